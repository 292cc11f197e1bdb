use crate::event::EventKind;
use crate::k8s_types::{core, K8sType};
use crate::mapper::{HostOrigin, MapperError};
use crate::metadata::{MetadataReconciler, OriginStamp};
use crate::resource::{ensure_object, set_metadata_map, K8sResource, ObjectId, ObjectIdRef, StringMap};
use crate::runner::duration_to_millis;
use crate::runner::metrics::SyncerMetrics;
use crate::runner::queue::Outcome;
use crate::runner::reconcile::compare::compare_values;
use crate::runner::reconcile::SyncError;
use crate::syncer::{decide, OwnershipPolicy, RegisterContext, Side, SyncDirection, SyncMode, Syncer};
use crate::translate::is_skipped;

use serde_json::{json, Value};

use std::sync::Arc;
use std::time::Instant;

/// One reconciliation pass for one virtual key of one syncer. Both objects are loaded fresh at
/// the start of every pass, and each side is written at most once.
pub(crate) struct SyncPass {
    syncer: Arc<dyn Syncer>,
    ownership: OwnershipPolicy,
    metadata: MetadataReconciler,
    ctx: RegisterContext,
    metrics: SyncerMetrics,
}

impl SyncPass {
    pub(crate) fn new(
        syncer: Arc<dyn Syncer>,
        ownership: OwnershipPolicy,
        ctx: RegisterContext,
        metrics: SyncerMetrics,
    ) -> SyncPass {
        let metadata = MetadataReconciler::new(syncer.metadata_policy());
        SyncPass {
            syncer,
            ownership,
            metadata,
            ctx,
            metrics,
        }
    }

    pub(crate) async fn run(&self, key: &ObjectId) -> Outcome {
        self.metrics.pass_started();
        let start = Instant::now();
        let (result, virtual_obj) = match self.get(Side::Virtual, key).await {
            Ok(virtual_obj) => (self.sync(key, virtual_obj.as_ref()).await, virtual_obj),
            Err(err) => (Err(err), None),
        };
        let error = match result {
            Ok(()) => {
                log::debug!(
                    "Syncer '{}' finished pass for {} in {}ms",
                    self.syncer.name(),
                    key,
                    duration_to_millis(start.elapsed())
                );
                return Outcome::Done;
            }
            Err(error) => error,
        };

        self.metrics.pass_failed();
        let transient = error.is_transient();
        if transient {
            log::warn!(
                "Syncer '{}' pass for {} failed, will retry: {}",
                self.syncer.name(),
                key,
                error
            );
        } else {
            log::error!(
                "Syncer '{}' pass for {} failed: {}",
                self.syncer.name(),
                key,
                error
            );
        }
        if let Some(virtual_obj) = virtual_obj.as_ref() {
            self.ctx.recorder.record(
                virtual_obj,
                EventKind::Warning,
                error.reason(),
                error.to_string().as_str(),
            );
        }
        if transient {
            Outcome::Retry
        } else {
            Outcome::Done
        }
    }

    async fn get(&self, side: Side, id: &ObjectId) -> Result<Option<K8sResource>, SyncError> {
        self.ctx
            .store(side)
            .get(self.syncer.resource_type(), &id.as_id_ref())
            .await
            .map_err(SyncError::store(side))
    }

    async fn sync(&self, key: &ObjectId, virtual_obj: Option<&K8sResource>) -> Result<(), SyncError> {
        let mode = self.syncer.mode();
        if virtual_obj.map(is_skipped).unwrap_or(false) {
            log::debug!("Syncer '{}' skipping excluded object {}", self.syncer.name(), key);
            return Ok(());
        }
        let host_id = match self.ctx.mapper.resolve_host(&*self.syncer, key, virtual_obj) {
            Some(id) => id,
            None => {
                log::debug!(
                    "Syncer '{}' has no host counterpart for {}",
                    self.syncer.name(),
                    key
                );
                return Ok(());
            }
        };

        let host_obj = self.get(Side::Host, &host_id).await?;
        let host = host_obj
            .as_ref()
            .map(|h| (h, self.ctx.mapper.classify_for(h, &*self.syncer)));
        if let Some((h, HostOrigin::Managed)) = host {
            if mode == SyncMode::ToHost {
                self.check_claim(key, h)?;
            }
        }
        let derived = virtual_obj
            .map(|v| self.syncer.is_derived_virtual(v))
            .unwrap_or(false);
        let direction = decide(mode, virtual_obj, derived, host);
        log::debug!(
            "Syncer '{}' pass for {} with host {}: {:?}",
            self.syncer.name(),
            key,
            host_id,
            direction
        );

        match (direction, virtual_obj, host_obj.as_ref()) {
            (SyncDirection::ToHost, Some(v), _) => self.create_host(v, &host_id).await,
            (SyncDirection::Sync { primary }, Some(v), Some(h)) => self.sync_pair(primary, v, h).await,
            (SyncDirection::UpSync, _, Some(h)) => self.create_virtual(key, h).await,
            (SyncDirection::DeleteHost, _, Some(_)) => self.delete(Side::Host, &host_id).await,
            (SyncDirection::DeleteVirtual, Some(_), _) => self.delete(Side::Virtual, key).await,
            (SyncDirection::RefuseAdopt, Some(_), _) => Err(SyncError::RefuseAdopt {
                virtual_id: key.clone(),
                host_id,
            }),
            (SyncDirection::WaitForHostDeletion, _, _) => {
                log::debug!(
                    "Syncer '{}' waiting for host object {} to be deleted",
                    self.syncer.name(),
                    host_id
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// A managed host object must be claimed by exactly this key
    fn check_claim(&self, key: &ObjectId, host: &K8sResource) -> Result<(), SyncError> {
        let host_id = host.get_object_id().to_owned();
        if let Err(err @ MapperError::MultipleMatches { .. }) =
            self.ctx.mapper.by_index(self.syncer.name(), &host.get_object_id())
        {
            return Err(SyncError::Mapper(err));
        }
        match self.syncer.translator().host_to_virtual(host) {
            Ok(owner) if owner != *key => Err(SyncError::Mapper(MapperError::MultipleMatches {
                host: host_id,
                candidates: vec![owner, key.clone()],
            })),
            _ => Ok(()),
        }
    }

    async fn create_host(&self, virtual_obj: &K8sResource, host_id: &ObjectId) -> Result<(), SyncError> {
        let k8s_type = self.syncer.resource_type();
        let translated = self
            .syncer
            .translate_to_host(&self.ctx, virtual_obj)
            .map_err(SyncError::Translate)?;
        let mut host = skeleton(k8s_type);
        self.ownership.copy_owned(Side::Virtual, &translated, &mut host);

        let origin = OriginStamp::for_object(virtual_obj, self.ctx.mapper.marker());
        let metadata = self.metadata.translate_metadata(virtual_obj, &origin);
        set_identity(&mut host, k8s_type, host_id, &metadata.annotations, &metadata.labels);

        log::info!(
            "Syncer '{}' creating host object {} for {}",
            self.syncer.name(),
            host_id,
            virtual_obj.get_object_id()
        );
        self.ctx
            .host_store
            .create(k8s_type, &host)
            .await
            .map_err(SyncError::store(Side::Host))?;
        self.metrics.write(Side::Host);
        Ok(())
    }

    async fn create_virtual(&self, key: &ObjectId, host_obj: &K8sResource) -> Result<(), SyncError> {
        let k8s_type = self.syncer.resource_type();
        if k8s_type.namespaced {
            if let Some(namespace) = key.namespace() {
                self.ensure_virtual_namespace(namespace).await?;
            }
        }
        let translated = self
            .syncer
            .translate_to_virtual(&self.ctx, host_obj)
            .map_err(SyncError::Translate)?;
        let mut virtual_obj = skeleton(k8s_type);
        self.ownership.copy_owned(Side::Host, &translated, &mut virtual_obj);
        let (annotations, labels) = self.syncer.up_sync_metadata(host_obj);
        set_identity(&mut virtual_obj, k8s_type, key, &annotations, &labels);

        log::info!(
            "Syncer '{}' importing host object {} as {}",
            self.syncer.name(),
            host_obj.get_object_id(),
            key
        );
        self.ctx
            .virtual_store
            .create(k8s_type, &virtual_obj)
            .await
            .map_err(SyncError::store(Side::Virtual))?;
        self.metrics.write(Side::Virtual);
        Ok(())
    }

    async fn ensure_virtual_namespace(&self, namespace: &str) -> Result<(), SyncError> {
        let store = &self.ctx.virtual_store;
        let existing = store
            .get(core::v1::Namespace, &ObjectIdRef::new("", namespace))
            .await
            .map_err(SyncError::store(Side::Virtual))?;
        if existing.is_some() {
            return Ok(());
        }
        let ns = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": namespace },
        });
        match store.create(core::v1::Namespace, &ns).await {
            Ok(_) => {
                log::info!("Created virtual namespace {}", namespace);
                self.metrics.write(Side::Virtual);
                Ok(())
            }
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(SyncError::store(Side::Virtual)(err)),
        }
    }

    async fn sync_pair(&self, primary: Side, virtual_obj: &K8sResource, host_obj: &K8sResource) -> Result<(), SyncError> {
        let translated = self
            .syncer
            .translate_to_host(&self.ctx, virtual_obj)
            .map_err(SyncError::Translate)?;
        let mut desired_host = host_obj.as_ref().clone();
        self.ownership
            .copy_owned(Side::Virtual, &translated, &mut desired_host);
        if primary == Side::Virtual {
            let origin = OriginStamp::for_object(virtual_obj, self.ctx.mapper.marker());
            let merged = self.metadata.merge_metadata(virtual_obj, host_obj, &origin);
            if merged.changed {
                set_metadata_map(&mut desired_host, "annotations", &merged.annotations);
                set_metadata_map(&mut desired_host, "labels", &merged.labels);
            }
        }
        self.apply(Side::Host, host_obj, desired_host).await?;

        let translated = self
            .syncer
            .translate_to_virtual(&self.ctx, host_obj)
            .map_err(SyncError::Translate)?;
        let mut desired_virtual = virtual_obj.as_ref().clone();
        self.ownership
            .copy_owned(Side::Host, &translated, &mut desired_virtual);
        if primary == Side::Host {
            let (annotations, labels) = self.syncer.up_sync_metadata(host_obj);
            set_metadata_map(&mut desired_virtual, "annotations", &annotations);
            set_metadata_map(&mut desired_virtual, "labels", &labels);
        }
        self.apply(Side::Virtual, virtual_obj, desired_virtual).await
    }

    /// Writes `desired` unless it is semantically equal to `current`. A change confined to the
    /// status goes through the status write.
    async fn apply(&self, side: Side, current: &K8sResource, desired: Value) -> Result<(), SyncError> {
        let status_only = {
            let diffs = compare_values(current.as_ref(), &desired);
            if diffs.is_empty() {
                return Ok(());
            }
            log::debug!(
                "Syncer '{}' updating {} object {}: {}",
                self.syncer.name(),
                side,
                current.get_object_id(),
                diffs
            );
            diffs.only_under("status")
        };
        let k8s_type = self.syncer.resource_type();
        let store = self.ctx.store(side);
        let result = if status_only {
            store.update_status(k8s_type, &desired).await
        } else {
            store.update(k8s_type, &desired).await
        };
        result.map_err(SyncError::store(side))?;
        self.metrics.write(side);
        Ok(())
    }

    async fn delete(&self, side: Side, id: &ObjectId) -> Result<(), SyncError> {
        log::info!("Syncer '{}' deleting {} object {}", self.syncer.name(), side, id);
        self.ctx
            .store(side)
            .delete(self.syncer.resource_type(), &id.as_id_ref())
            .await
            .map_err(SyncError::store(side))?;
        self.metrics.write(side);
        Ok(())
    }
}

fn skeleton(k8s_type: &K8sType) -> Value {
    json!({
        "apiVersion": k8s_type.api_version,
        "kind": k8s_type.kind,
    })
}

fn set_identity(object: &mut Value, k8s_type: &K8sType, id: &ObjectId, annotations: &StringMap, labels: &StringMap) {
    if let Some(metadata) = ensure_object(object, "metadata") {
        metadata.insert("name".to_owned(), Value::String(id.name.clone()));
        if k8s_type.namespaced {
            metadata.insert("namespace".to_owned(), Value::String(id.namespace.clone()));
        }
    }
    set_metadata_map(object, "annotations", annotations);
    set_metadata_map(object, "labels", labels);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::MemoryEventRecorder;
    use crate::mapper::ObjectMapper;
    use crate::runner::metrics::Metrics;
    use crate::store::{MemoryStore, ObjectStore};
    use crate::translate::{NameTranslator, NamespacedTranslator, MARKER_LABEL, NAME_ANNOTATION, NAMESPACE_ANNOTATION};
    use tokio_util::sync::CancellationToken;

    struct SecretMirror(NamespacedTranslator);

    impl Syncer for SecretMirror {
        fn name(&self) -> &str {
            "secrets"
        }

        fn resource_type(&self) -> &'static K8sType {
            core::v1::Secret
        }

        fn translator(&self) -> &dyn NameTranslator {
            &self.0
        }
    }

    struct Fixture {
        virtual_store: Arc<MemoryStore>,
        host_store: Arc<MemoryStore>,
        recorder: Arc<MemoryEventRecorder>,
        pass: SyncPass,
    }

    fn fixture() -> Fixture {
        let virtual_store = Arc::new(MemoryStore::new("virtual"));
        let host_store = Arc::new(MemoryStore::new("host"));
        let recorder = Arc::new(MemoryEventRecorder::new());
        let ctx = RegisterContext {
            virtual_store: virtual_store.clone(),
            host_store: host_store.clone(),
            target_namespace: "vcluster".to_owned(),
            current_namespace: "vcluster".to_owned(),
            name: "vc".to_owned(),
            mapper: Arc::new(ObjectMapper::new("vc")),
            recorder: recorder.clone(),
            shutdown: CancellationToken::new(),
        };
        let syncer: Arc<dyn Syncer> = Arc::new(SecretMirror(NamespacedTranslator::new("vcluster", "vc")));
        let ownership = syncer.ownership();
        let metrics = Metrics::new().syncer_metrics("secrets");
        Fixture {
            virtual_store,
            host_store,
            recorder,
            pass: SyncPass::new(syncer, ownership, ctx, metrics),
        }
    }

    fn host_id() -> ObjectIdRef<'static> {
        ObjectIdRef::new("vcluster", "test123-x-test-x-vc")
    }

    async fn create_virtual_secret(store: &MemoryStore) {
        store
            .create(
                core::v1::Secret,
                &json!({
                    "metadata": { "namespace": "test", "name": "test123", "labels": { "app": "demo" } },
                    "type": "Opaque",
                    "data": { "foo": "YmFy" },
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn virtual_objects_are_created_on_the_host_then_left_alone() {
        let f = fixture();
        create_virtual_secret(&f.virtual_store).await;
        let key = ObjectId::new("test", "test123");

        assert_eq!(Outcome::Done, f.pass.run(&key).await);
        let host = f.host_store.get_now(core::v1::Secret, &host_id()).unwrap();
        assert_eq!(Some("YmFy"), host.str_value("/data/foo"));
        assert_eq!(Some("Opaque"), host.str_value("/type"));
        assert_eq!(Some("test123"), host.get_annotation_value(NAME_ANNOTATION));
        assert_eq!(Some("test"), host.get_annotation_value(NAMESPACE_ANNOTATION));
        assert_eq!(Some("vc"), host.get_label_value(MARKER_LABEL));
        assert_eq!(Some("demo"), host.get_label_value("app"));

        let host_writes = f.host_store.write_count();
        let virtual_writes = f.virtual_store.write_count();
        assert_eq!(Outcome::Done, f.pass.run(&key).await);
        assert_eq!(host_writes, f.host_store.write_count());
        assert_eq!(virtual_writes, f.virtual_store.write_count());
    }

    #[tokio::test]
    async fn managed_host_objects_are_deleted_with_their_virtual_object() {
        let f = fixture();
        create_virtual_secret(&f.virtual_store).await;
        let key = ObjectId::new("test", "test123");
        f.pass.run(&key).await;

        f.virtual_store
            .delete(core::v1::Secret, &key.as_id_ref())
            .await
            .unwrap();
        assert_eq!(Outcome::Done, f.pass.run(&key).await);
        assert!(f.host_store.get_now(core::v1::Secret, &host_id()).is_none());
    }

    #[tokio::test]
    async fn foreign_host_objects_are_never_adopted() {
        let f = fixture();
        create_virtual_secret(&f.virtual_store).await;
        f.host_store
            .create(
                core::v1::Secret,
                &json!({
                    "metadata": { "namespace": "vcluster", "name": "test123-x-test-x-vc" },
                    "data": { "foo": "b3RoZXI=" },
                }),
            )
            .await
            .unwrap();
        let writes = f.host_store.write_count();

        assert_eq!(Outcome::Done, f.pass.run(&ObjectId::new("test", "test123")).await);
        assert_eq!(writes, f.host_store.write_count());
        assert_eq!(1, f.recorder.count(EventKind::Warning, "RefusedAdoption"));

        // and never deleted either
        f.virtual_store
            .delete(core::v1::Secret, &ObjectIdRef::new("test", "test123"))
            .await
            .unwrap();
        f.pass.run(&ObjectId::new("test", "test123")).await;
        assert!(f.host_store.get_now(core::v1::Secret, &host_id()).is_some());
    }

    #[tokio::test]
    async fn conflicts_end_the_pass_with_a_retry() {
        let f = fixture();
        create_virtual_secret(&f.virtual_store).await;
        let key = ObjectId::new("test", "test123");
        f.pass.run(&key).await;

        let mut changed = f
            .virtual_store
            .get_now(core::v1::Secret, &key.as_id_ref())
            .unwrap()
            .into_value();
        changed["data"]["foo"] = json!("YmF6");
        f.virtual_store.update(core::v1::Secret, &changed).await.unwrap();

        f.host_store.inject_conflicts(1);
        assert_eq!(Outcome::Retry, f.pass.run(&key).await);
        assert_eq!(1, f.recorder.count(EventKind::Warning, "SyncError"));

        assert_eq!(Outcome::Done, f.pass.run(&key).await);
        let host = f.host_store.get_now(core::v1::Secret, &host_id()).unwrap();
        assert_eq!(Some("YmF6"), host.str_value("/data/foo"));
    }
}

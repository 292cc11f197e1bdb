use crate::mapper::{MapperError, ObjectMapper};
use crate::resource::{K8sResource, ObjectId};
use crate::runner::metrics::WatcherMetrics;
use crate::runner::queue::WorkQueue;
use crate::runner::resource_map::ResourceMap;
use crate::store::{ListOptions, ObjectList, ObjectStore, StoreError, WatchEvent};
use crate::syncer::{RegisterContext, Side, Syncer};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::time::Duration;

/// Read side of a running informer
#[derive(Debug, Clone)]
pub(crate) struct InformerHandle {
    syncer: String,
    side: Side,
    cache: Arc<Mutex<ResourceMap>>,
    synced: watch::Receiver<bool>,
}

impl InformerHandle {
    pub(crate) fn syncer(&self) -> &str {
        self.syncer.as_str()
    }

    pub(crate) fn side(&self) -> Side {
        self.side
    }

    /// Waits until the initial list completed. Returns false if the informer stopped first.
    pub(crate) async fn wait_synced(&mut self) -> bool {
        loop {
            if *self.synced.borrow() {
                return true;
            }
            if self.synced.changed().await.is_err() {
                return false;
            }
        }
    }

    pub(crate) fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub(crate) fn resource_count(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Lists, then watches, the objects of one syncer on one side of the pair, and turns every
/// change into a virtual key on the syncer's work queue. The object mapper is kept up to date
/// with every object seen, before the key is queued.
pub(crate) struct Informer {
    syncer: Arc<dyn Syncer>,
    side: Side,
    store: Arc<dyn ObjectStore>,
    options: ListOptions,
    mapper: Arc<ObjectMapper>,
    queue: Arc<WorkQueue>,
    metrics: WatcherMetrics,
    retry_delay: Duration,
    cache: Arc<Mutex<ResourceMap>>,
    synced: watch::Sender<bool>,
    shutdown: CancellationToken,
}

pub(crate) fn start_informer(
    syncer: Arc<dyn Syncer>,
    side: Side,
    ctx: &RegisterContext,
    queue: Arc<WorkQueue>,
    metrics: WatcherMetrics,
    retry_delay: Duration,
) -> (InformerHandle, JoinHandle<()>) {
    let options = match side {
        Side::Virtual => syncer.virtual_list_options(ctx),
        Side::Host => syncer.host_list_options(ctx),
    };
    let (synced_tx, synced_rx) = watch::channel(false);
    let cache = Arc::new(Mutex::new(ResourceMap::new()));
    let handle = InformerHandle {
        syncer: syncer.name().to_owned(),
        side,
        cache: cache.clone(),
        synced: synced_rx,
    };
    let informer = Informer {
        syncer,
        side,
        store: ctx.store(side).clone(),
        options,
        mapper: ctx.mapper.clone(),
        queue,
        metrics,
        retry_delay,
        cache,
        synced: synced_tx,
        shutdown: ctx.shutdown.clone(),
    };
    let task = tokio::spawn(informer.run());
    (handle, task)
}

impl Informer {
    async fn run(mut self) {
        log::debug!(
            "Starting {} informer for syncer '{}' with options: {:?}",
            self.side,
            self.syncer.name(),
            self.options
        );
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = self.run_loop() => {}
            _ = shutdown.cancelled() => {}
        }
        log::info!("Ending {} informer for syncer '{}'", self.side, self.syncer.name());
    }

    async fn run_loop(&mut self) {
        loop {
            let error = match self.seed_cache().await {
                Ok(resource_version) => match self.watch_from(resource_version).await {
                    Ok(()) => continue,
                    Err(err) => err,
                },
                Err(err) => {
                    log::error!(
                        "Error seeding {} cache for syncer '{}': {}",
                        self.side,
                        self.syncer.name(),
                        err
                    );
                    err
                }
            };
            self.handle_error(error).await;
        }
    }

    async fn handle_error(&mut self, error: StoreError) {
        if error.is_expired() {
            log::warn!(
                "Resource version expired in {} informer for syncer '{}', listing again",
                self.side,
                self.syncer.name()
            );
            return;
        }
        log::error!(
            "Error in {} informer for syncer '{}': {}",
            self.side,
            self.syncer.name(),
            error
        );
        self.metrics.error();
        tokio::time::sleep(self.retry_delay).await;
    }

    async fn watch_from(&mut self, mut resource_version: String) -> Result<(), StoreError> {
        loop {
            self.metrics.request_started();
            let k8s_type = self.syncer.resource_type();
            let mut events = self.store.watch(k8s_type, &self.options, &resource_version).await?;
            while let Some(result) = events.next().await {
                self.metrics.event_received();
                let event = result?;
                resource_version = event.resource().resource_version().to_owned();
                self.handle_event(event);
            }
            log::debug!(
                "{} watch for syncer '{}' ended, resuming from resourceVersion: {:?}",
                self.side,
                self.syncer.name(),
                resource_version
            );
        }
    }

    fn handle_event(&mut self, event: WatchEvent) {
        let deleted = event.is_deleted();
        let resource = event.into_resource();
        {
            let mut cache = self.cache.lock();
            if deleted {
                cache.remove(&resource.get_object_id());
            } else {
                cache.insert(resource.clone());
            }
            self.metrics.set_resource_count(cache.len());
        }
        for key in self.keys_for(&resource, deleted) {
            self.queue.add(key);
        }
    }

    async fn seed_cache(&mut self) -> Result<String, StoreError> {
        log::info!(
            "Seeding {} cache for syncer '{}'",
            self.side,
            self.syncer.name()
        );
        let _ = self.synced.send(false);
        self.metrics.request_started();
        let ObjectList {
            resource_version,
            items,
        } = self
            .store
            .list(self.syncer.resource_type(), &self.options)
            .await?;

        let mut links = Vec::with_capacity(items.len());
        let mut keys = Vec::with_capacity(items.len());
        for resource in items.iter() {
            match self.side {
                Side::Virtual => {
                    links.extend(self.virtual_link(resource));
                    keys.push(resource.get_object_id().to_owned());
                }
                Side::Host => {
                    let resolved = self.resolve_virtual(resource);
                    if let [virtual_id] = resolved.as_slice() {
                        links.push((virtual_id.clone(), resource.get_object_id().to_owned()));
                    }
                    keys.extend(resolved);
                }
            }
        }
        self.mapper.reseed(self.syncer.name(), self.side, links);

        let dropped = {
            let mut cache = self.cache.lock();
            let dropped = cache.replace_all(items);
            self.metrics.set_resource_count(cache.len());
            dropped
        };
        // objects that went away while we were not watching
        for resource in dropped.iter() {
            keys.extend(self.keys_for(resource, true));
        }
        for key in keys {
            if self.syncer.should_reconcile(&key.as_id_ref()) {
                self.queue.add(key);
            }
        }
        let _ = self.synced.send(true);
        Ok(resource_version)
    }

    /// The link a virtual object reports, if it is synced at all
    fn virtual_link(&self, resource: &K8sResource) -> Option<(ObjectId, ObjectId)> {
        let virtual_id = resource.get_object_id().to_owned();
        if !self.syncer.should_reconcile(&virtual_id.as_id_ref()) {
            return None;
        }
        let host_id = self
            .syncer
            .translator()
            .virtual_to_host(&virtual_id.as_id_ref(), Some(resource))?;
        Some((virtual_id, host_id))
    }

    fn resolve_virtual(&self, host: &K8sResource) -> Vec<ObjectId> {
        match self.mapper.resolve_virtual(&*self.syncer, host) {
            Ok(Some(virtual_id)) => vec![virtual_id],
            Ok(None) => Vec::new(),
            Err(MapperError::NotFound(host_id)) => {
                log::debug!(
                    "Syncer '{}' found no virtual object for host object {}",
                    self.syncer.name(),
                    host_id
                );
                Vec::new()
            }
            Err(MapperError::MultipleMatches { host, candidates }) => {
                log::error!(
                    "Host object {} is claimed by {} virtual objects of syncer '{}'",
                    host,
                    candidates.len(),
                    self.syncer.name()
                );
                // the passes of all candidates will report the conflict
                candidates
            }
            Err(err) => {
                log::error!(
                    "Syncer '{}' can not resolve host object {}: {}",
                    self.syncer.name(),
                    host.get_object_id(),
                    err
                );
                Vec::new()
            }
        }
    }

    /// Updates the mapper with a change to `resource`, and returns the virtual keys to queue
    fn keys_for(&self, resource: &K8sResource, deleted: bool) -> Vec<ObjectId> {
        let name = self.syncer.name();
        let mut keys = match self.side {
            Side::Virtual => {
                let virtual_id = resource.get_object_id().to_owned();
                if deleted {
                    self.mapper.unlink_virtual(name, &virtual_id);
                } else if let Some((virtual_id, host_id)) = self.virtual_link(resource) {
                    self.mapper.link(name, virtual_id, host_id, Side::Virtual);
                }
                vec![virtual_id]
            }
            Side::Host => {
                let host_id = resource.get_object_id().to_owned();
                // whatever the object was linked to before needs a pass too
                let mut keys = self.mapper.unlink_host(name, &host_id);
                if !deleted {
                    let resolved = self.resolve_virtual(resource);
                    if let [virtual_id] = resolved.as_slice() {
                        self.mapper
                            .link(name, virtual_id.clone(), host_id, Side::Host);
                    }
                    keys.extend(resolved);
                } else if keys.is_empty() {
                    keys.extend(self.resolve_virtual(resource));
                }
                keys
            }
        };
        keys.retain(|key| self.syncer.should_reconcile(&key.as_id_ref()));
        keys.sort();
        keys.dedup();
        keys
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::MemoryEventRecorder;
    use crate::k8s_types::{core, K8sType};
    use crate::runner::metrics::Metrics;
    use crate::store::MemoryStore;
    use crate::translate::{NameTranslator, NamespacedTranslator};
    use serde_json::json;

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

    fn context(virtual_store: Arc<MemoryStore>, host_store: Arc<MemoryStore>) -> RegisterContext {
        RegisterContext {
            virtual_store,
            host_store,
            target_namespace: "vcluster".to_owned(),
            current_namespace: "vcluster".to_owned(),
            name: "vc".to_owned(),
            mapper: Arc::new(ObjectMapper::new("vc")),
            recorder: Arc::new(MemoryEventRecorder::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn queue(token: &CancellationToken) -> Arc<WorkQueue> {
        Arc::new(WorkQueue::new(
            "secrets",
            Duration::from_millis(10),
            Duration::from_millis(100),
            token.clone(),
        ))
    }

    #[tokio::test]
    async fn virtual_objects_are_linked_and_queued() {
        let virtual_store = Arc::new(MemoryStore::new("virtual"));
        let host_store = Arc::new(MemoryStore::new("host"));
        virtual_store
            .create(
                core::v1::Secret,
                &json!({"metadata": {"namespace": "test", "name": "before"}}),
            )
            .await
            .unwrap();

        let ctx = context(virtual_store.clone(), host_store);
        let queue = queue(&ctx.shutdown);
        let syncer: Arc<dyn Syncer> = Arc::new(SecretMirror(NamespacedTranslator::new("vcluster", "vc")));
        let (mut handle, task) = start_informer(
            syncer,
            Side::Virtual,
            &ctx,
            queue.clone(),
            Metrics::new().watcher_metrics("secrets", Side::Virtual),
            Duration::from_millis(10),
        );
        assert!(handle.wait_synced().await);
        assert_eq!(1, handle.resource_count());
        assert_eq!(Some(ObjectId::new("test", "before")), queue.next().await);
        assert!(ctx
            .mapper
            .cached_host("secrets", &ObjectId::new("test", "before"))
            .is_some());

        virtual_store
            .create(
                core::v1::Secret,
                &json!({"metadata": {"namespace": "test", "name": "after"}}),
            )
            .await
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), queue.next())
            .await
            .unwrap();
        assert_eq!(Some(ObjectId::new("test", "after")), next);

        ctx.shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn foreign_host_objects_are_not_queued() {
        let virtual_store = Arc::new(MemoryStore::new("virtual"));
        let host_store = Arc::new(MemoryStore::new("host"));
        host_store
            .create(
                core::v1::Secret,
                &json!({"metadata": {"namespace": "vcluster", "name": "someone-elses"}}),
            )
            .await
            .unwrap();

        let ctx = context(virtual_store, host_store);
        let queue = queue(&ctx.shutdown);
        let syncer: Arc<dyn Syncer> = Arc::new(SecretMirror(NamespacedTranslator::new("vcluster", "vc")));
        let (mut handle, task) = start_informer(
            syncer,
            Side::Host,
            &ctx,
            queue.clone(),
            Metrics::new().watcher_metrics("secrets", Side::Host),
            Duration::from_millis(10),
        );
        assert!(handle.wait_synced().await);
        assert_eq!(1, handle.resource_count());
        assert_eq!(0, queue.len());

        ctx.shutdown.cancel();
        task.await.unwrap();
    }
}

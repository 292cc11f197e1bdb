use super::{LabelSelector, ListOptions, ObjectList, ObjectStore, StoreError, WatchEvent, WatchStream};
use crate::k8s_types::K8sType;
use crate::resource::{ensure_object, K8sResource, ObjectIdRef};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};

const WATCH_BUFFER: usize = 1024;

type TypeKey = (String, String);
type ObjectKey = (String, String, String, String);

#[derive(Debug, Clone)]
struct StoredEvent {
    revision: u64,
    type_key: TypeKey,
    event: WatchEvent,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    revision: u64,
    next_uid: u64,
    log: Vec<StoredEvent>,
}

/// An in-process object store with the same optimistic concurrency and watch semantics as an
/// api server, minus admission, defaulting and garbage collection. Every write bumps a single
/// store-wide revision, which is used as the resource version.
pub struct MemoryStore {
    name: String,
    state: Mutex<State>,
    sender: broadcast::Sender<StoredEvent>,
    writes: AtomicUsize,
    pending_conflicts: AtomicUsize,
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .field("writes", &self.write_count())
            .finish()
    }
}

fn type_key(k8s_type: &K8sType) -> TypeKey {
    (k8s_type.api_version.to_owned(), k8s_type.kind.to_owned())
}

fn object_key(k8s_type: &K8sType, namespace: &str, name: &str) -> ObjectKey {
    let namespace = if k8s_type.namespaced { namespace } else { "" };
    (
        k8s_type.api_version.to_owned(),
        k8s_type.kind.to_owned(),
        namespace.to_owned(),
        name.to_owned(),
    )
}

fn describe(k8s_type: &K8sType, namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("{} {}", k8s_type.kind, name)
    } else {
        format!("{} {}/{}", k8s_type.kind, namespace, name)
    }
}

fn matches_options(resource: &K8sResource, options: &ListOptions, selector: Option<&LabelSelector>) -> bool {
    let ns_matches = options
        .namespace
        .as_deref()
        .map(|ns| resource.namespace().unwrap_or("") == ns)
        .unwrap_or(true);
    ns_matches && selector.map(|s| s.matches(&resource.labels())).unwrap_or(true)
}

fn parse_selector(options: &ListOptions) -> Result<Option<LabelSelector>, StoreError> {
    match options.label_selector.as_deref() {
        Some(s) => LabelSelector::parse(s).map(Some).map_err(|message| StoreError::Api {
            code: 400,
            message,
        }),
        None => Ok(None),
    }
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> MemoryStore {
        let (sender, _) = broadcast::channel(WATCH_BUFFER);
        MemoryStore {
            name: name.into(),
            state: Mutex::new(State::default()),
            sender,
            writes: AtomicUsize::new(0),
            pending_conflicts: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Number of successful create, update and delete calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes the next `count` updates fail with a conflict, as if someone else had written first
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.fetch_add(count, Ordering::SeqCst);
    }

    /// Reads an object without going through the async interface
    pub fn get_now(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Option<K8sResource> {
        let state = self.state.lock();
        state
            .objects
            .get(&object_key(k8s_type, id.namespace, id.name))
            .cloned()
            .and_then(|v| K8sResource::from_value(v).ok())
    }

    pub fn count(&self, k8s_type: &K8sType) -> usize {
        let key = type_key(k8s_type);
        let state = self.state.lock();
        state
            .objects
            .keys()
            .filter(|(api_version, kind, _, _)| api_version == &key.0 && kind == &key.1)
            .count()
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record(&self, state: &mut State, k8s_type: &K8sType, event: WatchEvent) {
        let stored = StoredEvent {
            revision: state.revision,
            type_key: type_key(k8s_type),
            event,
        };
        state.log.push(stored.clone());
        // nobody watching is fine
        let _ = self.sender.send(stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn prepare(k8s_type: &K8sType, resource: &Value) -> Result<(Value, String, String), StoreError> {
        let mut value = resource.clone();
        let obj = value.as_object_mut().ok_or_else(|| {
            StoreError::Invalid(crate::resource::InvalidResourceError::new(
                "resource must be a json object",
                resource.clone(),
            ))
        })?;
        obj.entry("apiVersion")
            .or_insert_with(|| Value::String(k8s_type.api_version.to_owned()));
        obj.entry("kind")
            .or_insert_with(|| Value::String(k8s_type.kind.to_owned()));

        let name = resource
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                StoreError::Invalid(crate::resource::InvalidResourceError::new(
                    "missing metadata.name",
                    resource.clone(),
                ))
            })?
            .to_owned();
        let namespace = resource
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        if k8s_type.namespaced && namespace.is_empty() {
            return Err(StoreError::Invalid(crate::resource::InvalidResourceError::new(
                "missing metadata.namespace for a namespaced kind",
                resource.clone(),
            )));
        }
        Ok((value, namespace, name))
    }

    fn write(&self, k8s_type: &K8sType, resource: &Value, status_only: bool) -> Result<K8sResource, StoreError> {
        let (mut value, namespace, name) = MemoryStore::prepare(k8s_type, resource)?;
        let key = object_key(k8s_type, &namespace, &name);
        let mut state = self.state.lock();
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(describe(k8s_type, &namespace, &name)))?;

        let existing_version = existing
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or("");
        let given_version = value.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        let stale = given_version.map(|v| v != existing_version).unwrap_or(false);
        if stale || self.take_conflict() {
            return Err(StoreError::Conflict(format!(
                "{} was modified, current resourceVersion: {}",
                describe(k8s_type, &namespace, &name),
                existing_version
            )));
        }

        if status_only {
            let status = value.get("status").cloned();
            value = existing.clone();
            if let Some(obj) = value.as_object_mut() {
                match status {
                    Some(s) => obj.insert("status".to_owned(), s),
                    None => obj.remove("status"),
                };
            }
        }

        state.revision += 1;
        let revision = state.revision.to_string();
        if let Some(metadata) = ensure_object(&mut value, "metadata") {
            for preserved in &["uid", "creationTimestamp"] {
                if let Some(v) = existing.pointer(&format!("/metadata/{}", preserved)) {
                    metadata.insert((*preserved).to_owned(), v.clone());
                }
            }
            metadata.insert("resourceVersion".to_owned(), Value::String(revision));
        }
        state.objects.insert(key, value.clone());
        let updated = K8sResource::from_value(value)?;
        self.record(&mut state, k8s_type, WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<Option<K8sResource>, StoreError> {
        Ok(self.get_now(k8s_type, id))
    }

    async fn list(&self, k8s_type: &K8sType, options: &ListOptions) -> Result<ObjectList, StoreError> {
        let selector = parse_selector(options)?;
        let key = type_key(k8s_type);
        let state = self.state.lock();
        let mut items = Vec::new();
        for ((api_version, kind, _, _), value) in state.objects.iter() {
            if api_version != &key.0 || kind != &key.1 {
                continue;
            }
            let resource = K8sResource::from_value(value.clone())?;
            if matches_options(&resource, options, selector.as_ref()) {
                items.push(resource);
            }
        }
        Ok(ObjectList {
            resource_version: state.revision.to_string(),
            items,
        })
    }

    async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError> {
        let (mut value, namespace, name) = MemoryStore::prepare(k8s_type, resource)?;
        let key = object_key(k8s_type, &namespace, &name);
        let mut state = self.state.lock();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(describe(k8s_type, &namespace, &name)));
        }
        state.revision += 1;
        state.next_uid += 1;
        let revision = state.revision.to_string();
        let uid = format!("{}-uid-{}", self.name, state.next_uid);
        if let Some(metadata) = ensure_object(&mut value, "metadata") {
            metadata.insert("resourceVersion".to_owned(), Value::String(revision));
            metadata.insert("uid".to_owned(), Value::String(uid));
            metadata.insert(
                "creationTimestamp".to_owned(),
                Value::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            );
            if !k8s_type.namespaced {
                metadata.remove("namespace");
            }
        }
        state.objects.insert(key, value.clone());
        let created = K8sResource::from_value(value)?;
        self.record(&mut state, k8s_type, WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError> {
        self.write(k8s_type, resource, false)
    }

    async fn update_status(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError> {
        self.write(k8s_type, resource, true)
    }

    async fn delete(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<(), StoreError> {
        let key = object_key(k8s_type, id.namespace, id.name);
        let mut state = self.state.lock();
        if let Some(mut value) = state.objects.remove(&key) {
            state.revision += 1;
            let revision = state.revision.to_string();
            if let Some(metadata) = ensure_object(&mut value, "metadata") {
                metadata.insert("resourceVersion".to_owned(), Value::String(revision));
            }
            let deleted = K8sResource::from_value(value)?;
            self.record(&mut state, k8s_type, WatchEvent::Deleted(deleted));
        }
        Ok(())
    }

    async fn watch(
        &self,
        k8s_type: &K8sType,
        options: &ListOptions,
        resource_version: &str,
    ) -> Result<WatchStream, StoreError> {
        let selector = parse_selector(options)?;
        let wanted_type = type_key(k8s_type);

        let (replay, receiver) = {
            let state = self.state.lock();
            let from = if resource_version.is_empty() {
                state.revision
            } else {
                resource_version.parse::<u64>().map_err(|_| {
                    StoreError::Expired(format!("unparseable resourceVersion: '{}'", resource_version))
                })?
            };
            let replay = state
                .log
                .iter()
                .filter(|e| e.revision > from)
                .cloned()
                .collect::<Vec<_>>();
            // subscribe while still holding the lock, so nothing falls between replay and live
            (replay, self.sender.subscribe())
        };

        let options = options.clone();
        let accept = move |stored: &StoredEvent| {
            stored.type_key == wanted_type
                && matches_options(stored.event.resource(), &options, selector.as_ref())
        };
        let accept_live = accept.clone();

        let replayed = futures::stream::iter(
            replay
                .into_iter()
                .filter(move |e| accept(e))
                .map(|e| Ok(e.event))
                .collect::<Vec<_>>(),
        );
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let mapped = match item {
                Ok(stored) if accept_live(&stored) => Some(Ok(stored.event)),
                Ok(_) => None,
                Err(err) => Some(Err(StoreError::Expired(format!("watch fell behind: {}", err)))),
            };
            futures::future::ready(mapped)
        });
        Ok(replayed.chain(live).boxed())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types::core::v1::{Namespace, Secret};
    use serde_json::json;

    fn secret(namespace: &str, name: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "namespace": namespace, "name": name },
            "data": { "key": "dmFsdWU=" }
        })
    }

    #[tokio::test]
    async fn create_assigns_versions_and_rejects_duplicates() {
        let store = MemoryStore::new("virtual");
        let created = store.create(Secret, &secret("test", "a")).await.unwrap();
        assert_eq!("1", created.resource_version());
        assert!(!created.uid().is_empty());

        let err = store.create(Secret, &secret("test", "a")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn stale_updates_conflict() {
        let store = MemoryStore::new("host");
        let created = store.create(Secret, &secret("test", "a")).await.unwrap();
        let mut first = created.clone().into_value();
        first["data"]["key"] = json!("Zmlyc3Q=");
        let updated = store.update(Secret, &first).await.unwrap();
        assert_eq!("2", updated.resource_version());

        // still carries resourceVersion 1
        let err = store.update(Secret, &created.into_value()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(2, store.write_count());
    }

    #[tokio::test]
    async fn injected_conflicts_fail_the_next_update_only() {
        let store = MemoryStore::new("host");
        let created = store.create(Secret, &secret("test", "a")).await.unwrap();
        store.inject_conflicts(1);
        assert!(store.update(Secret, created.as_ref()).await.unwrap_err().is_conflict());
        assert!(store.update(Secret, created.as_ref()).await.is_ok());
    }

    #[tokio::test]
    async fn delete_of_missing_object_is_ok() {
        let store = MemoryStore::new("host");
        store.delete(Secret, &ObjectIdRef::new("test", "nope")).await.unwrap();
        assert_eq!(0, store.write_count());
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_selector() {
        let store = MemoryStore::new("host");
        let mut labeled = secret("a", "one");
        labeled["metadata"]["labels"] = json!({"app": "web"});
        store.create(Secret, &labeled).await.unwrap();
        store.create(Secret, &secret("a", "two")).await.unwrap();
        store.create(Secret, &secret("b", "three")).await.unwrap();
        store
            .create(Namespace, &json!({"metadata": {"name": "a"}}))
            .await
            .unwrap();

        let in_a = store.list(Secret, &ListOptions::in_namespace("a")).await.unwrap();
        assert_eq!(2, in_a.items.len());
        assert_eq!("4", in_a.resource_version);

        let selected = store
            .list(Secret, &ListOptions::all().with_selector("app=web"))
            .await
            .unwrap();
        assert_eq!(1, selected.items.len());
        assert_eq!("one", selected.items[0].name());
    }

    #[tokio::test]
    async fn watch_replays_from_resource_version_then_follows() {
        let store = MemoryStore::new("host");
        store.create(Secret, &secret("a", "one")).await.unwrap();
        let listed = store.list(Secret, &ListOptions::all()).await.unwrap();
        store.create(Secret, &secret("a", "two")).await.unwrap();

        let mut watch = store
            .watch(Secret, &ListOptions::all(), &listed.resource_version)
            .await
            .unwrap();
        store.delete(Secret, &ObjectIdRef::new("a", "one")).await.unwrap();

        match watch.next().await {
            Some(Ok(WatchEvent::Added(res))) => assert_eq!("two", res.name()),
            other => panic!("unexpected event: {:?}", other),
        }
        match watch.next().await {
            Some(Ok(WatchEvent::Deleted(res))) => assert_eq!("one", res.name()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn update_status_only_touches_status() {
        let store = MemoryStore::new("virtual");
        let created = store.create(Secret, &secret("a", "one")).await.unwrap();
        let mut value = created.into_value();
        value["data"] = json!({"other": "eA=="});
        value["status"] = json!({"phase": "Ready"});
        let updated = store.update_status(Secret, &value).await.unwrap();
        assert_eq!(Some(&json!({"phase": "Ready"})), updated.status());
        assert_eq!(Some(&json!({"key": "dmFsdWU="})), updated.field("data"));
    }
}

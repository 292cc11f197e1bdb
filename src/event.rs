use crate::k8s_types::core;
use crate::resource::K8sResource;
use crate::store::ObjectStore;

use parking_lot::Mutex;
use serde_json::json;

use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Normal => "Normal",
            EventKind::Warning => "Warning",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records events about objects. Recording is fire-and-forget: it never blocks and never fails
/// the caller.
pub trait EventRecorder: Send + Sync + 'static {
    fn record(&self, object: &K8sResource, kind: EventKind, reason: &str, message: &str);
}

/// Writes `v1/Event` objects into a store, usually the virtual cluster, from a spawned task
pub struct StoreEventRecorder {
    store: Arc<dyn ObjectStore>,
    component: String,
    counter: AtomicU64,
}

impl Debug for StoreEventRecorder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StoreEventRecorder({})", self.component)
    }
}

impl StoreEventRecorder {
    pub fn new(store: Arc<dyn ObjectStore>, component: impl Into<String>) -> StoreEventRecorder {
        StoreEventRecorder {
            store,
            component: component.into(),
            counter: AtomicU64::new(0),
        }
    }

    fn event_for(&self, object: &K8sResource, kind: EventKind, reason: &str, message: &str) -> serde_json::Value {
        let now = chrono::Utc::now();
        let timestamp = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}.{:x}{:04x}", object.name(), now.timestamp_millis(), sequence);
        json!({
            "apiVersion": "v1",
            "kind": "Event",
            "metadata": {
                "namespace": object.namespace().unwrap_or("default"),
                "name": name,
            },
            "involvedObject": {
                "apiVersion": object.api_version(),
                "kind": object.kind(),
                "namespace": object.namespace().unwrap_or(""),
                "name": object.name(),
                "uid": object.uid(),
                "resourceVersion": object.resource_version(),
            },
            "type": kind.as_str(),
            "reason": reason,
            "message": message,
            "source": { "component": self.component.as_str() },
            "reportingComponent": self.component.as_str(),
            "firstTimestamp": timestamp.as_str(),
            "lastTimestamp": timestamp.as_str(),
            "count": 1,
        })
    }
}

impl EventRecorder for StoreEventRecorder {
    fn record(&self, object: &K8sResource, kind: EventKind, reason: &str, message: &str) {
        log::debug!("Recording {} event '{}' for {}: {}", kind, reason, object.get_object_id(), message);
        let event = self.event_for(object, kind, reason, message);
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!("Dropping event '{}' since there is no runtime to send it from", reason);
                return;
            }
        };
        let store = self.store.clone();
        handle.spawn(async move {
            if let Err(err) = store.create(core::v1::Event, &event).await {
                log::warn!("Failed to record event: {}", err);
            }
        });
    }
}

/// An event captured by a `MemoryEventRecorder`
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub object: String,
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

/// Keeps recorded events in memory, for tests
#[derive(Debug, Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn new() -> MemoryEventRecorder {
        MemoryEventRecorder::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: EventKind, reason: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind && e.reason == reason)
            .count()
    }
}

impl EventRecorder for MemoryEventRecorder {
    fn record(&self, object: &K8sResource, kind: EventKind, reason: &str, message: &str) {
        self.events.lock().push(RecordedEvent {
            object: object.get_object_id().to_string(),
            kind,
            reason: reason.to_owned(),
            message: message.to_owned(),
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::ObjectIdRef;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn secret() -> K8sResource {
        K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "namespace": "test", "name": "test123", "resourceVersion": "3", "uid": "abc" },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn store_recorder_creates_event_objects() {
        let store = Arc::new(MemoryStore::new("virtual"));
        let recorder = StoreEventRecorder::new(store.clone(), "my-plugin");
        recorder.record(&secret(), EventKind::Warning, "SyncError", "it broke");

        for _ in 0..50 {
            if store.count(core::v1::Event) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(1, store.count(core::v1::Event));
        let list = store
            .list(core::v1::Event, &crate::store::ListOptions::in_namespace("test"))
            .await
            .unwrap();
        let event = &list.items[0];
        assert_eq!(Some("Warning"), event.str_value("/type"));
        assert_eq!(Some("test123"), event.str_value("/involvedObject/name"));
        assert!(store
            .get(core::v1::Event, &ObjectIdRef::new("test", event.name()))
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn memory_recorder_counts_events_by_reason() {
        let recorder = MemoryEventRecorder::new();
        recorder.record(&secret(), EventKind::Warning, "SyncError", "one");
        recorder.record(&secret(), EventKind::Normal, "Synced", "two");
        assert_eq!(1, recorder.count(EventKind::Warning, "SyncError"));
        assert_eq!("test/test123", recorder.events()[0].object);
    }
}

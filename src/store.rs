//! The object store primitive that both clusters are accessed through.
//!
//! `HttpStore` talks to a real api server. `MemoryStore` keeps everything in process, and backs
//! the test kit.
pub mod http;
pub mod memory;

pub use self::http::HttpStore;
pub use self::memory::MemoryStore;

use crate::k8s_types::K8sType;
use crate::resource::{InvalidResourceError, K8sResource, ObjectIdRef};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use std::fmt::{self, Debug, Display};

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    /// The resource version of an update did not match the stored one
    Conflict(String),
    AlreadyExists(String),
    /// The watch can not resume from the given resource version, a new list is required
    Expired(String),
    /// Any other error status from the api server
    Api { code: u16, message: String },
    /// The request never got a response
    Transport(String),
    Invalid(InvalidResourceError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, StoreError::Expired(_))
    }

    /// Errors that a later retry of the same operation may not hit again
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Invalid(_) => false,
            StoreError::Api { code, .. } => *code >= 500 || *code == 429,
            _ => true,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Conflict(what) => write!(f, "conflict: {}", what),
            StoreError::AlreadyExists(what) => write!(f, "already exists: {}", what),
            StoreError::Expired(what) => write!(f, "resource version expired: {}", what),
            StoreError::Api { code, message } => write!(f, "api error {}: {}", code, message),
            StoreError::Transport(msg) => write!(f, "transport error: {}", msg),
            StoreError::Invalid(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Invalid(e) => Some(e),
            _ => None,
        }
    }
}

impl From<InvalidResourceError> for StoreError {
    fn from(err: InvalidResourceError) -> StoreError {
        StoreError::Invalid(err)
    }
}

/// A set of equality (`key=value`, `key!=value`) and existence (`key`, `!key`) requirements,
/// joined by commas, the subset of the label selector syntax that the syncers use.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<LabelSelector, String> {
        let mut requirements = Vec::new();
        for part in selector.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let req = if let Some(idx) = part.find("!=") {
                Requirement::NotEquals(part[..idx].trim().to_owned(), part[idx + 2..].trim().to_owned())
            } else if let Some(idx) = part.find('=') {
                let value = part[idx + 1..].trim_start_matches('=');
                Requirement::Equals(part[..idx].trim().to_owned(), value.trim().to_owned())
            } else if let Some(key) = part.strip_prefix('!') {
                Requirement::NotExists(key.trim().to_owned())
            } else {
                Requirement::Exists(part.to_owned())
            };
            let key = match &req {
                Requirement::Equals(k, _)
                | Requirement::NotEquals(k, _)
                | Requirement::Exists(k)
                | Requirement::NotExists(k) => k,
            };
            if key.is_empty() {
                return Err(format!("invalid label selector requirement: '{}'", part));
            }
            requirements.push(req);
        }
        Ok(LabelSelector { requirements })
    }

    pub fn matches(&self, labels: &crate::resource::StringMap) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListOptions {
    /// Restricts the list or watch to one namespace. `None` means all namespaces.
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
}

impl ListOptions {
    pub fn all() -> ListOptions {
        ListOptions::default()
    }

    pub fn in_namespace(namespace: impl Into<String>) -> ListOptions {
        ListOptions {
            namespace: Some(namespace.into()),
            label_selector: None,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> ListOptions {
        self.label_selector = Some(selector.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectList {
    pub resource_version: String,
    pub items: Vec<K8sResource>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(K8sResource),
    Modified(K8sResource),
    Deleted(K8sResource),
}

impl WatchEvent {
    pub fn resource(&self) -> &K8sResource {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r,
        }
    }

    pub fn into_resource(self) -> K8sResource {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, WatchEvent::Deleted(_))
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// A key-value object store with watch, where every object carries a resource version used for
/// optimistic concurrency. Writes that carry a stale `metadata.resourceVersion` fail with
/// `StoreError::Conflict`.
#[async_trait]
pub trait ObjectStore: Send + Sync + Debug + 'static {
    /// Returns `None` if the object does not exist
    async fn get(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<Option<K8sResource>, StoreError>;

    async fn list(&self, k8s_type: &K8sType, options: &ListOptions) -> Result<ObjectList, StoreError>;

    async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError>;

    /// Replaces the whole object. `resource` must carry the resource version it was read at.
    async fn update(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError>;

    /// Replaces only the `status` of the object
    async fn update_status(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError>;

    /// Deleting an object that does not exist is not an error
    async fn delete(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<(), StoreError>;

    /// Streams changes that happened after `resource_version`
    async fn watch(
        &self,
        k8s_type: &K8sType,
        options: &ListOptions,
        resource_version: &str,
    ) -> Result<WatchStream, StoreError>;
}

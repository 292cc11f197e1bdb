//! Hooks mutate objects on their way through the clients of the host process. Interceptors
//! handle raw requests that the host process forwards to the plugin.
use crate::error::Error;
use crate::k8s_types::K8sType;
use crate::syncer::Side;

use async_trait::async_trait;
use hyper::{Body, Request, Response};
use serde_json::Value;

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Get,
}

/// One kind of client call a hook can intercept: an operation, against one of the clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mutation {
    pub operation: Operation,
    pub side: Side,
}

impl Mutation {
    pub fn new(operation: Operation, side: Side) -> Mutation {
        Mutation { operation, side }
    }
}

impl Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let side = match self.side {
            Side::Virtual => "Virtual",
            Side::Host => "Host",
        };
        write!(f, "{:?}{}", self.operation, side)
    }
}

/// A stateless mutation of objects of one kind. Returning an error fails the client call that
/// triggered it.
pub trait ClientHook: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn resource_type(&self) -> &'static K8sType;

    fn mutations(&self) -> Vec<Mutation>;

    fn mutate(&self, mutation: Mutation, object: Value) -> Result<Value, Error>;
}

/// The key that hooks are grouped by, announced to the host process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookKey {
    pub api_version: String,
    pub kind: String,
    #[serde(rename = "type")]
    pub mutation: Mutation,
}

#[derive(Debug)]
pub struct HookError {
    pub hook: String,
    pub error: Error,
}

impl Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "hook '{}' failed: {}", self.hook, self.error)
    }
}

impl std::error::Error for HookError {}

/// Hooks grouped by kind and mutation, in registration order
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: BTreeMap<HookKey, Vec<Arc<dyn ClientHook>>>,
}

impl Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.hooks.keys()).finish()
    }
}

impl HookRegistry {
    pub fn new() -> HookRegistry {
        HookRegistry::default()
    }

    pub fn add(&mut self, hook: Arc<dyn ClientHook>) {
        let k8s_type = hook.resource_type();
        for mutation in hook.mutations() {
            let key = HookKey {
                api_version: k8s_type.api_version.to_owned(),
                kind: k8s_type.kind.to_owned(),
                mutation,
            };
            self.hooks.entry(key).or_default().push(hook.clone());
        }
    }

    pub fn keys(&self) -> Vec<HookKey> {
        self.hooks.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every hook registered for the kind and mutation, each one on the output of the
    /// previous one. Returns the final object, and whether any hook ran at all.
    pub fn mutate(
        &self,
        api_version: &str,
        kind: &str,
        mutation: Mutation,
        object: Value,
    ) -> Result<(Value, bool), HookError> {
        let key = HookKey {
            api_version: api_version.to_owned(),
            kind: kind.to_owned(),
            mutation,
        };
        let hooks = match self.hooks.get(&key) {
            Some(hooks) => hooks,
            None => return Ok((object, false)),
        };
        let mut current = object;
        for hook in hooks.iter() {
            log::debug!("Running hook '{}' for {}/{} {}", hook.name(), api_version, kind, mutation);
            current = hook.mutate(mutation, current).map_err(|error| HookError {
                hook: hook.name().to_owned(),
                error,
            })?;
        }
        Ok((current, true))
    }
}

/// Handles requests the host process forwards to the plugin by name. Served regardless of
/// leadership.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn handle(&self, request: Request<Body>) -> Result<Response<Body>, Error>;
}

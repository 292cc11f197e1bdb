//! The conversation with the host process that runs the plugin: it hands over the cluster
//! configs, learns about the plugin's hooks and interceptors, and tells the plugin when it
//! becomes, or stops being, the leader.
use crate::hook::{HookError, HookKey, HookRegistry, Interceptor, Mutation};
use crate::runner::metrics::Metrics;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::io;
use std::sync::Arc;

/// What the host process sends when it initializes the plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfig {
    /// kubeconfig of the virtual cluster
    pub virtual_cluster_config: String,
    /// kubeconfig of the host cluster
    pub host_cluster_config: String,
    pub target_namespace: String,
    pub current_namespace: String,
    /// Name of the virtual cluster
    pub name: String,
    /// Port that interceptors are served on. Zero means no interceptor port was assigned.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub working_dir: String,
}

/// What the plugin answers once it is ready
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyInfo {
    pub hooks: Vec<HookKey>,
    pub interceptors: Vec<String>,
    #[serde(default)]
    pub interceptor_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leadership {
    Pending,
    Acquired,
    Lost,
    /// The host process has not been heard from for too long
    Disconnected,
}

/// Everything the host process calls back into once the plugin is ready
#[derive(Clone)]
pub struct PluginHandlers {
    pub hooks: Arc<HookRegistry>,
    pub interceptors: Arc<BTreeMap<String, Arc<dyn Interceptor>>>,
    pub metrics: Metrics,
}

impl Debug for PluginHandlers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PluginHandlers")
            .field("hooks", &self.hooks)
            .field("interceptors", &self.interceptors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginHandlers {
    pub fn ready_info(&self, interceptor_port: u16) -> ReadyInfo {
        ReadyInfo {
            hooks: self.hooks.keys(),
            interceptors: self.interceptors.keys().cloned().collect(),
            interceptor_port,
        }
    }
}

#[derive(Debug)]
pub enum HandshakeError {
    Io(io::Error),
    Server(String),
    /// The host process went away before the handshake finished
    Closed,
    Invalid(String),
}

impl Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandshakeError::Io(e) => write!(f, "handshake io error: {}", e),
            HandshakeError::Server(e) => write!(f, "plugin server error: {}", e),
            HandshakeError::Closed => f.write_str("host process went away during the handshake"),
            HandshakeError::Invalid(msg) => write!(f, "invalid handshake: {}", msg),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> HandshakeError {
        HandshakeError::Io(err)
    }
}

/// The host process, as seen from the plugin
#[async_trait]
pub trait HostProcess: Send + Sync + 'static {
    /// Waits until the host process hands over its configuration
    async fn initialize(&self) -> Result<InitConfig, HandshakeError>;

    /// Announces hooks and interceptors, and starts serving them
    async fn set_ready(&self, handlers: PluginHandlers) -> Result<ReadyInfo, HandshakeError>;

    /// Follows the leadership state as reported by the host process
    fn leadership(&self) -> watch::Receiver<Leadership>;
}

/// A host process that lives in the same process, for embedding and tests. Leadership is
/// granted and revoked by calling methods on it.
pub struct LocalHostProcess {
    config: InitConfig,
    leadership: watch::Sender<Leadership>,
    // keeps the channel open while nobody else is listening
    _leadership_rx: watch::Receiver<Leadership>,
    handlers: Mutex<Option<PluginHandlers>>,
}

impl Debug for LocalHostProcess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LocalHostProcess")
            .field("name", &self.config.name)
            .field("leadership", &*self.leadership.borrow())
            .finish()
    }
}

impl LocalHostProcess {
    pub fn new(config: InitConfig) -> LocalHostProcess {
        let (leadership, rx) = watch::channel(Leadership::Pending);
        LocalHostProcess {
            config,
            leadership,
            _leadership_rx: rx,
            handlers: Mutex::new(None),
        }
    }

    pub fn grant_leadership(&self) {
        self.set_leadership(Leadership::Acquired);
    }

    pub fn revoke_leadership(&self) {
        self.set_leadership(Leadership::Lost);
    }

    pub fn disconnect(&self) {
        self.set_leadership(Leadership::Disconnected);
    }

    fn set_leadership(&self, leadership: Leadership) {
        log::info!("Local host process setting leadership to {:?}", leadership);
        let _ = self.leadership.send(leadership);
    }

    /// The ready info, once the plugin announced it
    pub fn ready_info(&self) -> Option<ReadyInfo> {
        self.handlers
            .lock()
            .as_ref()
            .map(|handlers| handlers.ready_info(self.config.port))
    }

    /// Runs the hooks of the plugin, the way the host process does for its clients
    pub fn mutate(
        &self,
        api_version: &str,
        kind: &str,
        mutation: Mutation,
        object: Value,
    ) -> Result<(Value, bool), HookError> {
        let hooks = self
            .handlers
            .lock()
            .as_ref()
            .map(|handlers| handlers.hooks.clone())
            .unwrap_or_default();
        hooks.mutate(api_version, kind, mutation, object)
    }
}

#[async_trait]
impl HostProcess for LocalHostProcess {
    async fn initialize(&self) -> Result<InitConfig, HandshakeError> {
        Ok(self.config.clone())
    }

    async fn set_ready(&self, handlers: PluginHandlers) -> Result<ReadyInfo, HandshakeError> {
        let info = handlers.ready_info(self.config.port);
        *self.handlers.lock() = Some(handlers);
        Ok(info)
    }

    fn leadership(&self) -> watch::Receiver<Leadership> {
        self.leadership.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_config_uses_camel_case_and_defaults() {
        let config: InitConfig = serde_json::from_value(json!({
            "virtualClusterConfig": "v",
            "hostClusterConfig": "h",
            "targetNamespace": "vcluster",
            "currentNamespace": "vcluster",
            "name": "vc",
        }))
        .unwrap();
        assert_eq!(0, config.port);
        assert_eq!("", config.working_dir);
        assert_eq!("vcluster", config.target_namespace);
    }

    #[tokio::test]
    async fn local_host_process_reports_leadership_changes() {
        let host = LocalHostProcess::new(InitConfig {
            virtual_cluster_config: String::new(),
            host_cluster_config: String::new(),
            target_namespace: "vcluster".to_owned(),
            current_namespace: "vcluster".to_owned(),
            name: "vc".to_owned(),
            port: 0,
            working_dir: String::new(),
        });
        let mut leadership = host.leadership();
        assert_eq!(Leadership::Pending, *leadership.borrow());
        host.grant_leadership();
        leadership.changed().await.unwrap();
        assert_eq!(Leadership::Acquired, *leadership.borrow());
        assert!(host.ready_info().is_none());
    }
}

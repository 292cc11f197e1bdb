//! Configuration: how to reach each cluster (`ClientConfig`), how the plugin runtime behaves
//! (`PluginOptions`), and the user supplied plugin config blob (`unmarshal_config`).
pub mod kubeconfig;

pub use self::kubeconfig::{KubeConfig, KubeConfigError};

use serde::de::DeserializeOwned;

use std::fmt::{self, Display};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable holding the plugin config, as YAML or JSON
pub const PLUGIN_CONFIG_ENV: &str = "PLUGIN_CONFIG";
/// Environment variable overriding the address of the plugin server
pub const PLUGIN_ADDRESS_ENV: &str = "PLUGIN_ADDRESS";

const DEFAULT_PLUGIN_ADDRESS: ([u8; 4], u16) = ([127, 0, 0, 1], 10099);
const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

/// Certificate authority for verifying the api server's certificate
#[derive(Debug, Clone, PartialEq)]
pub enum CAData {
    /// Path to a PEM file
    File(String),
    /// Base64 encoded PEM contents, as they appear in kubeconfig files
    Contents(String),
}

#[derive(Clone, PartialEq)]
pub enum Credentials {
    /// The complete value of the `Authorization` header
    Header(String),
    /// Client certificate and key, both base64 encoded PEM
    Pem {
        certificate_base64: String,
        private_key_base64: String,
    },
    /// Paths to the client certificate and key PEM files
    PemPath {
        certificate_path: String,
        private_key_path: String,
    },
}

impl Credentials {
    pub fn bearer_token(token: &str) -> Credentials {
        Credentials::Header(format!("Bearer {}", token.trim()))
    }

    pub fn basic(username: &str, password: &str) -> Credentials {
        let encoded = base64::encode(format!("{}:{}", username, password));
        Credentials::Header(format!("Basic {}", encoded))
    }

    pub fn authorization_header(&self) -> Option<&str> {
        match self {
            Credentials::Header(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

// credentials are never printed
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Credentials::Header(_) => f.write_str("Credentials::Header(<redacted>)"),
            Credentials::Pem { .. } => f.write_str("Credentials::Pem(<redacted>)"),
            Credentials::PemPath {
                certificate_path, ..
            } => write!(f, "Credentials::PemPath({})", certificate_path),
        }
    }
}

/// Everything needed to build an http client for one api server
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub credentials: Credentials,
    pub ca_data: Option<CAData>,
    pub user_agent: String,
    pub verify_ssl_certs: bool,
    pub impersonate: Option<String>,
    pub impersonate_groups: Vec<String>,
}

impl ClientConfig {
    pub fn new(
        api_server_endpoint: impl Into<String>,
        credentials: Credentials,
        user_agent: impl Into<String>,
    ) -> ClientConfig {
        ClientConfig {
            api_server_endpoint: api_server_endpoint.into(),
            credentials,
            ca_data: None,
            user_agent: user_agent.into(),
            verify_ssl_certs: true,
            impersonate: None,
            impersonate_groups: Vec::new(),
        }
    }

    /// Uses the service account token that is mounted into every pod
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, io::Error> {
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)?;
        let ca_data = if Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            Some(CAData::File(SERVICE_ACCOUNT_CA_PATH.to_owned()))
        } else {
            None
        };
        let mut conf = ClientConfig::new(
            format!("https://{}", API_SERVER_HOSTNAME),
            Credentials::bearer_token(&token),
            user_agent,
        );
        conf.ca_data = ca_data;
        Ok(conf)
    }

    /// Loads the kubeconfig from `$KUBECONFIG` or `~/.kube/config`
    pub fn from_kubeconfig(user_agent: impl Into<String>) -> Result<ClientConfig, KubeConfigError> {
        kubeconfig::load_from_kubeconfig(user_agent.into())
    }

    /// Parses a kubeconfig that was handed over in memory, for example during the handshake with
    /// the host process. Relative file paths in it are resolved against `working_dir`.
    pub fn from_kubeconfig_bytes(
        user_agent: impl Into<String>,
        bytes: &[u8],
        working_dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        let conf = KubeConfig::from_bytes(bytes)?;
        conf.create_client_config(user_agent.into(), working_dir)
    }
}

/// Knobs for the plugin runtime. Built with the `with_*` methods:
///
/// ```
/// use vcluster_sdk::config::PluginOptions;
/// use std::time::Duration;
///
/// let options = PluginOptions::new("import-secrets")
///     .with_max_concurrent_reconciles(8)
///     .with_cache_sync_timeout(Duration::from_secs(30));
/// assert_eq!(8, options.max_concurrent_reconciles);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PluginOptions {
    pub plugin_name: String,
    /// Loopback address the plugin server listens on
    pub listen_address: SocketAddr,
    pub expose_metrics: bool,
    pub expose_health: bool,
    /// Upper bound for waiting on the initial list of every cache
    pub cache_sync_timeout: Duration,
    /// The host process is considered gone when it has not been heard from for this long.
    /// `None` disables the check.
    pub heartbeat_timeout: Option<Duration>,
    /// Passes that may run at once per syncer
    pub max_concurrent_reconciles: usize,
    pub initial_requeue_delay: Duration,
    pub max_requeue_delay: Duration,
    /// Delay before an informer retries after its list or watch failed
    pub watch_retry_delay: Duration,
}

impl PluginOptions {
    pub fn new(plugin_name: impl Into<String>) -> PluginOptions {
        let listen_address = std::env::var(PLUGIN_ADDRESS_ENV)
            .ok()
            .and_then(|addr| addr.parse().ok())
            .unwrap_or_else(|| DEFAULT_PLUGIN_ADDRESS.into());
        PluginOptions {
            plugin_name: plugin_name.into(),
            listen_address,
            expose_metrics: true,
            expose_health: true,
            cache_sync_timeout: Duration::from_secs(60),
            heartbeat_timeout: None,
            max_concurrent_reconciles: 4,
            initial_requeue_delay: Duration::from_millis(100),
            max_requeue_delay: Duration::from_secs(60),
            watch_retry_delay: Duration::from_secs(10),
        }
    }

    pub fn with_listen_address(mut self, address: SocketAddr) -> Self {
        self.listen_address = address;
        self
    }

    pub fn expose_metrics(mut self, expose: bool) -> Self {
        self.expose_metrics = expose;
        self
    }

    pub fn expose_health(mut self, expose: bool) -> Self {
        self.expose_health = expose;
        self
    }

    pub fn with_cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrent_reconciles(mut self, max: usize) -> Self {
        self.max_concurrent_reconciles = max.max(1);
        self
    }

    pub fn with_requeue_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_requeue_delay = initial;
        self.max_requeue_delay = max.max(initial);
        self
    }

    pub fn with_watch_retry_delay(mut self, delay: Duration) -> Self {
        self.watch_retry_delay = delay;
        self
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// The environment variable is not set, or empty
    Missing,
    Format(serde_yaml::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Missing => write!(f, "environment variable {} is not set", PLUGIN_CONFIG_ENV),
            ConfigError::Format(e) => write!(f, "invalid plugin config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Format(e) => Some(e),
            ConfigError::Missing => None,
        }
    }
}

/// Reads the plugin config from the `PLUGIN_CONFIG` environment variable into `T`. The value may
/// be YAML or JSON.
pub fn unmarshal_config<T: DeserializeOwned>() -> Result<T, ConfigError> {
    let raw = std::env::var(PLUGIN_CONFIG_ENV).unwrap_or_default();
    parse_config(raw.as_str())
}

pub fn parse_config<T: DeserializeOwned>(raw: &str) -> Result<T, ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::Missing);
    }
    serde_yaml::from_str(raw).map_err(ConfigError::Format)
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct PullSecretConfig {
        destination_namespace: String,
        #[serde(default)]
        extra: Vec<String>,
    }

    #[test]
    fn parse_config_accepts_yaml_and_json() {
        let from_yaml: PullSecretConfig = parse_config("destinationNamespace: default\n").unwrap();
        let from_json: PullSecretConfig =
            parse_config(r#"{"destinationNamespace": "default"}"#).unwrap();
        assert_eq!(from_yaml, from_json);
        assert_eq!("default", from_yaml.destination_namespace);
    }

    #[test]
    fn empty_config_is_missing() {
        let result = parse_config::<PullSecretConfig>("  ");
        assert!(matches!(result, Err(ConfigError::Missing)));
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let creds = Credentials::bearer_token("super-secret");
        assert!(!format!("{:?}", creds).contains("super-secret"));
        assert_eq!(Some("Bearer super-secret"), creds.authorization_header());
    }
}

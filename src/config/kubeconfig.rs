use super::{CAData, ClientConfig, Credentials};

use std::fmt::{self, Display};
use std::io;
use std::path::{Path, PathBuf};

/// Error parsing a kubeconfig, or turning one of its contexts into a `ClientConfig`
#[derive(Debug)]
pub enum KubeConfigError {
    Io(io::Error),
    Format(serde_yaml::Error),
    NoHomeDir,
    UnknownContext(String),
    UnknownCluster(String),
    UnknownUser(String),
    /// The user entry has half of a credential pair, e.g. a certificate without a key
    IncompleteCredentials(&'static str),
    MissingCredentials(String),
}

impl From<serde_yaml::Error> for KubeConfigError {
    fn from(err: serde_yaml::Error) -> KubeConfigError {
        KubeConfigError::Format(err)
    }
}

impl From<io::Error> for KubeConfigError {
    fn from(err: io::Error) -> KubeConfigError {
        KubeConfigError::Io(err)
    }
}

impl Display for KubeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KubeConfigError::Io(e) => write!(f, "failed to read kubeconfig: {}", e),
            KubeConfigError::Format(e) => write!(f, "malformed kubeconfig: {}", e),
            KubeConfigError::NoHomeDir => {
                f.write_str("KUBECONFIG is unset and the home directory is unknown")
            }
            KubeConfigError::UnknownContext(name) => write!(f, "kubeconfig has no context '{}'", name),
            KubeConfigError::UnknownCluster(name) => write!(f, "kubeconfig has no cluster '{}'", name),
            KubeConfigError::UnknownUser(name) => write!(f, "kubeconfig has no user '{}'", name),
            KubeConfigError::IncompleteCredentials(msg) => write!(f, "incomplete credentials: {}", msg),
            KubeConfigError::MissingCredentials(user) => write!(
                f,
                "user '{}' has neither a token, a username and password, nor a client certificate",
                user
            ),
        }
    }
}
impl std::error::Error for KubeConfigError {}

/// Loads `$KUBECONFIG`, falling back to `~/.kube/config`, and builds a client for its current
/// context. Only used when a plugin runs outside of a virtual cluster pod.
pub fn load_from_kubeconfig(user_agent: String) -> Result<ClientConfig, KubeConfigError> {
    let path = match std::env::var_os("KUBECONFIG") {
        Some(path) => PathBuf::from(path),
        None => dirs::home_dir()
            .map(|home| home.join(".kube").join("config"))
            .ok_or(KubeConfigError::NoHomeDir)?,
    };
    log::debug!("Loading kubeconfig from {}", path.display());
    let bytes = std::fs::read(&path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    KubeConfig::from_bytes(&bytes)?.create_client_config(user_agent, dir)
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "user", alias = "context")]
    value: T,
}

fn find<'a, T>(entries: &'a [Named<T>], name: &str) -> Option<&'a T> {
    entries
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| &entry.value)
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority_data: Option<String>,
    certificate_authority: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
    client_certificate: Option<String>,
    client_key: Option<String>,
    #[serde(rename = "as")]
    impersonate: Option<String>,
    #[serde(default)]
    as_groups: Vec<String>,
}

impl UserEntry {
    fn credentials(&self, name: &str, dir: &Path) -> Result<Credentials, KubeConfigError> {
        let resolve = |path: &String| dir.join(path).to_string_lossy().into_owned();

        match self {
            UserEntry { token: Some(token), .. } => Ok(Credentials::bearer_token(token)),
            UserEntry { username: Some(username), password, .. } => password
                .as_ref()
                .map(|password| Credentials::basic(username, password))
                .ok_or(KubeConfigError::IncompleteCredentials("username without password")),
            UserEntry { client_certificate_data: Some(certificate), client_key_data, .. } => client_key_data
                .as_ref()
                .map(|key| Credentials::Pem {
                    certificate_base64: certificate.clone(),
                    private_key_base64: key.clone(),
                })
                .ok_or(KubeConfigError::IncompleteCredentials(
                    "client-certificate-data without client-key-data",
                )),
            UserEntry { client_certificate: Some(certificate), client_key, .. } => client_key
                .as_ref()
                .map(|key| Credentials::PemPath {
                    certificate_path: resolve(certificate),
                    private_key_path: resolve(key),
                })
                .ok_or(KubeConfigError::IncompleteCredentials(
                    "client-certificate without client-key",
                )),
            _ => Err(KubeConfigError::MissingCredentials(name.to_owned())),
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ContextEntry {
    cluster: String,
    user: String,
}

/// The parts of a kubeconfig needed to reach one api server
#[derive(Deserialize, Debug, PartialEq, Clone)]
pub struct KubeConfig {
    #[serde(rename = "current-context")]
    current_context: String,
    #[serde(default)]
    clusters: Vec<Named<ClusterEntry>>,
    #[serde(default)]
    users: Vec<Named<UserEntry>>,
    #[serde(default)]
    contexts: Vec<Named<ContextEntry>>,
}

impl KubeConfig {
    pub fn from_bytes(bytes: &[u8]) -> Result<KubeConfig, KubeConfigError> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    pub fn current_context(&self) -> &str {
        self.current_context.as_str()
    }

    /// Client for the current context. Relative certificate paths are resolved against `dir`.
    pub fn create_client_config(&self, user_agent: String, dir: &Path) -> Result<ClientConfig, KubeConfigError> {
        self.client_config_for_context(self.current_context.as_str(), user_agent, dir)
    }

    pub fn client_config_for_context(
        &self,
        context: &str,
        user_agent: String,
        dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        let context = find(&self.contexts, context)
            .ok_or_else(|| KubeConfigError::UnknownContext(context.to_owned()))?;
        let cluster = find(&self.clusters, &context.cluster)
            .ok_or_else(|| KubeConfigError::UnknownCluster(context.cluster.clone()))?;
        let user = find(&self.users, &context.user)
            .ok_or_else(|| KubeConfigError::UnknownUser(context.user.clone()))?;

        let ca_data = match (&cluster.certificate_authority_data, &cluster.certificate_authority) {
            (Some(data), _) => Some(CAData::Contents(data.clone())),
            (None, Some(path)) => Some(CAData::File(dir.join(path).to_string_lossy().into_owned())),
            (None, None) => None,
        };
        Ok(ClientConfig {
            api_server_endpoint: cluster.server.clone(),
            credentials: user.credentials(&context.user, dir)?,
            ca_data,
            user_agent,
            verify_ssl_certs: !cluster.insecure_skip_tls_verify,
            impersonate: user.impersonate.clone(),
            impersonate_groups: user.as_groups.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const VCLUSTER_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: my-vcluster
clusters:
- name: my-vcluster
  cluster:
    server: https://127.0.0.1:8443
    certificate-authority: certs/ca.crt
- name: host
  cluster:
    server: https://kubernetes.default.svc
    certificate-authority-data: Y2E=
    insecure-skip-tls-verify: true
contexts:
- name: my-vcluster
  context:
    cluster: my-vcluster
    user: my-vcluster
- name: host
  context:
    cluster: host
    user: syncer
users:
- name: my-vcluster
  user:
    client-certificate-data: Y2VydA==
    client-key-data: a2V5
- name: syncer
  user:
    token: abc
"#;

    fn kubeconfig() -> KubeConfig {
        KubeConfig::from_bytes(VCLUSTER_KUBECONFIG.as_bytes()).unwrap()
    }

    #[test]
    fn current_context_uses_client_certificates() {
        let client = kubeconfig()
            .create_client_config("plugin".to_owned(), Path::new("/plugin"))
            .unwrap();
        assert_eq!("https://127.0.0.1:8443", client.api_server_endpoint);
        assert_eq!(Some(CAData::File("/plugin/certs/ca.crt".to_owned())), client.ca_data);
        assert!(client.verify_ssl_certs);
        match client.credentials {
            Credentials::Pem { ref certificate_base64, .. } => assert_eq!("Y2VydA==", certificate_base64),
            other => panic!("unexpected credentials: {:?}", other),
        }
    }

    #[test]
    fn other_contexts_can_be_selected() {
        let client = kubeconfig()
            .client_config_for_context("host", "plugin".to_owned(), Path::new("/"))
            .unwrap();
        assert_eq!("https://kubernetes.default.svc", client.api_server_endpoint);
        assert_eq!(Some(CAData::Contents("Y2E=".to_owned())), client.ca_data);
        assert!(!client.verify_ssl_certs);
        assert_eq!(Some("Bearer abc"), client.credentials.authorization_header());
    }

    #[test]
    fn dangling_references_are_errors() {
        let conf = kubeconfig();
        let result = conf.client_config_for_context("nope", "plugin".to_owned(), Path::new("/"));
        assert!(matches!(result, Err(KubeConfigError::UnknownContext(ref name)) if name == "nope"));

        let broken = VCLUSTER_KUBECONFIG.replace("    user: syncer", "    user: nobody");
        let conf = KubeConfig::from_bytes(broken.as_bytes()).unwrap();
        let result = conf.client_config_for_context("host", "plugin".to_owned(), Path::new("/"));
        assert!(matches!(result, Err(KubeConfigError::UnknownUser(_))));
    }

    #[test]
    fn half_a_certificate_pair_is_rejected() {
        let broken = VCLUSTER_KUBECONFIG.replace("    client-key-data: a2V5\n", "");
        let conf = KubeConfig::from_bytes(broken.as_bytes()).unwrap();
        let result = conf.create_client_config("plugin".to_owned(), Path::new("/"));
        assert!(matches!(result, Err(KubeConfigError::IncompleteCredentials(_))));
    }
}

//! Ready-made syncers, initializers and hooks. They double as examples of how the traits in
//! `syncer` and `hook` are meant to be implemented.
mod crd;
mod import_secrets;
mod manifest;
mod mirror;
mod pod_hook;
mod pull_secret;

pub use self::crd::{crd_sync, CrdInitializer};
pub use self::import_secrets::ImportSecretsSyncer;
pub use self::manifest::{parse_manifest, ManifestInitializer};
pub use self::mirror::NamespacedMirror;
pub use self::pod_hook::PodLabelHook;
pub use self::pull_secret::{PullSecretSyncer, PLUGIN_LABEL, PLUGIN_LABEL_VALUE};

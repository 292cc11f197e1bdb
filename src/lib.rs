//! vcluster-sdk lets you write plugins for a virtual cluster: small programs that keep objects
//! of some kind in sync between a virtual cluster and the namespace of the host cluster it runs
//! in, or that mutate the objects the virtual cluster writes to the host.
//!
//! A plugin registers one or more `Syncer`s, hooks, initializers or interceptors, and then hands
//! control to the runner, which waits until the host process elects it as the leader.
//!
//! Secret mirror example:
//! ```no_run
//! use vcluster_sdk::prelude::*;
//!
//! // this function will block the current thread until the plugin stops, which it only ever
//! // does because of an error
//! run_plugin(PluginOptions::new("secret-mirror"), |ctx| {
//!     vec![
//!         // every secret of the virtual cluster gets a copy in the target namespace of the
//!         // host cluster, named `{name}-x-{namespace}-x-{virtual cluster name}`
//!         Registration::syncer(NamespacedMirror::new(ctx, "secrets", k8s_types::core::v1::Secret)),
//!         // and secrets can be imported from the host by annotating them with
//!         // `vcluster.loft.sh/import: NAMESPACE/NAME`
//!         Registration::syncer(ImportSecretsSyncer::new(ctx)),
//!     ]
//! });
//! ```
//!
//! Syncers only need to say which kind they sync and how names map between the clusters. The
//! runner takes care of watching both clusters, deciding which side to write, merging metadata,
//! retrying on conflicts, and never touching host objects that this virtual cluster does not
//! own.
//!

#[macro_use]
extern crate serde_derive;

pub mod builtin;
pub mod config;
pub mod error;
pub mod event;
pub mod hook;
pub mod k8s_types;
pub mod mapper;
pub mod metadata;
pub mod resource;
pub mod runner;
pub mod store;
pub mod syncer;
pub mod translate;

pub use serde;
pub use serde_json;
pub use serde_yaml;

pub mod prelude {
    pub use crate::builtin::{ImportSecretsSyncer, ManifestInitializer, NamespacedMirror, PodLabelHook, PullSecretSyncer};
    pub use crate::config::{parse_config, unmarshal_config, ClientConfig, PluginOptions};
    pub use crate::error::{Error, MessageError};
    pub use crate::event::{EventKind, EventRecorder};
    pub use crate::hook::{ClientHook, Interceptor, Mutation, Operation};
    pub use crate::k8s_types::{self, K8sType};
    pub use crate::resource::{K8sResource, ObjectId, ObjectIdRef};
    pub use crate::runner::{run_plugin, try_run_plugin, Manager};
    pub use crate::syncer::{Initializer, OwnershipPolicy, RegisterContext, Registration, Side, SyncMode, Syncer};
    pub use crate::translate::{ImportTranslator, NameTranslator, NamespacedTranslator};
    pub use serde::{Deserialize, Serialize};
}

//! Copies the image pull secrets of the host's target namespace into one virtual namespace,
//! which is read from the plugin config:
//!
//! ```yaml
//! destinationNamespace: default
//! ```
#[macro_use]
extern crate serde_derive;

use vcluster_sdk::config::ConfigError;
use vcluster_sdk::prelude::*;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullSecretConfig {
    #[serde(default = "default_namespace")]
    destination_namespace: String,
}

fn default_namespace() -> String {
    "default".to_owned()
}

fn main() {
    env_logger::init();
    let config = match unmarshal_config::<PullSecretConfig>() {
        Ok(config) => config,
        Err(ConfigError::Missing) => PullSecretConfig {
            destination_namespace: default_namespace(),
        },
        Err(err) => {
            log::error!("Invalid plugin config: {}", err);
            std::process::exit(1);
        }
    };
    log::info!("Syncing pull secrets into namespace '{}'", config.destination_namespace);

    run_plugin(PluginOptions::new("pull-secret-sync"), move |ctx| {
        vec![Registration::syncer(PullSecretSyncer::new(
            ctx,
            config.destination_namespace,
        ))]
    })
}

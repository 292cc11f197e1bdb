//! Applies a manifest to the virtual cluster once, when the plugin starts. The path can be
//! overridden with `MANIFEST_PATH`.
use vcluster_sdk::prelude::*;

const DEFAULT_MANIFEST_PATH: &str = "/manifests/mydeployment.yaml";

fn main() {
    env_logger::init();
    let path = std::env::var("MANIFEST_PATH").unwrap_or_else(|_| DEFAULT_MANIFEST_PATH.to_owned());
    run_plugin(PluginOptions::new("bootstrap-with-deployment"), move |_| {
        vec![Registration::initializer(ManifestInitializer::from_file(
            "mydeployment",
            path,
        ))]
    })
}

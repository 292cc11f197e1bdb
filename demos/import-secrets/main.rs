//! Imports every secret of the host's target namespace that is annotated with
//! `vcluster.loft.sh/import: NAMESPACE/NAME` into the virtual cluster.
use vcluster_sdk::prelude::*;

fn main() {
    env_logger::init();
    run_plugin(PluginOptions::new("import-secrets"), |ctx| {
        vec![Registration::syncer(ImportSecretsSyncer::new(ctx))]
    })
}

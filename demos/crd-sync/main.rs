//! Syncs `Car` objects from the virtual cluster to the host. The CRD is copied from the host
//! cluster into the virtual cluster before the syncer starts.
use vcluster_sdk::builtin::crd_sync;
use vcluster_sdk::prelude::*;

#[allow(non_upper_case_globals)]
static Car: &K8sType = &K8sType {
    api_version: "demo.loft.sh/v1",
    kind: "Car",
    plural_kind: "cars",
    namespaced: true,
};

fn main() {
    env_logger::init();
    run_plugin(PluginOptions::new("crd-sync"), |ctx| vec![crd_sync(ctx, Car)])
}

use crate::k8s_types::{core, K8sType};
use crate::resource::{K8sResource, ObjectIdRef, StringMap};
use crate::syncer::{RegisterContext, SyncMode, Syncer};
use crate::translate::{FixedNamespaceTranslator, NameTranslator, RESERVED_PREFIX};

/// Label that marks virtual secrets created by the pull secret syncer
pub const PLUGIN_LABEL: &str = "plugin.vcluster.loft.sh/managed-by";
pub const PLUGIN_LABEL_VALUE: &str = "pull-secret-sync";

const DOCKER_CONFIG_JSON: &str = "kubernetes.io/dockerconfigjson";

/// Copies every image pull secret of the host's target namespace into one virtual namespace,
/// under the same name. Other secret types are ignored, and a copied secret is deleted once its
/// host secret is gone or stops being a pull secret.
#[derive(Debug, Clone)]
pub struct PullSecretSyncer {
    destination_namespace: String,
    translator: FixedNamespaceTranslator,
}

impl PullSecretSyncer {
    pub fn new(ctx: &RegisterContext, destination_namespace: impl Into<String>) -> PullSecretSyncer {
        let destination_namespace = destination_namespace.into();
        PullSecretSyncer {
            translator: FixedNamespaceTranslator::new(
                ctx.target_namespace.as_str(),
                destination_namespace.as_str(),
            ),
            destination_namespace,
        }
    }
}

impl Syncer for PullSecretSyncer {
    fn name(&self) -> &str {
        "pull-secret-sync"
    }

    fn resource_type(&self) -> &'static K8sType {
        core::v1::Secret
    }

    fn translator(&self) -> &dyn NameTranslator {
        &self.translator
    }

    fn mode(&self) -> SyncMode {
        SyncMode::UpSync
    }

    fn is_importable(&self, host: &K8sResource) -> bool {
        host.str_value("/type") == Some(DOCKER_CONFIG_JSON)
    }

    fn is_derived_virtual(&self, virtual_obj: &K8sResource) -> bool {
        virtual_obj.get_label_value(PLUGIN_LABEL) == Some(PLUGIN_LABEL_VALUE)
    }

    fn up_sync_metadata(&self, host_obj: &K8sResource) -> (StringMap, StringMap) {
        let annotations = host_obj
            .annotations()
            .into_iter()
            .filter(|(key, _)| !key.starts_with(RESERVED_PREFIX))
            .collect();
        let mut labels = host_obj.labels();
        labels.insert(PLUGIN_LABEL.to_owned(), PLUGIN_LABEL_VALUE.to_owned());
        (annotations, labels)
    }

    fn should_reconcile(&self, virtual_id: &ObjectIdRef<'_>) -> bool {
        virtual_id.namespace == self.destination_namespace
    }
}

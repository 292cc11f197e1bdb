use crate::k8s_types::{core, K8sType};
use crate::resource::{K8sResource, ObjectId};
use crate::syncer::{RegisterContext, SyncMode, Syncer};
use crate::translate::{ImportTranslator, NameTranslator, IMPORT_ANNOTATION};

/// Imports host secrets into the virtual cluster. A host secret in the target namespace that
/// carries `vcluster.loft.sh/import: NAMESPACE/NAME` is copied to that virtual identity, kept up
/// to date, and deleted again once the host secret is gone or no longer carries the annotation.
/// The virtual namespace is created if it does not exist. Secrets outside the target namespace
/// are never imported.
#[derive(Debug, Clone)]
pub struct ImportSecretsSyncer {
    translator: ImportTranslator,
}

impl ImportSecretsSyncer {
    pub fn new(ctx: &RegisterContext) -> ImportSecretsSyncer {
        ImportSecretsSyncer::in_namespace(ctx.target_namespace.as_str())
    }

    /// Imports from `host_namespace` instead of the target namespace
    pub fn in_namespace(host_namespace: impl Into<String>) -> ImportSecretsSyncer {
        ImportSecretsSyncer {
            translator: ImportTranslator::new(host_namespace),
        }
    }
}

impl Syncer for ImportSecretsSyncer {
    fn name(&self) -> &str {
        "import-secrets"
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
        if host.namespace() != Some(self.translator.host_namespace()) {
            return false;
        }
        match host.get_annotation_value(IMPORT_ANNOTATION) {
            Some(value) if ObjectId::parse(value).is_some() => true,
            Some(value) => {
                log::info!(
                    "Ignoring malformed import annotation on {}: '{}', expected NAMESPACE/NAME",
                    host.get_object_id(),
                    value
                );
                false
            }
            None => false,
        }
    }
}

use crate::k8s_types::K8sType;
use crate::syncer::{OwnershipPolicy, RegisterContext, SyncMode, Syncer};
use crate::translate::{NameTranslator, NamespacedTranslator};

/// Mirrors every object of one kind from the virtual cluster into the target namespace of the
/// host cluster. The virtual side owns everything but the `status`, unless a different
/// ownership policy is given.
#[derive(Debug, Clone)]
pub struct NamespacedMirror {
    name: String,
    k8s_type: &'static K8sType,
    translator: NamespacedTranslator,
    ownership: OwnershipPolicy,
}

impl NamespacedMirror {
    pub fn new(ctx: &RegisterContext, name: impl Into<String>, k8s_type: &'static K8sType) -> NamespacedMirror {
        NamespacedMirror {
            name: name.into(),
            k8s_type,
            translator: NamespacedTranslator::new(ctx.target_namespace.as_str(), ctx.name.as_str()),
            ownership: OwnershipPolicy::for_mode(SyncMode::ToHost),
        }
    }

    pub fn with_ownership(mut self, ownership: OwnershipPolicy) -> NamespacedMirror {
        self.ownership = ownership;
        self
    }
}

impl Syncer for NamespacedMirror {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    fn resource_type(&self) -> &'static K8sType {
        self.k8s_type
    }

    fn translator(&self) -> &dyn NameTranslator {
        &self.translator
    }

    fn ownership(&self) -> OwnershipPolicy {
        self.ownership.clone()
    }
}

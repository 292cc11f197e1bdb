use crate::builtin::NamespacedMirror;
use crate::error::{Error, MessageError};
use crate::k8s_types::{apiextensions_k8s_io, K8sType};
use crate::resource::{set_metadata_map, ObjectIdRef};
use crate::syncer::{Initializer, RegisterContext, Registration};

use async_trait::async_trait;
use serde_json::{json, Value};

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Copies a CustomResourceDefinition from the host cluster into the virtual cluster, or brings
/// the virtual copy's spec up to date. Fails if the host cluster does not have the CRD.
#[derive(Debug, Clone, PartialEq)]
pub struct CrdInitializer {
    crd_name: String,
}

impl CrdInitializer {
    /// `crd_name` is the full name of the CRD, `{plural}.{group}`
    pub fn new(crd_name: impl Into<String>) -> CrdInitializer {
        CrdInitializer {
            crd_name: crd_name.into(),
        }
    }

    pub fn for_type(k8s_type: &K8sType) -> CrdInitializer {
        CrdInitializer::new(format!("{}.{}", k8s_type.plural_kind, k8s_type.group()))
    }

    pub fn crd_name(&self) -> &str {
        self.crd_name.as_str()
    }
}

#[async_trait]
impl Initializer for CrdInitializer {
    fn name(&self) -> &str {
        self.crd_name.as_str()
    }

    async fn init(&self, ctx: &RegisterContext) -> Result<(), Error> {
        let crd_type = apiextensions_k8s_io::v1::CustomResourceDefinition;
        let id = ObjectIdRef::new("", self.crd_name.as_str());
        let host_crd = ctx.host_store.get(crd_type, &id).await?.ok_or_else(|| {
            MessageError::new(format!(
                "CustomResourceDefinition '{}' does not exist in the host cluster",
                self.crd_name
            ))
        })?;

        let spec = host_crd.field("spec").cloned().unwrap_or(Value::Null);
        let mut desired = json!({
            "apiVersion": crd_type.api_version,
            "kind": crd_type.kind,
            "metadata": { "name": self.crd_name },
            "spec": spec,
        });
        let mut annotations = host_crd.annotations();
        annotations.remove(LAST_APPLIED_ANNOTATION);
        set_metadata_map(&mut desired, "annotations", &annotations);
        set_metadata_map(&mut desired, "labels", &host_crd.labels());

        match ctx.virtual_store.get(crd_type, &id).await? {
            None => {
                log::info!("Copying CustomResourceDefinition '{}' into the virtual cluster", self.crd_name);
                ctx.virtual_store.create(crd_type, &desired).await?;
            }
            Some(existing) if existing.field("spec") == desired.get("spec") => {
                log::debug!("CustomResourceDefinition '{}' is up to date", self.crd_name);
            }
            Some(existing) => {
                log::info!("Updating CustomResourceDefinition '{}' in the virtual cluster", self.crd_name);
                let mut updated = existing.into_value();
                updated["spec"] = desired["spec"].take();
                ctx.virtual_store.update(crd_type, &updated).await?;
            }
        }
        Ok(())
    }
}

/// Syncs a custom kind from the virtual cluster to the host, after copying its CRD from the host
/// into the virtual cluster
pub fn crd_sync(ctx: &RegisterContext, k8s_type: &'static K8sType) -> Registration {
    Registration::syncer(NamespacedMirror::new(ctx, k8s_type.plural_kind, k8s_type))
        .with_initializer(CrdInitializer::for_type(k8s_type))
}

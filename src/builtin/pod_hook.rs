use crate::error::{Error, MessageError};
use crate::hook::{ClientHook, Mutation, Operation};
use crate::k8s_types::{core, K8sType};
use crate::resource::ensure_object;
use crate::syncer::Side;

use serde_json::Value;

pub const CREATED_BY_LABEL: &str = "created-by-plugin";

/// Labels every pod that is created or updated in the host cluster
#[derive(Debug, Clone, Default)]
pub struct PodLabelHook;

impl ClientHook for PodLabelHook {
    fn name(&self) -> &str {
        "pod-hook"
    }

    fn resource_type(&self) -> &'static K8sType {
        core::v1::Pod
    }

    fn mutations(&self) -> Vec<Mutation> {
        vec![
            Mutation::new(Operation::Create, Side::Host),
            Mutation::new(Operation::Update, Side::Host),
        ]
    }

    fn mutate(&self, _mutation: Mutation, mut object: Value) -> Result<Value, Error> {
        if object.get("kind").and_then(Value::as_str) != Some("Pod") {
            return Err(MessageError::new(format!("object {} is not a pod", object)));
        }
        let labels = ensure_object(&mut object, "metadata")
            .and_then(|metadata| {
                metadata
                    .entry("labels")
                    .or_insert_with(|| Value::Object(Default::default()))
                    .as_object_mut()
            })
            .ok_or_else(|| MessageError::new("pod metadata is not an object"))?;
        labels.insert(CREATED_BY_LABEL.to_owned(), Value::String("pod-hook".to_owned()));
        Ok(object)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn pods_get_labelled() {
        let pod = json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p" } });
        let mutated = PodLabelHook
            .mutate(Mutation::new(Operation::Create, Side::Host), pod)
            .unwrap();
        assert_eq!(json!("pod-hook"), mutated["metadata"]["labels"][CREATED_BY_LABEL]);
    }

    #[test]
    fn other_kinds_are_rejected() {
        let service = json!({ "apiVersion": "v1", "kind": "Service", "metadata": { "name": "s" } });
        assert!(PodLabelHook
            .mutate(Mutation::new(Operation::Update, Side::Host), service)
            .is_err());
    }
}

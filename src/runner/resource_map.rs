use crate::resource::object_id::{ObjectId, ObjectIdRef};
use crate::resource::K8sResource;

use std::collections::HashMap;

/// Objects of one kind from one cluster, indexed by namespace and then name
#[derive(Debug, Default)]
pub struct ResourceMap(HashMap<String, HashMap<String, K8sResource>>);

impl ResourceMap {
    pub fn new() -> ResourceMap {
        ResourceMap(HashMap::new())
    }

    pub fn insert(&mut self, resource: K8sResource) -> Option<K8sResource> {
        let ObjectId { namespace, name } = resource.get_object_id().to_owned();
        self.0.entry(namespace).or_default().insert(name, resource)
    }

    pub fn get<'a, 'b>(&'a self, id: impl Into<ObjectIdRef<'b>>) -> Option<&'a K8sResource> {
        let id = id.into();
        self.0.get(id.namespace).and_then(|by_name| by_name.get(id.name))
    }

    pub fn contains<'a>(&self, id: impl Into<ObjectIdRef<'a>>) -> bool {
        self.get(id).is_some()
    }

    pub fn remove<'a>(&mut self, id: impl Into<ObjectIdRef<'a>>) -> Option<K8sResource> {
        let id = id.into();
        let by_name = self.0.get_mut(id.namespace)?;
        let removed = by_name.remove(id.name);
        if by_name.is_empty() {
            self.0.remove(id.namespace);
        }
        removed
    }

    /// Replaces the whole content, and returns the objects that were dropped in the process
    pub fn replace_all(&mut self, resources: Vec<K8sResource>) -> Vec<K8sResource> {
        let mut previous = std::mem::take(&mut self.0);
        for resource in resources {
            let id = resource.get_object_id().to_owned();
            if let Some(by_name) = previous.get_mut(id.namespace.as_str()) {
                by_name.remove(id.name.as_str());
            }
            self.insert(resource);
        }
        previous
            .into_iter()
            .flat_map(|(_, by_name)| by_name.into_iter().map(|(_, resource)| resource))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &K8sResource> {
        self.0.values().flat_map(HashMap::values)
    }

    pub fn len(&self) -> usize {
        self.0.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

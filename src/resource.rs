//! The json-backed object model shared by both clusters.
pub mod object_id;

pub use self::object_id::{ObjectId, ObjectIdRef};

use serde_json::Value;

use std::collections::BTreeMap;

pub type JsonObject = serde_json::Map<String, Value>;

/// String map used for labels and annotations. Ordered, so that comparisons and the
/// serialized form never depend on insertion order.
pub type StringMap = BTreeMap<String, String>;

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl std::fmt::Display for InvalidResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Invalid Resource: {}", self.message)
    }
}

impl std::error::Error for InvalidResourceError {}

/// An object as it was returned by one of the object stores. Every `K8sResource` has been
/// validated to have `apiVersion`, `kind`, `metadata.name` and `metadata.resourceVersion`,
/// so the accessors for those return plain `&str`s.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sResource(Value);

impl K8sResource {
    pub fn from_value(value: Value) -> Result<K8sResource, InvalidResourceError> {
        if let Err(msg) = K8sResource::validate(&value) {
            Err(InvalidResourceError {
                message: msg,
                value,
            })
        } else {
            Ok(K8sResource(value))
        }
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn resource_version(&self) -> &str {
        self.str_value("/metadata/resourceVersion").unwrap_or("")
    }

    pub fn uid(&self) -> &str {
        self.str_value("/metadata/uid").unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.str_value("/metadata/name").unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_value("/metadata/namespace")
            .filter(|ns| !ns.is_empty())
    }

    pub fn api_version(&self) -> &str {
        self.str_value("/apiVersion").unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        self.str_value("/kind").unwrap_or("")
    }

    pub fn status(&self) -> Option<&Value> {
        self.0.pointer("/status")
    }

    pub fn get_label_value(&self, label: &str) -> Option<&str> {
        let labels = self.0.pointer("/metadata/labels")?.as_object()?;
        labels.get(label).and_then(Value::as_str)
    }

    pub fn get_annotation_value(&self, annotation: &str) -> Option<&str> {
        let annotations = self.0.pointer("/metadata/annotations")?.as_object()?;
        annotations.get(annotation).and_then(Value::as_str)
    }

    pub fn labels(&self) -> StringMap {
        string_map(&self.0, "/metadata/labels")
    }

    pub fn annotations(&self) -> StringMap {
        string_map(&self.0, "/metadata/annotations")
    }

    pub fn is_deletion_timestamp_set(&self) -> bool {
        self.0.pointer("/metadata/deletionTimestamp").is_some()
    }

    pub fn get_object_id(&self) -> ObjectIdRef {
        let ns = self.namespace().unwrap_or("");
        ObjectIdRef::new(ns, self.name())
    }

    pub fn str_value(&self, pointer: &str) -> Option<&str> {
        self.0.pointer(pointer).and_then(Value::as_str)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    fn validate(value: &Value) -> Result<(), &'static str> {
        if !value.is_object() {
            return Err("resource must be a json object");
        }
        value
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .ok_or("missing metadata.resourceVersion")?;
        value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or("missing metadata.name")?;
        value.pointer("/apiVersion").and_then(Value::as_str).ok_or("missing apiVersion")?;
        value.pointer("/kind").and_then(Value::as_str).ok_or("missing kind")?;
        Ok(())
    }
}

impl std::convert::AsRef<Value> for K8sResource {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl std::borrow::Borrow<Value> for K8sResource {
    fn borrow(&self) -> &Value {
        &self.0
    }
}

impl From<K8sResource> for Value {
    fn from(res: K8sResource) -> Value {
        res.into_value()
    }
}

impl std::fmt::Display for K8sResource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Reads a string to string map (labels, annotations, secret data) from the given pointer.
/// Non-string values are skipped.
pub fn string_map(json: &Value, pointer: &str) -> StringMap {
    json.pointer(pointer)
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

/// Writes `map` under `metadata.<field>`, removing the key entirely when the map is empty.
pub fn set_metadata_map(json: &mut Value, field: &str, map: &StringMap) {
    let metadata = match ensure_object(json, "metadata") {
        Some(m) => m,
        None => return,
    };
    if map.is_empty() {
        metadata.remove(field);
    } else {
        let as_json = map
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<JsonObject>();
        metadata.insert(field.to_owned(), Value::Object(as_json));
    }
}

/// Returns the object under `key`, inserting an empty one first if needed. Returns `None` if
/// `json` is not an object, or if the existing value under `key` is not an object.
pub fn ensure_object<'a>(json: &'a mut Value, key: &str) -> Option<&'a mut JsonObject> {
    let obj = json.as_object_mut()?;
    obj.entry(key.to_owned())
        .or_insert_with(|| Value::Object(JsonObject::new()))
        .as_object_mut()
}

pub fn str_value<'a, 'b>(json: &'a Value, pointer: &'b str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Value::as_str)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_requires_resource_version() {
        let value = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "foo", "namespace": "bar" }
        });
        let err = K8sResource::from_value(value).unwrap_err();
        assert_eq!("missing metadata.resourceVersion", err.message);
    }

    #[test]
    fn empty_namespace_is_treated_as_missing() {
        let res = K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "foo", "namespace": "", "resourceVersion": "1" }
        }))
        .unwrap();
        assert_eq!(None, res.namespace());
        assert_eq!(ObjectIdRef::new("", "foo"), res.get_object_id());
    }

    #[test]
    fn set_metadata_map_removes_empty_maps() {
        let mut value = json!({"metadata": {"labels": {"a": "b"}}});
        set_metadata_map(&mut value, "labels", &StringMap::new());
        assert_eq!(json!({"metadata": {}}), value);

        let mut labels = StringMap::new();
        labels.insert("x".to_owned(), "y".to_owned());
        set_metadata_map(&mut value, "labels", &labels);
        assert_eq!(json!({"metadata": {"labels": {"x": "y"}}}), value);
    }
}

//! Identity of an object within one cluster: the `namespace` and `name` from its `metadata`.
//!
//! Reconciliation is always keyed by the _virtual_ identity of an object. The host identity
//! is derived from it by a `NameTranslator`, except for up-synced kinds, where the virtual
//! identity is derived from the host object instead.
//!
//! `ObjectId` owns its fields, while `ObjectIdRef` borrows them, typically from a json
//! `Value`. Cluster scoped objects (and objects that rely on a default namespace) use an
//! empty string for the namespace, and `namespace()` returns `None` for those.
use std::fmt::{self, Display};

/// An owned Object Id
#[derive(Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> ObjectId {
        ObjectId {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// An id for an object that does not live in a namespace
    pub fn cluster_scoped(name: impl Into<String>) -> ObjectId {
        ObjectId::new(String::new(), name)
    }

    /// Parses the `NAMESPACE/NAME` form that appears in annotations. Both parts must be
    /// non-empty, and there must be exactly one separator.
    pub fn parse(value: &str) -> Option<ObjectId> {
        let mut parts = value.split('/');
        let namespace = parts.next()?;
        let name = parts.next()?;
        if parts.next().is_some() || namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(ObjectId::new(namespace, name))
    }

    pub fn as_id_ref(&self) -> ObjectIdRef {
        ObjectIdRef {
            namespace: &self.namespace,
            name: &self.name,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.as_id_ref().namespace()
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.as_id_ref().fmt(f)
    }
}

/// An id that borrows its fields
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ObjectIdRef<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
}

impl<'a> ObjectIdRef<'a> {
    pub fn new(namespace: &'a str, name: &'a str) -> ObjectIdRef<'a> {
        ObjectIdRef { namespace, name }
    }

    pub fn to_owned(&self) -> ObjectId {
        ObjectId {
            namespace: self.namespace.to_owned(),
            name: self.name.to_owned(),
        }
    }

    /// Returns the namespace, or `None` if it is empty
    pub fn namespace(&self) -> Option<&'a str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(self.namespace)
        }
    }

    pub fn name(&self) -> &'a str {
        self.name
    }
}

impl<'a> Display for ObjectIdRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl<'a> PartialEq<ObjectIdRef<'a>> for ObjectId {
    fn eq(&self, other: &ObjectIdRef<'a>) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl<'a> PartialEq<ObjectId> for ObjectIdRef<'a> {
    fn eq(&self, other: &ObjectId) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl<'a> From<&'a ObjectId> for ObjectIdRef<'a> {
    fn from(id: &'a ObjectId) -> ObjectIdRef<'a> {
        id.as_id_ref()
    }
}

impl<'a> From<(&'a str, &'a str)> for ObjectIdRef<'a> {
    fn from((namespace, name): (&'a str, &'a str)) -> ObjectIdRef<'a> {
        ObjectIdRef { namespace, name }
    }
}

impl<'a, 'b> From<&'b ObjectIdRef<'a>> for ObjectIdRef<'a> {
    fn from(other: &'b ObjectIdRef<'a>) -> ObjectIdRef<'a> {
        *other
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    #[test]
    fn object_id_has_same_hash_as_ref() {
        let id = ObjectId::new("foo", "bar");
        let id_ref = id.as_id_ref();

        assert_eq!(hash(&id), hash(&id_ref));
        assert_eq!(&id, &id_ref);
    }

    #[test]
    fn parse_accepts_only_namespace_and_name() {
        assert_eq!(Some(ObjectId::new("app", "imported")), ObjectId::parse("app/imported"));
        assert_eq!(None, ObjectId::parse("imported"));
        assert_eq!(None, ObjectId::parse("a/b/c"));
        assert_eq!(None, ObjectId::parse("/name"));
        assert_eq!(None, ObjectId::parse("ns/"));
    }

    #[test]
    fn cluster_scoped_ids_display_without_separator() {
        assert_eq!("my-ns", ObjectId::cluster_scoped("my-ns").to_string());
        assert_eq!("ns/name", ObjectId::new("ns", "name").to_string());
    }

    fn hash<T: Hash>(obj: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        obj.hash(&mut hasher);
        hasher.finish()
    }
}

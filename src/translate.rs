//! Mapping between virtual object identities and host object identities.
//!
//! Everything in here is pure: no store access, no shared state. Translators only look at the
//! identity they are given and, where available, the object itself.
use crate::resource::{K8sResource, ObjectId, ObjectIdRef};

use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

use std::fmt::{self, Display};

/// Label stamped on every host object created by a syncer. The value is the name of the
/// virtual cluster, so that several virtual clusters can share one host namespace.
pub const MARKER_LABEL: &str = "vcluster.loft.sh/managed-by";
/// Label carrying the virtual namespace of the origin object
pub const NAMESPACE_LABEL: &str = "vcluster.loft.sh/namespace";
pub const NAME_ANNOTATION: &str = "vcluster.loft.sh/object-name";
pub const NAMESPACE_ANNOTATION: &str = "vcluster.loft.sh/object-namespace";
pub const KIND_ANNOTATION: &str = "vcluster.loft.sh/object-kind";
pub const UID_ANNOTATION: &str = "vcluster.loft.sh/object-uid";
/// Comma separated annotation keys that were copied from the virtual object
pub const MANAGED_ANNOTATIONS_ANNOTATION: &str = "vcluster.loft.sh/managed-annotations";
/// Comma separated label keys that were copied from the virtual object
pub const MANAGED_LABELS_ANNOTATION: &str = "vcluster.loft.sh/managed-labels";
/// Exclude marker. An object with this annotation set to `"true"` is never synced, and a host
/// object carrying it is never considered managed.
pub const SKIP_ANNOTATION: &str = "vcluster.loft.sh/skip-sync";
/// Import directive on a host object, in the form `NAMESPACE/NAME`
pub const IMPORT_ANNOTATION: &str = "vcluster.loft.sh/import";
/// Origin of an imported virtual object, in the form `NAMESPACE/NAME`
pub const IMPORTED_ANNOTATION: &str = "vcluster.loft.sh/imported";

/// Prefix shared by every annotation and label this crate stamps. Keys with this prefix are
/// never propagated between clusters.
pub const RESERVED_PREFIX: &str = "vcluster.loft.sh/";

const MAX_NAME_LENGTH: usize = 63;
const HASHED_PREFIX_LENGTH: usize = 52;
const HASH_LENGTH: usize = 10;
const SEPARATOR: &str = "-x-";

lazy_static! {
    static ref DNS_LABEL: Regex = Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
}

/// Why a host object could not be translated back to a virtual identity
#[derive(Debug, Clone, PartialEq)]
pub enum TranslateError {
    /// The object carries no origin annotations. Callers should fall back to an indexed lookup.
    MissingAnnotation,
    /// The object was not created for this virtual cluster
    Foreign,
    /// The origin annotations are present but unusable
    Malformed(String),
}

impl Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TranslateError::MissingAnnotation => f.write_str("host object has no origin annotations"),
            TranslateError::Foreign => f.write_str("host object does not belong to this virtual cluster"),
            TranslateError::Malformed(msg) => write!(f, "malformed origin annotation: {}", msg),
        }
    }
}

impl std::error::Error for TranslateError {}

/// Maps identities between the two clusters for one resource kind.
pub trait NameTranslator: Send + Sync + 'static {
    /// Returns the host identity for a virtual object, or `None` if the object is intentionally
    /// not synced. `object` is `None` when the virtual object no longer exists; implementations
    /// that need the object to compute the identity should return `None` in that case and let
    /// the object mapper's name cache answer instead.
    fn virtual_to_host(&self, id: &ObjectIdRef<'_>, object: Option<&K8sResource>) -> Option<ObjectId>;

    /// Recovers the virtual identity of a host object.
    fn host_to_virtual(&self, host: &K8sResource) -> Result<ObjectId, TranslateError>;
}

/// Maps every namespaced virtual object into a single host namespace, encoding the virtual
/// namespace into the host name. The marker label value is the virtual cluster name.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedTranslator {
    host_namespace: String,
    suffix: String,
}

impl NamespacedTranslator {
    pub fn new(host_namespace: impl Into<String>, suffix: impl Into<String>) -> NamespacedTranslator {
        NamespacedTranslator {
            host_namespace: host_namespace.into(),
            suffix: suffix.into(),
        }
    }

    pub fn host_namespace(&self) -> &str {
        self.host_namespace.as_str()
    }

    pub fn suffix(&self) -> &str {
        self.suffix.as_str()
    }

    pub fn host_name(&self, namespace: &str, name: &str) -> String {
        host_name(name, namespace, self.suffix.as_str())
    }

    fn is_ours(&self, host: &K8sResource) -> bool {
        host.namespace() == Some(self.host_namespace.as_str())
            && host.get_label_value(MARKER_LABEL) == Some(self.suffix.as_str())
            && host.get_annotation_value(SKIP_ANNOTATION) != Some("true")
    }
}

impl NameTranslator for NamespacedTranslator {
    fn virtual_to_host(&self, id: &ObjectIdRef<'_>, object: Option<&K8sResource>) -> Option<ObjectId> {
        if object.map(is_skipped).unwrap_or(false) {
            return None;
        }
        let name = self.host_name(id.namespace, id.name);
        Some(ObjectId::new(self.host_namespace.clone(), name))
    }

    fn host_to_virtual(&self, host: &K8sResource) -> Result<ObjectId, TranslateError> {
        if !self.is_ours(host) {
            return Err(TranslateError::Foreign);
        }
        origin_from_annotations(host)
    }
}

/// Maps names unchanged between one host namespace and one virtual namespace
#[derive(Debug, Clone, PartialEq)]
pub struct FixedNamespaceTranslator {
    host_namespace: String,
    virtual_namespace: String,
}

impl FixedNamespaceTranslator {
    pub fn new(host_namespace: impl Into<String>, virtual_namespace: impl Into<String>) -> Self {
        FixedNamespaceTranslator {
            host_namespace: host_namespace.into(),
            virtual_namespace: virtual_namespace.into(),
        }
    }
}

impl NameTranslator for FixedNamespaceTranslator {
    fn virtual_to_host(&self, id: &ObjectIdRef<'_>, object: Option<&K8sResource>) -> Option<ObjectId> {
        if id.namespace != self.virtual_namespace || object.map(is_skipped).unwrap_or(false) {
            return None;
        }
        Some(ObjectId::new(self.host_namespace.clone(), id.name))
    }

    fn host_to_virtual(&self, host: &K8sResource) -> Result<ObjectId, TranslateError> {
        if host.namespace() != Some(self.host_namespace.as_str()) || is_skipped(host) {
            return Err(TranslateError::Foreign);
        }
        Ok(ObjectId::new(self.virtual_namespace.clone(), host.name()))
    }
}

/// Identity comes from explicit annotations: the `import` annotation on the host object names
/// the virtual object, and the `imported` annotation on the virtual object names the host one.
/// Only host objects in the target namespace take part, whatever a virtual object claims.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportTranslator {
    host_namespace: String,
}

impl ImportTranslator {
    pub fn new(host_namespace: impl Into<String>) -> ImportTranslator {
        ImportTranslator {
            host_namespace: host_namespace.into(),
        }
    }

    pub fn host_namespace(&self) -> &str {
        self.host_namespace.as_str()
    }
}

impl NameTranslator for ImportTranslator {
    fn virtual_to_host(&self, id: &ObjectIdRef<'_>, object: Option<&K8sResource>) -> Option<ObjectId> {
        let value = object?.get_annotation_value(IMPORTED_ANNOTATION)?;
        let parsed = match ObjectId::parse(value) {
            Some(parsed) => parsed,
            None => {
                log::error!("Malformed '{}' annotation value: '{}'", IMPORTED_ANNOTATION, value);
                return None;
            }
        };
        if parsed.namespace() != Some(self.host_namespace.as_str()) {
            log::warn!(
                "Ignoring '{}' annotation of {} that points outside of namespace '{}': '{}'",
                IMPORTED_ANNOTATION,
                id,
                self.host_namespace,
                value
            );
            return None;
        }
        Some(parsed)
    }

    fn host_to_virtual(&self, host: &K8sResource) -> Result<ObjectId, TranslateError> {
        if is_skipped(host) || host.namespace() != Some(self.host_namespace.as_str()) {
            return Err(TranslateError::Foreign);
        }
        let value = host
            .get_annotation_value(IMPORT_ANNOTATION)
            .ok_or(TranslateError::Foreign)?;
        ObjectId::parse(value).ok_or_else(|| {
            TranslateError::Malformed(format!(
                "'{}' on {} must have the form NAMESPACE/NAME, got: '{}'",
                IMPORT_ANNOTATION,
                host.get_object_id(),
                value
            ))
        })
    }
}

/// Reads the stamped origin annotations of a managed host object
pub fn origin_from_annotations(host: &K8sResource) -> Result<ObjectId, TranslateError> {
    let name = host.get_annotation_value(NAME_ANNOTATION);
    let namespace = host.get_annotation_value(NAMESPACE_ANNOTATION);
    match (name, namespace) {
        (None, None) => Err(TranslateError::MissingAnnotation),
        (Some(name), Some(namespace)) if !name.is_empty() && !namespace.is_empty() => {
            Ok(ObjectId::new(namespace, name))
        }
        (Some(name), _) => Err(TranslateError::Malformed(format!(
            "'{}' is set to '{}' on {} but '{}' is missing or empty",
            NAME_ANNOTATION,
            name,
            host.get_object_id(),
            NAMESPACE_ANNOTATION
        ))),
        (None, Some(_)) => Err(TranslateError::Malformed(format!(
            "'{}' is set on {} but '{}' is missing",
            NAMESPACE_ANNOTATION,
            host.get_object_id(),
            NAME_ANNOTATION
        ))),
    }
}

pub fn is_skipped(object: &K8sResource) -> bool {
    object.get_annotation_value(SKIP_ANNOTATION) == Some("true")
}

/// Computes the host name for a virtual object. The readable form is
/// `{name}-x-{namespace}-x-{suffix}`. A hashed form is used instead when the readable one is
/// longer than a DNS label allows, is not a valid DNS label, or could be split into name and
/// namespace in more than one way.
pub fn host_name(name: &str, namespace: &str, suffix: &str) -> String {
    let readable = format!("{}{}{}{}{}", name, SEPARATOR, namespace, SEPARATOR, suffix);
    if is_dns_label(&readable) && splits_uniquely(name, namespace) {
        return readable;
    }

    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b"/");
    hasher.update(name.as_bytes());
    hasher.update(b"/");
    hasher.update(suffix.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let prefix = dns_prefix(&readable, HASHED_PREFIX_LENGTH);
    if prefix.is_empty() {
        return digest[..HASH_LENGTH].to_owned();
    }
    format!("{}-{}", prefix, &digest[..HASH_LENGTH])
}

/// True if `{name}-x-{namespace}-x-` contains the separator exactly twice, counting overlapping
/// matches. Then the first match ends the name and the second one ends the namespace.
fn splits_uniquely(name: &str, namespace: &str) -> bool {
    let head = format!("{}{}{}{}", name, SEPARATOR, namespace, SEPARATOR);
    let matches = head
        .as_bytes()
        .windows(SEPARATOR.len())
        .filter(|window| *window == SEPARATOR.as_bytes())
        .count();
    matches == 2
}

/// Lowercases `value`, replaces everything that is not allowed in a DNS label with `-`, and
/// trims it to at most `max` chars without leading or trailing dashes
fn dns_prefix(value: &str, max: usize) -> String {
    let sanitized: String = value
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(max)
        .collect();
    sanitized.trim_matches('-').to_owned()
}

/// Returns true if `name` is usable as a DNS-1123 label, which is what most host names must be.
pub fn is_dns_label(name: &str) -> bool {
    name.len() <= MAX_NAME_LENGTH && DNS_LABEL.is_match(name)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn host_object(annotations: serde_json::Value, labels: serde_json::Value) -> K8sResource {
        K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "namespace": "vcluster-ns",
                "name": "test123-x-test-x-my-vcluster",
                "resourceVersion": "3",
                "annotations": annotations,
                "labels": labels,
            }
        }))
        .unwrap()
    }

    #[test]
    fn host_names_are_deterministic() {
        let translator = NamespacedTranslator::new("vcluster-ns", "my-vcluster");
        let id = ObjectIdRef::new("test", "test123");
        let first = translator.virtual_to_host(&id, None);
        let second = translator.virtual_to_host(&id, None);
        assert_eq!(first, second);
        assert_eq!(
            Some(ObjectId::new("vcluster-ns", "test123-x-test-x-my-vcluster")),
            first
        );
    }

    #[test]
    fn host_names_are_injective_for_separator_collisions() {
        // both of these would produce "a-x-b-x-c-x-s" in the readable form
        let one = host_name("a-x-b", "c", "s");
        let two = host_name("a", "b-x-c", "s");
        assert_ne!(one, two);
        assert!(is_dns_label(&one), "not a dns label: {}", one);
        assert!(is_dns_label(&two), "not a dns label: {}", two);
    }

    #[test]
    fn long_names_are_hashed_and_stay_valid() {
        let long_name = "n".repeat(80);
        let mut seen = HashSet::new();
        for ns in &["default", "kube-system", "app"] {
            let name = host_name(&long_name, ns, "my-vcluster");
            assert!(name.len() <= 63);
            assert!(is_dns_label(&name), "not a dns label: {}", name);
            assert!(seen.insert(name));
        }
    }

    #[test]
    fn distinct_virtual_ids_map_to_distinct_host_ids() {
        let translator = NamespacedTranslator::new("host", "vc");
        let ids = [
            ("a", "b"),
            ("b", "a"),
            ("a-x-b", "c"),
            ("a", "b-x-c"),
            ("default", "nginx"),
            ("default", "nginx-x-default"),
            ("b", "a-x"),
            ("x-b", "a"),
            ("x", "a-x"),
            ("x-x", "a"),
            ("b", "a-x-x"),
        ];
        let mut seen = HashSet::new();
        for (ns, name) in ids.iter() {
            let host = translator
                .virtual_to_host(&ObjectIdRef::new(ns, name), None)
                .unwrap();
            assert!(seen.insert(host.clone()), "collision for {}/{}: {}", ns, name, host);
        }
    }

    #[test]
    fn host_to_virtual_round_trips_managed_objects() {
        let translator = NamespacedTranslator::new("vcluster-ns", "my-vcluster");
        let host = host_object(
            json!({ NAME_ANNOTATION: "test123", NAMESPACE_ANNOTATION: "test" }),
            json!({ MARKER_LABEL: "my-vcluster" }),
        );
        let virtual_id = translator.host_to_virtual(&host).unwrap();
        assert_eq!(ObjectId::new("test", "test123"), virtual_id);
        let back = translator
            .virtual_to_host(&virtual_id.as_id_ref(), None)
            .unwrap();
        assert_eq!(host.get_object_id(), back);
    }

    #[test]
    fn objects_of_other_virtual_clusters_are_foreign() {
        let translator = NamespacedTranslator::new("vcluster-ns", "my-vcluster");
        let host = host_object(
            json!({ NAME_ANNOTATION: "test123", NAMESPACE_ANNOTATION: "test" }),
            json!({ MARKER_LABEL: "other-vcluster" }),
        );
        assert_eq!(Err(TranslateError::Foreign), translator.host_to_virtual(&host));

        let unlabeled = host_object(json!({}), json!({}));
        assert_eq!(Err(TranslateError::Foreign), translator.host_to_virtual(&unlabeled));
    }

    #[test]
    fn missing_and_malformed_annotations_are_distinguished() {
        let translator = NamespacedTranslator::new("vcluster-ns", "my-vcluster");
        let missing = host_object(json!({}), json!({ MARKER_LABEL: "my-vcluster" }));
        assert_eq!(
            Err(TranslateError::MissingAnnotation),
            translator.host_to_virtual(&missing)
        );

        let malformed = host_object(
            json!({ NAME_ANNOTATION: "test123" }),
            json!({ MARKER_LABEL: "my-vcluster" }),
        );
        match translator.host_to_virtual(&malformed) {
            Err(TranslateError::Malformed(_)) => {}
            other => panic!("expected malformed, got: {:?}", other),
        }
    }

    #[test]
    fn skipped_virtual_objects_are_not_synced() {
        let translator = NamespacedTranslator::new("vcluster-ns", "my-vcluster");
        let virtual_obj = K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "namespace": "test",
                "name": "private",
                "resourceVersion": "1",
                "annotations": { SKIP_ANNOTATION: "true" }
            }
        }))
        .unwrap();
        let id = virtual_obj.get_object_id();
        assert_eq!(None, translator.virtual_to_host(&id, Some(&virtual_obj)));
    }

    #[test]
    fn import_translator_reads_import_annotations() {
        let host = K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "namespace": "kube-system",
                "name": "mysecret",
                "resourceVersion": "1",
                "annotations": { IMPORT_ANNOTATION: "app/imported" }
            }
        }))
        .unwrap();
        let translator = ImportTranslator::new("kube-system");
        assert_eq!(
            Ok(ObjectId::new("app", "imported")),
            translator.host_to_virtual(&host)
        );

        let bad = K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "namespace": "kube-system",
                "name": "mysecret",
                "resourceVersion": "1",
                "annotations": { IMPORT_ANNOTATION: "no-slash" }
            }
        }))
        .unwrap();
        assert!(matches!(
            translator.host_to_virtual(&bad),
            Err(TranslateError::Malformed(_))
        ));
    }

    #[test]
    fn import_translator_stays_in_its_host_namespace() {
        let translator = ImportTranslator::new("kube-system");
        let imported = |origin: &str| {
            K8sResource::from_value(json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {
                    "namespace": "app",
                    "name": "imported",
                    "resourceVersion": "1",
                    "annotations": { IMPORTED_ANNOTATION: origin }
                }
            }))
            .unwrap()
        };
        let id = ObjectIdRef::new("app", "imported");
        assert_eq!(
            Some(ObjectId::new("kube-system", "mysecret")),
            translator.virtual_to_host(&id, Some(&imported("kube-system/mysecret")))
        );
        assert_eq!(None, translator.virtual_to_host(&id, Some(&imported("other-ns/db-password"))));

        let elsewhere = K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "namespace": "other-ns",
                "name": "db-password",
                "resourceVersion": "1",
                "annotations": { IMPORT_ANNOTATION: "app/imported" }
            }
        }))
        .unwrap();
        assert_eq!(Err(TranslateError::Foreign), translator.host_to_virtual(&elsewhere));
    }

    #[test]
    fn names_that_are_not_dns_labels_are_sanitized() {
        let name = host_name("My.Secret", "default", "vc");
        assert!(is_dns_label(&name), "not a dns label: {}", name);
        assert!(name.starts_with("my-secret-x-default-x-vc-"), "unexpected name: {}", name);
        assert_ne!(name, host_name("my-secret", "default", "vc"));
    }
}

//! Computes the labels and annotations of the non-primary object of a resource pair.
//!
//! Host objects carry three kinds of metadata: keys written by the host cluster itself (which
//! must survive every sync), keys propagated from the virtual object, and the origin stamp
//! written by this crate. Propagated keys are recorded in the `managed-annotations` and
//! `managed-labels` annotations, so that a key removed from the virtual object is also removed
//! from the host object on the next pass, without touching keys the host cluster added.
use crate::resource::{K8sResource, ObjectIdRef, StringMap};
use crate::translate::{
    IMPORTED_ANNOTATION, IMPORT_ANNOTATION, KIND_ANNOTATION, MANAGED_ANNOTATIONS_ANNOTATION,
    MANAGED_LABELS_ANNOTATION, MARKER_LABEL, NAMESPACE_ANNOTATION, NAMESPACE_LABEL,
    NAME_ANNOTATION, RESERVED_PREFIX, SKIP_ANNOTATION, UID_ANNOTATION,
};

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Which keys may flow from the virtual object to the host object
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataPolicy {
    /// Annotations that are consumed rather than propagated
    pub excluded_annotations: Vec<String>,
    /// Labels that are never propagated
    pub excluded_labels: Vec<String>,
    /// When set, only label keys starting with one of these prefixes are propagated
    pub label_allowlist: Option<Vec<String>>,
    /// When set, only annotation keys starting with one of these prefixes are propagated
    pub annotation_allowlist: Option<Vec<String>>,
}

impl Default for MetadataPolicy {
    fn default() -> Self {
        MetadataPolicy {
            excluded_annotations: vec![
                LAST_APPLIED_ANNOTATION.to_owned(),
                IMPORT_ANNOTATION.to_owned(),
                IMPORTED_ANNOTATION.to_owned(),
                SKIP_ANNOTATION.to_owned(),
            ],
            excluded_labels: Vec::new(),
            label_allowlist: None,
            annotation_allowlist: None,
        }
    }
}

impl MetadataPolicy {
    pub fn exclude_annotation(mut self, key: impl Into<String>) -> Self {
        self.excluded_annotations.push(key.into());
        self
    }

    pub fn exclude_label(mut self, key: impl Into<String>) -> Self {
        self.excluded_labels.push(key.into());
        self
    }

    pub fn allow_labels(mut self, prefixes: Vec<String>) -> Self {
        self.label_allowlist = Some(prefixes);
        self
    }

    pub fn allow_annotations(mut self, prefixes: Vec<String>) -> Self {
        self.annotation_allowlist = Some(prefixes);
        self
    }

    fn allows_annotation(&self, key: &str) -> bool {
        allowed(key, &self.excluded_annotations, self.annotation_allowlist.as_ref())
    }

    fn allows_label(&self, key: &str) -> bool {
        allowed(key, &self.excluded_labels, self.label_allowlist.as_ref())
    }
}

fn allowed(key: &str, excluded: &[String], allowlist: Option<&Vec<String>>) -> bool {
    if key.starts_with(RESERVED_PREFIX) || excluded.iter().any(|e| e == key) {
        return false;
    }
    match allowlist {
        Some(prefixes) => prefixes.iter().any(|p| key.starts_with(p.as_str())),
        None => true,
    }
}

/// Result of a metadata merge
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergedMetadata {
    pub annotations: StringMap,
    pub labels: StringMap,
    /// true if the merged maps differ from the target's current maps
    pub changed: bool,
}

/// Where a host object came from. Stamped onto every host object on every pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OriginStamp<'a> {
    pub virtual_id: ObjectIdRef<'a>,
    pub kind: &'a str,
    pub uid: &'a str,
    /// The marker label value, which is the name of the virtual cluster
    pub marker: &'a str,
}

impl<'a> OriginStamp<'a> {
    pub fn for_object(virtual_obj: &'a K8sResource, marker: &'a str) -> OriginStamp<'a> {
        OriginStamp {
            virtual_id: virtual_obj.get_object_id(),
            kind: virtual_obj.kind(),
            uid: virtual_obj.uid(),
            marker,
        }
    }

    fn stamp(&self, annotations: &mut StringMap, labels: &mut StringMap) {
        annotations.insert(NAME_ANNOTATION.to_owned(), self.virtual_id.name.to_owned());
        annotations.insert(
            NAMESPACE_ANNOTATION.to_owned(),
            self.virtual_id.namespace.to_owned(),
        );
        annotations.insert(KIND_ANNOTATION.to_owned(), self.kind.to_owned());
        if !self.uid.is_empty() {
            annotations.insert(UID_ANNOTATION.to_owned(), self.uid.to_owned());
        }
        labels.insert(MARKER_LABEL.to_owned(), self.marker.to_owned());
        if !self.virtual_id.namespace.is_empty() {
            labels.insert(
                NAMESPACE_LABEL.to_owned(),
                self.virtual_id.namespace.to_owned(),
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataReconciler {
    policy: MetadataPolicy,
}

impl MetadataReconciler {
    pub fn new(policy: MetadataPolicy) -> MetadataReconciler {
        MetadataReconciler { policy }
    }

    pub fn policy(&self) -> &MetadataPolicy {
        &self.policy
    }

    /// Metadata for a host object that does not exist yet
    pub fn translate_metadata(&self, virtual_obj: &K8sResource, origin: &OriginStamp<'_>) -> MergedMetadata {
        let mut merged = self.merge_maps(
            &virtual_obj.annotations(),
            &virtual_obj.labels(),
            &StringMap::new(),
            &StringMap::new(),
            origin,
        );
        merged.changed = true;
        merged
    }

    /// Merges the metadata of `virtual_obj` onto the current metadata of `host_obj`
    pub fn merge_metadata(
        &self,
        virtual_obj: &K8sResource,
        host_obj: &K8sResource,
        origin: &OriginStamp<'_>,
    ) -> MergedMetadata {
        self.merge_maps(
            &virtual_obj.annotations(),
            &virtual_obj.labels(),
            &host_obj.annotations(),
            &host_obj.labels(),
            origin,
        )
    }

    fn merge_maps(
        &self,
        virtual_annotations: &StringMap,
        virtual_labels: &StringMap,
        host_annotations: &StringMap,
        host_labels: &StringMap,
        origin: &OriginStamp<'_>,
    ) -> MergedMetadata {
        let mut annotations = host_annotations.clone();
        let mut labels = host_labels.clone();

        // drop everything that was propagated last time, the overlay below re-adds what's left
        for key in managed_keys(host_annotations, MANAGED_ANNOTATIONS_ANNOTATION) {
            annotations.remove(key);
        }
        for key in managed_keys(host_annotations, MANAGED_LABELS_ANNOTATION) {
            labels.remove(key);
        }

        let mut propagated_annotations = Vec::new();
        for (key, value) in virtual_annotations.iter() {
            if self.policy.allows_annotation(key) {
                annotations.insert(key.clone(), value.clone());
                propagated_annotations.push(key.as_str());
            }
        }
        let mut propagated_labels = Vec::new();
        for (key, value) in virtual_labels.iter() {
            if self.policy.allows_label(key) {
                labels.insert(key.clone(), value.clone());
                propagated_labels.push(key.as_str());
            }
        }
        record_managed_keys(&mut annotations, MANAGED_ANNOTATIONS_ANNOTATION, &propagated_annotations);
        record_managed_keys(&mut annotations, MANAGED_LABELS_ANNOTATION, &propagated_labels);
        origin.stamp(&mut annotations, &mut labels);

        let changed = &annotations != host_annotations || &labels != host_labels;
        MergedMetadata {
            annotations,
            labels,
            changed,
        }
    }
}

fn managed_keys<'a>(annotations: &'a StringMap, tracking_key: &str) -> impl Iterator<Item = &'a str> {
    annotations
        .get(tracking_key)
        .map(String::as_str)
        .unwrap_or("")
        .split(',')
        .filter(|k| !k.is_empty())
}

fn record_managed_keys(annotations: &mut StringMap, tracking_key: &str, keys: &[&str]) {
    if keys.is_empty() {
        annotations.remove(tracking_key);
    } else {
        // the keys come from a BTreeMap so they are already sorted
        annotations.insert(tracking_key.to_owned(), keys.join(","));
    }
}

/// Metadata for a virtual object derived from a host object: the host's annotations minus the
/// ones listed in `consumed`, plus `extra`. Labels are copied as they are.
pub fn derived_metadata(
    host_obj: &K8sResource,
    consumed: &[&str],
    extra_annotations: &[(&str, String)],
) -> (StringMap, StringMap) {
    let mut annotations = host_obj.annotations();
    for key in consumed {
        annotations.remove(*key);
    }
    for (key, value) in extra_annotations {
        annotations.insert((*key).to_owned(), value.clone());
    }
    (annotations, host_obj.labels())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::{json, Value};

    fn object(namespace: &str, name: &str, annotations: Value, labels: Value) -> K8sResource {
        K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "namespace": namespace,
                "name": name,
                "uid": "uid-1",
                "resourceVersion": "7",
                "annotations": annotations,
                "labels": labels,
            }
        }))
        .unwrap()
    }

    fn map(value: Value) -> StringMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn host_keys_survive_and_virtual_keys_are_overlaid() {
        let reconciler = MetadataReconciler::default();
        let virtual_obj = object("test", "test123", json!({"team": "a"}), json!({"app": "web"}));
        let host_obj = object("vc", "h", json!({"host-only": "x"}), json!({"topology": "zone-1"}));
        let origin = OriginStamp::for_object(&virtual_obj, "my-vcluster");

        let merged = reconciler.merge_metadata(&virtual_obj, &host_obj, &origin);
        assert!(merged.changed);
        assert_eq!(Some("x"), merged.annotations.get("host-only").map(String::as_str));
        assert_eq!(Some("a"), merged.annotations.get("team").map(String::as_str));
        assert_eq!(Some("zone-1"), merged.labels.get("topology").map(String::as_str));
        assert_eq!(Some("web"), merged.labels.get("app").map(String::as_str));
        assert_eq!(Some("my-vcluster"), merged.labels.get(MARKER_LABEL).map(String::as_str));
        assert_eq!(Some("test123"), merged.annotations.get(NAME_ANNOTATION).map(String::as_str));
        assert_eq!(Some("test"), merged.annotations.get(NAMESPACE_ANNOTATION).map(String::as_str));
        assert_eq!(Some("team"), merged.annotations.get(MANAGED_ANNOTATIONS_ANNOTATION).map(String::as_str));
    }

    #[test]
    fn merge_is_stable_once_applied() {
        let reconciler = MetadataReconciler::default();
        let virtual_obj = object("test", "test123", json!({"team": "a"}), json!({"app": "web"}));
        let host_obj = object("vc", "h", json!({}), json!({}));
        let origin = OriginStamp::for_object(&virtual_obj, "my-vcluster");
        let first = reconciler.merge_metadata(&virtual_obj, &host_obj, &origin);

        let applied = object(
            "vc",
            "h",
            serde_json::to_value(&first.annotations).unwrap(),
            serde_json::to_value(&first.labels).unwrap(),
        );
        let second = reconciler.merge_metadata(&virtual_obj, &applied, &origin);
        assert!(!second.changed);
        assert_eq!(first.annotations, second.annotations);
        assert_eq!(first.labels, second.labels);
    }

    #[test]
    fn keys_removed_in_virtual_are_removed_from_host() {
        let reconciler = MetadataReconciler::default();
        let virtual_obj = object("test", "test123", json!({}), json!({}));
        let host_obj = object(
            "vc",
            "h",
            json!({
                "team": "a",
                "host-only": "x",
                MANAGED_ANNOTATIONS_ANNOTATION: "team",
                MANAGED_LABELS_ANNOTATION: "app",
            }),
            json!({"app": "web", "topology": "zone-1"}),
        );
        let origin = OriginStamp::for_object(&virtual_obj, "my-vcluster");
        let merged = reconciler.merge_metadata(&virtual_obj, &host_obj, &origin);
        assert!(!merged.annotations.contains_key("team"));
        assert!(!merged.annotations.contains_key(MANAGED_ANNOTATIONS_ANNOTATION));
        assert!(!merged.labels.contains_key("app"));
        assert!(merged.annotations.contains_key("host-only"));
        assert!(merged.labels.contains_key("topology"));
    }

    #[test]
    fn administrative_annotations_are_not_propagated() {
        let reconciler = MetadataReconciler::default();
        let virtual_obj = object(
            "test",
            "test123",
            json!({
                IMPORT_ANNOTATION: "a/b",
                LAST_APPLIED_ANNOTATION: "{}",
                "vcluster.loft.sh/anything": "x",
                "kept": "yes",
            }),
            json!({}),
        );
        let origin = OriginStamp::for_object(&virtual_obj, "vc");
        let merged = reconciler.translate_metadata(&virtual_obj, &origin);
        assert!(!merged.annotations.contains_key(IMPORT_ANNOTATION));
        assert!(!merged.annotations.contains_key(LAST_APPLIED_ANNOTATION));
        assert!(!merged.annotations.contains_key("vcluster.loft.sh/anything"));
        assert_eq!(Some("yes"), merged.annotations.get("kept").map(String::as_str));
    }

    #[test]
    fn allowlist_limits_propagated_labels() {
        let policy = MetadataPolicy::default().allow_labels(vec!["app".to_owned()]);
        let reconciler = MetadataReconciler::new(policy);
        let virtual_obj = object("t", "n", json!({}), json!({"app": "web", "tier": "db"}));
        let origin = OriginStamp::for_object(&virtual_obj, "vc");
        let merged = reconciler.translate_metadata(&virtual_obj, &origin);
        assert!(merged.labels.contains_key("app"));
        assert!(!merged.labels.contains_key("tier"));
    }

    #[test]
    fn missing_and_empty_maps_compare_equal() {
        let reconciler = MetadataReconciler::default();
        let virtual_obj = K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"namespace": "t", "name": "n", "resourceVersion": "1"}
        }))
        .unwrap();
        let origin = OriginStamp::for_object(&virtual_obj, "vc");
        let stamped = reconciler.translate_metadata(&virtual_obj, &origin);
        let host_obj = object(
            "vc",
            "h",
            serde_json::to_value(&stamped.annotations).unwrap(),
            serde_json::to_value(&stamped.labels).unwrap(),
        );
        let merged = reconciler.merge_metadata(&virtual_obj, &host_obj, &origin);
        assert!(!merged.changed);
        assert_eq!(map(json!({"vcluster.loft.sh/managed-by": "vc", "vcluster.loft.sh/namespace": "t"})), merged.labels);
    }

    #[test]
    fn derived_metadata_swaps_import_for_imported() {
        let host_obj = object(
            "kube-system",
            "mysecret",
            json!({IMPORT_ANNOTATION: "app/imported", "other": "x"}),
            json!({"a": "b"}),
        );
        let (annotations, labels) = derived_metadata(
            &host_obj,
            &[IMPORT_ANNOTATION],
            &[(IMPORTED_ANNOTATION, "kube-system/mysecret".to_owned())],
        );
        assert_eq!(
            map(json!({"other": "x", IMPORTED_ANNOTATION: "kube-system/mysecret"})),
            annotations
        );
        assert_eq!(map(json!({"a": "b"})), labels);
    }
}

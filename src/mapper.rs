//! The bidirectional index between virtual and host objects, shared by all syncers of one
//! manager. Every syncer gets its own partition, keyed by the syncer name.
use crate::resource::{K8sResource, ObjectId, ObjectIdRef};
use crate::syncer::{Side, SyncMode, Syncer};
use crate::translate::{is_skipped, TranslateError, MARKER_LABEL};

use parking_lot::RwLock;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};

/// How a host object relates to this virtual cluster, from the point of view of one syncer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOrigin {
    /// Created by this virtual cluster, and carries its managed marker
    Managed,
    /// Not created by this virtual cluster, but accepted by an explicit import rule of the syncer
    Importable,
    /// Everything else. Foreign objects are never deleted or mutated.
    Foreign,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapperError {
    NotFound(ObjectId),
    /// More than one virtual object claims the same host object. This is never resolved
    /// automatically.
    MultipleMatches {
        host: ObjectId,
        candidates: Vec<ObjectId>,
    },
    Translate(TranslateError),
}

impl Display for MapperError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapperError::NotFound(host) => write!(f, "no virtual object maps to host object {}", host),
            MapperError::MultipleMatches { host, candidates } => {
                write!(f, "host object {} is claimed by multiple virtual objects: ", host)?;
                for (i, candidate) in candidates.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", candidate)?;
                }
                Ok(())
            }
            MapperError::Translate(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MapperError {}

impl From<TranslateError> for MapperError {
    fn from(err: TranslateError) -> MapperError {
        MapperError::Translate(err)
    }
}

/// Which side(s) reported a link. A link is dropped once neither side reports it anymore.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Seen {
    from_virtual: bool,
    from_host: bool,
}

impl Seen {
    fn set(&mut self, side: Side, value: bool) {
        match side {
            Side::Virtual => self.from_virtual = value,
            Side::Host => self.from_host = value,
        }
    }

    fn is_empty(&self) -> bool {
        !self.from_virtual && !self.from_host
    }
}

#[derive(Debug, Default)]
struct SyncerIndex {
    // physical name index: host id -> the virtual ids that map to it
    by_host: HashMap<ObjectId, BTreeMap<ObjectId, Seen>>,
    // name cache: virtual id -> host id
    by_virtual: HashMap<ObjectId, ObjectId>,
}

impl SyncerIndex {
    fn link(&mut self, virtual_id: ObjectId, host_id: ObjectId, side: Side) {
        if let Some(previous) = self.by_virtual.get(&virtual_id) {
            if *previous != host_id {
                let previous = previous.clone();
                self.clear_link(&virtual_id, &previous, side);
            }
        }
        self.by_host
            .entry(host_id.clone())
            .or_default()
            .entry(virtual_id.clone())
            .or_default()
            .set(side, true);
        self.by_virtual.insert(virtual_id, host_id);
    }

    fn clear_link(&mut self, virtual_id: &ObjectId, host_id: &ObjectId, side: Side) {
        let mut remove_host = false;
        if let Some(virtual_ids) = self.by_host.get_mut(host_id) {
            let mut remove_link = false;
            if let Some(seen) = virtual_ids.get_mut(virtual_id) {
                seen.set(side, false);
                remove_link = seen.is_empty();
            }
            if remove_link {
                virtual_ids.remove(virtual_id);
                if self.by_virtual.get(virtual_id) == Some(host_id) {
                    self.by_virtual.remove(virtual_id);
                }
            }
            remove_host = virtual_ids.is_empty();
        }
        if remove_host {
            self.by_host.remove(host_id);
        }
    }

    fn unlink_virtual(&mut self, virtual_id: &ObjectId) {
        if let Some(host_id) = self.by_virtual.get(virtual_id).cloned() {
            self.clear_link(virtual_id, &host_id, Side::Virtual);
        }
    }

    /// Returns the virtual ids that were linked to the host object
    fn unlink_host(&mut self, host_id: &ObjectId) -> Vec<ObjectId> {
        let virtual_ids: Vec<ObjectId> = self
            .by_host
            .get(host_id)
            .map(|ids| ids.keys().cloned().collect())
            .unwrap_or_default();
        for virtual_id in virtual_ids.iter() {
            self.clear_link(virtual_id, host_id, Side::Host);
        }
        virtual_ids
    }

    fn clear_side(&mut self, side: Side) {
        let links: Vec<(ObjectId, ObjectId)> = self
            .by_host
            .iter()
            .flat_map(|(host, ids)| ids.keys().map(move |v| (v.clone(), host.clone())))
            .collect();
        for (virtual_id, host_id) in links {
            self.clear_link(&virtual_id, &host_id, side);
        }
    }
}

#[derive(Debug)]
pub struct ObjectMapper {
    marker: String,
    indices: RwLock<HashMap<String, SyncerIndex>>,
}

impl ObjectMapper {
    /// `marker` is the value of the managed marker label, which is the virtual cluster name
    pub fn new(marker: impl Into<String>) -> ObjectMapper {
        ObjectMapper {
            marker: marker.into(),
            indices: RwLock::new(HashMap::new()),
        }
    }

    pub fn marker(&self) -> &str {
        self.marker.as_str()
    }

    /// True if the host object carries the managed marker of this virtual cluster
    pub fn is_managed(&self, host: &K8sResource) -> bool {
        !is_skipped(host) && host.get_label_value(MARKER_LABEL) == Some(self.marker.as_str())
    }

    pub fn classify(&self, host: &K8sResource, mode: SyncMode, importable: bool) -> HostOrigin {
        if is_skipped(host) {
            HostOrigin::Foreign
        } else if self.is_managed(host) {
            HostOrigin::Managed
        } else if mode == SyncMode::UpSync && importable {
            HostOrigin::Importable
        } else {
            HostOrigin::Foreign
        }
    }

    pub fn classify_for(&self, host: &K8sResource, syncer: &dyn Syncer) -> HostOrigin {
        self.classify(host, syncer.mode(), syncer.is_importable(host))
    }

    pub fn link(&self, syncer: &str, virtual_id: ObjectId, host_id: ObjectId, side: Side) {
        log::trace!("syncer '{}' linking virtual: {} to host: {} from the {} side", syncer, virtual_id, host_id, side);
        self.indices
            .write()
            .entry(syncer.to_owned())
            .or_default()
            .link(virtual_id, host_id, side);
    }

    pub fn unlink_virtual(&self, syncer: &str, virtual_id: &ObjectId) {
        if let Some(index) = self.indices.write().get_mut(syncer) {
            index.unlink_virtual(virtual_id);
        }
    }

    /// Drops every link reported by the host object, and returns the virtual ids it was linked to
    pub fn unlink_host(&self, syncer: &str, host_id: &ObjectId) -> Vec<ObjectId> {
        self.indices
            .write()
            .get_mut(syncer)
            .map(|index| index.unlink_host(host_id))
            .unwrap_or_default()
    }

    /// Replaces every link reported by `side` with `links`. Used when an informer (re)lists.
    pub fn reseed(&self, syncer: &str, side: Side, links: Vec<(ObjectId, ObjectId)>) {
        let mut indices = self.indices.write();
        let index = indices.entry(syncer.to_owned()).or_default();
        index.clear_side(side);
        for (virtual_id, host_id) in links {
            index.link(virtual_id, host_id, side);
        }
    }

    /// Looks up the virtual object that maps to `host_id` through the physical name index
    pub fn by_index(&self, syncer: &str, host_id: &ObjectIdRef<'_>) -> Result<ObjectId, MapperError> {
        let host_id = host_id.to_owned();
        let indices = self.indices.read();
        let candidates: Vec<ObjectId> = indices
            .get(syncer)
            .and_then(|index| index.by_host.get(&host_id))
            .map(|ids| ids.keys().cloned().collect())
            .unwrap_or_default();
        match candidates.as_slice() {
            [] => Err(MapperError::NotFound(host_id)),
            [single] => Ok(single.clone()),
            _ => Err(MapperError::MultipleMatches {
                host: host_id,
                candidates,
            }),
        }
    }

    /// The last known host counterpart of a virtual object, which still answers after the
    /// virtual object is gone
    pub fn cached_host(&self, syncer: &str, virtual_id: &ObjectId) -> Option<ObjectId> {
        self.indices
            .read()
            .get(syncer)
            .and_then(|index| index.by_virtual.get(virtual_id))
            .cloned()
    }

    /// Resolves the host counterpart of a virtual object, first through the translator and then
    /// through the name cache
    pub fn resolve_host(
        &self,
        syncer: &dyn Syncer,
        virtual_id: &ObjectId,
        virtual_obj: Option<&K8sResource>,
    ) -> Option<ObjectId> {
        syncer
            .translator()
            .virtual_to_host(&virtual_id.as_id_ref(), virtual_obj)
            .or_else(|| {
                if virtual_obj.map(is_skipped).unwrap_or(false) {
                    None
                } else {
                    self.cached_host(syncer.name(), virtual_id)
                }
            })
    }

    /// Resolves the virtual counterpart of a host object. Foreign objects resolve to `None`. When
    /// the origin annotations are missing, the physical name index is consulted instead.
    pub fn resolve_virtual(
        &self,
        syncer: &dyn Syncer,
        host: &K8sResource,
    ) -> Result<Option<ObjectId>, MapperError> {
        match self.classify_for(host, syncer) {
            HostOrigin::Foreign => return Ok(None),
            HostOrigin::Managed if syncer.mode() == SyncMode::UpSync => return Ok(None),
            _ => {}
        }
        match syncer.translator().host_to_virtual(host) {
            Ok(id) => Ok(Some(id)),
            Err(TranslateError::Foreign) => Ok(None),
            Err(TranslateError::MissingAnnotation) => {
                self.by_index(syncer.name(), &host.get_object_id()).map(Some)
            }
            Err(e @ TranslateError::Malformed(_)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types::{core, K8sType};
    use crate::translate::{
        NameTranslator, NamespacedTranslator, IMPORT_ANNOTATION, NAMESPACE_ANNOTATION, NAME_ANNOTATION,
        SKIP_ANNOTATION,
    };
    use serde_json::json;

    struct TestSyncer {
        translator: NamespacedTranslator,
        mode: SyncMode,
    }

    impl Syncer for TestSyncer {
        fn name(&self) -> &str {
            "test"
        }

        fn resource_type(&self) -> &'static K8sType {
            core::v1::Secret
        }

        fn mode(&self) -> SyncMode {
            self.mode
        }

        fn translator(&self) -> &dyn NameTranslator {
            &self.translator
        }

        fn is_importable(&self, host: &K8sResource) -> bool {
            host.get_annotation_value(IMPORT_ANNOTATION).is_some()
        }
    }

    fn syncer(mode: SyncMode) -> TestSyncer {
        TestSyncer {
            translator: NamespacedTranslator::new("vcluster", "vc"),
            mode,
        }
    }

    fn host(labels: serde_json::Value, annotations: serde_json::Value) -> K8sResource {
        K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "namespace": "vcluster",
                "name": "host-name",
                "resourceVersion": "1",
                "labels": labels,
                "annotations": annotations,
            }
        }))
        .unwrap()
    }

    #[test]
    fn objects_are_classified_by_marker_and_import_rule() {
        let mapper = ObjectMapper::new("vc");
        let to_host = syncer(SyncMode::ToHost);
        let up_sync = syncer(SyncMode::UpSync);

        let managed = host(json!({ MARKER_LABEL: "vc" }), json!({}));
        assert_eq!(HostOrigin::Managed, mapper.classify_for(&managed, &to_host));

        let other_cluster = host(json!({ MARKER_LABEL: "other" }), json!({}));
        assert_eq!(HostOrigin::Foreign, mapper.classify_for(&other_cluster, &to_host));

        let importable = host(json!({}), json!({ IMPORT_ANNOTATION: "app/imported" }));
        assert_eq!(HostOrigin::Foreign, mapper.classify_for(&importable, &to_host));
        assert_eq!(HostOrigin::Importable, mapper.classify_for(&importable, &up_sync));

        let skipped = host(json!({ MARKER_LABEL: "vc" }), json!({ SKIP_ANNOTATION: "true" }));
        assert_eq!(HostOrigin::Foreign, mapper.classify_for(&skipped, &to_host));
        assert!(!mapper.is_managed(&skipped));
    }

    #[test]
    fn by_index_reports_missing_single_and_multiple_matches() {
        let mapper = ObjectMapper::new("vc");
        let host_id = ObjectId::new("vcluster", "host-name");
        assert!(matches!(
            mapper.by_index("test", &host_id.as_id_ref()),
            Err(MapperError::NotFound(_))
        ));

        mapper.link("test", ObjectId::new("a", "one"), host_id.clone(), Side::Virtual);
        assert_eq!(
            Ok(ObjectId::new("a", "one")),
            mapper.by_index("test", &host_id.as_id_ref())
        );

        mapper.link("test", ObjectId::new("b", "two"), host_id.clone(), Side::Virtual);
        match mapper.by_index("test", &host_id.as_id_ref()) {
            Err(MapperError::MultipleMatches { candidates, .. }) => assert_eq!(2, candidates.len()),
            other => panic!("expected multiple matches, got: {:?}", other),
        }
        // partitions are per syncer
        assert!(mapper.by_index("other", &host_id.as_id_ref()).is_err());
    }

    #[test]
    fn name_cache_survives_virtual_deletion_while_host_reports_the_link() {
        let mapper = ObjectMapper::new("vc");
        let virtual_id = ObjectId::new("app", "imported");
        let host_id = ObjectId::new("kube-system", "mysecret");
        mapper.link("test", virtual_id.clone(), host_id.clone(), Side::Host);
        mapper.link("test", virtual_id.clone(), host_id.clone(), Side::Virtual);

        mapper.unlink_virtual("test", &virtual_id);
        assert_eq!(Some(host_id.clone()), mapper.cached_host("test", &virtual_id));

        let unlinked = mapper.unlink_host("test", &host_id);
        assert_eq!(vec![virtual_id.clone()], unlinked);
        assert_eq!(None, mapper.cached_host("test", &virtual_id));
    }

    #[test]
    fn reseed_replaces_links_of_one_side() {
        let mapper = ObjectMapper::new("vc");
        let stale = ObjectId::new("a", "stale");
        mapper.link("test", stale.clone(), ObjectId::new("vcluster", "stale-x-a-x-vc"), Side::Host);
        mapper.reseed(
            "test",
            Side::Host,
            vec![(ObjectId::new("a", "fresh"), ObjectId::new("vcluster", "fresh-x-a-x-vc"))],
        );
        assert_eq!(None, mapper.cached_host("test", &stale));
        assert!(mapper.cached_host("test", &ObjectId::new("a", "fresh")).is_some());
    }

    #[test]
    fn host_objects_resolve_through_annotations_then_index() {
        let mapper = ObjectMapper::new("vc");
        let to_host = syncer(SyncMode::ToHost);

        let stamped = host(
            json!({ MARKER_LABEL: "vc" }),
            json!({
                NAME_ANNOTATION: "test123",
                NAMESPACE_ANNOTATION: "test",
            }),
        );
        assert_eq!(
            Ok(Some(ObjectId::new("test", "test123"))),
            mapper.resolve_virtual(&to_host, &stamped)
        );

        let unstamped = host(json!({ MARKER_LABEL: "vc" }), json!({}));
        assert!(matches!(
            mapper.resolve_virtual(&to_host, &unstamped),
            Err(MapperError::NotFound(_))
        ));
        mapper.link(
            "test",
            ObjectId::new("test", "test123"),
            ObjectId::new("vcluster", "host-name"),
            Side::Virtual,
        );
        assert_eq!(
            Ok(Some(ObjectId::new("test", "test123"))),
            mapper.resolve_virtual(&to_host, &unstamped)
        );

        let foreign = host(json!({}), json!({}));
        assert_eq!(Ok(None), mapper.resolve_virtual(&to_host, &foreign));
    }
}

//! What a plugin author implements to mirror one kind between the virtual and the host cluster,
//! and the rules that decide what a sync pass does with a pair of objects.
use crate::error::Error;
use crate::event::EventRecorder;
use crate::hook::{ClientHook, Interceptor};
use crate::k8s_types::K8sType;
use crate::mapper::{HostOrigin, ObjectMapper};
use crate::metadata::{derived_metadata, MetadataPolicy};
use crate::resource::{K8sResource, ObjectId, ObjectIdRef, StringMap};
use crate::store::{ListOptions, ObjectStore};
use crate::translate::{NameTranslator, IMPORTED_ANNOTATION, IMPORT_ANNOTATION};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use std::collections::HashSet;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

/// Fields that are never part of an ownership partition, since they identify the object
const RESERVED_FIELDS: &[&str] = &["apiVersion", "kind", "metadata"];

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Virtual,
    Host,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Virtual => "virtual",
            Side::Host => "host",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Virtual => Side::Host,
            Side::Host => Side::Virtual,
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a pair is primary, meaning its existence decides whether the pair exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Virtual objects are created on the host
    ToHost,
    /// Host objects are imported into the virtual cluster
    UpSync,
}

impl SyncMode {
    pub fn primary(&self) -> Side {
        match self {
            SyncMode::ToHost => Side::Virtual,
            SyncMode::UpSync => Side::Host,
        }
    }
}

/// Declares, per top-level field, which side is authoritative for it. Fields that are not
/// listed belong to the `remaining` side. Every field has exactly one owner, so no field is
/// ever written in both directions.
///
/// ```
/// use vcluster_sdk::syncer::{OwnershipPolicy, Side};
///
/// let policy = OwnershipPolicy::new(Side::Virtual).host_owned("status");
/// assert_eq!(Some(Side::Virtual), policy.owner_of("spec"));
/// assert_eq!(Some(Side::Host), policy.owner_of("status"));
/// assert_eq!(None, policy.owner_of("metadata"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipPolicy {
    fields: Vec<(String, Side)>,
    remaining: Side,
}

impl OwnershipPolicy {
    pub fn new(remaining: Side) -> OwnershipPolicy {
        OwnershipPolicy {
            fields: Vec::new(),
            remaining,
        }
    }

    /// The policy of a plain mirror: the primary side owns everything, except that a `ToHost`
    /// mirror takes the `status` from the host
    pub fn for_mode(mode: SyncMode) -> OwnershipPolicy {
        match mode {
            SyncMode::ToHost => OwnershipPolicy::new(Side::Virtual).host_owned("status"),
            SyncMode::UpSync => OwnershipPolicy::new(Side::Host),
        }
    }

    pub fn virtual_owned(self, field: impl Into<String>) -> OwnershipPolicy {
        self.owned_by(field, Side::Virtual)
    }

    pub fn host_owned(self, field: impl Into<String>) -> OwnershipPolicy {
        self.owned_by(field, Side::Host)
    }

    pub fn owned_by(mut self, field: impl Into<String>, side: Side) -> OwnershipPolicy {
        self.fields.push((field.into(), side));
        self
    }

    pub fn remaining(&self) -> Side {
        self.remaining
    }

    pub fn owner_of(&self, field: &str) -> Option<Side> {
        if RESERVED_FIELDS.contains(&field) {
            return None;
        }
        let explicit = self
            .fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, side)| *side);
        Some(explicit.unwrap_or(self.remaining))
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for (field, _) in self.fields.iter() {
            if RESERVED_FIELDS.contains(&field.as_str()) {
                return Err(format!("'{}' can not be owned by either side", field));
            }
            if !seen.insert(field.as_str()) {
                return Err(format!("'{}' is listed more than once", field));
            }
        }
        Ok(())
    }

    /// Overwrites every field of `onto` that is owned by `owner` with the value from `from`.
    /// Owned fields that are missing in `from` are removed from `onto`.
    pub fn copy_owned(&self, owner: Side, from: &Value, onto: &mut Value) {
        let onto = match onto.as_object_mut() {
            Some(obj) => obj,
            None => return,
        };
        let empty = serde_json::Map::new();
        let from = from.as_object().unwrap_or(&empty);

        let keys: Vec<String> = from
            .keys()
            .chain(onto.keys())
            .filter(|key| self.owner_of(key) == Some(owner))
            .cloned()
            .collect();
        for key in keys {
            match from.get(&key) {
                Some(value) => {
                    onto.insert(key, value.clone());
                }
                None => {
                    onto.remove(&key);
                }
            }
        }
    }
}

/// What a sync pass does with a pair, computed fresh for every pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Create the host object from the virtual one
    ToHost,
    /// Both exist, bring the non-authoritative fields up to date. Metadata flows from `primary`.
    Sync { primary: Side },
    /// Create the virtual object from the host one
    UpSync,
    DeleteHost,
    DeleteVirtual,
    /// The host object is being deleted. Nothing is written until it is gone.
    WaitForHostDeletion,
    /// A virtual object exists, and so does a host object at its mapped identity that is not
    /// ours to take over
    RefuseAdopt,
    Ignore,
}

/// Decides what to do with a pair. `virtual_derived` is true if the virtual object only exists
/// because of a host object (it was imported), and `host` carries the classification of the
/// host object.
///
/// Only up-sync syncers ever delete virtual objects. To a `ToHost` syncer a derived virtual
/// object is invisible: it is neither exported nor deleted, and a host copy exported before the
/// object became derived is cleaned up like the copy of a deleted object.
pub fn decide(
    mode: SyncMode,
    virtual_obj: Option<&K8sResource>,
    virtual_derived: bool,
    host: Option<(&K8sResource, HostOrigin)>,
) -> SyncDirection {
    if let Some((host_obj, _)) = host {
        if host_obj.is_deletion_timestamp_set() {
            return if virtual_obj.is_some() {
                SyncDirection::WaitForHostDeletion
            } else {
                SyncDirection::Ignore
            };
        }
    }
    let virtual_deleting = virtual_obj
        .map(K8sResource::is_deletion_timestamp_set)
        .unwrap_or(false);
    let hidden = mode == SyncMode::ToHost && virtual_derived;
    let virtual_live = virtual_obj.filter(|_| !virtual_deleting && !hidden);

    match (mode, virtual_live, host.map(|(_, origin)| origin)) {
        (_, None, None) => SyncDirection::Ignore,

        (SyncMode::UpSync, Some(_), None) if virtual_derived => SyncDirection::DeleteVirtual,
        (SyncMode::ToHost, Some(_), None) => SyncDirection::ToHost,
        (SyncMode::UpSync, Some(_), None) => SyncDirection::Ignore,

        (SyncMode::ToHost, None, Some(HostOrigin::Managed)) => SyncDirection::DeleteHost,
        // an up-sync syncer never deletes host objects
        (SyncMode::UpSync, None, Some(HostOrigin::Managed)) => SyncDirection::Ignore,
        // wait for the deletion of the virtual object before importing again
        (_, None, Some(HostOrigin::Importable)) if virtual_deleting => SyncDirection::Ignore,
        (_, None, Some(HostOrigin::Importable)) => SyncDirection::UpSync,
        (_, None, Some(HostOrigin::Foreign)) => SyncDirection::Ignore,

        (SyncMode::ToHost, Some(_), Some(HostOrigin::Managed)) => SyncDirection::Sync {
            primary: Side::Virtual,
        },
        (SyncMode::UpSync, Some(_), Some(HostOrigin::Managed)) if virtual_derived => {
            SyncDirection::DeleteVirtual
        }
        (SyncMode::UpSync, Some(_), Some(HostOrigin::Managed)) => SyncDirection::Ignore,
        (SyncMode::UpSync, Some(_), Some(HostOrigin::Importable)) if virtual_derived => SyncDirection::Sync {
            primary: Side::Host,
        },
        (_, Some(_), Some(HostOrigin::Importable)) => SyncDirection::RefuseAdopt,
        // the host object is no longer importable
        (SyncMode::UpSync, Some(_), Some(HostOrigin::Foreign)) if virtual_derived => {
            SyncDirection::DeleteVirtual
        }
        (SyncMode::ToHost, Some(_), Some(HostOrigin::Foreign)) => SyncDirection::RefuseAdopt,
        (SyncMode::UpSync, Some(_), Some(HostOrigin::Foreign)) => SyncDirection::Ignore,
    }
}

/// Mirrors one kind between the virtual and the host cluster. Only `name`, `resource_type` and
/// `translator` are required. The defaults implement a generic mirror that copies every field
/// according to `ownership` and leaves metadata to the metadata reconciler.
pub trait Syncer: Send + Sync + 'static {
    /// Unique among all registrations of one manager
    fn name(&self) -> &str;

    fn resource_type(&self) -> &'static K8sType;

    fn translator(&self) -> &dyn NameTranslator;

    fn mode(&self) -> SyncMode {
        SyncMode::ToHost
    }

    fn ownership(&self) -> OwnershipPolicy {
        OwnershipPolicy::for_mode(self.mode())
    }

    fn metadata_policy(&self) -> MetadataPolicy {
        MetadataPolicy::default()
    }

    /// Explicit import rule of up-sync syncers. Host objects that are neither managed nor
    /// importable are never touched.
    fn is_importable(&self, _host: &K8sResource) -> bool {
        false
    }

    /// True if the virtual object only exists because it was created from a host object
    fn is_derived_virtual(&self, virtual_obj: &K8sResource) -> bool {
        virtual_obj.get_annotation_value(IMPORTED_ANNOTATION).is_some()
    }

    fn host_list_options(&self, ctx: &RegisterContext) -> ListOptions {
        if self.resource_type().namespaced {
            ListOptions::in_namespace(ctx.target_namespace.as_str())
        } else {
            ListOptions::all()
        }
    }

    fn virtual_list_options(&self, _ctx: &RegisterContext) -> ListOptions {
        ListOptions::all()
    }

    /// Returns the host object for `virtual_obj`, without metadata. Only the fields owned by the
    /// virtual side are taken from the result.
    fn translate_to_host(&self, _ctx: &RegisterContext, virtual_obj: &K8sResource) -> Result<Value, Error> {
        Ok(copy_fields(self.resource_type(), &self.ownership(), Side::Virtual, virtual_obj))
    }

    /// Returns the virtual object for `host_obj`, without metadata. Only the fields owned by the
    /// host side are taken from the result.
    fn translate_to_virtual(&self, _ctx: &RegisterContext, host_obj: &K8sResource) -> Result<Value, Error> {
        Ok(copy_fields(self.resource_type(), &self.ownership(), Side::Host, host_obj))
    }

    /// Annotations and labels of a virtual object that is derived from `host_obj`
    fn up_sync_metadata(&self, host_obj: &K8sResource) -> (StringMap, StringMap) {
        derived_metadata(
            host_obj,
            &[IMPORT_ANNOTATION, LAST_APPLIED_ANNOTATION],
            &[(IMPORTED_ANNOTATION, host_obj.get_object_id().to_string())],
        )
    }

    /// Cheap filter applied before a key is queued
    fn should_reconcile(&self, _virtual_id: &ObjectIdRef<'_>) -> bool {
        true
    }
}

fn copy_fields(k8s_type: &K8sType, policy: &OwnershipPolicy, owner: Side, source: &K8sResource) -> Value {
    let mut target = json!({
        "apiVersion": k8s_type.api_version,
        "kind": k8s_type.kind,
    });
    policy.copy_owned(owner, source.as_ref(), &mut target);
    target
}

/// One-time setup that runs after leadership is acquired and before any syncer starts, for
/// example copying a CRD from the host into the virtual cluster
#[async_trait]
pub trait Initializer: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn init(&self, ctx: &RegisterContext) -> Result<(), Error>;
}

/// What a registration provides. Computed once, when the registration is created.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Capabilities {
    pub syncer: bool,
    pub hook: bool,
    pub initializer: bool,
    pub interceptor: bool,
}

/// A named unit handed to the manager. One registration may combine several capabilities, for
/// example a syncer together with the initializer that prepares for it.
#[derive(Clone)]
pub struct Registration {
    name: String,
    syncer: Option<Arc<dyn Syncer>>,
    hook: Option<Arc<dyn ClientHook>>,
    initializer: Option<Arc<dyn Initializer>>,
    interceptor: Option<Arc<dyn Interceptor>>,
    ownership: Option<OwnershipPolicy>,
    capabilities: Capabilities,
}

impl Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl Registration {
    fn empty(name: String) -> Registration {
        Registration {
            name,
            syncer: None,
            hook: None,
            initializer: None,
            interceptor: None,
            ownership: None,
            capabilities: Capabilities::default(),
        }
    }

    pub fn syncer(syncer: impl Syncer) -> Registration {
        Registration::empty(syncer.name().to_owned()).with_syncer(syncer)
    }

    pub fn hook(hook: impl ClientHook) -> Registration {
        Registration::empty(hook.name().to_owned()).with_hook(hook)
    }

    pub fn initializer(initializer: impl Initializer) -> Registration {
        Registration::empty(initializer.name().to_owned()).with_initializer(initializer)
    }

    pub fn interceptor(interceptor: impl Interceptor) -> Registration {
        Registration::empty(interceptor.name().to_owned()).with_interceptor(interceptor)
    }

    pub fn with_syncer(mut self, syncer: impl Syncer) -> Registration {
        self.ownership = Some(syncer.ownership());
        self.syncer = Some(Arc::new(syncer));
        self.capabilities.syncer = true;
        self
    }

    pub fn with_hook(mut self, hook: impl ClientHook) -> Registration {
        self.hook = Some(Arc::new(hook));
        self.capabilities.hook = true;
        self
    }

    pub fn with_initializer(mut self, initializer: impl Initializer) -> Registration {
        self.initializer = Some(Arc::new(initializer));
        self.capabilities.initializer = true;
        self
    }

    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Registration {
        self.interceptor = Some(Arc::new(interceptor));
        self.capabilities.interceptor = true;
        self
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn get_syncer(&self) -> Option<&Arc<dyn Syncer>> {
        self.syncer.as_ref()
    }

    pub fn get_hook(&self) -> Option<&Arc<dyn ClientHook>> {
        self.hook.as_ref()
    }

    pub fn get_initializer(&self) -> Option<&Arc<dyn Initializer>> {
        self.initializer.as_ref()
    }

    pub fn get_interceptor(&self) -> Option<&Arc<dyn Interceptor>> {
        self.interceptor.as_ref()
    }

    /// The ownership policy of the syncer, as it was when the registration was created
    pub fn ownership(&self) -> Option<&OwnershipPolicy> {
        self.ownership.as_ref()
    }

    pub(crate) fn validate(&self) -> Result<(), RegistrationError> {
        if self.capabilities == Capabilities::default() {
            return Err(RegistrationError::Empty(self.name.clone()));
        }
        if let Some(policy) = self.ownership.as_ref() {
            policy
                .validate()
                .map_err(|reason| RegistrationError::InvalidOwnership {
                    name: self.name.clone(),
                    reason,
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationError {
    DuplicateName(String),
    DuplicateInterceptor(String),
    InvalidOwnership { name: String, reason: String },
    Empty(String),
    /// Registrations are only accepted until the manager starts running
    NotAllowed(String),
}

impl Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistrationError::DuplicateName(name) => {
                write!(f, "a registration named '{}' already exists", name)
            }
            RegistrationError::DuplicateInterceptor(name) => {
                write!(f, "an interceptor named '{}' already exists", name)
            }
            RegistrationError::InvalidOwnership { name, reason } => {
                write!(f, "invalid ownership policy of syncer '{}': {}", name, reason)
            }
            RegistrationError::Empty(name) => {
                write!(f, "registration '{}' provides nothing", name)
            }
            RegistrationError::NotAllowed(state) => {
                write!(f, "can not register while the manager is {}", state)
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Everything syncers, hooks and initializers get to know about the plugin's environment.
/// Created by the manager during initialization.
#[derive(Clone)]
pub struct RegisterContext {
    pub virtual_store: Arc<dyn ObjectStore>,
    pub host_store: Arc<dyn ObjectStore>,
    /// The host namespace that namespaced objects are synced into
    pub target_namespace: String,
    /// The host namespace the virtual cluster itself runs in
    pub current_namespace: String,
    /// Name of the virtual cluster, which is also the value of the managed marker
    pub name: String,
    pub mapper: Arc<ObjectMapper>,
    pub recorder: Arc<dyn EventRecorder>,
    pub shutdown: CancellationToken,
}

impl Debug for RegisterContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RegisterContext")
            .field("name", &self.name)
            .field("target_namespace", &self.target_namespace)
            .field("current_namespace", &self.current_namespace)
            .field("virtual_store", &self.virtual_store)
            .field("host_store", &self.host_store)
            .finish()
    }
}

impl RegisterContext {
    pub fn store(&self, side: Side) -> &Arc<dyn ObjectStore> {
        match side {
            Side::Virtual => &self.virtual_store,
            Side::Host => &self.host_store,
        }
    }

    /// Host identity of a virtual object under the default namespaced translation scheme
    pub fn host_name(&self, id: &ObjectIdRef<'_>) -> ObjectId {
        ObjectId::new(
            self.target_namespace.as_str(),
            crate::translate::host_name(id.name, id.namespace, self.name.as_str()),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn obj(deleting: bool) -> K8sResource {
        let mut value = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "namespace": "ns", "name": "n", "resourceVersion": "1" },
            "data": { "k": "dg==" },
        });
        if deleting {
            value["metadata"]["deletionTimestamp"] = json!("2021-01-01T00:00:00Z");
        }
        K8sResource::from_value(value).unwrap()
    }

    #[test]
    fn to_host_decision_table() {
        let v = obj(false);
        let h = obj(false);
        let mode = SyncMode::ToHost;
        assert_eq!(SyncDirection::ToHost, decide(mode, Some(&v), false, None));
        assert_eq!(
            SyncDirection::Sync { primary: Side::Virtual },
            decide(mode, Some(&v), false, Some((&h, HostOrigin::Managed)))
        );
        assert_eq!(
            SyncDirection::DeleteHost,
            decide(mode, None, false, Some((&h, HostOrigin::Managed)))
        );
        assert_eq!(
            SyncDirection::Ignore,
            decide(mode, None, false, Some((&h, HostOrigin::Foreign)))
        );
        assert_eq!(
            SyncDirection::RefuseAdopt,
            decide(mode, Some(&v), false, Some((&h, HostOrigin::Foreign)))
        );
        assert_eq!(SyncDirection::Ignore, decide(mode, None, false, None));
    }

    #[test]
    fn deleting_virtual_objects_count_as_absent() {
        let v = obj(true);
        let h = obj(false);
        assert_eq!(
            SyncDirection::DeleteHost,
            decide(SyncMode::ToHost, Some(&v), false, Some((&h, HostOrigin::Managed)))
        );
        assert_eq!(SyncDirection::Ignore, decide(SyncMode::ToHost, Some(&v), false, None));
    }

    #[test]
    fn to_host_syncers_never_delete_derived_virtual_objects() {
        let v = obj(false);
        let h = obj(false);
        let mode = SyncMode::ToHost;
        assert_eq!(SyncDirection::Ignore, decide(mode, Some(&v), true, None));
        assert_eq!(
            SyncDirection::Ignore,
            decide(mode, Some(&v), true, Some((&h, HostOrigin::Foreign)))
        );
        // a copy exported before the object became derived is removed from the host
        assert_eq!(
            SyncDirection::DeleteHost,
            decide(mode, Some(&v), true, Some((&h, HostOrigin::Managed)))
        );
    }

    #[test]
    fn deleting_host_objects_are_waited_for() {
        let v = obj(false);
        let h = obj(true);
        assert_eq!(
            SyncDirection::WaitForHostDeletion,
            decide(SyncMode::ToHost, Some(&v), false, Some((&h, HostOrigin::Managed)))
        );
        assert_eq!(
            SyncDirection::Ignore,
            decide(SyncMode::ToHost, None, false, Some((&h, HostOrigin::Managed)))
        );
    }

    #[test]
    fn up_sync_decision_table() {
        let v = obj(false);
        let h = obj(false);
        let mode = SyncMode::UpSync;
        assert_eq!(
            SyncDirection::UpSync,
            decide(mode, None, false, Some((&h, HostOrigin::Importable)))
        );
        assert_eq!(
            SyncDirection::Sync { primary: Side::Host },
            decide(mode, Some(&v), true, Some((&h, HostOrigin::Importable)))
        );
        assert_eq!(
            SyncDirection::RefuseAdopt,
            decide(mode, Some(&v), false, Some((&h, HostOrigin::Importable)))
        );
        // host gone, or no longer importable
        assert_eq!(SyncDirection::DeleteVirtual, decide(mode, Some(&v), true, None));
        assert_eq!(
            SyncDirection::DeleteVirtual,
            decide(mode, Some(&v), true, Some((&h, HostOrigin::Foreign)))
        );
        // virtual objects that were not imported are left alone
        assert_eq!(SyncDirection::Ignore, decide(mode, Some(&v), false, None));
        // managed host objects belong to the core syncers
        assert_eq!(
            SyncDirection::Ignore,
            decide(mode, None, false, Some((&h, HostOrigin::Managed)))
        );
    }

    #[test]
    fn ownership_policy_is_validated() {
        assert!(OwnershipPolicy::for_mode(SyncMode::ToHost).validate().is_ok());
        let twice = OwnershipPolicy::new(Side::Virtual)
            .host_owned("status")
            .virtual_owned("status");
        assert!(twice.validate().is_err());
        let reserved = OwnershipPolicy::new(Side::Virtual).host_owned("metadata");
        assert!(reserved.validate().is_err());
    }

    #[test]
    fn copy_owned_only_touches_owned_fields() {
        let policy = OwnershipPolicy::new(Side::Virtual).host_owned("status");
        let virtual_obj = json!({
            "metadata": { "name": "virtual" },
            "spec": { "replicas": 3 },
            "status": { "ready": 1 },
        });
        let mut host_obj = json!({
            "metadata": { "name": "host" },
            "spec": { "replicas": 1 },
            "extra": true,
            "status": { "ready": 3 },
        });
        policy.copy_owned(Side::Virtual, &virtual_obj, &mut host_obj);
        assert_eq!(
            json!({
                "metadata": { "name": "host" },
                "spec": { "replicas": 3 },
                "status": { "ready": 3 },
            }),
            host_obj
        );
    }
}

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::hash::{self, Hash};

/// A basic description of a Kubernetes kind, with just enough information to talk to an api
/// server about it. All fields are `&'static str` so that references can be passed around
/// freely. Custom kinds are declared as statics:
///
/// ```no_run
/// use vcluster_sdk::k8s_types::K8sType;
///
/// #[allow(non_upper_case_globals)]
/// pub static Car: &K8sType = &K8sType {
///     api_version: "demo.loft.sh/v1",
///     kind: "Car",
///     plural_kind: "cars",
///     namespaced: true,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sType {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub plural_kind: &'static str,
    pub namespaced: bool,
}

impl Hash for K8sType {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.api_version.hash(hasher);
        self.kind.hash(hasher);
    }
}

/// Creates a `&'static K8sType` at runtime **by leaking memory**. This is fine as long as it
/// only happens once per kind, for example while registering syncers for CRDs discovered at
/// startup.
pub fn define_type(
    api_version: String,
    kind: String,
    plural_kind: String,
    namespaced: bool,
) -> &'static K8sType {
    fn leak_str(s: String) -> &'static str {
        Box::leak(s.into_boxed_str())
    }

    let k8s_type = K8sType {
        api_version: leak_str(api_version),
        kind: leak_str(kind),
        plural_kind: leak_str(plural_kind),
        namespaced,
    };
    log::info!("Dynamically defining {:?}", k8s_type);
    Box::leak(Box::new(k8s_type))
}

impl K8sType {
    pub fn as_group_and_version(&self) -> (&str, &str) {
        match self.api_version.find('/') {
            Some(slash_idx) => (
                &self.api_version[..slash_idx],
                &self.api_version[(slash_idx + 1)..],
            ),
            None => ("", self.api_version),
        }
    }

    pub fn group(&self) -> &str {
        self.as_group_and_version().0
    }

    pub fn version(&self) -> &str {
        self.as_group_and_version().1
    }

    pub fn is_type(&self, api_version: &str, kind: &str) -> bool {
        self.api_version == api_version && self.kind == kind
    }
}

impl Display for K8sType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.plural_kind)
    }
}

/// The set of kinds known to one plugin manager, looked up by `(apiVersion, kind)`. Built from
/// the registrations, so that requests from the host process naming a kind can be resolved
/// without any global state.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    types: HashMap<(&'static str, &'static str), &'static K8sType>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry::default()
    }

    /// Every kind defined in this module
    pub fn builtin() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        for k8s_type in [
            self::core::v1::Namespace,
            self::core::v1::Node,
            self::core::v1::Pod,
            self::core::v1::Event,
            self::core::v1::Service,
            self::core::v1::Endpoints,
            self::core::v1::Secret,
            self::core::v1::ConfigMap,
            self::core::v1::PersistentVolumeClaim,
            self::core::v1::PersistentVolume,
            self::core::v1::ServiceAccount,
            self::apiextensions_k8s_io::v1::CustomResourceDefinition,
            self::apps::v1::DaemonSet,
            self::apps::v1::Deployment,
            self::apps::v1::ReplicaSet,
            self::apps::v1::StatefulSet,
            self::networking_k8s_io::v1::Ingress,
            self::networking_k8s_io::v1::NetworkPolicy,
        ]
        .iter()
        .copied()
        {
            registry.register(k8s_type);
        }
        registry
    }

    pub fn register(&mut self, k8s_type: &'static K8sType) {
        self.types
            .insert((k8s_type.api_version, k8s_type.kind), k8s_type);
    }

    pub fn lookup(&self, api_version: &str, kind: &str) -> Option<&'static K8sType> {
        self.types
            .values()
            .find(|t| t.is_type(api_version, kind))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

macro_rules! k8s_type {
    ($ref_name:ident, $api_version:expr, $kind:expr, $plural_kind:expr, $namespaced:expr) => {
        #[allow(non_upper_case_globals)]
        pub static $ref_name: &crate::k8s_types::K8sType = &crate::k8s_types::K8sType {
            api_version: $api_version,
            kind: $kind,
            plural_kind: $plural_kind,
            namespaced: $namespaced,
        };
    };
}

macro_rules! def_types {
    (@nogroupmod, $group:expr, [
        $( $version:ident => [
            $( $kind:ident ~ $plural_kind:ident ~ $namespaced:expr ),*
        ]),*
    ]) => {
        $(
            pub mod $version {
                $(
                    k8s_type!($kind, concat!($group, "/", stringify!($version)), stringify!($kind), stringify!($plural_kind), $namespaced);
                )*
            }
        )*
    };
    ($group:ident => $rem:tt ) => {
        pub mod $group {
            def_types!{@nogroupmod, stringify!($group), $rem }
        }
    };
    (@core => [
        $( $version:ident => [
            $( $kind:ident ~ $plural_kind:ident ~ $namespaced:expr ),*
        ]),*
    ]) => {
        pub mod core {
            $(pub mod $version {
                $(
                    k8s_type!($kind, stringify!($version), stringify!($kind), stringify!($plural_kind), $namespaced);
                )*
            })*
        }
    }
}

def_types! {
    @core => [
        v1 => [
            Namespace ~ namespaces ~ false,
            Node ~ nodes ~ false,
            Pod ~ pods ~ true,
            Event ~ events ~ true,
            Service ~ services ~ true,
            Endpoints ~ endpoints ~ true,
            Secret ~ secrets ~ true,
            ConfigMap ~ configmaps ~ true,
            PersistentVolumeClaim ~ persistentvolumeclaims ~ true,
            PersistentVolume ~ persistentvolumes ~ false,
            ServiceAccount ~ serviceaccounts ~ true
        ]
    ]
}

pub mod apiextensions_k8s_io {
    def_types! {
        @nogroupmod, "apiextensions.k8s.io", [
            v1 => [
                CustomResourceDefinition ~ customresourcedefinitions ~ false
            ]
        ]
    }
}

def_types! {
    apps => [
        v1 => [
            DaemonSet ~ daemonsets ~ true,
            Deployment ~ deployments ~ true,
            ReplicaSet ~ replicasets ~ true,
            StatefulSet ~ statefulsets ~ true
        ]
    ]
}

pub mod networking_k8s_io {
    def_types! {
        @nogroupmod, "networking.k8s.io", [
            v1 => [
                Ingress ~ ingresses ~ true,
                NetworkPolicy ~ networkpolicies ~ true
            ]
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn group_and_version_are_split() {
        let crd = apiextensions_k8s_io::v1::CustomResourceDefinition;
        assert_eq!(("apiextensions.k8s.io", "v1"), crd.as_group_and_version());
        assert_eq!(("", "v1"), core::v1::Secret.as_group_and_version());
        assert_eq!("apps/v1", apps::v1::Deployment.api_version);
        assert!(!core::v1::Namespace.namespaced);
    }

    #[test]
    fn registry_resolves_registered_types() {
        let mut registry = TypeRegistry::new();
        registry.register(core::v1::Secret);
        registry.register(core::v1::Pod);
        assert_eq!(Some(core::v1::Pod), registry.lookup("v1", "Pod"));
        assert_eq!(None, registry.lookup("v1", "ConfigMap"));
        assert_eq!(2, registry.len());
    }

    #[test]
    fn builtin_registry_knows_every_defined_kind() {
        let registry = TypeRegistry::builtin();
        assert_eq!(18, registry.len());
        assert_eq!(Some(apps::v1::Deployment), registry.lookup("apps/v1", "Deployment"));
        assert_eq!(Some(core::v1::ConfigMap), registry.lookup("v1", "ConfigMap"));
        assert_eq!(None, registry.lookup("demo.loft.sh/v1", "Car"));
    }
}

use crate::error::{Error, MessageError};
use crate::k8s_types::{K8sType, TypeRegistry};
use crate::resource::{str_value, ObjectIdRef};
use crate::syncer::{Initializer, RegisterContext};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
enum Source {
    Inline(String),
    File(PathBuf),
}

/// Applies a YAML manifest to the virtual cluster before the syncers start. Every document is
/// created if it does not exist yet, or updated if any field it sets differs from the live
/// object. Fields the manifest does not mention are left alone.
#[derive(Debug, Clone)]
pub struct ManifestInitializer {
    name: String,
    source: Source,
    types: TypeRegistry,
}

impl ManifestInitializer {
    pub fn from_yaml(name: impl Into<String>, yaml: impl Into<String>) -> ManifestInitializer {
        ManifestInitializer {
            name: name.into(),
            source: Source::Inline(yaml.into()),
            types: TypeRegistry::builtin(),
        }
    }

    /// The file is read when the initializer runs, so a missing file fails the plugin startup
    pub fn from_file(name: impl Into<String>, path: impl Into<PathBuf>) -> ManifestInitializer {
        ManifestInitializer {
            name: name.into(),
            source: Source::File(path.into()),
            types: TypeRegistry::builtin(),
        }
    }

    /// Makes a custom kind known to the manifest, in addition to the built in ones
    pub fn with_type(mut self, k8s_type: &'static K8sType) -> ManifestInitializer {
        self.types.register(k8s_type);
        self
    }

    fn read(&self) -> Result<String, Error> {
        match &self.source {
            Source::Inline(yaml) => Ok(yaml.clone()),
            Source::File(path) => std::fs::read_to_string(path).map_err(|err| {
                MessageError::new(format!("failed to read manifest {}: {}", path.display(), err))
            }),
        }
    }

    async fn apply(&self, ctx: &RegisterContext, mut desired: Value) -> Result<(), Error> {
        let api_version = str_value(&desired, "/apiVersion").unwrap_or_default().to_owned();
        let kind = str_value(&desired, "/kind").unwrap_or_default().to_owned();
        let k8s_type = self.types.lookup(&api_version, &kind).ok_or_else(|| {
            MessageError::new(format!("manifest '{}' contains unknown kind {}/{}", self.name, api_version, kind))
        })?;
        let name = str_value(&desired, "/metadata/name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| MessageError::new(format!("manifest '{}' has a {} without a name", self.name, kind)))?
            .to_owned();
        let namespace = if k8s_type.namespaced {
            let namespace = str_value(&desired, "/metadata/namespace").unwrap_or("default").to_owned();
            desired["metadata"]["namespace"] = json!(namespace);
            namespace
        } else {
            String::new()
        };

        let id = ObjectIdRef::new(namespace.as_str(), name.as_str());
        match ctx.virtual_store.get(k8s_type, &id).await? {
            None => {
                log::info!("Creating {} {} from manifest '{}'", kind, id, self.name);
                ctx.virtual_store.create(k8s_type, &desired).await?;
            }
            Some(existing) => {
                let existing = existing.into_value();
                let mut updated = existing.clone();
                overlay(&mut updated, &desired);
                if updated == existing {
                    log::debug!("{} {} from manifest '{}' is up to date", kind, id, self.name);
                } else {
                    log::info!("Updating {} {} from manifest '{}'", kind, id, self.name);
                    ctx.virtual_store.update(k8s_type, &updated).await?;
                }
            }
        }
        Ok(())
    }
}

/// Splits a multi-document YAML manifest into its objects, skipping empty documents
pub fn parse_manifest(yaml: &str) -> Result<Vec<Value>, serde_yaml::Error> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = Value::deserialize(document)?;
        if !value.is_null() {
            objects.push(value);
        }
    }
    Ok(objects)
}

/// Writes every field of `desired` into `target`. Nested objects are merged key by key, anything
/// else is replaced wholesale.
fn overlay(target: &mut Value, desired: &Value) {
    match (target, desired) {
        (Value::Object(target), Value::Object(desired)) => {
            for (key, value) in desired {
                match target.get_mut(key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, desired) => *target = desired.clone(),
    }
}

#[async_trait]
impl Initializer for ManifestInitializer {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn init(&self, ctx: &RegisterContext) -> Result<(), Error> {
        let objects = parse_manifest(&self.read()?)?;
        for object in objects {
            self.apply(ctx, object).await?;
        }
        log::info!("Applied manifest '{}'", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::MemoryEventRecorder;
    use crate::k8s_types::{apps, core};
    use crate::mapper::ObjectMapper;
    use crate::store::{MemoryStore, ObjectStore};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const MANIFEST: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: demo
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: nginx
  namespace: demo
  labels:
    app: nginx
spec:
  replicas: 1
  template:
    spec:
      containers:
      - name: nginx
        image: nginx:1.21
---
# trailing comment only
"#;

    fn context(virtual_store: Arc<MemoryStore>) -> RegisterContext {
        RegisterContext {
            virtual_store,
            host_store: Arc::new(MemoryStore::new("host")),
            target_namespace: "vcluster".to_owned(),
            current_namespace: "vcluster".to_owned(),
            name: "vc".to_owned(),
            mapper: Arc::new(ObjectMapper::new("vc")),
            recorder: Arc::new(MemoryEventRecorder::new()),
            shutdown: CancellationToken::new(),
        }
    }

    #[test]
    fn documents_are_split_and_empty_ones_skipped() {
        let objects = parse_manifest(MANIFEST).unwrap();
        assert_eq!(2, objects.len());
        assert_eq!("Namespace", objects[0]["kind"]);
        assert_eq!(1, objects[1]["spec"]["replicas"]);
        assert!(parse_manifest("kind: [").is_err());
    }

    #[tokio::test]
    async fn manifest_objects_are_created_then_kept_up_to_date() {
        let virtual_store = Arc::new(MemoryStore::new("virtual"));
        let ctx = context(virtual_store.clone());
        let id = ObjectIdRef::new("demo", "nginx");

        ManifestInitializer::from_yaml("nginx", MANIFEST).init(&ctx).await.unwrap();
        assert!(virtual_store.get_now(core::v1::Namespace, &ObjectIdRef::new("", "demo")).is_some());
        let created = virtual_store.get_now(apps::v1::Deployment, &id).unwrap();
        assert_eq!(Some("nginx"), created.get_label_value("app"));

        // fields the manifest does not set survive, and an unchanged manifest writes nothing
        let mut scaled = created.into_value();
        scaled["metadata"]["labels"]["team"] = json!("web");
        virtual_store.update(apps::v1::Deployment, &scaled).await.unwrap();
        let writes = virtual_store.write_count();
        ManifestInitializer::from_yaml("nginx", MANIFEST).init(&ctx).await.unwrap();
        assert_eq!(writes, virtual_store.write_count());

        let bumped = MANIFEST.replace("nginx:1.21", "nginx:1.22");
        ManifestInitializer::from_yaml("nginx", bumped).init(&ctx).await.unwrap();
        let updated = virtual_store.get_now(apps::v1::Deployment, &id).unwrap();
        assert_eq!(
            Some("nginx:1.22"),
            updated.str_value("/spec/template/spec/containers/0/image")
        );
        assert_eq!(Some("web"), updated.get_label_value("team"));
    }

    #[tokio::test]
    async fn namespaced_objects_default_to_the_default_namespace() {
        let virtual_store = Arc::new(MemoryStore::new("virtual"));
        let ctx = context(virtual_store.clone());
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  a: b\n";

        ManifestInitializer::from_yaml("settings", manifest).init(&ctx).await.unwrap();
        let created = virtual_store
            .get_now(core::v1::ConfigMap, &ObjectIdRef::new("default", "settings"))
            .unwrap();
        assert_eq!(Some("b"), created.str_value("/data/a"));
    }

    #[allow(non_upper_case_globals)]
    static Car: &K8sType = &K8sType {
        api_version: "demo.loft.sh/v1",
        kind: "Car",
        plural_kind: "cars",
        namespaced: true,
    };

    #[tokio::test]
    async fn unknown_kinds_and_missing_files_fail() {
        let virtual_store = Arc::new(MemoryStore::new("virtual"));
        let ctx = context(virtual_store.clone());
        let manifest = "apiVersion: demo.loft.sh/v1\nkind: Car\nmetadata:\n  name: herbie\n";

        assert!(ManifestInitializer::from_yaml("cars", manifest).init(&ctx).await.is_err());
        ManifestInitializer::from_yaml("cars", manifest)
            .with_type(Car)
            .init(&ctx)
            .await
            .unwrap();
        assert!(virtual_store.get_now(Car, &ObjectIdRef::new("default", "herbie")).is_some());

        let missing = ManifestInitializer::from_file("missing", "/does/not/exist.yaml");
        assert!(missing.init(&ctx).await.is_err());
    }
}

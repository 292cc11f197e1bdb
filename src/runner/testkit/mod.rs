//! Runs a plugin against two in-memory clusters, for integration tests. The `TestKit` owns its
//! own runtime, so tests using it are plain `#[test]` functions.
use crate::{
    config::PluginOptions,
    error::Error,
    event::MemoryEventRecorder,
    k8s_types::K8sType,
    resource::{K8sResource, ObjectIdRef},
    runner::{
        handshake::{InitConfig, LocalHostProcess},
        metrics::Metrics,
        reconcile::compare,
        ActivityHandle, ClusterStores, LifecycleError, Manager,
    },
    store::{MemoryStore, ObjectStore},
    syncer::{RegisterContext, Registration, Side},
};

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::time::{Duration, Instant};

macro_rules! test_error {
    ($($arg:tt)*) => {{
        Box::new(TestKitError(format!($($arg)*))) as Error
    }};
}

/// How long the work queues and both stores must stay quiet before the plugin counts as settled
const SETTLE_PERIOD: Duration = Duration::from_millis(150);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct TestKit {
    runtime: Runtime,
    virtual_store: Arc<MemoryStore>,
    host_store: Arc<MemoryStore>,
    recorder: Arc<MemoryEventRecorder>,
    host: Arc<LocalHostProcess>,
    context: RegisterContext,
    metrics: Metrics,
    activity: ActivityHandle,
    shutdown: CancellationToken,
    manager: Option<JoinHandle<Result<(), LifecycleError>>>,
}

impl Debug for TestKit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TestKit")
            .field("context", &self.context)
            .field("virtual_store", &self.virtual_store)
            .field("host_store", &self.host_store)
            .finish()
    }
}

pub trait ToJson {
    fn to_json(&self) -> Value;
    fn into_json(self) -> Value;
}

impl<T: Serialize + Clone> ToJson for T {
    fn to_json(&self) -> Value {
        self.clone().into_json()
    }
    fn into_json(self) -> Value {
        serde_json::to_value(self).expect("failed to serialize value")
    }
}

impl Drop for TestKit {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The handshake the test host process performs: virtual cluster `vc`, syncing into the host
/// namespace `vcluster`
pub fn default_init_config() -> InitConfig {
    InitConfig {
        virtual_cluster_config: String::new(),
        host_cluster_config: String::new(),
        target_namespace: "vcluster".to_owned(),
        current_namespace: "vcluster".to_owned(),
        name: "vc".to_owned(),
        port: 0,
        working_dir: String::new(),
    }
}

impl TestKit {
    /// Initializes a manager against two empty in-memory stores, registers whatever `setup`
    /// returns, grants leadership and waits until every cache synced
    pub fn start<F>(options: PluginOptions, setup: F) -> Result<TestKit, Error>
    where
        F: FnOnce(&RegisterContext) -> Vec<Registration>,
    {
        TestKit::with_init_config(default_init_config(), options, Vec::new(), setup)
    }

    /// Like `start`, with a custom handshake. The `seed` objects are created before the
    /// plugin's caches are filled.
    pub fn with_init_config<F>(
        config: InitConfig,
        options: PluginOptions,
        seed: Vec<(Side, &'static K8sType, Value)>,
        setup: F,
    ) -> Result<TestKit, Error>
    where
        F: FnOnce(&RegisterContext) -> Vec<Registration>,
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let virtual_store = Arc::new(MemoryStore::new("virtual"));
        let host_store = Arc::new(MemoryStore::new("host"));
        for (side, k8s_type, object) in seed {
            let store = match side {
                Side::Virtual => &virtual_store,
                Side::Host => &host_store,
            };
            runtime.block_on(store.create(k8s_type, &object))?;
        }

        let recorder = Arc::new(MemoryEventRecorder::new());
        let host = Arc::new(LocalHostProcess::new(config));
        let mut manager = Manager::new(options).with_recorder(recorder.clone());
        let stores = ClusterStores::Provided {
            virtual_store: virtual_store.clone(),
            host_store: host_store.clone(),
        };
        let context = runtime.block_on(manager.init_with(host.clone(), stores))?;
        for registration in setup(&context) {
            manager.register(registration)?;
        }

        let metrics = manager.metrics();
        let activity = manager.activity();
        let shutdown = manager.shutdown_token();
        let mut synced = manager.subscribe_synced();
        let task = runtime.spawn(async move { manager.start().await });
        host.grant_leadership();

        let started = runtime.block_on(async {
            loop {
                if *synced.borrow() {
                    return true;
                }
                if synced.changed().await.is_err() {
                    return false;
                }
            }
        });
        if !started {
            log::error!("Plugin failed to start in the test kit");
            return match runtime.block_on(task) {
                Ok(Ok(())) => Err(test_error!("plugin stopped before it finished starting")),
                Ok(Err(err)) => Err(err.into()),
                Err(err) => Err(test_error!("plugin task failed: {}", err)),
            };
        }
        log::info!("Test kit started plugin for virtual cluster '{}'", context.name);

        Ok(TestKit {
            runtime,
            virtual_store,
            host_store,
            recorder,
            host,
            context,
            metrics,
            activity,
            shutdown,
            manager: Some(task),
        })
    }

    pub fn context(&self) -> &RegisterContext {
        &self.context
    }

    pub fn store(&self, side: Side) -> &MemoryStore {
        match side {
            Side::Virtual => &self.virtual_store,
            Side::Host => &self.host_store,
        }
    }

    pub fn recorder(&self) -> &MemoryEventRecorder {
        &self.recorder
    }

    pub fn host_process(&self) -> &LocalHostProcess {
        &self.host
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn create_resource(&self, side: Side, k8s_type: &K8sType, resource: impl ToJson) -> Result<K8sResource, Error> {
        let value = resource.into_json();
        let store = self.store(side);
        let created = self.runtime.block_on(store.create(k8s_type, &value))?;
        Ok(created)
    }

    /// Reads the current object, applies `change` to it and writes it back
    pub fn update_resource<F>(&self, side: Side, k8s_type: &K8sType, id: &ObjectIdRef<'_>, change: F) -> Result<K8sResource, Error>
    where
        F: FnOnce(&mut Value),
    {
        let store = self.store(side);
        let current = store
            .get_now(k8s_type, id)
            .ok_or_else(|| test_error!("no {} {} in the {} store", k8s_type, id, side))?;
        let mut value = current.into_value();
        change(&mut value);
        let updated = self.runtime.block_on(store.update(k8s_type, &value))?;
        Ok(updated)
    }

    pub fn delete_resource(&self, side: Side, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<(), Error> {
        let store = self.store(side);
        self.runtime.block_on(store.delete(k8s_type, id))?;
        Ok(())
    }

    pub fn get_resource(&self, side: Side, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Option<K8sResource> {
        self.store(side).get_now(k8s_type, id)
    }

    /// Waits until no work is queued or in flight, and neither store was written to, for a
    /// short settle period
    pub fn wait_until_idle(&self, timeout: Duration) -> Result<(), Error> {
        let start = Instant::now();
        let mut quiet_since: Option<(Instant, usize)> = None;
        while start.elapsed() < timeout {
            let writes = self.virtual_store.write_count() + self.host_store.write_count();
            if self.activity.is_idle() {
                match quiet_since {
                    Some((since, count)) if count == writes => {
                        if since.elapsed() >= SETTLE_PERIOD {
                            return Ok(());
                        }
                    }
                    _ => quiet_since = Some((Instant::now(), writes)),
                }
            } else {
                quiet_since = None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Err(Box::new(ReconciliationIncompleteError { timeout }))
    }

    /// Waits until the object exists and satisfies `predicate`, returning it
    pub fn wait_for<P>(&self, side: Side, k8s_type: &K8sType, id: &ObjectIdRef<'_>, timeout: Duration, predicate: P) -> Result<K8sResource, Error>
    where
        P: Fn(&K8sResource) -> bool,
    {
        let start = Instant::now();
        loop {
            let current = self.get_resource(side, k8s_type, id);
            if let Some(resource) = current.as_ref() {
                if predicate(resource) {
                    return Ok(resource.clone());
                }
            }
            if start.elapsed() > timeout {
                return Err(match current {
                    Some(resource) => test_error!(
                        "{} {} in the {} store never matched, last seen: {}",
                        k8s_type,
                        id,
                        side,
                        resource
                    ),
                    None => Box::new(MissingResource {
                        k8s_type: k8s_type.clone(),
                        side,
                        id: id.to_owned().to_string(),
                    }),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn assert_resource_exists_eventually(&self, side: Side, k8s_type: &K8sType, id: &ObjectIdRef<'_>, timeout: Duration) -> K8sResource {
        match self.wait_for(side, k8s_type, id, timeout, |_| true) {
            Ok(resource) => resource,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn assert_resource_deleted_eventually(&self, side: Side, k8s_type: &K8sType, id: &ObjectIdRef<'_>, timeout: Duration) {
        let start = Instant::now();
        while self.get_resource(side, k8s_type, id).is_some() {
            if start.elapsed() > timeout {
                panic!(
                    "Expected {} {} to be deleted from the {} store within {}ms",
                    k8s_type,
                    id,
                    side,
                    crate::runner::duration_to_millis(timeout)
                );
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn assert_resource_eq_eventually(&self, side: Side, k8s_type: &K8sType, id: &ObjectIdRef<'_>, expected: impl ToJson, timeout: Duration) {
        let expected = expected.into_json();
        let start = Instant::now();
        loop {
            let diff = match self.get_resource(side, k8s_type, id) {
                Some(actual) => diff_resources(actual.into_value(), &expected),
                None => Some(Diff {
                    expected: expected.clone(),
                    actual: Value::Null,
                    different_paths: vec!["".to_owned()],
                }),
            };
            match diff {
                None => return,
                Some(diff) if start.elapsed() > timeout => {
                    panic!("{} {} in the {} store never matched: {}", k8s_type, id, side, diff)
                }
                Some(_) => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }

    pub fn revoke_leadership(&self) {
        self.host.revoke_leadership();
    }

    /// Cancels the manager and waits for it to stop, returning whatever it stopped with
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.shutdown.cancel();
        match self.manager.take() {
            Some(task) => match self.runtime.block_on(task) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.into()),
                Err(err) => Err(test_error!("plugin task failed: {}", err)),
            },
            None => Ok(()),
        }
    }

    /// Waits for the manager to stop on its own, for example after leadership was revoked
    pub fn wait_for_exit(mut self, timeout: Duration) -> Result<(), Error> {
        let task = match self.manager.take() {
            Some(task) => task,
            None => return Ok(()),
        };
        match self.runtime.block_on(async move { tokio::time::timeout(timeout, task).await }) {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(err.into()),
            Ok(Err(err)) => Err(test_error!("plugin task failed: {}", err)),
            Err(_) => Err(test_error!("plugin did not stop within {}ms", crate::runner::duration_to_millis(timeout))),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct TestKitError(String);

impl Display for TestKitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Test Error: {}", self.0)
    }
}
impl std::error::Error for TestKitError {}

/// The plugin never settled: work kept being queued, or objects kept being written. In a real
/// cluster this would be a hot loop, typically caused by a translation that returns a different
/// object every time it is called.
#[derive(Debug)]
pub struct ReconciliationIncompleteError {
    timeout: Duration,
}

impl std::error::Error for ReconciliationIncompleteError {}

impl Display for ReconciliationIncompleteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let duration_ms = crate::runner::duration_to_millis(self.timeout);
        write!(f, "Plugin never settled within {}ms", duration_ms)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Diff {
    expected: Value,
    actual: Value,
    different_paths: Vec<String>,
}

impl Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Diff: \n\texpected:\t {},\n\tactual:\t{},\n\tdifferent_paths:\t{:?}",
            self.expected, self.actual, self.different_paths
        )
    }
}

#[derive(Debug)]
pub struct MissingResource {
    pub k8s_type: K8sType,
    pub side: Side,
    pub id: String,
}

impl Display for MissingResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Missing Resource: type: {}, side: {}, id: {}",
            self.k8s_type, self.side, self.id
        )
    }
}
impl std::error::Error for MissingResource {}

fn diff_resources(actual: Value, expected: &Value) -> Option<Diff> {
    let paths: Vec<String> = compare::compare_values(&actual, expected)
        .iter()
        .map(|diff| diff.path.clone())
        .collect();
    if paths.is_empty() {
        None
    } else {
        Some(Diff {
            expected: expected.clone(),
            actual,
            different_paths: paths,
        })
    }
}

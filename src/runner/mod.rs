mod controller;
pub mod handshake;
mod informer;
pub mod metrics;
mod queue;
pub(crate) mod reconcile;
pub(crate) mod resource_map;
mod server;

#[cfg(feature = "testkit")]
pub mod testkit;

pub use self::handshake::{
    HandshakeError, HostProcess, InitConfig, Leadership, LocalHostProcess, PluginHandlers, ReadyInfo,
};
pub use self::reconcile::SyncError;
pub use self::server::{LeaderRequest, MutateRequest, MutateResponse, PluginServer, HANDLER_NAME_HEADER};

use crate::config::{ClientConfig, KubeConfigError, PluginOptions};
use crate::error::Error;
use crate::event::{EventRecorder, StoreEventRecorder};
use crate::hook::{HookRegistry, Interceptor};
use crate::k8s_types::TypeRegistry;
use crate::mapper::ObjectMapper;
use crate::runner::controller::Controller;
use crate::runner::informer::{start_informer, InformerHandle};
use crate::runner::metrics::Metrics;
use crate::runner::queue::WorkQueue;
use crate::runner::reconcile::SyncPass;
use crate::store::{HttpStore, ObjectStore};
use crate::syncer::{RegisterContext, Registration, RegistrationError, Side};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unregistered,
    Initialized,
    WaitingForLeadership,
    Running,
    ShuttingDown,
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LifecycleState::Unregistered => "unregistered",
            LifecycleState::Initialized => "initialized",
            LifecycleState::WaitingForLeadership => "waiting for leadership",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// Errors that end the life of the plugin. None of these are retried.
#[derive(Debug)]
pub enum LifecycleError {
    Handshake(HandshakeError),
    AlreadyInitialized,
    NotInitialized,
    KubeConfig(KubeConfigError),
    Client(io::Error),
    CacheSyncTimeout { syncer: String, side: Side },
    Initializer { name: String, error: Error },
    Registration(RegistrationError),
    LeadershipLost,
    HostDisconnected,
    /// The shutdown token was cancelled before the plugin finished starting
    Cancelled,
}

impl Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LifecycleError::Handshake(e) => write!(f, "handshake with the host process failed: {}", e),
            LifecycleError::AlreadyInitialized => f.write_str("the plugin was already initialized"),
            LifecycleError::NotInitialized => f.write_str("the plugin has not been initialized"),
            LifecycleError::KubeConfig(e) => write!(f, "invalid cluster config: {}", e),
            LifecycleError::Client(e) => write!(f, "failed to create client: {}", e),
            LifecycleError::CacheSyncTimeout { syncer, side } => write!(
                f,
                "timed out waiting for the {} cache of syncer '{}' to sync",
                side, syncer
            ),
            LifecycleError::Initializer { name, error } => {
                write!(f, "initializer '{}' failed: {}", name, error)
            }
            LifecycleError::Registration(e) => write!(f, "{}", e),
            LifecycleError::LeadershipLost => f.write_str("lost leadership"),
            LifecycleError::HostDisconnected => f.write_str("lost connection to the host process"),
            LifecycleError::Cancelled => f.write_str("shut down before the plugin started"),
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LifecycleError::Handshake(e) => Some(e),
            LifecycleError::KubeConfig(e) => Some(e),
            LifecycleError::Client(e) => Some(e),
            LifecycleError::Registration(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HandshakeError> for LifecycleError {
    fn from(err: HandshakeError) -> LifecycleError {
        LifecycleError::Handshake(err)
    }
}

impl From<RegistrationError> for LifecycleError {
    fn from(err: RegistrationError) -> LifecycleError {
        LifecycleError::Registration(err)
    }
}

impl From<KubeConfigError> for LifecycleError {
    fn from(err: KubeConfigError) -> LifecycleError {
        LifecycleError::KubeConfig(err)
    }
}

impl From<io::Error> for LifecycleError {
    fn from(err: io::Error) -> LifecycleError {
        LifecycleError::Client(err)
    }
}

/// Where the manager gets its two object stores from
pub enum ClusterStores {
    /// Http clients built from the kubeconfigs that the host process hands over
    FromHandshake,
    Provided {
        virtual_store: Arc<dyn ObjectStore>,
        host_store: Arc<dyn ObjectStore>,
    },
}

/// Tells whether any syncer still has work queued or in flight
#[derive(Debug, Clone)]
pub struct ActivityHandle {
    queues: Arc<Mutex<Vec<Arc<WorkQueue>>>>,
}

impl ActivityHandle {
    pub fn is_idle(&self) -> bool {
        self.queues.lock().iter().all(|queue| queue.is_idle())
    }
}

/// Drives the plugin through its lifecycle: initialization, registration, waiting for
/// leadership, and finally running every registered syncer until leadership is lost.
pub struct Manager {
    options: PluginOptions,
    state: watch::Sender<LifecycleState>,
    synced: watch::Sender<bool>,
    // keep the channels open while nobody else is listening
    _receivers: (watch::Receiver<LifecycleState>, watch::Receiver<bool>),
    metrics: Metrics,
    shutdown: CancellationToken,
    recorder: Option<Arc<dyn EventRecorder>>,
    host: Option<Arc<dyn HostProcess>>,
    context: Option<RegisterContext>,
    registrations: Vec<Registration>,
    types: TypeRegistry,
    queues: Arc<Mutex<Vec<Arc<WorkQueue>>>>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Manager")
            .field("plugin_name", &self.options.plugin_name)
            .field("state", &self.state())
            .field("registrations", &self.registrations)
            .finish()
    }
}

impl Manager {
    pub fn new(options: PluginOptions) -> Manager {
        let (state, state_rx) = watch::channel(LifecycleState::Unregistered);
        let (synced, synced_rx) = watch::channel(false);
        Manager {
            options,
            state,
            synced,
            _receivers: (state_rx, synced_rx),
            metrics: Metrics::new(),
            shutdown: CancellationToken::new(),
            recorder: None,
            host: None,
            context: None,
            registrations: Vec::new(),
            types: TypeRegistry::new(),
            queues: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Replaces the default recorder, which writes `v1/Event` objects into the virtual cluster
    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Manager {
        self.recorder = Some(recorder);
        self
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Flips to true once every cache has synced and all controllers are started
    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    /// Cancelling this token shuts the manager down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn activity(&self) -> ActivityHandle {
        ActivityHandle {
            queues: self.queues.clone(),
        }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn registrations(&self) -> &[Registration] {
        self.registrations.as_slice()
    }

    fn set_state(&self, state: LifecycleState) {
        log::info!("Plugin '{}' is now {}", self.options.plugin_name, state);
        let _ = self.state.send(state);
    }

    /// Runs the handshake with the host process and connects to both clusters using the
    /// kubeconfigs it hands over
    pub async fn init(&mut self, host: Arc<dyn HostProcess>) -> Result<RegisterContext, LifecycleError> {
        self.init_with(host, ClusterStores::FromHandshake).await
    }

    pub async fn init_with(
        &mut self,
        host: Arc<dyn HostProcess>,
        stores: ClusterStores,
    ) -> Result<RegisterContext, LifecycleError> {
        if self.context.is_some() || self.state() != LifecycleState::Unregistered {
            return Err(LifecycleError::AlreadyInitialized);
        }
        let config = host.initialize().await?;
        log::debug!(
            "Initializing plugin '{}' for virtual cluster '{}' with target namespace '{}'",
            self.options.plugin_name,
            config.name,
            config.target_namespace
        );

        let (virtual_store, host_store) = match stores {
            ClusterStores::Provided {
                virtual_store,
                host_store,
            } => (virtual_store, host_store),
            ClusterStores::FromHandshake => {
                let working_dir = Path::new(config.working_dir.as_str());
                let user_agent = self.options.plugin_name.as_str();
                let virtual_config = ClientConfig::from_kubeconfig_bytes(
                    user_agent,
                    config.virtual_cluster_config.as_bytes(),
                    working_dir,
                )?;
                let host_config = ClientConfig::from_kubeconfig_bytes(
                    user_agent,
                    config.host_cluster_config.as_bytes(),
                    working_dir,
                )?;
                let virtual_store: Arc<dyn ObjectStore> = Arc::new(HttpStore::new(
                    virtual_config,
                    self.metrics.client_metrics(Side::Virtual),
                )?);
                let host_store: Arc<dyn ObjectStore> = Arc::new(HttpStore::new(
                    host_config,
                    self.metrics.client_metrics(Side::Host),
                )?);
                (virtual_store, host_store)
            }
        };

        let recorder = match self.recorder.take() {
            Some(recorder) => recorder,
            None => Arc::new(StoreEventRecorder::new(
                virtual_store.clone(),
                self.options.plugin_name.clone(),
            )),
        };
        let ctx = RegisterContext {
            virtual_store,
            host_store,
            target_namespace: config.target_namespace,
            current_namespace: config.current_namespace,
            mapper: Arc::new(ObjectMapper::new(config.name.clone())),
            name: config.name,
            recorder,
            shutdown: self.shutdown.clone(),
        };
        self.context = Some(ctx.clone());
        self.host = Some(host);
        self.set_state(LifecycleState::Initialized);
        Ok(ctx)
    }

    pub fn register(&mut self, registration: Registration) -> Result<(), RegistrationError> {
        match self.state() {
            LifecycleState::Unregistered
            | LifecycleState::Initialized
            | LifecycleState::WaitingForLeadership => {}
            other => return Err(RegistrationError::NotAllowed(other.to_string())),
        }
        registration.validate()?;
        if self
            .registrations
            .iter()
            .any(|existing| existing.name() == registration.name())
        {
            return Err(RegistrationError::DuplicateName(registration.name().to_owned()));
        }
        if let Some(interceptor) = registration.get_interceptor() {
            let taken = self
                .registrations
                .iter()
                .filter_map(|existing| existing.get_interceptor())
                .any(|existing| existing.name() == interceptor.name());
            if taken {
                return Err(RegistrationError::DuplicateInterceptor(
                    interceptor.name().to_owned(),
                ));
            }
        }
        if let Some(syncer) = registration.get_syncer() {
            self.types.register(syncer.resource_type());
        }
        if let Some(hook) = registration.get_hook() {
            self.types.register(hook.resource_type());
        }
        log::info!(
            "Registered '{}' with capabilities: {:?}",
            registration.name(),
            registration.capabilities()
        );
        self.registrations.push(registration);
        Ok(())
    }

    fn handlers(&self) -> PluginHandlers {
        let mut hooks = HookRegistry::new();
        let mut interceptors: BTreeMap<String, Arc<dyn Interceptor>> = BTreeMap::new();
        for registration in self.registrations.iter() {
            if let Some(hook) = registration.get_hook() {
                hooks.add(hook.clone());
            }
            if let Some(interceptor) = registration.get_interceptor() {
                interceptors.insert(interceptor.name().to_owned(), interceptor.clone());
            }
        }
        PluginHandlers {
            hooks: Arc::new(hooks),
            interceptors: Arc::new(interceptors),
            metrics: self.metrics.clone(),
        }
    }

    /// Announces the plugin as ready, waits for leadership, and then runs all syncers. Only
    /// returns once the plugin shuts down: `Ok` when the shutdown token was cancelled, and an
    /// error when leadership or the host process was lost, or starting up failed.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        let (ctx, host) = match (self.context.clone(), self.host.clone()) {
            (Some(ctx), Some(host)) if self.state() == LifecycleState::Initialized => (ctx, host),
            _ => return Err(LifecycleError::NotInitialized),
        };
        let info = host.set_ready(self.handlers()).await?;
        log::info!(
            "Plugin '{}' is ready with {} hook keys and {} interceptors",
            self.options.plugin_name,
            info.hooks.len(),
            info.interceptors.len()
        );

        self.set_state(LifecycleState::WaitingForLeadership);
        let mut leadership = host.leadership();
        let result = match self.wait_for_leadership(&mut leadership).await {
            Ok(()) => {
                self.set_state(LifecycleState::Running);
                self.run(&ctx, &mut leadership).await
            }
            Err(err) => Err(err),
        };

        self.set_state(LifecycleState::ShuttingDown);
        self.shutdown.cancel();
        match result.as_ref() {
            Ok(()) => log::info!("Plugin '{}' shut down", self.options.plugin_name),
            Err(err) => log::error!("Plugin '{}' is shutting down: {}", self.options.plugin_name, err),
        }
        result
    }

    async fn wait_for_leadership(
        &self,
        leadership: &mut watch::Receiver<Leadership>,
    ) -> Result<(), LifecycleError> {
        log::info!("Plugin '{}' is waiting for leadership", self.options.plugin_name);
        loop {
            let current = *leadership.borrow();
            match current {
                Leadership::Acquired => return Ok(()),
                Leadership::Disconnected => return Err(LifecycleError::HostDisconnected),
                Leadership::Pending | Leadership::Lost => {}
            }
            tokio::select! {
                changed = leadership.changed() => {
                    if changed.is_err() {
                        return Err(LifecycleError::HostDisconnected);
                    }
                }
                _ = self.shutdown.cancelled() => return Err(LifecycleError::Cancelled),
            }
        }
    }

    async fn run(
        &self,
        ctx: &RegisterContext,
        leadership: &mut watch::Receiver<Leadership>,
    ) -> Result<(), LifecycleError> {
        let mut tasks = Vec::new();
        let started = tokio::select! {
            result = self.start_syncers(ctx, &mut tasks) => result.map(|_| true),
            error = supervise(leadership) => Err(error),
            _ = self.shutdown.cancelled() => Ok(false),
        };
        let result = match started {
            Ok(true) => {
                let _ = self.synced.send(true);
                log::info!(
                    "All {} tasks of plugin '{}' are running",
                    tasks.len(),
                    self.options.plugin_name
                );
                tokio::select! {
                    error = supervise(leadership) => Err(error),
                    _ = self.shutdown.cancelled() => Ok(()),
                }
            }
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        };

        self.shutdown.cancel();
        for task in tasks {
            if let Err(err) = task.await {
                log::error!("Task of plugin '{}' failed: {}", self.options.plugin_name, err);
            }
        }
        result
    }

    async fn start_syncers(
        &self,
        ctx: &RegisterContext,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), LifecycleError> {
        for registration in self.registrations.iter() {
            if let Some(initializer) = registration.get_initializer() {
                log::info!("Running initializer '{}'", initializer.name());
                initializer
                    .init(ctx)
                    .await
                    .map_err(|error| LifecycleError::Initializer {
                        name: initializer.name().to_owned(),
                        error,
                    })?;
            }
        }

        let mut informers: Vec<InformerHandle> = Vec::new();
        let mut controllers = Vec::new();
        for registration in self.registrations.iter() {
            let syncer = match registration.get_syncer() {
                Some(syncer) => syncer.clone(),
                None => continue,
            };
            let name = syncer.name().to_owned();
            let queue = Arc::new(WorkQueue::new(
                name.clone(),
                self.options.initial_requeue_delay,
                self.options.max_requeue_delay,
                self.shutdown.clone(),
            ));
            self.queues.lock().push(queue.clone());
            for side in [Side::Virtual, Side::Host].iter() {
                let (handle, task) = start_informer(
                    syncer.clone(),
                    *side,
                    ctx,
                    queue.clone(),
                    self.metrics.watcher_metrics(name.as_str(), *side),
                    self.options.watch_retry_delay,
                );
                informers.push(handle);
                tasks.push(task);
            }
            let ownership = registration
                .ownership()
                .cloned()
                .unwrap_or_else(|| syncer.ownership());
            let pass = SyncPass::new(
                syncer,
                ownership,
                ctx.clone(),
                self.metrics.syncer_metrics(name.as_str()),
            );
            controllers.push(Controller::new(
                name,
                pass,
                queue,
                self.options.max_concurrent_reconciles,
                self.shutdown.clone(),
            ));
        }

        wait_for_caches(informers, self.options.cache_sync_timeout).await?;

        for controller in controllers {
            tasks.push(tokio::spawn(controller.run()));
        }
        Ok(())
    }
}

async fn wait_for_caches(
    informers: Vec<InformerHandle>,
    timeout: Duration,
) -> Result<(), LifecycleError> {
    let deadline = tokio::time::Instant::now() + timeout;
    for mut informer in informers {
        match tokio::time::timeout_at(deadline, informer.wait_synced()).await {
            Ok(true) => {
                log::debug!(
                    "The {} cache of syncer '{}' synced with {} objects",
                    informer.side(),
                    informer.syncer(),
                    informer.resource_count()
                );
            }
            Ok(false) => return Err(LifecycleError::Cancelled),
            Err(_) => {
                return Err(LifecycleError::CacheSyncTimeout {
                    syncer: informer.syncer().to_owned(),
                    side: informer.side(),
                })
            }
        }
    }
    Ok(())
}

/// Resolves once leadership is lost, or the host process is gone
async fn supervise(leadership: &mut watch::Receiver<Leadership>) -> LifecycleError {
    loop {
        let current = *leadership.borrow();
        match current {
            Leadership::Lost => return LifecycleError::LeadershipLost,
            Leadership::Disconnected => return LifecycleError::HostDisconnected,
            Leadership::Pending | Leadership::Acquired => {}
        }
        if leadership.changed().await.is_err() {
            return LifecycleError::HostDisconnected;
        }
    }
}

#[derive(Debug)]
pub struct UnexpectedShutdownError;
impl Display for UnexpectedShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Plugin shutdown without an error")
    }
}
impl std::error::Error for UnexpectedShutdownError {}

/// Starts the plugin server, runs the handshake, registers whatever `setup` returns, and runs
/// the plugin on a new runtime. Blocks the current thread until the plugin stops, which it only
/// does because of an error.
pub fn try_run_plugin<F>(options: PluginOptions, setup: F) -> Error
where
    F: FnOnce(&RegisterContext) -> Vec<Registration>,
{
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => return err.into(),
    };
    let result = runtime.block_on(async move {
        let mut manager = Manager::new(options);
        let server = PluginServer::start(manager.options(), manager.metrics()).await?;
        let ctx = manager.init(Arc::new(server)).await?;
        for registration in setup(&ctx) {
            manager.register(registration)?;
        }
        manager.start().await
    });
    log::warn!("Plugin stopped, shutting down runtime");
    runtime.shutdown_timeout(Duration::from_secs(5));
    match result {
        Ok(()) => Box::new(UnexpectedShutdownError),
        Err(err) => err.into(),
    }
}

/// Like `try_run_plugin`, but exits the process with a non-zero status once the plugin stops
pub fn run_plugin<F>(options: PluginOptions, setup: F) -> !
where
    F: FnOnce(&RegisterContext) -> Vec<Registration>,
{
    let err = try_run_plugin(options, setup);
    log::error!("Plugin failed: {}", err);
    std::process::exit(1)
}

pub(crate) fn duration_to_millis(duration: Duration) -> u64 {
    let mut millis = duration.as_secs() * 1000;
    let nanos = duration.subsec_nanos() as u64;
    if nanos > 1_000_000 {
        millis = millis.saturating_add(nanos / 1_000_000)
    }
    millis
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::MemoryEventRecorder;
    use crate::k8s_types::{core, K8sType};
    use crate::store::MemoryStore;
    use crate::syncer::{Initializer, Syncer};
    use crate::translate::{NameTranslator, NamespacedTranslator};

    use async_trait::async_trait;

    struct Mirror(NamespacedTranslator);

    impl Syncer for Mirror {
        fn name(&self) -> &str {
            "configmaps"
        }

        fn resource_type(&self) -> &'static K8sType {
            core::v1::ConfigMap
        }

        fn translator(&self) -> &dyn NameTranslator {
            &self.0
        }
    }

    struct Failing;

    #[async_trait]
    impl Initializer for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn init(&self, _ctx: &RegisterContext) -> Result<(), Error> {
            Err(crate::error::MessageError::new("nope"))
        }
    }

    fn local_host() -> Arc<LocalHostProcess> {
        Arc::new(LocalHostProcess::new(InitConfig {
            virtual_cluster_config: String::new(),
            host_cluster_config: String::new(),
            target_namespace: "vcluster".to_owned(),
            current_namespace: "vcluster".to_owned(),
            name: "vc".to_owned(),
            port: 0,
            working_dir: String::new(),
        }))
    }

    fn stores() -> ClusterStores {
        ClusterStores::Provided {
            virtual_store: Arc::new(MemoryStore::new("virtual")),
            host_store: Arc::new(MemoryStore::new("host")),
        }
    }

    fn manager() -> Manager {
        Manager::new(PluginOptions::new("test-plugin"))
            .with_recorder(Arc::new(MemoryEventRecorder::new()))
    }

    fn mirror() -> Registration {
        Registration::syncer(Mirror(NamespacedTranslator::new("vcluster", "vc")))
    }

    #[tokio::test]
    async fn initializing_twice_is_refused() {
        let mut manager = manager();
        manager.init_with(local_host(), stores()).await.unwrap();
        assert_eq!(LifecycleState::Initialized, manager.state());
        let result = manager.init_with(local_host(), stores()).await;
        assert!(matches!(result, Err(LifecycleError::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn start_requires_init() {
        let mut manager = manager();
        assert!(matches!(manager.start().await, Err(LifecycleError::NotInitialized)));
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mut manager = manager();
        manager.register(mirror()).unwrap();
        assert_eq!(
            Err(RegistrationError::DuplicateName("configmaps".to_owned())),
            manager.register(mirror())
        );
        assert_eq!(1, manager.types().len());
    }

    #[tokio::test]
    async fn losing_leadership_stops_the_manager() {
        let host = local_host();
        let mut manager = manager();
        manager.init_with(host.clone(), stores()).await.unwrap();
        manager.register(mirror()).unwrap();
        let mut synced = manager.subscribe_synced();
        let task = tokio::spawn(async move {
            let result = manager.start().await;
            (result, manager)
        });

        host.grant_leadership();
        while !*synced.borrow() {
            synced.changed().await.unwrap();
        }
        host.revoke_leadership();

        let (result, mut manager) = task.await.unwrap();
        assert!(matches!(result, Err(LifecycleError::LeadershipLost)));
        assert_eq!(LifecycleState::ShuttingDown, manager.state());
        assert_eq!(
            Err(RegistrationError::NotAllowed("shutting down".to_owned())),
            manager.register(Registration::initializer(Failing))
        );
    }

    #[tokio::test]
    async fn failing_initializer_is_fatal() {
        let host = local_host();
        let mut manager = manager();
        manager.init_with(host.clone(), stores()).await.unwrap();
        manager.register(Registration::initializer(Failing)).unwrap();
        host.grant_leadership();
        let result = manager.start().await;
        match result {
            Err(LifecycleError::Initializer { name, .. }) => assert_eq!("failing", name),
            other => panic!("expected initializer error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn followers_wait_until_cancelled() {
        let mut manager = manager();
        manager.init_with(local_host(), stores()).await.unwrap();
        let token = manager.shutdown_token();
        let mut state = manager.subscribe_state();
        let task = tokio::spawn(async move { manager.start().await });
        while *state.borrow() != LifecycleState::WaitingForLeadership {
            state.changed().await.unwrap();
        }
        token.cancel();
        assert!(matches!(task.await.unwrap(), Err(LifecycleError::Cancelled)));
    }
}

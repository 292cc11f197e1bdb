use crate::config::PluginOptions;
use crate::hook::{Interceptor, Mutation};
use crate::runner::handshake::{
    HandshakeError, HostProcess, InitConfig, Leadership, PluginHandlers, ReadyInfo,
};
use crate::runner::metrics::Metrics;

use async_trait::async_trait;
use hyper::server::Server;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Header that tells the interceptor server which interceptor a request is for
pub const HANDLER_NAME_HEADER: &str = "VCluster-Plugin-Handler-Name";

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutateRequest {
    pub api_version: String,
    pub kind: String,
    #[serde(rename = "type")]
    pub mutation: Mutation,
    pub object: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutateResponse {
    pub object: Value,
    pub mutated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeaderRequest {
    pub leader: bool,
}

struct ServerState {
    serve_metrics: bool,
    serve_health: bool,
    metrics: Metrics,
    init: watch::Sender<Option<InitConfig>>,
    ready: watch::Sender<Option<ReadyInfo>>,
    leadership: watch::Sender<Leadership>,
    handlers: RwLock<Option<PluginHandlers>>,
    last_contact: Mutex<Option<Instant>>,
    // keep the channels open while nobody else is listening
    _receivers: (
        watch::Receiver<Option<InitConfig>>,
        watch::Receiver<Option<ReadyInfo>>,
        watch::Receiver<Leadership>,
    ),
}

/// The host process, as reached over the plugin's loopback http server. The host process
/// drives the handshake by calling `/initialize`, which is answered once the manager called
/// `set_ready`, and reports leadership changes on `/leader`.
#[derive(Clone)]
pub struct PluginServer {
    state: Arc<ServerState>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for PluginServer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "PluginServer({})", self.local_addr)
    }
}

impl PluginServer {
    /// Binds the listen address from the options and starts serving in the background
    pub async fn start(options: &PluginOptions, metrics: Metrics) -> Result<PluginServer, HandshakeError> {
        let (init, init_rx) = watch::channel(None);
        let (ready, ready_rx) = watch::channel(None);
        let (leadership, leadership_rx) = watch::channel(Leadership::Pending);
        let state = Arc::new(ServerState {
            serve_metrics: options.expose_metrics,
            serve_health: options.expose_health,
            metrics,
            init,
            ready,
            leadership,
            handlers: RwLock::new(None),
            last_contact: Mutex::new(None),
            _receivers: (init_rx, ready_rx, leadership_rx),
        });

        let svc = Svc {
            state: state.clone(),
        };
        let service = make_service_fn(move |_| {
            let svc = svc.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |request| {
                    let svc = svc.clone();
                    async move { svc.handle_request(request).await }
                }))
            }
        });
        let server = Server::try_bind(&options.listen_address)
            .map_err(|e| HandshakeError::Server(e.to_string()))?
            .serve(service);
        let local_addr = server.local_addr();
        log::info!(
            "Starting plugin server on address: {}, exposing '/metrics': {}, '/health': {}",
            local_addr,
            options.expose_metrics,
            options.expose_health
        );
        tokio::spawn(async move {
            if let Err(err) = server.await {
                log::error!("Plugin server failed with error: {:?}", err);
            }
        });

        if let Some(timeout) = options.heartbeat_timeout {
            tokio::spawn(watch_heartbeat(state.clone(), timeout));
        }
        Ok(PluginServer { state, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Reports the host process as disconnected when it goes quiet for longer than `timeout`. Only
/// starts counting once the host process made contact.
async fn watch_heartbeat(state: Arc<ServerState>, timeout: Duration) {
    let check_interval = (timeout / 4).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(check_interval).await;
        let last_contact = *state.last_contact.lock();
        if let Some(last) = last_contact {
            if last.elapsed() > timeout {
                log::error!(
                    "No contact with the host process for {}ms, considering it gone",
                    crate::runner::duration_to_millis(last.elapsed())
                );
                let _ = state.leadership.send(Leadership::Disconnected);
                return;
            }
        }
    }
}

#[async_trait]
impl HostProcess for PluginServer {
    async fn initialize(&self) -> Result<InitConfig, HandshakeError> {
        let mut init = self.state.init.subscribe();
        loop {
            if let Some(config) = init.borrow().clone() {
                return Ok(config);
            }
            init.changed().await.map_err(|_| HandshakeError::Closed)?;
        }
    }

    async fn set_ready(&self, handlers: PluginHandlers) -> Result<ReadyInfo, HandshakeError> {
        let port = self
            .state
            .init
            .borrow()
            .as_ref()
            .map(|config| config.port)
            .unwrap_or(0);
        if port != 0 && !handlers.interceptors.is_empty() {
            start_interceptor_server(port, handlers.interceptors.clone())?;
        }
        let info = handlers.ready_info(port);
        *self.state.handlers.write() = Some(handlers);
        let _ = self.state.ready.send(Some(info.clone()));
        Ok(info)
    }

    fn leadership(&self) -> watch::Receiver<Leadership> {
        self.state.leadership.subscribe()
    }
}

#[derive(Clone)]
struct Svc {
    state: Arc<ServerState>,
}

impl Svc {
    fn not_found(&self) -> Result<Response<Body>, Error> {
        let resp = Response::builder().status(404).body(Body::empty())?;
        Ok(resp)
    }

    fn health(&self) -> Result<Response<Body>, Error> {
        let resp = Response::builder().status(200).body(Body::empty())?;
        Ok(resp)
    }

    fn metrics(&self) -> Result<Response<Body>, Error> {
        let body = self.state.metrics.encode_as_text()?;
        let resp = Response::builder()
            .status(200)
            .header(http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
            .body(Body::from(body))?;
        Ok(resp)
    }

    async fn initialize(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let body = hyper::body::to_bytes(request.into_body()).await?;
        let config: InitConfig = match serde_json::from_slice(&body) {
            Ok(config) => config,
            Err(err) => return json_response(400, &json!({ "error": err.to_string() })),
        };
        log::info!(
            "Host process initialized plugin for virtual cluster '{}', target namespace: '{}'",
            config.name,
            config.target_namespace
        );
        let mut ready = self.state.ready.subscribe();
        let _ = self.state.init.send(Some(config));
        loop {
            if let Some(info) = ready.borrow().clone() {
                return json_response(200, &info);
            }
            ready.changed().await?;
        }
    }

    async fn leader(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let body = hyper::body::to_bytes(request.into_body()).await?;
        let LeaderRequest { leader } = match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return json_response(400, &json!({ "error": err.to_string() })),
        };
        let current = *self.state.leadership.borrow();
        let next = match (leader, current) {
            (true, _) => Leadership::Acquired,
            (false, Leadership::Acquired) => Leadership::Lost,
            (false, other) => other,
        };
        if next != current {
            log::info!("Host process reports leadership change: {:?} -> {:?}", current, next);
            let _ = self.state.leadership.send(next);
        }
        json_response(200, &json!({}))
    }

    async fn mutate(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let body = hyper::body::to_bytes(request.into_body()).await?;
        let req: MutateRequest = match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return json_response(400, &json!({ "error": err.to_string() })),
        };
        let hooks = match self.state.handlers.read().as_ref() {
            Some(handlers) => handlers.hooks.clone(),
            None => return json_response(503, &json!({ "error": "plugin is not ready" })),
        };
        match hooks.mutate(&req.api_version, &req.kind, req.mutation, req.object) {
            Ok((object, mutated)) => json_response(200, &MutateResponse { object, mutated }),
            Err(err) => {
                log::warn!(
                    "Mutation {} of {}/{} failed: {}",
                    req.mutation,
                    req.api_version,
                    req.kind,
                    err
                );
                json_response(500, &json!({ "error": err.to_string() }))
            }
        }
    }

    async fn handle_request(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        *self.state.last_contact.lock() = Some(Instant::now());
        let req_path = request.uri().path().trim_end_matches('/').to_owned();
        let req_method = request.method().clone();

        log::debug!("Got http request {} {}", req_method, req_path);

        let result = match (&req_method, req_path.as_str()) {
            (&Method::POST, "/initialize") => self.initialize(request).await,
            (&Method::POST, "/leader") => self.leader(request).await,
            (&Method::POST, "/mutate") => self.mutate(request).await,
            (&Method::GET, "/health") if self.state.serve_health => self.health(),
            (&Method::GET, "/metrics") if self.state.serve_metrics => self.metrics(),
            _ => self.not_found(),
        };
        match result.as_ref() {
            Ok(resp) => {
                log::debug!(
                    "Finished handling {} {} with response status: {}",
                    req_method,
                    req_path,
                    resp.status()
                );
            }
            Err(err) => {
                log::error!("Error handling {} {} , error: {:?}", req_method, req_path, err);
            }
        }
        result
    }
}

fn json_response<T: Serialize>(status: u16, body: &T) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(body)?;
    let resp = Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))?;
    Ok(resp)
}

fn start_interceptor_server(
    port: u16,
    interceptors: Arc<BTreeMap<String, Arc<dyn Interceptor>>>,
) -> Result<(), HandshakeError> {
    let address: SocketAddr = ([127, 0, 0, 1], port).into();
    let service = make_service_fn(move |_| {
        let interceptors = interceptors.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |request| {
                let interceptors = interceptors.clone();
                async move { intercept(&interceptors, request).await }
            }))
        }
    });
    let server = Server::try_bind(&address)
        .map_err(|e| HandshakeError::Server(e.to_string()))?
        .serve(service);
    log::info!("Serving interceptors on address: {}", address);
    tokio::spawn(async move {
        if let Err(err) = server.await {
            log::error!("Interceptor server failed with error: {:?}", err);
        }
    });
    Ok(())
}

async fn intercept(
    interceptors: &BTreeMap<String, Arc<dyn Interceptor>>,
    request: Request<Body>,
) -> Result<Response<Body>, Error> {
    let name = request
        .headers()
        .get(HANDLER_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_owned();
    let interceptor = match interceptors.get(name.as_str()) {
        Some(interceptor) => interceptor.clone(),
        None => {
            log::warn!("No interceptor named '{}' for {} {}", name, request.method(), request.uri());
            let resp = Response::builder().status(404).body(Body::empty())?;
            return Ok(resp);
        }
    };
    match interceptor.handle(request).await {
        Ok(resp) => Ok(resp),
        Err(err) => {
            log::error!("Interceptor '{}' failed: {}", name, err);
            json_response(500, &json!({ "error": err.to_string() }))
        }
    }
}

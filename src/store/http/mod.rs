//! `ObjectStore` backed by a Kubernetes api server, over hyper with openssl.
mod request;

use crate::config::{CAData, ClientConfig, Credentials};
use crate::k8s_types::K8sType;
use crate::resource::{K8sResource, ObjectIdRef};
use crate::runner::metrics::ClientMetrics;
use crate::store::{ListOptions, ObjectList, ObjectStore, StoreError, WatchEvent, WatchStream};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use http::{Method, Request, Response, StatusCode};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslMethod};
use openssl::x509::X509;
use serde::de::DeserializeOwned;
use serde_json::Value;

use std::fmt::{self, Debug};
use std::io;
use std::sync::Arc;
use std::time::Instant;

struct StoreInner {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: ClientConfig,
    metrics: ClientMetrics,
}

/// Cheap to clone, all clones share one connection pool
#[derive(Clone)]
pub struct HttpStore(Arc<StoreInner>);

impl Debug for HttpStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HttpStore({})", self.0.config.api_server_endpoint)
    }
}

fn invalid_base64(field: &str, err: base64::DecodeError) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("Invalid base64 content of {}: {}", field, err),
    )
}

impl HttpStore {
    pub fn new(config: ClientConfig, metrics: ClientMetrics) -> Result<HttpStore, io::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let mut ssl = SslConnector::builder(SslMethod::tls())?;
        // enable http2 using alpn
        ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;
        match config.ca_data.as_ref() {
            Some(CAData::Contents(certs)) => {
                // inline CA certs, as they appear in kubeconfig files, have to be added to the
                // openssl cert store one by one
                let decoded = base64::decode(certs)
                    .map_err(|e| invalid_base64("certificate-authority-data", e))?;
                let certs = X509::stack_from_pem(decoded.as_slice())?;
                let cert_store = ssl.cert_store_mut();
                for cert in certs {
                    cert_store.add_cert(cert)?;
                }
            }
            Some(CAData::File(path)) => {
                ssl.set_ca_file(path.as_str())?;
            }
            None => {}
        }

        let client_cert = match &config.credentials {
            Credentials::PemPath {
                certificate_path,
                private_key_path,
            } => Some((std::fs::read(certificate_path)?, std::fs::read(private_key_path)?)),
            Credentials::Pem {
                certificate_base64,
                private_key_base64,
            } => {
                let cert = base64::decode(certificate_base64)
                    .map_err(|e| invalid_base64("client-certificate-data", e))?;
                let key = base64::decode(private_key_base64)
                    .map_err(|e| invalid_base64("client-key-data", e))?;
                Some((cert, key))
            }
            Credentials::Header(_) => None,
        };
        if let Some((cert, key)) = client_cert {
            let cert = X509::from_pem(cert.as_slice())?;
            let pkey = PKey::private_key_from_pem(key.as_slice())?;
            ssl.set_certificate(&*cert)?;
            ssl.set_private_key(&*pkey)?;
            // ensures that the private key and certificate actually go together
            ssl.check_private_key()?;
        }

        if config.verify_ssl_certs {
            ssl.set_verify(openssl::ssl::SslVerifyMode::PEER);
        } else {
            log::warn!("TLS Certificate verification has been disabled! All connections to {} will be insecure!", config.api_server_endpoint);
            ssl.set_verify(openssl::ssl::SslVerifyMode::NONE);
        }

        let https = HttpsConnector::with_connector(http, ssl)?;
        let http_client = HyperClient::builder().build(https);

        Ok(HttpStore(Arc::new(StoreInner {
            http_client,
            config,
            metrics,
        })))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.0.config
    }

    async fn get_response(&self, req: Request<Body>) -> Result<Response<Body>, StoreError> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let start_time = Instant::now();
        log::debug!("Starting {} request to: {}", method, uri);

        let timer = self.0.metrics.request_started();
        let result = self.0.http_client.request(req).await;
        timer.observe_duration();
        let duration = start_time.elapsed().as_millis();
        match result {
            Ok(resp) => {
                log::debug!(
                    "Response status received for {} to: {}, status: {}, duration: {}ms",
                    method,
                    uri,
                    resp.status().as_u16(),
                    duration
                );
                Ok(resp)
            }
            Err(err) => {
                log::error!(
                    "Failed to execute {} request to: {}, err: {}",
                    method,
                    uri,
                    err
                );
                Err(StoreError::Transport(err.to_string()))
            }
        }
    }

    /// Executes the request and deserializes a successful response body. Error statuses are
    /// mapped with `status_error`.
    async fn execute<T: DeserializeOwned>(
        &self,
        req: Request<Body>,
        what: &str,
    ) -> Result<T, StoreError> {
        let is_create = req.method() == Method::POST;
        let response = self.get_response(req).await?;
        if !response.status().is_success() {
            return Err(status_error(response, what, is_create).await);
        }
        read_body(response).await
    }
}

async fn read_body<T: DeserializeOwned>(response: Response<Body>) -> Result<T, StoreError> {
    let deserialized = if log::log_enabled!(log::Level::Trace) {
        // the body can't be read twice without copying, so buffer it whole when logging it
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(transport)?;
        log::trace!("Got response body: {}", String::from_utf8_lossy(body.as_ref()));
        serde_json::from_slice(body.as_ref()).map_err(decode)?
    } else {
        let body = hyper::body::aggregate(response.into_body())
            .await
            .map_err(transport)?;
        serde_json::from_reader(body.reader()).map_err(decode)?
    };
    Ok(deserialized)
}

fn transport(err: hyper::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

fn decode(err: serde_json::Error) -> StoreError {
    StoreError::Transport(format!("invalid response body: {}", err))
}

async fn status_error(response: Response<Body>, what: &str, is_create: bool) -> StoreError {
    let status = response.status();
    let message = match hyper::body::to_bytes(response.into_body()).await {
        Ok(body) => serde_json::from_slice::<ApiError>(body.as_ref())
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(body.as_ref()).into_owned()),
        Err(e) => e.to_string(),
    };
    log::debug!("Request for {} failed with status: {}, message: {}", what, status, message);
    status_to_error(status, what, message, is_create)
}

fn status_to_error(status: StatusCode, what: &str, message: String, is_create: bool) -> StoreError {
    match status.as_u16() {
        404 => StoreError::NotFound(what.to_owned()),
        409 if is_create => StoreError::AlreadyExists(what.to_owned()),
        409 => StoreError::Conflict(what.to_owned()),
        410 => StoreError::Expired(message),
        code => StoreError::Api { code, message },
    }
}

/// List responses omit `apiVersion` and `kind` on their items
fn with_type(mut value: Value, k8s_type: &K8sType) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.entry("apiVersion")
            .or_insert_with(|| Value::from(k8s_type.api_version));
        obj.entry("kind")
            .or_insert_with(|| Value::from(k8s_type.kind));
    }
    value
}

fn id_of(resource: &Value) -> Result<ObjectIdRef<'_>, StoreError> {
    let name = resource
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            StoreError::Invalid(crate::resource::InvalidResourceError::new(
                "missing metadata.name",
                resource.clone(),
            ))
        })?;
    let namespace = resource
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or("");
    Ok(ObjectIdRef::new(namespace, name))
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn get(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<Option<K8sResource>, StoreError> {
        let req = request::get_request(&self.0.config, k8s_type, id)?;
        match self.execute::<Value>(req, &format!("{} {}", k8s_type, id)).await {
            Ok(value) => Ok(Some(K8sResource::from_value(with_type(value, k8s_type))?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, k8s_type: &K8sType, options: &ListOptions) -> Result<ObjectList, StoreError> {
        let req = request::list_request(&self.0.config, k8s_type, options)?;
        let raw: RawList = self.execute(req, &k8s_type.to_string()).await?;
        let items = raw
            .items
            .into_iter()
            .map(|item| K8sResource::from_value(with_type(item, k8s_type)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ObjectList {
            resource_version: raw.metadata.resource_version.unwrap_or_default(),
            items,
        })
    }

    async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError> {
        let id = id_of(resource)?;
        log::info!("Creating {} '{}' at {}", k8s_type.kind, id, self.0.config.api_server_endpoint);
        let req = request::create_request(&self.0.config, k8s_type, resource)?;
        let created: Value = self.execute(req, &format!("{} {}", k8s_type, id)).await?;
        Ok(K8sResource::from_value(with_type(created, k8s_type))?)
    }

    async fn update(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError> {
        let id = id_of(resource)?;
        let req = request::replace_request(&self.0.config, k8s_type, &id, resource)?;
        let updated: Value = self.execute(req, &format!("{} {}", k8s_type, id)).await?;
        Ok(K8sResource::from_value(with_type(updated, k8s_type))?)
    }

    async fn update_status(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError> {
        let id = id_of(resource)?;
        let req = request::update_status_request(&self.0.config, k8s_type, &id, resource)?;
        let updated: Value = self.execute(req, &format!("{} {} status", k8s_type, id)).await?;
        Ok(K8sResource::from_value(with_type(updated, k8s_type))?)
    }

    async fn delete(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<(), StoreError> {
        log::info!("Deleting {} '{}' at {}", k8s_type.kind, id, self.0.config.api_server_endpoint);
        let req = request::delete_request(&self.0.config, k8s_type, id)?;
        let response = self.get_response(req).await?;
        match response.status().as_u16() {
            // 404 means that something else already deleted it, and 409 that the deletion is
            // already in progress
            200..=299 | 404 | 409 => Ok(()),
            _ => Err(status_error(response, &format!("{} {}", k8s_type, id), false).await),
        }
    }

    async fn watch(
        &self,
        k8s_type: &K8sType,
        options: &ListOptions,
        resource_version: &str,
    ) -> Result<WatchStream, StoreError> {
        let req = request::watch_request(&self.0.config, k8s_type, options, resource_version)?;
        let response = self.get_response(req).await?;
        if !response.status().is_success() {
            return Err(status_error(response, &k8s_type.to_string(), false).await);
        }
        let events = WatchEvents::new(response.into_body());
        let api_version = k8s_type.api_version;
        let kind = k8s_type.kind;
        let stream = futures::stream::unfold(Some(events), move |state| async move {
            let mut events = match state {
                Some(events) => events,
                None => return None,
            };
            loop {
                let event = match events.next().await {
                    Some(Ok(event)) => event,
                    Some(Err(err)) => return Some((Err(err), None)),
                    None => return None,
                };
                let (wrap, value): (fn(K8sResource) -> WatchEvent, Value) = match event {
                    RawWatchEvent::Added(v) => (WatchEvent::Added, v),
                    RawWatchEvent::Modified(v) => (WatchEvent::Modified, v),
                    RawWatchEvent::Deleted(v) => (WatchEvent::Deleted, v),
                    RawWatchEvent::Bookmark(_) => continue,
                    RawWatchEvent::Error(e) if e.code == 410 => {
                        return Some((Err(StoreError::Expired(e.message)), None))
                    }
                    RawWatchEvent::Error(e) => {
                        return Some((
                            Err(StoreError::Api {
                                code: e.code,
                                message: e.message,
                            }),
                            None,
                        ))
                    }
                };
                let mut value = value;
                if let Some(obj) = value.as_object_mut() {
                    obj.entry("apiVersion").or_insert_with(|| Value::from(api_version));
                    obj.entry("kind").or_insert_with(|| Value::from(kind));
                }
                let item = K8sResource::from_value(value)
                    .map(wrap)
                    .map_err(StoreError::from);
                return Some((item, Some(events)));
            }
        });
        Ok(stream.boxed())
    }
}

/// Splits a watch response body into newline delimited json events. Chunk boundaries from the
/// api server don't line up with events.
struct WatchEvents {
    body: Body,
    buffer: BytesMut,
    done: bool,
}

impl WatchEvents {
    fn new(body: Body) -> WatchEvents {
        WatchEvents {
            body,
            buffer: BytesMut::with_capacity(4096),
            done: false,
        }
    }

    fn take_line(&mut self) -> Option<BytesMut> {
        let end = match self.buffer.iter().position(|b| *b == b'\n') {
            Some(newline) => newline + 1,
            None if self.done && !self.buffer.is_empty() => self.buffer.len(),
            None => return None,
        };
        Some(self.buffer.split_to(end))
    }

    async fn next(&mut self) -> Option<Result<RawWatchEvent, StoreError>> {
        loop {
            if let Some(line) = self.take_line() {
                let line = trim_ascii(&line[..]);
                if line.is_empty() {
                    continue;
                }
                return Some(serde_json::from_slice(line).map_err(decode));
            }
            if self.done {
                return None;
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    log::error!("Error reading watch response: {}", e);
                    self.done = true;
                    return Some(Err(transport(e)));
                }
                None => self.done = true,
            }
        }
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
enum RawWatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Bookmark(Value),
    Error(ApiError),
}

/// The `Status` object returned by the api server for failed requests
#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct ApiError {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub code: u16,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Api Error: status: '{}', code: {}, reason: '{}', message: '{}'",
            self.status, self.code, self.reason, self.message
        )
    }
}
impl std::error::Error for ApiError {}

#[derive(Debug, Deserialize, PartialEq, Clone)]
struct ListMeta {
    #[serde(rename = "resourceVersion")]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
struct RawList {
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<Value>,
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use tokio::runtime;

    #[test]
    fn watch_events_survive_split_chunks() {
        let chunks = vec![
            &b"{\"type\":\"ADDED\",\"object\":{\"metadata\":{\"name\":\"a\"}}}\n{\"type\":\"MOD"[..],
            &b"IFIED\",\"object\":{\"metadata\":{\"name\":\"b\"}}}\r\n\n"[..],
            &b"{\"type\":\"DELETED\",\"object\":{\"metadata\":{\"name\":\"c\"}}}"[..],
        ];
        let stream = tokio_stream::iter(chunks).map(|b| Ok::<_, io::Error>(Bytes::from_static(b)));
        let mut events = WatchEvents::new(Body::wrap_stream(stream));
        let runtime = runtime::Builder::new_current_thread().build().unwrap();

        runtime.block_on(async move {
            let mut names = Vec::new();
            while let Some(event) = events.next().await {
                let (kind, value) = match event.expect("failed to parse event") {
                    RawWatchEvent::Added(v) => ("added", v),
                    RawWatchEvent::Modified(v) => ("modified", v),
                    RawWatchEvent::Deleted(v) => ("deleted", v),
                    other => panic!("unexpected event: {:?}", other),
                };
                names.push(format!("{} {}", kind, value["metadata"]["name"].as_str().unwrap()));
            }
            assert_eq!(vec!["added a", "modified b", "deleted c"], names);
        });
    }

    #[test]
    fn raw_watch_events_are_parsed() {
        let bookmark: RawWatchEvent = serde_json::from_str(
            r#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"12"}}}"#,
        )
        .unwrap();
        assert!(matches!(bookmark, RawWatchEvent::Bookmark(_)));

        let expired: RawWatchEvent = serde_json::from_str(
            r#"{"type":"ERROR","object":{"status":"Failure","message":"too old","reason":"Expired","code":410}}"#,
        )
        .unwrap();
        match expired {
            RawWatchEvent::Error(e) => assert_eq!(410, e.code),
            _ => panic!("expected error event"),
        }
    }

    #[test]
    fn status_codes_map_to_store_errors() {
        let status = |code| StatusCode::from_u16(code).unwrap();
        assert!(status_to_error(status(404), "x", String::new(), false).is_not_found());
        assert!(status_to_error(status(409), "x", String::new(), true).is_already_exists());
        assert!(status_to_error(status(409), "x", String::new(), false).is_conflict());
        assert!(status_to_error(status(410), "x", String::new(), false).is_expired());
        assert!(!status_to_error(status(403), "x", String::new(), false).is_transient());
    }
}

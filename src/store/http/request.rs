use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::store::{ListOptions, StoreError};

use http::{header, Method, Request};
use hyper::Body;
use serde_json::Value;
use url::Url;

const IMPERSONATE_USER: &str = "Impersonate-User";
const IMPERSONATE_GROUP: &str = "Impersonate-Group";
const JSON: &str = "application/json";

/// Watches are closed by the api server after this long, and then resumed by the informer
const WATCH_TIMEOUT_SECONDS: u32 = 300;

pub fn get_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, StoreError> {
    let url = make_url(config, k8s_type, id.namespace(), Some(id.name()))?;
    finish(make_req(url, Method::GET, config), Body::empty())
}

pub fn list_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    options: &ListOptions,
) -> Result<Request<Body>, StoreError> {
    let mut url = make_url(config, k8s_type, options.namespace.as_deref(), None)?;
    if let Some(selector) = options.label_selector.as_ref() {
        url.query_pairs_mut().append_pair("labelSelector", selector);
    }
    finish(make_req(url, Method::GET, config), Body::empty())
}

pub fn watch_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    options: &ListOptions,
    resource_version: &str,
) -> Result<Request<Body>, StoreError> {
    let mut url = make_url(config, k8s_type, options.namespace.as_deref(), None)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("watch", "true");
        query.append_pair("allowWatchBookmarks", "true");
        if !resource_version.is_empty() {
            query.append_pair("resourceVersion", resource_version);
        }
        if let Some(selector) = options.label_selector.as_ref() {
            query.append_pair("labelSelector", selector);
        }
        query.append_pair("timeoutSeconds", &WATCH_TIMEOUT_SECONDS.to_string());
    }
    finish(make_req(url, Method::GET, config), Body::empty())
}

pub fn create_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    resource: &Value,
) -> Result<Request<Body>, StoreError> {
    let namespace = resource.pointer("/metadata/namespace").and_then(Value::as_str);
    let url = make_url(config, k8s_type, namespace, None)?;
    finish(make_req(url, Method::POST, config), json_body(resource)?)
}

pub fn replace_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    resource: &Value,
) -> Result<Request<Body>, StoreError> {
    let url = make_url(config, k8s_type, id.namespace(), Some(id.name()))?;
    finish(make_req(url, Method::PUT, config), json_body(resource)?)
}

pub fn update_status_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    resource: &Value,
) -> Result<Request<Body>, StoreError> {
    let mut url = make_url(config, k8s_type, id.namespace(), Some(id.name()))?;
    url.path_segments_mut()
        .map_err(|_| invalid_endpoint(config))?
        .push("status");
    finish(make_req(url, Method::PUT, config), json_body(resource)?)
}

pub fn delete_request(
    config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, StoreError> {
    let url = make_url(config, k8s_type, id.namespace(), Some(id.name()))?;
    finish(make_req(url, Method::DELETE, config), Body::empty())
}

fn json_body(value: &Value) -> Result<Body, StoreError> {
    serde_json::to_vec(value)
        .map(Body::from)
        .map_err(|e| StoreError::Transport(format!("failed to serialize request body: {}", e)))
}

fn finish(builder: http::request::Builder, body: Body) -> Result<Request<Body>, StoreError> {
    builder
        .body(body)
        .map_err(|e| StoreError::Transport(format!("invalid request: {}", e)))
}

fn make_req(url: Url, method: Method, config: &ClientConfig) -> http::request::Builder {
    let mut builder = Request::builder()
        .method(method)
        .uri(url.as_str())
        .header(header::USER_AGENT, config.user_agent.as_str())
        .header(header::ACCEPT, JSON)
        .header(header::CONTENT_TYPE, JSON);
    if let Some(auth) = config.credentials.authorization_header() {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    if let Some(user) = config.impersonate.as_ref() {
        builder = builder.header(IMPERSONATE_USER, user.as_str());
        for group in config.impersonate_groups.iter() {
            builder = builder.header(IMPERSONATE_GROUP, group.as_str());
        }
    }
    builder
}

fn invalid_endpoint(config: &ClientConfig) -> StoreError {
    StoreError::Transport(format!(
        "invalid api server endpoint: '{}'",
        config.api_server_endpoint
    ))
}

pub(crate) fn make_url(
    config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    name: Option<&str>,
) -> Result<Url, StoreError> {
    let mut url =
        Url::parse(config.api_server_endpoint.as_str()).map_err(|_| invalid_endpoint(config))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| invalid_endpoint(config))?;
        segments.pop_if_empty();

        let group = k8s_type.group();
        let prefix = if group.is_empty() { "api" } else { "apis" };
        segments.push(prefix);
        if !group.is_empty() {
            segments.push(group);
        }
        segments.push(k8s_type.version());
        if let Some(ns) = namespace.filter(|_| k8s_type.namespaced) {
            segments.push("namespaces");
            segments.push(ns);
        }
        segments.push(k8s_type.plural_kind);

        if let Some(n) = name {
            segments.push(n);
        }
    }
    Ok(url)
}

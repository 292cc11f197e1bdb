//! Labels every pod the virtual cluster creates on the host, and serves a tiny interceptor
//! that answers with the plugin's version.
use vcluster_sdk::prelude::*;
use vcluster_sdk::serde_json::json;

use async_trait::async_trait;
use hyper::{Body, Request, Response};

struct VersionInterceptor;

#[async_trait]
impl Interceptor for VersionInterceptor {
    fn name(&self) -> &str {
        "version"
    }

    async fn handle(&self, _request: Request<Body>) -> Result<Response<Body>, Error> {
        let body = json!({ "plugin": "pod-hooks", "version": env!("CARGO_PKG_VERSION") });
        let response = Response::builder()
            .status(200)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))?;
        Ok(response)
    }
}

fn main() {
    env_logger::init();
    run_plugin(PluginOptions::new("pod-hooks"), |_ctx| {
        vec![
            Registration::hook(PodLabelHook),
            Registration::interceptor(VersionInterceptor),
        ]
    })
}

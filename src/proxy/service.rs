// Request forwarding: method, path, and headers pass through unchanged,
// only Host is rewritten; the response streams back verbatim.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

use super::Backend;

#[derive(Clone)]
pub struct ProxyService {
    client: Client<hyper_util::client::legacy::connect::HttpConnector, Incoming>,
}

impl ProxyService {
    pub fn new() -> Self {
        let mut connector = hyper_util::client::legacy::connect::HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(10)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build(connector);

        Self { client }
    }

    /// Forward a request to the backend.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        backend: &Backend,
    ) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let backend_uri = format!(
            "http://{}{}",
            backend.addr(),
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        debug!(backend_uri = %backend_uri, "Forwarding to backend");

        *req.uri_mut() = backend_uri.parse()?;

        let headers = req.headers_mut();
        headers.insert(
            "X-Forwarded-Proto",
            hyper::header::HeaderValue::from_static("http"),
        );
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert("X-Forwarded-Host", host);
        }
        headers.insert(
            hyper::header::HOST,
            hyper::header::HeaderValue::from_str(&backend.addr())?,
        );

        let response = self.client.request(req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Default for ProxyService {
    fn default() -> Self {
        Self::new()
    }
}

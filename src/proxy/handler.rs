// Proxy connection handler: parses requests, resolves the Host header to a
// backend, and forwards.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::db::DbPool;

use super::{Backend, ProxyService};

/// How one Host header resolves.
enum Route {
    ControlPlane,
    Deployment(Backend),
    Unknown,
}

#[derive(Clone)]
pub struct ProxyHandler {
    db: DbPool,
    config: Arc<Config>,
    proxy_service: ProxyService,
}

impl ProxyHandler {
    pub fn new(db: DbPool, config: Arc<Config>) -> Self {
        Self {
            db,
            config,
            proxy_service: ProxyService::new(),
        }
    }

    /// Handle a single TCP connection
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let io = TokioIo::new(stream);
        let handler = self.clone();

        http1::Builder::new()
            .serve_connection(
                io,
                service_fn(move |req| {
                    let handler = handler.clone();
                    async move { handler.handle_request(req, remote_addr).await }
                }),
            )
            .with_upgrades()
            .await?;

        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let host = self.extract_host(&req);

        debug!(
            method = %req.method(),
            uri = %req.uri(),
            host = ?host,
            remote = %remote_addr,
            "Incoming proxy request"
        );

        let route = match &host {
            Some(h) => match self.resolve(h).await {
                Ok(route) => route,
                Err(e) => {
                    error!(host = %h, error = %e, "Route lookup failed");
                    return Ok(self.error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal error",
                    ));
                }
            },
            None => Route::Unknown,
        };

        let backend = match route {
            Route::ControlPlane => Backend::local(self.config.server.api_port),
            Route::Deployment(backend) => backend,
            Route::Unknown => {
                warn!(host = ?host, "No application found for host");
                return Ok(self.error_response(
                    StatusCode::NOT_FOUND,
                    &format!(
                        "No application found for host: {}",
                        host.as_deref().unwrap_or("unknown")
                    ),
                ));
            }
        };

        match self.proxy_service.forward(req, &backend).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!(error = %e, backend = %backend.addr(), "Backend request failed");
                Ok(self.error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable",
                ))
            }
        }
    }

    /// Resolve a hostname. The control plane answers on its own hostname and
    /// the loopback aliases; everything else goes through one deployment
    /// lookup, gated on base-domain membership.
    async fn resolve(&self, host: &str) -> anyhow::Result<Route> {
        let host = host.split(':').next().unwrap_or(host).to_lowercase();

        if host == self.config.server.hostname.to_lowercase()
            || host == "localhost"
            || host == "127.0.0.1"
        {
            return Ok(Route::ControlPlane);
        }

        if !self.config.proxy.subdomains_enabled() {
            return Ok(Route::Unknown);
        }
        let base = self.config.proxy.base_domain.to_lowercase();
        if !(host == base || host.ends_with(&format!(".{}", base))) {
            return Ok(Route::Unknown);
        }

        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT port FROM deployments WHERE hostname = ? AND status = 'running'",
        )
        .bind(&host)
        .fetch_optional(&self.db)
        .await?;

        Ok(match row.and_then(|(p,)| u16::try_from(p).ok()) {
            Some(port) => Route::Deployment(Backend::local(port)),
            None => Route::Unknown,
        })
    }

    /// Extract the host from the request (Host header or URI authority)
    fn extract_host<T>(&self, req: &Request<T>) -> Option<String> {
        if let Some(host) = req.headers().get(hyper::header::HOST) {
            if let Ok(host_str) = host.to_str() {
                return Some(host_str.to_string());
            }
        }
        req.uri().host().map(|h| h.to_string())
    }

    fn error_response(
        &self,
        status: StatusCode,
        message: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let body = format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <title>{} - Slipway</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Oxygen, Ubuntu, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #f5f5f5;
        }}
        .error {{
            text-align: center;
            padding: 40px;
            background: white;
            border-radius: 8px;
            box-shadow: 0 2px 10px rgba(0,0,0,0.1);
        }}
        h1 {{ color: #e74c3c; margin-bottom: 10px; }}
        p {{ color: #666; margin: 0; }}
        .code {{ font-size: 48px; color: #333; margin-bottom: 20px; }}
    </style>
</head>
<body>
    <div class="error">
        <div class="code">{}</div>
        <h1>{}</h1>
        <p>Powered by Slipway</p>
    </div>
</body>
</html>"#,
            status.as_u16(),
            status.as_u16(),
            message
        );

        Response::builder()
            .status(status)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
            .unwrap()
    }
}

// Reverse proxy: routes inbound requests to deployment containers by
// Host header, with a single database lookup per request.

mod handler;
mod service;

use crate::config::Config;
use crate::db::DbPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub use handler::ProxyHandler;
pub use service::ProxyService;

/// Resolved forwarding target for one request.
#[derive(Debug, Clone)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn local(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Long-lived listener accepting proxied connections.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    db: DbPool,
    config: Arc<Config>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, db: DbPool, config: Arc<Config>) -> Self {
        Self {
            bind_addr,
            db,
            config,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!("Proxy server listening on http://{}", self.bind_addr);

        let handler = ProxyHandler::new(self.db, self.config);

        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle_connection(stream, remote_addr).await {
                            error!(error = %e, "Error handling proxy connection");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                }
            }
        }
    }
}

//! Host port allocation for deployments.
//!
//! A port is claimed while its deployment is in a busy state (pending,
//! cloning, building, running). Allocation scans the configured range in
//! ascending order, skips claimed ports and the engine's own API port, and
//! confirms each candidate with a real bind probe so ports held by processes
//! outside the engine are skipped too.

use crate::config::Config;
use crate::db::DbPool;
use std::collections::HashSet;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
    #[error("port {0} is reserved for the control plane")]
    Reserved(u16),
    #[error("port {0} is out of range")]
    OutOfRange(u16),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Ports currently claimed by deployments in the database.
async fn claimed_ports(db: &DbPool) -> Result<HashSet<u16>, sqlx::Error> {
    let rows: Vec<(Option<i64>,)> = sqlx::query_as(
        "SELECT port FROM deployments WHERE status IN ('pending', 'cloning', 'building', 'running')",
    )
    .fetch_all(db)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(p,)| p)
        .filter_map(|p| u16::try_from(p).ok())
        .collect())
}

async fn bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// Find the lowest free port in the configured range.
pub async fn find_available_port(db: &DbPool, config: &Config) -> Result<u16, PortError> {
    let claimed = claimed_ports(db).await?;
    let start = config.ports.range_start;
    let end = config.ports.range_end;

    for port in start..=end {
        if port == config.server.api_port {
            continue;
        }
        if claimed.contains(&port) {
            continue;
        }
        if !bindable(port).await {
            debug!(port, "Port bound by an outside process, skipping");
            continue;
        }
        return Ok(port);
    }

    Err(PortError::Exhausted { start, end })
}

/// Validate a user-chosen port. Only the reserved control-plane port and
/// out-of-range values are rejected; collisions with other deployments are
/// accepted here and surface at container start instead.
pub fn validate_port(config: &Config, port: u16) -> Result<(), PortError> {
    if port == 0 {
        return Err(PortError::OutOfRange(port));
    }
    if port == config.server.api_port {
        return Err(PortError::Reserved(port));
    }
    Ok(())
}

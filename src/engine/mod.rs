mod pipeline;

pub use pipeline::*;

use crate::config::Config;
use crate::db::{DbPool, DeploymentStatus, TriggerKind};
use crate::runtime::{ContainerRuntime, ContainerState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type DeploymentJob = (String, TriggerKind); // (deployment_id, trigger)

/// Consumes deployment jobs and runs the pipeline for each as a detached
/// task, so one slow build never holds up the queue.
pub struct DeploymentEngine {
    db: DbPool,
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<Config>,
    rx: mpsc::Receiver<DeploymentJob>,
}

impl DeploymentEngine {
    pub fn new(
        db: DbPool,
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<Config>,
        rx: mpsc::Receiver<DeploymentJob>,
    ) -> Self {
        Self {
            db,
            runtime,
            config,
            rx,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Deployment engine started");

        while let Some((deployment_id, trigger)) = self.rx.recv().await {
            tracing::info!(%deployment_id, %trigger, "Processing deployment");

            let db = self.db.clone();
            let runtime = self.runtime.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = run_deployment(&db, runtime, &config, &deployment_id, trigger).await
                {
                    tracing::error!(%deployment_id, error = %e, "Deployment failed");
                }
            });
        }
    }
}

/// Reset the deployment and hand it to the engine. Returns immediately; the
/// pipeline runs in the background. Status reset and log clearing happen
/// before the acknowledgement so the caller observes a fresh run.
pub async fn trigger_deploy(
    db: &DbPool,
    tx: &mpsc::Sender<DeploymentJob>,
    deployment_id: &str,
    trigger: TriggerKind,
) -> Result<()> {
    sqlx::query("UPDATE deployments SET status = 'pending', updated_at = datetime('now') WHERE id = ?")
        .bind(deployment_id)
        .execute(db)
        .await?;
    sqlx::query("DELETE FROM deployment_logs WHERE deployment_id = ?")
        .bind(deployment_id)
        .execute(db)
        .await?;

    tx.send((deployment_id.to_string(), trigger))
        .await
        .map_err(|_| anyhow::anyhow!("Deployment engine is not running"))?;
    Ok(())
}

pub async fn update_deployment_status(
    db: &DbPool,
    deployment_id: &str,
    status: DeploymentStatus,
) -> Result<()> {
    sqlx::query("UPDATE deployments SET status = ?, updated_at = datetime('now') WHERE id = ?")
        .bind(status.as_str())
        .bind(deployment_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Append one log line. Lines append strictly in execution order.
pub async fn add_deployment_log(
    db: &DbPool,
    deployment_id: &str,
    level: &str,
    message: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO deployment_logs (deployment_id, timestamp, level, message) VALUES (?, ?, ?, ?)",
    )
    .bind(deployment_id)
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(level)
    .bind(message)
    .execute(db)
    .await?;
    Ok(())
}

/// Reconcile a stored running/stopped status against the actual container
/// state. The corrected status is persisted and returned. Mid-pipeline
/// states are left alone; the pipeline owns them.
pub async fn reconcile_status(
    db: &DbPool,
    runtime: &Arc<dyn ContainerRuntime>,
    deployment_id: &str,
    stored: DeploymentStatus,
    container_id: Option<&str>,
) -> Result<DeploymentStatus> {
    if !matches!(stored, DeploymentStatus::Running | DeploymentStatus::Stopped) {
        return Ok(stored);
    }
    let Some(container_id) = container_id else {
        return Ok(stored);
    };

    let observed = match runtime.inspect(container_id).await? {
        ContainerState::Running => DeploymentStatus::Running,
        ContainerState::Stopped | ContainerState::NotFound => DeploymentStatus::Stopped,
    };

    if observed != stored {
        tracing::info!(
            %deployment_id,
            stored = %stored,
            observed = %observed,
            "Reconciling deployment status with container state"
        );
        update_deployment_status(db, deployment_id, observed).await?;
    }
    Ok(observed)
}

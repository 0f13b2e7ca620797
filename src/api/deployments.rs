//! Deployment CRUD and lifecycle endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{Build, Deployment, DeploymentLog, DeploymentStatus, EnvVar, TriggerKind};
use crate::engine::{self, queue_rollback, reconcile_status, trigger_deploy};
use crate::ports;
use crate::AppState;

use super::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CreateDeployment {
    pub name: String,
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub root_directory: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub output_directory: Option<String>,
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub restart_policy: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub deployment_id: String,
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub build_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub trigger: Option<TriggerKind>,
}

#[derive(Debug, Serialize)]
pub struct LogSnapshot {
    pub status: String,
    pub build_logs: Vec<DeploymentLog>,
    pub container_logs: Vec<crate::runtime::LogLine>,
}

#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub deployment_id: String,
    pub build_id: String,
    pub status: &'static str,
}

async fn fetch_deployment(state: &AppState, id: &str) -> ApiResult<Deployment> {
    let deployment: Option<Deployment> = sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?;
    deployment.ok_or_else(|| ApiError::not_found("Deployment not found"))
}

/// Listed rows go through the same status reconciliation as single reads, so
/// the overview never shows a container as running when it is gone.
pub async fn list_deployments(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Deployment>>> {
    let mut deployments: Vec<Deployment> =
        sqlx::query_as("SELECT * FROM deployments ORDER BY created_at DESC")
            .fetch_all(&state.db)
            .await?;
    for deployment in &mut deployments {
        let reconciled = reconcile_status(
            &state.db,
            &state.runtime,
            &deployment.id,
            deployment.status_enum(),
            deployment.container_id.as_deref(),
        )
        .await?;
        deployment.status = reconciled.as_str().to_string();
    }
    Ok(Json(deployments))
}

/// The stored status is reconciled against the actual container state before
/// being returned, so a container that died outside the engine's view shows
/// up as stopped here.
pub async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deployment>> {
    let mut deployment = fetch_deployment(&state, &id).await?;

    let reconciled = reconcile_status(
        &state.db,
        &state.runtime,
        &id,
        deployment.status_enum(),
        deployment.container_id.as_deref(),
    )
    .await?;
    deployment.status = reconciled.as_str().to_string();

    Ok(Json(deployment))
}

pub async fn create_deployment(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDeployment>,
) -> ApiResult<(StatusCode, Json<Deployment>)> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::validation("Name must not be empty"));
    }
    if payload.repo_url.trim().is_empty() {
        return Err(ApiError::validation("Repository URL must not be empty"));
    }

    let mut keys = HashSet::new();
    for var in &payload.env_vars {
        if !keys.insert(&var.key) {
            return Err(ApiError::validation(format!(
                "Duplicate environment variable key: {}",
                var.key
            )));
        }
    }

    let port = match payload.port {
        Some(port) => {
            ports::validate_port(&state.config, port)?;
            port
        }
        None => ports::find_available_port(&state.db, &state.config).await?,
    };

    let id = Uuid::new_v4().to_string();
    let env_vars = serde_json::to_string(&payload.env_vars)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    sqlx::query(
        "INSERT INTO deployments
            (id, name, repo_url, branch, root_directory, framework,
             install_command, build_command, start_command, output_directory,
             env_vars, port, restart_policy)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(payload.name.trim())
    .bind(payload.repo_url.trim())
    .bind(payload.branch.as_deref().unwrap_or("main"))
    .bind(&payload.root_directory)
    .bind(&payload.framework)
    .bind(&payload.install_command)
    .bind(&payload.build_command)
    .bind(&payload.start_command)
    .bind(&payload.output_directory)
    .bind(&env_vars)
    .bind(port as i64)
    .bind(payload.restart_policy.as_deref().unwrap_or("unless-stopped"))
    .execute(&state.db)
    .await?;

    let deployment = fetch_deployment(&state, &id).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

/// Kick off a pipeline run. Returns 202 immediately; progress is visible
/// through the log endpoints. The body may name a trigger kind; it defaults
/// to manual.
pub async fn deploy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Option<Json<DeployRequest>>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let deployment = fetch_deployment(&state, &id).await?;
    let trigger = payload
        .and_then(|Json(body)| body.trigger)
        .unwrap_or(TriggerKind::Manual);

    trigger_deploy(&state.db, &state.deploy_tx, &deployment.id, trigger).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            deployment_id: deployment.id,
            status: "pending",
        }),
    ))
}

pub async fn start_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TriggerResponse>> {
    let deployment = fetch_deployment(&state, &id).await?;
    let container_id = deployment
        .container_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("Deployment has no container to start"))?;

    state.runtime.start(container_id).await?;
    engine::update_deployment_status(&state.db, &id, DeploymentStatus::Running).await?;

    Ok(Json(TriggerResponse {
        deployment_id: id,
        status: "running",
    }))
}

pub async fn stop_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TriggerResponse>> {
    let deployment = fetch_deployment(&state, &id).await?;
    let container_id = deployment
        .container_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("Deployment has no container to stop"))?;

    state.runtime.stop(container_id).await?;
    engine::update_deployment_status(&state.db, &id, DeploymentStatus::Stopped).await?;

    Ok(Json(TriggerResponse {
        deployment_id: id,
        status: "stopped",
    }))
}

/// Remove the deployment and its container and image. Logs, builds, and
/// webhooks go with the row via cascading deletes.
pub async fn delete_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let deployment = fetch_deployment(&state, &id).await?;

    if let Some(container_id) = &deployment.container_id {
        state.runtime.stop(container_id).await?;
        state.runtime.remove(container_id).await?;
    }
    state.runtime.remove_image(&deployment.image_tag()).await?;

    sqlx::query("DELETE FROM deployments WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_builds(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Build>>> {
    fetch_deployment(&state, &id).await?;

    let builds: Vec<Build> = sqlx::query_as(
        "SELECT * FROM builds WHERE deployment_id = ? ORDER BY build_number DESC",
    )
    .bind(&id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(builds))
}

/// Roll back to an earlier ready build. The pipeline re-clones and re-builds
/// the target commit as build number max+1.
pub async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<RollbackRequest>,
) -> ApiResult<(StatusCode, Json<RollbackResponse>)> {
    fetch_deployment(&state, &id).await?;

    let target: Option<Build> =
        sqlx::query_as("SELECT * FROM builds WHERE id = ? AND deployment_id = ?")
            .bind(&payload.build_id)
            .bind(&id)
            .fetch_optional(&state.db)
            .await?;
    let target = target.ok_or_else(|| ApiError::not_found("Build not found"))?;
    if !target.is_ready() {
        return Err(ApiError::bad_request(
            "Cannot roll back to a build that is not ready",
        ));
    }

    let new_build_id = queue_rollback(&state.db, &state.deploy_tx, &id, &target.id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RollbackResponse {
            deployment_id: id,
            build_id: new_build_id,
            status: "pending",
        }),
    ))
}

/// Point-in-time snapshot: build logs in execution order, recent container
/// output when one is running, and the current status.
pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<LogSnapshot>> {
    let deployment = fetch_deployment(&state, &id).await?;

    let build_logs: Vec<DeploymentLog> = sqlx::query_as(
        "SELECT * FROM deployment_logs WHERE deployment_id = ? ORDER BY id ASC",
    )
    .bind(&id)
    .fetch_all(&state.db)
    .await?;

    let container_logs = match (&deployment.container_id, deployment.status_enum()) {
        (Some(container_id), DeploymentStatus::Running) => {
            state.runtime.logs(container_id).await.unwrap_or_default()
        }
        _ => Vec::new(),
    };

    Ok(Json(LogSnapshot {
        status: deployment.status,
        build_logs,
        container_logs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use crate::engine::DeploymentJob;
    use crate::runtime::NoopRuntime;
    use tokio::sync::mpsc;

    async fn test_state() -> (Arc<AppState>, mpsc::Receiver<DeploymentJob>) {
        let pool = db::init_test().await;
        let (tx, rx) = mpsc::channel(8);
        let state = Arc::new(AppState::new(
            Arc::new(Config::default()),
            pool,
            tx,
            Arc::new(NoopRuntime),
        ));
        (state, rx)
    }

    async fn insert_deployment(state: &AppState, id: &str) {
        sqlx::query(
            "INSERT INTO deployments (id, name, repo_url, port) VALUES (?, ?, 'https://github.com/acme/app', 3000)",
        )
        .bind(id)
        .bind(format!("app-{id}"))
        .execute(&state.db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn listed_statuses_are_reconciled() {
        let (state, _rx) = test_state().await;
        sqlx::query(
            "INSERT INTO deployments (id, name, repo_url, port, status, container_id)
             VALUES ('d1', 'app', 'https://github.com/acme/app', 3000, 'running', 'c1')",
        )
        .execute(&state.db)
        .await
        .unwrap();

        // NoopRuntime reports the container gone, so the listed row flips to
        // stopped and the correction is persisted.
        let Json(deployments) = list_deployments(State(state.clone())).await.unwrap();
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].status, "stopped");

        let (stored,): (String,) = sqlx::query_as("SELECT status FROM deployments WHERE id = 'd1'")
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(stored, "stopped");
    }

    #[tokio::test]
    async fn deploy_defaults_to_a_manual_trigger() {
        let (state, mut rx) = test_state().await;
        insert_deployment(&state, "d1").await;

        let (status, _) = deploy(State(state), Path("d1".to_string()), None)
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let (id, trigger) = rx.recv().await.unwrap();
        assert_eq!(id, "d1");
        assert_eq!(trigger, TriggerKind::Manual);
    }

    #[tokio::test]
    async fn deploy_accepts_an_explicit_trigger_kind() {
        let (state, mut rx) = test_state().await;
        insert_deployment(&state, "d2").await;

        let body = DeployRequest {
            trigger: Some(TriggerKind::Webhook),
        };
        let (status, _) = deploy(State(state), Path("d2".to_string()), Some(Json(body)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let (id, trigger) = rx.recv().await.unwrap();
        assert_eq!(id, "d2");
        assert_eq!(trigger, TriggerKind::Webhook);
    }
}

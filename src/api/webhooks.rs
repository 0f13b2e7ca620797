//! Webhook management and the public ingress endpoint.
//!
//! Each deployment owns at most one webhook. The secret doubles as the
//! unguessable URL token and the HMAC-SHA256 signing key: knowing the URL is
//! knowing the key, which is exactly the GitHub webhook model.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::db::{DbPool, DeliveryOutcome, Deployment, TriggerKind, Webhook, WebhookLog};
use crate::engine::trigger_deploy;
use crate::AppState;

use super::error::{ApiError, ApiResult};

type HmacSha256 = Hmac<Sha256>;

const SECRET_BYTES: usize = 32;

#[derive(Debug, Serialize)]
pub struct WebhookCreated {
    pub id: String,
    pub deployment_id: String,
    /// Shown in full only at creation and rotation time.
    pub secret: String,
    pub url_path: String,
    pub enabled: bool,
    pub events: Vec<String>,
}

fn generate_secret() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; SECRET_BYTES] = rng.random();
    hex::encode(bytes)
}

fn created_response(webhook: &Webhook, secret: String) -> WebhookCreated {
    WebhookCreated {
        id: webhook.id.clone(),
        deployment_id: webhook.deployment_id.clone(),
        url_path: format!("/hooks/{}", secret),
        secret,
        enabled: webhook.enabled != 0,
        events: webhook.event_list(),
    }
}

async fn fetch_webhook(db: &DbPool, deployment_id: &str) -> ApiResult<Webhook> {
    let webhook: Option<Webhook> =
        sqlx::query_as("SELECT * FROM webhooks WHERE deployment_id = ?")
            .bind(deployment_id)
            .fetch_optional(db)
            .await?;
    webhook.ok_or_else(|| ApiError::not_found("Webhook not found"))
}

pub async fn create_webhook(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<(StatusCode, Json<WebhookCreated>)> {
    let exists: Option<(String,)> =
        sqlx::query_as("SELECT id FROM webhooks WHERE deployment_id = ?")
            .bind(&deployment_id)
            .fetch_optional(&state.db)
            .await?;
    if exists.is_some() {
        return Err(ApiError::conflict("Deployment already has a webhook"));
    }

    let id = Uuid::new_v4().to_string();
    let secret = generate_secret();
    sqlx::query("INSERT INTO webhooks (id, deployment_id, secret) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(&deployment_id)
        .bind(&secret)
        .execute(&state.db)
        .await?;

    let webhook = fetch_webhook(&state.db, &deployment_id).await?;
    Ok((StatusCode::CREATED, Json(created_response(&webhook, secret))))
}

/// Replace the secret. The old hook URL stops working immediately.
pub async fn rotate_webhook(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<Json<WebhookCreated>> {
    let webhook = fetch_webhook(&state.db, &deployment_id).await?;

    let secret = generate_secret();
    sqlx::query("UPDATE webhooks SET secret = ? WHERE id = ?")
        .bind(&secret)
        .bind(&webhook.id)
        .execute(&state.db)
        .await?;

    let webhook = fetch_webhook(&state.db, &deployment_id).await?;
    Ok(Json(created_response(&webhook, secret)))
}

/// Webhook metadata without the secret.
pub async fn get_webhook(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<Json<Webhook>> {
    let webhook = fetch_webhook(&state.db, &deployment_id).await?;
    Ok(Json(webhook))
}

pub async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<StatusCode> {
    let webhook = fetch_webhook(&state.db, &deployment_id).await?;
    sqlx::query("DELETE FROM webhooks WHERE id = ?")
        .bind(&webhook.id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn webhook_logs(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<Json<Vec<WebhookLog>>> {
    let webhook = fetch_webhook(&state.db, &deployment_id).await?;
    let logs: Vec<WebhookLog> = sqlx::query_as(
        "SELECT * FROM webhook_logs WHERE webhook_id = ? ORDER BY id DESC LIMIT 100",
    )
    .bind(&webhook.id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(logs))
}

/// Verify an X-Hub-Signature-256 style header against the raw body.
/// Comparison happens in constant time inside the MAC verification.
fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Branch name from a push payload's ref field ("refs/heads/<branch>").
fn extract_branch(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("ref")
        .and_then(|r| r.as_str())
        .and_then(|r| r.strip_prefix("refs/heads/"))
        .map(String::from)
}

async fn log_delivery(
    db: &DbPool,
    webhook: &Webhook,
    event: &str,
    payload: &[u8],
    outcome: DeliveryOutcome,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO webhook_logs (webhook_id, deployment_id, event, payload, outcome, message)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&webhook.id)
    .bind(&webhook.deployment_id)
    .bind(event)
    .bind(String::from_utf8_lossy(payload).into_owned())
    .bind(outcome.as_str())
    .bind(message)
    .execute(db)
    .await?;
    Ok(())
}

/// Public ingress: `POST /hooks/:secret`. The raw body is read before any
/// parsing because signature verification needs the exact bytes.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(secret): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let webhook: Option<Webhook> = sqlx::query_as("SELECT * FROM webhooks WHERE secret = ?")
        .bind(&secret)
        .fetch_optional(&state.db)
        .await?;
    let webhook = webhook.ok_or_else(|| ApiError::not_found("Unknown webhook"))?;

    let event = headers
        .get("X-Webhook-Event")
        .or_else(|| headers.get("X-GitHub-Event"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("push")
        .to_string();

    if webhook.enabled == 0 {
        log_delivery(&state.db, &webhook, &event, &body, DeliveryOutcome::Failed, "Webhook disabled")
            .await?;
        return Err(ApiError::forbidden("Webhook is disabled"));
    }

    // Signed deliveries must verify; unsigned ones pass through
    if let Some(signature) = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
    {
        if !verify_signature(&webhook.secret, &body, signature) {
            log_delivery(&state.db, &webhook, &event, &body, DeliveryOutcome::Failed, "Bad signature").await?;
            return Err(ApiError::unauthorized("Signature verification failed"));
        }
    }

    if event == "ping" {
        log_delivery(&state.db, &webhook, &event, &body, DeliveryOutcome::Success, "Ping acknowledged").await?;
        return Ok(Json(json!({ "status": "pong" })));
    }

    if !webhook.handles_event(&event) {
        log_delivery(&state.db, &webhook, &event, &body, DeliveryOutcome::Skipped, "Event not configured")
            .await?;
        return Ok(Json(json!({ "status": "skipped", "reason": "event not configured" })));
    }

    let deployment: Option<Deployment> = sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
        .bind(&webhook.deployment_id)
        .fetch_optional(&state.db)
        .await?;
    let deployment = deployment.ok_or_else(|| ApiError::not_found("Deployment not found"))?;

    if event == "push" {
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap_or(json!({}));
        if let Some(branch) = extract_branch(&payload) {
            if branch != deployment.branch {
                let message = format!(
                    "Push to {} ignored, deployment tracks {}",
                    branch, deployment.branch
                );
                log_delivery(&state.db, &webhook, &event, &body, DeliveryOutcome::Skipped, &message).await?;
                return Ok(Json(json!({ "status": "skipped", "reason": "branch mismatch" })));
            }
        }
    }

    sqlx::query(
        "UPDATE webhooks SET trigger_count = trigger_count + 1, last_triggered_at = datetime('now')
         WHERE id = ?",
    )
    .bind(&webhook.id)
    .execute(&state.db)
    .await?;
    log_delivery(&state.db, &webhook, &event, &body, DeliveryOutcome::Success, "Deployment triggered").await?;

    info!(deployment_id = %deployment.id, event = %event, "Webhook triggered deployment");
    trigger_deploy(&state.db, &state.deploy_tx, &deployment.id, TriggerKind::Webhook).await?;

    Ok(Json(json!({ "status": "triggered", "deployment_id": deployment.id })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, &header));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign("topsecret", body);
        assert!(!verify_signature("othersecret", body, &header));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let header = sign("topsecret", br#"{"ref":"refs/heads/main"}"#);
        assert!(!verify_signature(
            "topsecret",
            br#"{"ref":"refs/heads/evil"}"#,
            &header
        ));
    }

    #[test]
    fn malformed_signature_headers_fail() {
        let body = b"{}";
        assert!(!verify_signature("s", body, "sha1=abcd"));
        assert!(!verify_signature("s", body, "sha256=nothex"));
        assert!(!verify_signature("s", body, ""));
    }

    #[test]
    fn branch_comes_from_the_ref_field() {
        let payload = json!({ "ref": "refs/heads/feature/login" });
        assert_eq!(extract_branch(&payload).as_deref(), Some("feature/login"));

        let tag = json!({ "ref": "refs/tags/v1.0" });
        assert_eq!(extract_branch(&tag), None);

        assert_eq!(extract_branch(&json!({})), None);
    }

    #[test]
    fn secrets_are_long_and_distinct() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), SECRET_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn disabled_webhook_rejects_and_audits_the_delivery() {
        let pool = crate::db::init_test().await;
        sqlx::query(
            "INSERT INTO deployments (id, name, repo_url, port) VALUES ('d1', 'app', 'https://github.com/acme/app', 3000)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO webhooks (id, deployment_id, secret, enabled) VALUES ('w1', 'd1', 'sekret', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let state = Arc::new(AppState::new(
            Arc::new(crate::config::Config::default()),
            pool.clone(),
            tx,
            Arc::new(crate::runtime::NoopRuntime),
        ));

        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Event", "push".parse().unwrap());
        let result = receive_webhook(
            State(state),
            Path("sekret".to_string()),
            headers,
            Bytes::from_static(br#"{"ref":"refs/heads/main"}"#),
        )
        .await;
        assert!(result.is_err());

        let (event, outcome, message): (String, String, Option<String>) = sqlx::query_as(
            "SELECT event, outcome, message FROM webhook_logs WHERE webhook_id = 'w1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(event, "push");
        assert_eq!(outcome, "failed");
        assert_eq!(message.as_deref(), Some("Webhook disabled"));
    }
}

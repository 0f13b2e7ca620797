mod deployments;
pub mod error;
mod webhooks;
mod ws;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Deployments
        .route("/deployments", get(deployments::list_deployments))
        .route("/deployments", post(deployments::create_deployment))
        .route("/deployments/:id", get(deployments::get_deployment))
        .route("/deployments/:id", delete(deployments::delete_deployment))
        .route("/deployments/:id/deploy", post(deployments::deploy))
        .route("/deployments/:id/start", post(deployments::start_deployment))
        .route("/deployments/:id/stop", post(deployments::stop_deployment))
        // Build history
        .route("/deployments/:id/builds", get(deployments::list_builds))
        .route("/deployments/:id/rollback", post(deployments::rollback))
        // Logs
        .route("/deployments/:id/logs", get(deployments::get_logs))
        .route("/deployments/:id/logs/ws", get(ws::deployment_logs_ws))
        // Webhook management
        .route("/deployments/:id/webhook", post(webhooks::create_webhook))
        .route("/deployments/:id/webhook", get(webhooks::get_webhook))
        .route("/deployments/:id/webhook", delete(webhooks::delete_webhook))
        .route("/deployments/:id/webhook/rotate", post(webhooks::rotate_webhook))
        .route("/deployments/:id/webhook/logs", get(webhooks::webhook_logs));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        // Public ingress, addressed by secret token
        .route("/hooks/:secret", post(webhooks::receive_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

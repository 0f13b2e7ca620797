//! Webhook models. Each deployment owns at most one webhook; its secret is
//! both the unguessable URL token and the HMAC-SHA256 signing key.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Webhook {
    pub id: String,
    pub deployment_id: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub enabled: i64,
    /// JSON array of event names
    pub events: String,
    pub trigger_count: i64,
    pub last_triggered_at: Option<String>,
    pub created_at: String,
}

impl Webhook {
    pub fn event_list(&self) -> Vec<String> {
        serde_json::from_str(&self.events).unwrap_or_else(|_| vec!["push".to_string()])
    }

    pub fn handles_event(&self, event: &str) -> bool {
        self.event_list().iter().any(|e| e == event)
    }
}

/// Outcome of a single webhook delivery, for the audit trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    Skipped,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookLog {
    pub id: i64,
    pub webhook_id: String,
    pub deployment_id: String,
    pub event: String,
    pub payload: Option<String>,
    pub outcome: String,
    pub message: Option<String>,
    pub created_at: String,
}

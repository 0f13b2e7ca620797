//! Build history models. Builds are append-only: rows are created when a
//! pipeline run reaches clone-success (or pre-inserted queued by rollback)
//! and finalized exactly once as ready or failed. Only the is_current flag
//! is ever flipped afterwards.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Building,
    Ready,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What caused a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Rollback,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for TriggerKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "webhook" => Self::Webhook,
            "rollback" => Self::Rollback,
            _ => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Build {
    pub id: String,
    pub deployment_id: String,
    pub build_number: i64,
    pub status: String,
    pub branch: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub trigger_kind: String,
    pub is_current: i64,
    pub duration_ms: Option<i64>,
    pub container_id: Option<String>,
    pub image_id: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

impl Build {
    pub fn is_ready(&self) -> bool {
        self.status == BuildStatus::Ready.as_str()
    }
}

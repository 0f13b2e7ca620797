//! Deployment models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle states of a deployment. Only the pipeline moves a deployment
/// through pending → cloning → building → running; start/stop toggle
/// running ↔ stopped; anything active drops to failed on error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Cloning,
    Building,
    Running,
    Failed,
    Stopped,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Building => "building",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// States whose port claim must be respected by the allocator.
    pub fn holds_port(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Pending | Self::Building | Self::Cloning
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for DeploymentStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "cloning" => Self::Cloning,
            "building" => Self::Building,
            "running" => Self::Running,
            "failed" => Self::Failed,
            "stopped" => Self::Stopped,
            _ => Self::Pending,
        }
    }
}

/// One environment variable entry. Stored on the deployment row as an
/// ordered JSON array with unique keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub root_directory: Option<String>,
    /// Detected or pinned framework id. None (or "unknown") means the
    /// detector runs on the next pipeline pass.
    pub framework: Option<String>,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub output_directory: Option<String>,
    /// JSON array of EnvVar objects
    pub env_vars: String,
    pub port: i64,
    pub restart_policy: String,
    pub status: String,
    pub container_id: Option<String>,
    pub image_id: Option<String>,
    pub hostname: Option<String>,
    pub preview_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Deployment {
    pub fn status_enum(&self) -> DeploymentStatus {
        DeploymentStatus::from(self.status.clone())
    }

    pub fn env_var_list(&self) -> Vec<EnvVar> {
        serde_json::from_str(&self.env_vars).unwrap_or_default()
    }

    /// Framework sentinel check: no framework pinned yet, or pinned to the
    /// "no recipe yet" placeholder.
    pub fn needs_detection(&self) -> bool {
        match self.framework.as_deref() {
            None | Some("") | Some("unknown") => true,
            _ => false,
        }
    }

    /// Deterministic container name for this deployment.
    pub fn container_name(&self) -> String {
        format!("slipway-{}", self.name)
    }

    /// Deterministic image tag for this deployment.
    pub fn image_tag(&self) -> String {
        format!("slipway-{}:latest", self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeploymentLog {
    pub id: i64,
    pub deployment_id: String,
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in ["pending", "cloning", "building", "running", "failed", "stopped"] {
            assert_eq!(DeploymentStatus::from(s.to_string()).as_str(), s);
        }
        // Unknown values fall back to pending
        assert_eq!(
            DeploymentStatus::from("bogus".to_string()),
            DeploymentStatus::Pending
        );
    }

    #[test]
    fn busy_states_hold_ports() {
        assert!(DeploymentStatus::Running.holds_port());
        assert!(DeploymentStatus::Cloning.holds_port());
        assert!(!DeploymentStatus::Failed.holds_port());
        assert!(!DeploymentStatus::Stopped.holds_port());
    }
}

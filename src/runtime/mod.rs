mod docker;

pub use docker::DockerRuntime;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Inputs for an image build. The context directory is tarred up and shipped
/// to the daemon; build output is forwarded line by line through `log_tx`.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub path: String,
    pub dockerfile: String,
    pub tag: String,
    pub build_args: Vec<(String, String)>,
}

/// Inputs for creating and starting a container. The host binding always
/// mirrors the container port.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub image: String,
    pub name: String,
    pub port: u16,
    pub env: Vec<(String, String)>,
    pub restart_policy: String,
}

/// Coarse container state as the engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    NotFound,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LogLine {
    pub timestamp: String,
    pub message: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build_image(
        &self,
        ctx: &BuildContext,
        log_tx: mpsc::UnboundedSender<String>,
    ) -> Result<String>;
    async fn create_and_start(&self, config: &RunConfig) -> Result<String>;
    async fn start(&self, container_id: &str) -> Result<()>;
    /// Graceful stop with a 10 second deadline. A missing or already-stopped
    /// container counts as success.
    async fn stop(&self, container_id: &str) -> Result<()>;
    /// Forced removal. A missing container counts as success.
    async fn remove(&self, container_id: &str) -> Result<()>;
    async fn inspect(&self, container_id: &str) -> Result<ContainerState>;
    /// Snapshot of recent container output, without following.
    async fn logs(&self, container_id: &str) -> Result<Vec<LogLine>>;
    async fn follow_logs(
        &self,
        container_id: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = LogLine> + Send>>>;
    async fn remove_image(&self, image: &str) -> Result<()>;
    async fn is_available(&self) -> bool;
}

/// Stand-in used when the Docker daemon cannot be reached at startup. The
/// API stays up; deployments fail with a clear message.
pub struct NoopRuntime;

#[async_trait]
impl ContainerRuntime for NoopRuntime {
    async fn build_image(
        &self,
        _ctx: &BuildContext,
        _log_tx: mpsc::UnboundedSender<String>,
    ) -> Result<String> {
        anyhow::bail!("No container runtime available")
    }
    async fn create_and_start(&self, _config: &RunConfig) -> Result<String> {
        anyhow::bail!("No container runtime available")
    }
    async fn start(&self, _container_id: &str) -> Result<()> {
        anyhow::bail!("No container runtime available")
    }
    async fn stop(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }
    async fn remove(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }
    async fn inspect(&self, _container_id: &str) -> Result<ContainerState> {
        Ok(ContainerState::NotFound)
    }
    async fn logs(&self, _container_id: &str) -> Result<Vec<LogLine>> {
        Ok(Vec::new())
    }
    async fn follow_logs(
        &self,
        _container_id: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = LogLine> + Send>>> {
        anyhow::bail!("No container runtime available")
    }
    async fn remove_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }
    async fn is_available(&self) -> bool {
        false
    }
}

pub async fn connect(config: &crate::config::RuntimeConfig) -> Arc<dyn ContainerRuntime> {
    match DockerRuntime::new(&config.docker_socket) {
        Ok(runtime) if runtime.is_available().await => {
            tracing::info!("Connected to Docker daemon");
            Arc::new(runtime)
        }
        Ok(_) => {
            tracing::warn!("Docker daemon did not answer ping. Deployments will not work.");
            Arc::new(NoopRuntime)
        }
        Err(e) => {
            tracing::warn!("Failed to connect to Docker: {}. Deployments will not work.", e);
            Arc::new(NoopRuntime)
        }
    }
}

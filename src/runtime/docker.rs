use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::mpsc;

use super::{BuildContext, ContainerRuntime, ContainerState, LogLine, RunConfig};

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new(socket: &str) -> Result<Self> {
        let client = if socket.starts_with("tcp://") || socket.starts_with("http://") {
            Docker::connect_with_local_defaults()?
        } else {
            Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?
        };
        Ok(Self { client })
    }
}

/// Daemon responses that mean the desired state already holds.
fn is_gone(e: &DockerError, codes: &[u16]) -> bool {
    matches!(e, DockerError::DockerResponseServerError { status_code, .. } if codes.contains(status_code))
}

fn restart_policy_enum(name: &str) -> bollard::service::RestartPolicyNameEnum {
    use bollard::service::RestartPolicyNameEnum;
    match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "no" => RestartPolicyNameEnum::NO,
        _ => RestartPolicyNameEnum::UNLESS_STOPPED,
    }
}

fn parse_log_line(output: LogOutput) -> Option<LogLine> {
    let message = match output {
        LogOutput::StdOut { message } => message,
        LogOutput::StdErr { message } => message,
        _ => return None,
    };
    let raw = String::from_utf8_lossy(&message).to_string();
    // Docker prefixes "2024-01-01T00:00:00.000000000Z message"
    let (timestamp, msg) = match raw.split_once(' ') {
        Some((ts, rest)) if ts.len() >= 20 && ts.contains('T') => {
            (ts.to_string(), rest.to_string())
        }
        _ => (chrono::Utc::now().to_rfc3339(), raw),
    };
    Some(LogLine {
        timestamp,
        message: msg.trim_end().to_string(),
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(
        &self,
        ctx: &BuildContext,
        log_tx: mpsc::UnboundedSender<String>,
    ) -> Result<String> {
        // Ship the workspace to the daemon as a tar archive
        let mut tar_builder = tar::Builder::new(Vec::new());
        tar_builder
            .append_dir_all(".", &ctx.path)
            .context("Failed to archive build context")?;
        let tar_data = tar_builder
            .into_inner()
            .context("Failed to finish build context archive")?;

        let build_args: HashMap<&str, &str> = ctx
            .build_args
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let options = BuildImageOptions {
            dockerfile: ctx.dockerfile.trim_start_matches("./"),
            t: &ctx.tag,
            rm: true,
            buildargs: build_args,
            ..Default::default()
        };

        let mut stream = self
            .client
            .build_image(options, None, Some(Bytes::from(tar_data)));

        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    if let Some(line) = output.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            let _ = log_tx.send(line.to_string());
                        }
                    }
                    if let Some(error) = output.error {
                        anyhow::bail!("Build error: {}", error);
                    }
                }
                Err(e) => anyhow::bail!("Build failed: {}", e),
            }
        }

        // Resolve the tag to the concrete image id so a later rebuild under
        // the same tag can still find and remove this one.
        let image_id = self
            .client
            .inspect_image(&ctx.tag)
            .await
            .ok()
            .and_then(|image| image.id)
            .unwrap_or_else(|| ctx.tag.clone());
        Ok(image_id)
    }

    async fn create_and_start(&self, config: &RunConfig) -> Result<String> {
        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        // Host port mirrors the container port so the proxy can address the
        // deployment at 127.0.0.1:<port>
        let port_key = format!("{}/tcp", config.port);
        let mut port_bindings: HashMap<String, Option<Vec<bollard::service::PortBinding>>> =
            HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![bollard::service::PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(config.port.to_string()),
            }]),
        );
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let restart_policy = bollard::service::RestartPolicy {
            name: Some(restart_policy_enum(&config.restart_policy)),
            maximum_retry_count: None,
        };

        let host_config = bollard::service::HostConfig {
            port_bindings: Some(port_bindings),
            restart_policy: Some(restart_policy),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: &config.name,
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await
            .context("Failed to create container")?;

        self.client
            .start_container::<String>(&response.id, None)
            .await
            .context("Failed to start container")?;

        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        match self.client.start_container::<String>(container_id, None).await {
            Ok(()) => Ok(()),
            // 304: already running
            Err(e) if is_gone(&e, &[304]) => Ok(()),
            Err(e) => Err(e).context("Failed to start container"),
        }
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let options = StopContainerOptions { t: 10 };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if is_gone(&e, &[304, 404]) => Ok(()),
            Err(e) => Err(e).context("Failed to stop container"),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e, &[404, 409]) => Ok(()),
            Err(e) => Err(e).context("Failed to remove container"),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState> {
        match self.client.inspect_container(container_id, None).await {
            Ok(info) => {
                let running = info
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(if running {
                    ContainerState::Running
                } else {
                    ContainerState::Stopped
                })
            }
            Err(e) if is_gone(&e, &[404]) => Ok(ContainerState::NotFound),
            Err(e) => Err(e).context("Failed to inspect container"),
        }
    }

    async fn logs(&self, container_id: &str) -> Result<Vec<LogLine>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: true,
            tail: "1000".to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(container_id, Some(options));
        let mut lines = Vec::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    if let Some(line) = parse_log_line(output) {
                        lines.push(line);
                    }
                }
                Err(e) if is_gone(&e, &[404]) => break,
                Err(e) => return Err(e).context("Failed to read container logs"),
            }
        }
        Ok(lines)
    }

    async fn follow_logs(
        &self,
        container_id: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = LogLine> + Send>>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            timestamps: true,
            tail: "100".to_string(),
            ..Default::default()
        };

        let stream = self.client.logs(container_id, Some(options));

        let mapped = stream.filter_map(|result| async move {
            match result {
                Ok(output) => parse_log_line(output),
                Err(e) => {
                    tracing::warn!("Error reading container log: {}", e);
                    None
                }
            }
        });

        Ok(Box::pin(mapped))
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            noprune: false,
        };
        match self.client.remove_image(image, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) if is_gone(&e, &[404, 409]) => Ok(()),
            Err(e) => Err(e).context("Failed to remove image"),
        }
    }

    async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Reserved control-plane port. Deployments may never claim it.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// Hostname the control plane answers to behind the proxy.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            proxy_port: default_proxy_port(),
            hostname: default_hostname(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    7700
}

fn default_proxy_port() -> u16 {
    80
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    /// Base domain for minted deployment hostnames (e.g. "apps.example.com").
    /// Empty disables subdomain routing entirely.
    #[serde(default)]
    pub base_domain: String,
}

impl ProxyConfig {
    pub fn subdomains_enabled(&self) -> bool {
        !self.base_domain.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_range_start")]
    pub range_start: u16,
    #[serde(default = "default_range_end")]
    pub range_end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
        }
    }
}

fn default_range_start() -> u16 {
    3000
}

fn default_range_end() -> u16 {
    3999
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: default_docker_socket(),
        }
    }
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GitConfig {
    /// Personal access token injected into clone URLs for github.com repos.
    pub github_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config =
                toml::from_str(&content).context("Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.api_port, 7700);
        assert!(config.ports.range_start < config.ports.range_end);
        assert!(!config.proxy.subdomains_enabled());
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
[server]
api_port = 9000

[proxy]
base_domain = "apps.example.com"
"#,
        )
        .unwrap();
        assert_eq!(config.server.api_port, 9000);
        assert!(config.proxy.subdomains_enabled());
        assert_eq!(config.ports.range_start, 3000);
    }
}

//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;
use trench_core::{SignalError, SignalResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_queue_depth() -> usize {
    64
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub queue_depth: usize,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
    ) -> SignalResult<Self> {
        let file_config = match config_path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| SignalError::Config(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        Ok(Self {
            port: cli_port.unwrap_or(file_config.server.port),
            bind: cli_bind
                .map(str::to_string)
                .unwrap_or(file_config.server.bind),
            queue_depth: file_config.server.queue_depth,
        })
    }

    pub fn socket_addr(&self) -> SignalResult<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| SignalError::Config(format!("invalid bind address: {e}")))
    }
}

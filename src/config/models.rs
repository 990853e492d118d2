// src/config/models.rs
use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Upper bound on how long shutdown waits for tasks. Unbounded when unset.
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;

        if self.metrics.enabled {
            ensure!(
                self.metrics.path.starts_with('/'),
                "metrics.path must start with '/', got {:?}",
                self.metrics.path
            );
            if self.metrics.port == self.server.listen_addr.port() {
                bail!(
                    "metrics.port {} clashes with server.listen_addr",
                    self.metrics.port
                );
            }
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.read_buffer_size > 0,
            "server.read_buffer_size must be greater than zero"
        );
        if let Some(secs) = self.shutdown_timeout_secs {
            ensure!(secs > 0, "server.shutdown_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            read_buffer_size: default_read_buffer_size(),
            shutdown_timeout_secs: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7000))
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

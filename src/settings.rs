use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::cli::{Cli, LogFormat};
use crate::key::QueryMode;

fn default_listen() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("static listen address")
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

fn default_gzip_enabled() -> bool {
    true
}

fn default_cleanup_frequency() -> u64 {
    30
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_worker_count() -> usize {
    255
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_clear_on_start() -> bool {
    true
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> u64 {
    64 * 1024 * 1024
}

fn default_max_capture_size() -> u64 {
    64 * 1024 * 1024
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Redis,
    File,
}

/// Runtime configuration, loaded once at startup and immutable afterwards.
///
/// Keys are the exact PascalCase names found in the JSON config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub global_host: String,
    pub image_host: String,
    pub admin_host: String,
    #[serde(default)]
    pub global_upstream: Option<String>,
    #[serde(default)]
    pub image_upstream: Option<String>,
    pub store_type: StoreType,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_gzip_enabled")]
    pub gzip_enabled: bool,
    #[serde(default)]
    pub cache_exceptions: Vec<String>,
    #[serde(default)]
    pub query_ignore_enabled: bool,
    #[serde(default)]
    pub query_sorting_enabled: bool,
    #[serde(default)]
    pub response_time_logging_enabled: bool,
    #[serde(default = "default_cleanup_frequency")]
    pub cleanup_frequency: u64,
    #[serde(default = "default_clear_on_start")]
    pub clear_on_start: bool,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: u64,
    #[serde(default = "default_max_capture_size")]
    pub max_capture_size: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        let settings: Settings = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse configuration {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_file_size > 0,
            "MaxFileSize must be greater than 0 (got {})",
            self.max_file_size
        );
        ensure!(
            self.cleanup_frequency > 0,
            "CleanupFrequency must be greater than 0 seconds (got {})",
            self.cleanup_frequency
        );
        ensure!(
            self.worker_count > 0,
            "WorkerCount must be at least 1 (got {})",
            self.worker_count
        );
        ensure!(
            self.queue_capacity > 0,
            "QueueCapacity must be at least 1 (got {})",
            self.queue_capacity
        );
        ensure!(
            self.max_header_size > 0,
            "MaxHeaderSize must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "MaxRequestBodySize must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.max_capture_size >= self.max_file_size,
            "MaxCaptureSize ({}) must not be smaller than MaxFileSize ({})",
            self.max_capture_size,
            self.max_file_size
        );
        ensure!(
            self.client_timeout > 0,
            "ClientTimeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "UpstreamConnectTimeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "UpstreamTimeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        for host in [&self.global_host, &self.image_host, &self.admin_host] {
            ensure!(!host.is_empty(), "host names must not be empty");
        }
        ensure!(
            self.global_host != self.image_host
                && self.global_host != self.admin_host
                && self.image_host != self.admin_host,
            "GlobalHost, ImageHost, and AdminHost must be distinct"
        );
        Ok(())
    }

    /// The query normalisation mode; ignore wins over sort when both are set.
    pub fn query_mode(&self) -> QueryMode {
        if self.query_ignore_enabled {
            QueryMode::Ignore
        } else if self.query_sorting_enabled {
            QueryMode::Sort
        } else {
            QueryMode::Preserve
        }
    }

    pub fn global_upstream_addr(&self) -> String {
        self.global_upstream
            .clone()
            .unwrap_or_else(|| format!("{}:80", self.global_host))
    }

    pub fn image_upstream_addr(&self) -> String {
        self.image_upstream
            .clone()
            .unwrap_or_else(|| format!("{}:80", self.image_host))
    }

    pub fn cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_frequency)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Ok(path.to_path_buf());
    }

    let candidate = PathBuf::from("cachefront.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    bail!(
        "no configuration file provided via --config and {} does not exist",
        candidate.display()
    );
}

//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Configuration model for the bus, transport, TLS and logging."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_endpoint_capacity() -> usize {
    1024
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sync_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ws_name() -> String {
    "cloudhub".to_owned()
}

fn default_ws_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_ws_port() -> u16 {
    10000
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_buffer_size() -> usize {
    1024
}

fn default_read_limit() -> usize {
    1536 * 1024
}

fn default_heartbeat_period() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_deadline() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_count() -> u32 {
    5
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_backlog_limit() -> usize {
    256
}

fn default_max_clients() -> usize {
    1024
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_tls_ca() -> PathBuf {
    PathBuf::from("certs/root-ca.crt")
}

fn default_tls_cert() -> PathBuf {
    PathBuf::from("certs/server.crt")
}

fn default_tls_key() -> PathBuf {
    PathBuf::from("certs/server.key")
}

/// Primary configuration object for the fleet control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "FLEET_CONFIG";

    /// Load configuration from disk, respecting the `FLEET_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.bus.validate()?;
        self.websocket.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Sizing and deadlines for the in-process bus.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Queue depth of every endpoint channel.
    #[serde(default = "default_endpoint_capacity")]
    pub endpoint_capacity: usize,
    /// Hard cap on a single enqueue.
    #[serde(default = "default_send_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub send_timeout: Duration,
    /// Reply deadline applied when a sync caller passes a zero timeout.
    #[serde(default = "default_sync_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sync_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint_capacity: default_endpoint_capacity(),
            send_timeout: default_send_timeout(),
            sync_timeout: default_sync_timeout(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_capacity == 0 {
            return Err(anyhow!("bus.endpoint_capacity must be greater than zero"));
        }
        Ok(())
    }
}

/// A single `(option, resource) -> module` entry of a proxy's handler table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub option: String,
    pub resource: String,
    pub module: String,
}

/// Connection options shared by the client and server proxies.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_ws_name")]
    pub name: String,
    #[serde(default = "default_ws_host")]
    pub host: String,
    #[serde(default = "default_ws_port")]
    pub port: u16,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default = "default_handshake_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub handshake_timeout: Duration,
    #[serde(default = "default_buffer_size")]
    pub read_buffer: usize,
    #[serde(default = "default_buffer_size")]
    pub write_buffer: usize,
    #[serde(default = "default_read_limit")]
    pub read_limit: usize,
    #[serde(default = "default_heartbeat_period")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_period: Duration,
    #[serde(default = "default_heartbeat_deadline")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_deadline: Duration,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retry_backoff: Duration,
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_shutdown_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub shutdown_grace: Duration,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            name: default_ws_name(),
            host: default_ws_host(),
            port: default_ws_port(),
            client_name: None,
            handshake_timeout: default_handshake_timeout(),
            read_buffer: default_buffer_size(),
            write_buffer: default_buffer_size(),
            read_limit: default_read_limit(),
            heartbeat_period: default_heartbeat_period(),
            heartbeat_deadline: default_heartbeat_deadline(),
            retry_count: default_retry_count(),
            retry_backoff: default_retry_backoff(),
            backlog_limit: default_backlog_limit(),
            max_clients: default_max_clients(),
            shutdown_grace: default_shutdown_grace(),
            routes: Vec::new(),
        }
    }
}

impl WebSocketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("websocket.name must not be empty"));
        }
        if self.read_limit == 0 {
            return Err(anyhow!("websocket.read_limit must be greater than zero"));
        }
        if self.retry_count == 0 {
            return Err(anyhow!("websocket.retry_count must be at least 1"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("websocket.max_clients must be greater than zero"));
        }
        if self.heartbeat_deadline <= self.heartbeat_period {
            return Err(anyhow!(
                "websocket.heartbeat_deadline ({:?}) must exceed heartbeat_period ({:?})",
                self.heartbeat_deadline,
                self.heartbeat_period
            ));
        }
        let mut seen = HashSet::new();
        for route in &self.routes {
            if !seen.insert((route.option.as_str(), route.resource.as_str())) {
                return Err(anyhow!(
                    "duplicate websocket route {}:{}",
                    route.option,
                    route.resource
                ));
            }
        }
        Ok(())
    }
}

/// PEM material handed to the transport's TLS setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_tls_ca")]
    pub ca_path: PathBuf,
    #[serde(default = "default_tls_cert")]
    pub cert_path: PathBuf,
    #[serde(default = "default_tls_key")]
    pub key_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_path: default_tls_ca(),
            cert_path: default_tls_cert(),
            key_path: default_tls_key(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AppConfig = "".parse().expect("defaults parse");
        assert_eq!(config.bus.endpoint_capacity, 1024);
        assert_eq!(config.bus.send_timeout, Duration::from_secs(30));
        assert_eq!(config.websocket.read_limit, 1536 * 1024);
        assert_eq!(config.websocket.heartbeat_period, Duration::from_secs(5));
        assert_eq!(config.websocket.retry_count, 5);
        assert_eq!(config.websocket.max_clients, 1024);
        assert!(config.websocket.routes.is_empty());
    }

    #[test]
    fn zero_client_cap_is_rejected() {
        let err = "[websocket]\nmax_clients = 0\n"
            .parse::<AppConfig>()
            .expect_err("no client slots");
        assert!(err.to_string().contains("max_clients"));
    }

    #[test]
    fn routes_and_durations_parse() {
        let config: AppConfig = r#"
            [bus]
            sync_timeout = 3

            [websocket]
            name = "edgehub"
            port = 20000
            retry_backoff = 1

            [[websocket.routes]]
            option = "GET"
            resource = "/edgemanager/v1/software/edge/version-info"
            module = "edgemanager"
        "#
        .parse()
        .expect("config parses");
        assert_eq!(config.bus.sync_timeout, Duration::from_secs(3));
        assert_eq!(config.websocket.name, "edgehub");
        assert_eq!(config.websocket.retry_backoff, Duration::from_secs(1));
        assert_eq!(config.websocket.routes.len(), 1);
        assert_eq!(config.websocket.routes[0].module, "edgemanager");
    }

    #[test]
    fn duplicate_routes_are_rejected() {
        let err = r#"
            [[websocket.routes]]
            option = "GET"
            resource = "/a"
            module = "one"

            [[websocket.routes]]
            option = "GET"
            resource = "/a"
            module = "two"
        "#
        .parse::<AppConfig>()
        .expect_err("duplicate route");
        assert!(err.to_string().contains("duplicate websocket route"));
    }

    #[test]
    fn heartbeat_deadline_must_exceed_period() {
        let err = r#"
            [websocket]
            heartbeat_period = 10
            heartbeat_deadline = 10
        "#
        .parse::<AppConfig>()
        .expect_err("deadline too short");
        assert!(err.to_string().contains("heartbeat_deadline"));
    }

    #[test]
    fn loads_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fleet.toml");
        fs::write(&path, "[bus]\nendpoint_capacity = 8\n").expect("write config");
        let missing = dir.path().join("missing.toml");

        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).expect("load config");
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.bus.endpoint_capacity, 8);
    }
}

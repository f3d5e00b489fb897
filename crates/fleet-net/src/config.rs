//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Proxy configuration and transport defaults."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::time::Duration;

use fleet_common::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as FrameConfig;

use crate::error::Result;
use crate::router::RouteTable;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_READ_LIMIT: usize = 1536 * 1024;
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_DEADLINE: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKLOG_LIMIT: usize = 256;
pub const DEFAULT_MAX_CLIENTS: usize = 1024;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Only secure WebSockets are dialed or served.
pub const WS_SCHEME: &str = "wss";
/// Handshake header asserting the dialing proxy's identity.
pub const CLIENT_NAME_HEADER: &str = "clientName";
/// Header a fronting proxy uses to pass the client's address.
pub const REAL_IP_HEADER: &str = "X-Real-IP";
/// Request path of the upgrade endpoint.
pub const SERVICE_PATH: &str = "/";

/// Options of one client or server proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Endpoint name registered on the bus.
    pub name: String,
    /// Dial target (client) or bind address (server).
    pub host: String,
    pub port: u16,
    /// Identity sent in the `clientName` header; defaults to `name`.
    pub client_name: String,
    pub handshake_timeout: Duration,
    pub read_buffer: usize,
    pub write_buffer: usize,
    /// Largest accepted inbound frame.
    pub read_limit: usize,
    pub heartbeat_period: Duration,
    /// Idle read deadline; data frames and pongs both reset it.
    pub heartbeat_deadline: Duration,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    /// Frames buffered while a client proxy reconnects.
    pub backlog_limit: usize,
    /// Concurrent clients a server proxy admits; further upgrades get 400.
    pub max_clients: usize,
    pub shutdown_grace: Duration,
    /// Reply deadline for sync requests arriving from the peer.
    pub sync_timeout: Duration,
    pub routes: RouteTable,
}

impl ProxyConfig {
    /// Defaults for a proxy named `name` targeting `host:port`.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        Self {
            client_name: name.clone(),
            name,
            host: host.into(),
            port,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_buffer: DEFAULT_BUFFER_SIZE,
            write_buffer: DEFAULT_BUFFER_SIZE,
            read_limit: DEFAULT_READ_LIMIT,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            heartbeat_deadline: DEFAULT_HEARTBEAT_DEADLINE,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            max_clients: DEFAULT_MAX_CLIENTS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            routes: RouteTable::new(),
        }
    }

    /// Build from the `[websocket]` section of the application config.
    pub fn from_settings(settings: &WebSocketConfig, sync_timeout: Duration) -> Result<Self> {
        let mut routes = RouteTable::new();
        for route in &settings.routes {
            routes.insert(&route.option, &route.resource, &route.module)?;
        }
        Ok(Self {
            name: settings.name.clone(),
            host: settings.host.clone(),
            port: settings.port,
            client_name: settings
                .client_name
                .clone()
                .unwrap_or_else(|| settings.name.clone()),
            handshake_timeout: settings.handshake_timeout,
            read_buffer: settings.read_buffer,
            write_buffer: settings.write_buffer,
            read_limit: settings.read_limit,
            heartbeat_period: settings.heartbeat_period,
            heartbeat_deadline: settings.heartbeat_deadline,
            retry_count: settings.retry_count,
            retry_backoff: settings.retry_backoff,
            backlog_limit: settings.backlog_limit,
            max_clients: settings.max_clients,
            shutdown_grace: settings.shutdown_grace,
            sync_timeout,
            routes,
        })
    }

    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_retry(mut self, retry_count: u32, retry_backoff: Duration) -> Self {
        self.retry_count = retry_count.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_heartbeat(mut self, period: Duration, deadline: Duration) -> Self {
        self.heartbeat_period = period;
        self.heartbeat_deadline = deadline;
        self
    }

    pub fn with_read_limit(mut self, read_limit: usize) -> Self {
        self.read_limit = read_limit;
        self
    }

    pub fn with_backlog_limit(mut self, backlog_limit: usize) -> Self {
        self.backlog_limit = backlog_limit;
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `wss://host:port/`.
    pub fn url(&self) -> String {
        format!("{}://{}{}", WS_SCHEME, self.address(), SERVICE_PATH)
    }

    /// Frame codec limits.
    pub(crate) fn frame_config(&self) -> FrameConfig {
        let mut config = FrameConfig::default();
        config.read_buffer_size = self.read_buffer;
        config.write_buffer_size = self.write_buffer;
        config.max_message_size = Some(self.read_limit);
        config.max_frame_size = Some(self.read_limit);
        config
    }
}

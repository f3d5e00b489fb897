//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Shared configuration and tracing primitives."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Core shared primitives for the fleet control-plane workspace.
//! This crate exposes configuration loading and logging bootstrap
//! consumed by the bus, the transport and the daemon.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BusConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, RouteConfig, TlsConfig,
    WebSocketConfig,
};
pub use logging::{init_tracing, LogFormat};

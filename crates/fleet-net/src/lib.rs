//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Mutual-TLS WebSocket transport between cloud and edge buses."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! WebSocket proxies that extend a process-local [`fleet_msg::Bus`] across
//! the cloud/edge link.
//!
//! A [`WsClientProxy`] dials out and keeps one connection alive; a
//! [`WsServerProxy`] accepts many named clients. Both register a bus
//! endpoint: messages sent to it are written to the wire, and inbound frames
//! are routed to local modules through a [`RouteTable`].

pub mod client;
pub mod config;
mod conn;
pub mod error;
pub mod router;
pub mod server;
pub mod state;
pub mod tls;
pub mod wire;

pub use client::WsClientProxy;
pub use config::ProxyConfig;
pub use error::{Result, TransportError};
pub use router::{HandlerRouter, RouteOutcome, RouteTable};
pub use server::{valid_client_name, PeerCallback, PeerInfo, WsServerProxy, WsSvrSender};
pub use state::{ConnectionState, ConnectionStatus};
pub use tls::{crypto_provider, TlsAssets};
pub use wire::{FrameSender, MsgType, WsMessage, WsSvrMessage};

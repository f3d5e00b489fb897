//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Operation logger for connection transitions, faults and dropped frames."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for tests and tools.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Bus endpoint or proxy name emitting the record.
    pub endpoint: Option<&'a str>,
    /// Remote peer (client name or dial target).
    pub peer: Option<&'a str>,
    /// Message id the record refers to.
    pub msg_id: Option<&'a str>,
    /// Connection generation at the time of the record.
    pub generation: Option<u64>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint name.
    pub fn with_endpoint(mut self, endpoint: &'a str) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Attach a peer identifier.
    pub fn with_peer(mut self, peer: &'a str) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Attach a message id.
    pub fn with_msg_id(mut self, msg_id: &'a str) -> Self {
        self.msg_id = Some(msg_id);
        self
    }

    /// Attach a connection generation.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }
}

/// Outcome attached to every operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed.
    Success,
    /// A frame or message was discarded; the connection survives.
    Dropped,
    /// The operation failed or tore down a connection.
    Fault,
}

impl Outcome {
    /// Stable label used in the `outcome` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Dropped => "dropped",
            Outcome::Fault => "fault",
        }
    }
}

/// Emit one operation record: a state transition, a fatal failure, or a dropped frame.
pub fn log_operation(context: Option<&LogContext>, event: &str, message: &str, outcome: Outcome) {
    let default_ctx = LogContext::default();
    let ctx = context.unwrap_or(&default_ctx);
    let endpoint = ctx.endpoint.unwrap_or("");
    let peer = ctx.peer.unwrap_or("");
    let msg_id = ctx.msg_id.unwrap_or("");
    let generation = ctx.generation.unwrap_or_default();
    let outcome_label = outcome.as_str();
    match outcome {
        Outcome::Success => tracing::info!(
            event,
            outcome = outcome_label,
            endpoint,
            peer,
            msg_id,
            generation,
            "{}",
            message
        ),
        Outcome::Dropped => tracing::warn!(
            event,
            outcome = outcome_label,
            endpoint,
            peer,
            msg_id,
            generation,
            "{}",
            message
        ),
        Outcome::Fault => tracing::error!(
            event,
            outcome = outcome_label,
            endpoint,
            peer,
            msg_id,
            generation,
            "{}",
            message
        ),
    }
}

//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Message envelope, in-process bus and module lifecycle."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Process-local messaging for the fleet control plane.
//!
//! A single [`Bus`] is created at process start and threaded into every
//! module. Modules own a named endpoint, exchange [`Message`] envelopes,
//! and correlate synchronous requests with their responses through the
//! bus's pending table.
#![warn(missing_docs)]

use std::time::Duration;

pub mod bus;
pub mod handler;
pub mod logging;
pub mod message;
pub mod module;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Failures surfaced by the bus, the module manager and message helpers.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// An endpoint or module with this name already exists.
    #[error("endpoint '{0}' is already registered")]
    AlreadyRegistered(String),
    /// No endpoint or module with this name exists.
    #[error("endpoint '{0}' is not registered")]
    NotRegistered(String),
    /// The destination endpoint does not exist or was closed mid-send.
    #[error("no such endpoint '{0}'")]
    NoSuchEndpoint(String),
    /// A response arrived for a request nobody is waiting on.
    #[error("no pending request for parent id '{0}'")]
    NoSuchPending(String),
    /// The destination did not accept the message in time.
    #[error("enqueue to '{destination}' timed out after {timeout:?}")]
    SendTimeout {
        /// Destination endpoint.
        destination: String,
        /// Enqueue deadline that elapsed.
        timeout: Duration,
    },
    /// No response arrived before the caller's deadline.
    #[error("no response to '{id}' within {timeout:?}")]
    ReceiveTimeout {
        /// Request id.
        id: String,
        /// Reply deadline that elapsed.
        timeout: Duration,
    },
    /// The call was cancelled before it completed.
    #[error("request '{0}' cancelled")]
    Cancelled(String),
    /// The endpoint channel was closed by unregister.
    #[error("channel of endpoint '{0}' closed")]
    ChannelClosed(String),
    /// The system random source failed while minting a message id.
    #[error("message id generation failed: {0}")]
    IdGeneration(String),
    /// Another sync caller is already waiting on this request id.
    #[error("request '{0}' already awaits a response")]
    DuplicatePending(String),
    /// A handler for this route key is already registered.
    #[error("handler for '{0}' already registered")]
    DuplicateHandler(String),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use bus::{Bus, PendingResponse};
pub use handler::{serve, status, HandlerFn, HandlerTable, HandlerTableBuilder, RespMsg};
pub use logging::{log_message, MessageDirection, MessagingMetricsExporter};
pub use message::{route_key, Header, Message, Router, PROTOCOL_VERSION};
pub use module::{Module, ModuleContext, ModuleManager};

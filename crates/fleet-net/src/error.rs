//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Transport error kinds."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use fleet_msg::MessagingError;
use tokio_tungstenite::tungstenite;

/// Shared result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures surfaced by the WebSocket proxies.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The proxy has no live connection to write to.
    #[error("websocket '{0}' is not connected")]
    NotConnected(String),
    /// TLS or WebSocket upgrade failed or timed out.
    #[error("handshake with {peer} failed: {reason}")]
    HandshakeFailed {
        /// Dial target or client address.
        peer: String,
        /// Underlying failure.
        reason: String,
    },
    /// Every dial attempt of a cycle failed.
    #[error("dial to {target} failed after {attempts} attempt(s): {reason}")]
    DialFailed {
        /// Dial target.
        target: String,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },
    /// An inbound frame exceeded the read limit.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Observed size.
        size: usize,
        /// Configured read limit.
        limit: usize,
    },
    /// An inbound frame was not a valid message.
    #[error("undecodable frame: {0}")]
    DecodeFailed(String),
    /// Writing to the socket failed.
    #[error("write failed: {0}")]
    WriteFailed(String),
    /// Reading from the socket failed or the heartbeat deadline passed.
    #[error("read failed: {0}")]
    ReadFailed(String),
    /// No connected client with this name.
    #[error("unknown client '{0}'")]
    UnknownClient(String),
    /// A client with this name is already connected.
    #[error("client '{0}' is already connected")]
    DuplicateClient(String),
    /// Every client slot of the server is taken.
    #[error("max websocket client connection reached ({0}), please try again later")]
    TooManyClients(usize),
    /// The `clientName` header is missing or malformed.
    #[error("invalid client name '{0}'")]
    InvalidClientName(String),
    /// A route for this option/resource pair already exists.
    #[error("route '{0}' already registered")]
    DuplicateRoute(String),
    /// The proxy has been stopped.
    #[error("websocket '{0}' is stopped")]
    Stopped(String),
    /// The proxy is already running.
    #[error("websocket '{0}' is already started")]
    AlreadyStarted(String),
    /// Dialing was cancelled.
    #[error("websocket '{0}' start cancelled")]
    Cancelled(String),
    /// TLS material could not be loaded or assembled.
    #[error("tls configuration error: {0}")]
    Tls(String),
    /// Socket-level IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Bus failure while bridging a message.
    #[error(transparent)]
    Bus(#[from] MessagingError),
}

impl From<rustls::Error> for TransportError {
    fn from(err: rustls::Error) -> Self {
        TransportError::Tls(err.to_string())
    }
}

impl TransportError {
    /// Classify a read-side WebSocket error.
    pub(crate) fn from_read(err: tungstenite::Error, limit: usize) -> Self {
        match err {
            tungstenite::Error::Capacity(tungstenite::error::CapacityError::MessageTooLong {
                size,
                ..
            }) => TransportError::FrameTooLarge { size, limit },
            other => TransportError::ReadFailed(other.to_string()),
        }
    }
}

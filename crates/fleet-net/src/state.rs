//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Connection state machine published over a watch channel."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;

use fleet_logging::{log_operation, LogContext, Outcome};
use tokio::sync::watch;

/// Lifecycle of a proxy connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopping,
    Stopped,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stopping => "stopping",
            ConnectionState::Stopped => "stopped",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Stopping | ConnectionState::Stopped)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to subscribers.
///
/// `generation` increments every time the proxy reaches `Connected`, so a
/// subscriber can tell a reconnect apart from a connection that never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
        }
    }
}

/// Owner of a proxy's state; every accepted transition is logged.
#[derive(Debug)]
pub(crate) struct StateCell {
    name: String,
    tx: watch::Sender<ConnectionStatus>,
}

impl StateCell {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(ConnectionStatus::default());
        Self {
            name: name.into(),
            tx,
        }
    }

    pub(crate) fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.current().state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    /// Move to `next`. Once stopping, only `Stopped` is accepted.
    pub(crate) fn transition(&self, next: ConnectionState, peer: &str) -> bool {
        let mut moved = None;
        self.tx.send_if_modified(|status| {
            if status.state == next {
                return false;
            }
            if status.state.is_terminal() && next != ConnectionState::Stopped {
                return false;
            }
            let previous = status.state;
            status.state = next;
            if next == ConnectionState::Connected {
                status.generation += 1;
            }
            moved = Some((previous, status.generation));
            true
        });

        let Some((previous, generation)) = moved else {
            return false;
        };
        let ctx = LogContext::new()
            .with_endpoint(&self.name)
            .with_peer(peer)
            .with_generation(generation);
        log_operation(
            Some(&ctx),
            "ws.state",
            &format!("{previous} -> {next}"),
            Outcome::Success,
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_bumps_generation() {
        let cell = StateCell::new("cloudhub");
        assert!(cell.transition(ConnectionState::Connecting, "127.0.0.1:10000"));
        assert!(cell.transition(ConnectionState::Connected, "127.0.0.1:10000"));
        assert!(cell.transition(ConnectionState::Disconnected, "127.0.0.1:10000"));
        assert!(cell.transition(ConnectionState::Connected, "127.0.0.1:10000"));
        assert_eq!(
            cell.current(),
            ConnectionStatus {
                state: ConnectionState::Connected,
                generation: 2
            }
        );
    }

    #[test]
    fn repeated_state_is_not_a_transition() {
        let cell = StateCell::new("cloudhub");
        assert!(!cell.transition(ConnectionState::Disconnected, "peer"));
        assert_eq!(cell.current().generation, 0);
    }

    #[test]
    fn stopping_only_moves_to_stopped() {
        let cell = StateCell::new("cloudhub");
        let rx = cell.subscribe();
        cell.transition(ConnectionState::Stopping, "peer");
        assert!(!cell.transition(ConnectionState::Connecting, "peer"));
        assert!(!cell.transition(ConnectionState::Connected, "peer"));
        assert!(cell.transition(ConnectionState::Stopped, "peer"));
        assert_eq!(rx.borrow().state, ConnectionState::Stopped);
    }
}

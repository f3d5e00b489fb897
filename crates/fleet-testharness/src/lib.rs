//! ---
//! fleet_section: "11-test-harness"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "test"
//! fleet_description: "Shared fixtures for transport and end-to-end tests."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Fixtures for exercising the transport without external infrastructure:
//! a throwaway PKI and a WebSocket peer that follows a per-connection script.

pub mod peer;
pub mod pki;

pub use peer::{PeerStep, ScriptedPeer};
pub use pki::{PemPaths, TestPki};

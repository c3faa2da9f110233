//! Pseudo-terminal session bridge
//!
//! Runs a command on a pseudo-terminal and exposes it to a thin terminal
//! renderer over WebSocket. The [`bridge::SessionBridge`] owns the
//! lifecycle; the [`server`] module is the transport in front of it.

pub mod bridge;
pub mod config;
pub mod pty;
pub mod relay;
pub mod server;

pub use bridge::{BridgeError, BridgeResult, ConnectOutcome, SessionBridge};
pub use config::{ConfigError, SessionConfig};
pub use pty::{PtyError, PtySession, TerminalSize};
pub use relay::PtyOutput;

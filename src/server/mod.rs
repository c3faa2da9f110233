//! WebSocket server module
//!
//! Transport adapter between terminal clients and the session bridge.

mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::serve;

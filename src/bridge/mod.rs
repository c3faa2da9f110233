//! Session bridge module
//!
//! Owns the bridge lifecycle and mediates transport events into PTY
//! operations.

mod lifecycle;

pub use lifecycle::*;

//! Configuration module
//!
//! Handles building and loading the session configuration.

mod session;

pub use session::*;

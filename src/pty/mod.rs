//! PTY management module
//!
//! Allocates the pseudo-terminal, spawns the child on it, and provides the
//! read/write/resize/terminate primitives the relay loop and bridge build on.
//! Uses portable-pty for allocation and spawning.

mod decode;
mod session;

pub use decode::*;
pub use session::*;

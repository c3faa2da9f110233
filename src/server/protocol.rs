//! Protocol message definitions
//!
//! Defines the messages exchanged between terminal clients and the bridge.
//! Control messages are JSON text frames tagged by `type`; binary frames
//! carry raw terminal input and have no JSON form.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current protocol version, announced in the welcome message
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from the terminal client to the bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes or pasted text for the child
    PtyInput {
        /// Input data for the child's terminal
        input: String,
    },

    /// The client's viewport changed size
    Resize {
        /// New terminal height in rows
        rows: u16,
        /// New terminal width in columns
        cols: u16,
        /// Optional viewport width in pixels
        #[serde(default, skip_serializing_if = "is_zero")]
        pixel_width: u16,
        /// Optional viewport height in pixels
        #[serde(default, skip_serializing_if = "is_zero")]
        pixel_height: u16,
    },

    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },
}

fn is_zero(value: &u16) -> bool {
    *value == 0
}

impl ClientMessage {
    /// Parse and validate a client message from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let message: Self = serde_json::from_str(json)?;
        message.validate()?;
        Ok(message)
    }

    /// Validate the message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Resize { rows, cols, .. } => {
                validate_dimensions(*rows, *cols)?;
            }
            ClientMessage::PtyInput { .. } | ClientMessage::Ping { .. } => {}
        }
        Ok(())
    }

    /// Create a ping message
    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }

    /// Create an input message
    pub fn pty_input(input: impl Into<String>) -> Self {
        ClientMessage::PtyInput {
            input: input.into(),
        }
    }

    /// Create a resize message without pixel dimensions
    pub fn resize(rows: u16, cols: u16) -> Self {
        ClientMessage::Resize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Check terminal dimensions are usable. Any non-zero `u16` is accepted.
pub fn validate_dimensions(rows: u16, cols: u16) -> ProtocolResult<()> {
    if cols == 0 {
        return Err(ProtocolError::ValidationError(
            "cols must be at least 1".to_string(),
        ));
    }
    if rows == 0 {
        return Err(ProtocolError::ValidationError(
            "rows must be at least 1".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Server Messages
// ============================================================================

/// Error codes carried by [`ServerMessage::Error`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The client sent something unparseable or out of range
    InvalidMessage,
    /// The command could not be started
    SpawnFailed,
    /// Writing input to the PTY failed
    WriteFailed,
    /// Changing the window size failed
    ResizeFailed,
    /// The bridge is shutting down
    NotRunning,
    /// The client fell too far behind the output stream and was dropped
    OutputLagged,
}

/// Messages sent from the bridge to terminal clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the WebSocket handshake
    Welcome {
        /// Protocol version spoken by the bridge
        version: u32,
        /// Bridge name and version
        server: String,
    },

    /// A chunk of terminal output
    PtyOutput {
        /// Decoded output, may contain ANSI escape sequences
        output: String,
    },

    /// Reply to a ping
    Pong {
        /// Sequence number echoed from the ping
        seq: u64,
    },

    /// Something went wrong handling a client message
    Error {
        /// Human-readable description
        message: String,
        /// Machine-readable code
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl ServerMessage {
    /// Create the welcome message
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            server: format!("ptybridge/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Create an output message
    pub fn pty_output(output: impl Into<String>) -> Self {
        ServerMessage::PtyOutput {
            output: output.into(),
        }
    }

    /// Create an error message with a code
    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        ServerMessage::error_with_code(err.to_string(), ErrorCode::InvalidMessage)
    }
}

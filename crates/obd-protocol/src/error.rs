//! OBD-II Error Types

use crate::driver::DriverState;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while talking to an OBD-II adapter.
///
/// Every variant maps to a stable [`ObdError::code`] so callers can turn
/// failures into API status codes without matching on messages.
#[derive(Debug, Clone, Error)]
pub enum ObdError {
    /// Transport could not be opened, or dropped unexpectedly
    #[error("Connection error: {0}")]
    Connection(String),

    /// No response within the command's timeout window
    #[error("Timeout waiting for response to {command} after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// Malformed or unrecognized response payload
    #[error("Parse error: {message} (response: {response:?})")]
    Parse { message: String, response: String },

    /// Command or PID not implemented by the catalog or the adapter
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// No protocol in the profile produced a valid handshake
    #[error("No OBD protocol responded (tried {tried:?})")]
    Protocol { tried: Vec<String> },

    /// Lower-layer I/O failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation attempted while the driver is in an incompatible state
    #[error("Cannot {operation} while driver is {state}")]
    State {
        operation: &'static str,
        state: DriverState,
    },
}

/// Serializable form of an error for API responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub message: String,
}

impl ObdError {
    /// Stable machine-readable code for this error kind
    pub fn code(&self) -> &'static str {
        match self {
            ObdError::Connection(_) => "connection_error",
            ObdError::Timeout { .. } => "timeout_error",
            ObdError::Parse { .. } => "parse_error",
            ObdError::Unsupported(_) => "unsupported_error",
            ObdError::Protocol { .. } => "protocol_error",
            ObdError::Transport(_) => "transport_error",
            ObdError::State { .. } => "state_error",
        }
    }

    /// Whether repeating the same request could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ObdError::Connection(_) | ObdError::Timeout { .. } | ObdError::Transport(_)
        )
    }

    /// Build a parse error for the given raw response
    pub fn parse(message: impl Into<String>, response: impl Into<String>) -> Self {
        ObdError::Parse {
            message: message.into(),
            response: response.into(),
        }
    }

    /// Structured report suitable for serialization
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
        }
    }

    /// Map a well-known ELM327 failure reply onto the taxonomy.
    ///
    /// Returns `None` when the reply carries no recognized failure marker.
    pub fn from_adapter_reply(command: &str, reply: &str) -> Option<Self> {
        let upper = reply.to_ascii_uppercase();
        if upper.contains("NO DATA") {
            Some(ObdError::Unsupported(format!("{command}: vehicle returned NO DATA")))
        } else if upper.trim() == "?" {
            Some(ObdError::Unsupported(format!("{command}: adapter rejected command")))
        } else if upper.contains("UNABLE TO CONNECT")
            || (upper.contains("BUS INIT") && upper.contains("ERROR"))
            || upper.contains("CAN ERROR")
        {
            Some(ObdError::Connection(format!("{command}: {}", reply.trim())))
        } else if upper.contains("STOPPED") || upper.contains("BUFFER FULL") {
            Some(ObdError::Transport(format!("{command}: {}", reply.trim())))
        } else {
            None
        }
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}

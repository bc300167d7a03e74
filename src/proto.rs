use std::time::Duration;

pub mod codec;
pub mod command;
pub mod framing;
pub mod response;

#[cfg(test)]
pub(crate) mod fake;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("I/O error: {:?}", _0)]
    Io(#[from] std::io::Error),

    #[error("Serial I/O error: {:?}", _0)]
    Serial(#[from] tokio_serial::Error),

    #[error("Endpoint {endpoint} is unavailable: {source}")]
    LinkUnavailable {
        endpoint: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("Invalid framing: {0}")]
    InvalidFraming(String),

    #[error("No candidate bit rate answered on {endpoint} (tried {attempted:?}, last failure: {last_failure})")]
    NegotiationExhausted {
        endpoint: String,
        attempted: Vec<u32>,
        last_failure: String,
    },

    #[error("Writing {command:?} did not complete within {timeout:?}")]
    WriteTimeout { command: String, timeout: Duration },

    #[error("No line received within {0:?}")]
    ReadTimeout(Duration),

    #[error("Command {outstanding:?} is still awaiting its response")]
    AlreadyOutstanding { outstanding: String },

    #[error("Command {command:?} got no response within {elapsed:?}")]
    ResponseTimeout { command: String, elapsed: Duration },

    #[error("Session is closed{}", .reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    SessionClosed { reason: Option<String> },

    #[error("Connection was closed by the endpoint")]
    Disconnected,

    #[error("Command text is not a single ASCII line: {0:?}")]
    InvalidCommand(String),

    #[error("Malformed line received ({reason}): {raw:?}")]
    MalformedLine { raw: Vec<u8>, reason: &'static str },

    #[error("Operation requires {expected} mode, session is in {actual} mode")]
    ModeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid identification response: {0:?}")]
    InvalidIdent(String),
}

impl ProtoError {
    /// Channel-level failures after which the link can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtoError::Io(_) | ProtoError::Serial(_) | ProtoError::Disconnected
        )
    }

    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        ProtoError::SessionClosed {
            reason: Some(reason.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;

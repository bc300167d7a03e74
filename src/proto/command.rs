use chrono::{DateTime, Utc};

use super::codec::is_valid_command;
use super::{ProtoError, Result};

/// Standard IEEE-488.2 identification query.
pub const IDN_QUERY: &str = "*IDN?";

/// A command line sent to the instrument.
///
/// The text is opaque; only its shape (one printable ASCII line) is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    pub issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(text: impl AsRef<str>) -> Result<Self> {
        let text = text.as_ref().trim();
        if !is_valid_command(text) {
            return Err(ProtoError::InvalidCommand(text.to_string()));
        }
        Ok(Self {
            text: text.to_string(),
            issued_at: Utc::now(),
        })
    }

    pub fn idn() -> Self {
        Self {
            text: IDN_QUERY.to_string(),
            issued_at: Utc::now(),
        }
    }

    /// True for SCPI queries, which are expected to produce a reply line.
    pub fn is_query(&self) -> bool {
        self.text.ends_with('?')
    }
}

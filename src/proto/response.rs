use chrono::{DateTime, Utc};
use std::fmt;

use super::command::Command;
use super::{ProtoError, Result};

/// One inbound line.
///
/// `command` is set when the line answered an outstanding command; a streamed
/// or unsolicited line has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub command: Option<Command>,
}

impl Response {
    pub fn unsolicited(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Utc::now(),
            command: None,
        }
    }

    pub fn correlated(text: impl Into<String>, command: Command) -> Self {
        Self {
            text: text.into(),
            received_at: Utc::now(),
            command: Some(command),
        }
    }

    pub fn is_unsolicited(&self) -> bool {
        self.command.is_none()
    }

    /// Round trip time, if this line answered a command.
    pub fn latency(&self) -> Option<chrono::Duration> {
        self.command
            .as_ref()
            .map(|cmd| self.received_at - cmd.issued_at)
    }

    pub fn ident(&self) -> Result<Ident> {
        Ident::try_from(self.text.as_str())
    }

    /// Leading numeric field of a reading such as `+6.467E-3 VDC`.
    pub fn value(&self) -> Option<f64> {
        self.text.split_whitespace().next()?.parse::<f64>().ok()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Parsed `*IDN?` reply, e.g. `FLUKE, 8808A, 1234567, 1.0 D1.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl TryFrom<&str> for Ident {
    type Error = ProtoError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        let values: Vec<&str> = value.split(',').map(str::trim).collect();
        if values.len() >= 4 && values[..3].iter().all(|v| !v.is_empty()) {
            Ok(Self {
                manufacturer: values[0].to_string(),
                model: values[1].to_string(),
                serial: values[2].to_string(),
                firmware: values[3..].join(","),
            })
        } else {
            Err(ProtoError::InvalidIdent(value.to_string()))
        }
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (S/N {}, firmware {})",
            self.manufacturer, self.model, self.serial, self.firmware
        )
    }
}

//! Bit rate discovery.
//!
//! The instrument's configured speed is usually unknown, so each candidate is
//! tried in turn with a probe command until a reply passes the validator.
//! Every channel opened here is closed again before the next attempt.

use std::{fmt, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Connector, SerialConnector};
use crate::proto::command::{Command, IDN_QUERY};
use crate::proto::framing::FramingConfig;
use crate::proto::response::Ident;
use crate::proto::{ProtoError, Result};

/// Predicate over a probe reply.
pub type Validator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Time given to the link after opening, before the probe is sent.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

pub fn starts_with(prefix: impl Into<String>) -> Validator {
    let prefix = prefix.into();
    Arc::new(move |reply| reply.starts_with(prefix.as_str()))
}

pub fn any_line() -> Validator {
    Arc::new(|reply| !reply.is_empty())
}

/// Accepts anything that parses as an `*IDN?` reply.
pub fn idn_reply() -> Validator {
    Arc::new(|reply| Ident::try_from(reply).is_ok())
}

#[derive(Clone)]
pub struct NegotiationConfig {
    /// Tried in this order.
    pub candidates: Vec<u32>,
    pub probe: String,
    pub validator: Validator,
    pub settle_delay: Duration,
    /// Budget for the probe reply. Defaults to the framing's read timeout.
    pub probe_timeout: Option<Duration>,
    /// Everything but the bit rate is taken from here.
    pub framing: FramingConfig,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            candidates: crate::DEFAULT_CANDIDATE_BAUDRATES.to_vec(),
            probe: IDN_QUERY.to_string(),
            validator: any_line(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            probe_timeout: None,
            framing: FramingConfig::default(),
        }
    }
}

impl fmt::Debug for NegotiationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationConfig")
            .field("candidates", &self.candidates)
            .field("probe", &self.probe)
            .field("settle_delay", &self.settle_delay)
            .field("probe_timeout", &self.probe_timeout)
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationResult {
    pub framing: FramingConfig,
    pub identification: String,
}

impl NegotiationResult {
    pub fn ident(&self) -> Result<Ident> {
        Ident::try_from(self.identification.as_str())
    }
}

/// Negotiate against a serial port.
pub async fn negotiate(endpoint: &str, config: &NegotiationConfig) -> Result<NegotiationResult> {
    negotiate_with(&SerialConnector, endpoint, config).await
}

pub async fn negotiate_with(
    connector: &dyn Connector,
    endpoint: &str,
    config: &NegotiationConfig,
) -> Result<NegotiationResult> {
    let probe = Command::new(&config.probe)?;
    let mut attempted = Vec::with_capacity(config.candidates.len());
    let mut last_failure = String::from("no candidate bit rates");

    for &bit_rate in &config.candidates {
        let framing = config.framing.with_bit_rate(bit_rate);
        attempted.push(bit_rate);

        let mut channel = match connector.open(endpoint, &framing) {
            Ok(channel) => channel,
            Err(err @ ProtoError::InvalidFraming(_)) => {
                warn!(endpoint, bit_rate, error = %err, "skipping candidate");
                last_failure = format!("{} baud: {}", bit_rate, err);
                continue;
            }
            Err(err) => return Err(err),
        };

        let outcome = probe_once(&mut channel, &probe.text, config).await;
        channel.close().await;

        match outcome {
            Ok(reply) if (config.validator)(&reply) => {
                info!(endpoint, bit_rate, identification = %reply, "link negotiated");
                return Ok(NegotiationResult {
                    framing,
                    identification: reply,
                });
            }
            Ok(reply) => {
                debug!(endpoint, bit_rate, %reply, "reply rejected");
                last_failure = format!("{} baud: unexpected reply {:?}", bit_rate, reply);
            }
            Err(err) => {
                debug!(endpoint, bit_rate, error = %err, "probe failed");
                last_failure = format!("{} baud: {}", bit_rate, err);
            }
        }
    }

    Err(ProtoError::NegotiationExhausted {
        endpoint: endpoint.to_string(),
        attempted,
        last_failure,
    })
}

async fn probe_once(channel: &mut Channel, probe: &str, config: &NegotiationConfig) -> Result<String> {
    tokio::time::sleep(config.settle_delay).await;
    channel.send_line(probe).await?;

    let budget = config
        .probe_timeout
        .unwrap_or(channel.framing().read_timeout);
    let deadline = Instant::now() + budget;
    loop {
        match tokio::time::timeout_at(deadline, channel.receive_line()).await {
            Err(_) => return Err(ProtoError::ReadTimeout(budget)),
            Ok(Ok(Some(line))) if !line.is_empty() => return Ok(line),
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => return Err(err),
        }
    }
}

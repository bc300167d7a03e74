use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Connector, LineWriter, SerialConnector};
use crate::correlator::{Correlator, CorrelatorState, FeedItem, Mode};
use crate::listener::Listener;
use crate::negotiate::{negotiate_with, NegotiationConfig};
use crate::proto::command::Command;
use crate::proto::framing::FramingConfig;
use crate::proto::response::{Ident, Response};
use crate::proto::{ProtoError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    pub mode: Mode,
    /// How long a command waits for its reply. Defaults to the read timeout.
    pub response_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn streaming() -> Self {
        Self {
            mode: Mode::Streaming,
            ..Self::default()
        }
    }
}

/// An open link to one instrument.
///
/// Owns the channel: the listener task holds the receiving half, the session
/// the sending half. Dropping the session stops the listener.
pub struct Session {
    endpoint: String,
    framing: FramingConfig,
    identification: Option<String>,
    response_timeout: Duration,
    correlator: Arc<Correlator>,
    writer: Mutex<Option<LineWriter>>,
    listener: Mutex<Listener>,
}

impl Session {
    /// Negotiate the bit rate of a serial port and open a session on it.
    pub async fn open(endpoint: &str, negotiation: &NegotiationConfig, config: SessionConfig) -> Result<Self> {
        Self::open_with(&SerialConnector, endpoint, negotiation, config).await
    }

    pub async fn open_with(
        connector: &dyn Connector,
        endpoint: &str,
        negotiation: &NegotiationConfig,
        config: SessionConfig,
    ) -> Result<Self> {
        let negotiated = negotiate_with(connector, endpoint, negotiation).await?;
        let channel = connector.open(endpoint, &negotiated.framing)?;
        let mut session = Self::from_channel(channel, config)?;
        session.identification = Some(negotiated.identification);
        Ok(session)
    }

    /// Start a session on an already open channel.
    pub fn from_channel(channel: Channel, config: SessionConfig) -> Result<Self> {
        let endpoint = channel.endpoint().to_string();
        let framing = *channel.framing();
        let (reader, writer) = channel.into_split()?;

        let correlator = Arc::new(Correlator::new(config.mode));
        let listener = Listener::spawn(reader, correlator.clone());
        info!(endpoint = %endpoint, %framing, mode = config.mode.as_str(), "session open");

        Ok(Self {
            endpoint,
            framing,
            identification: None,
            response_timeout: config.response_timeout.unwrap_or(framing.read_timeout),
            correlator,
            writer: Mutex::new(Some(writer)),
            listener: Mutex::new(listener),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn framing(&self) -> &FramingConfig {
        &self.framing
    }

    pub fn mode(&self) -> Mode {
        self.correlator.mode()
    }

    /// The probe reply seen during negotiation, if the session was negotiated.
    pub fn identification(&self) -> Option<&str> {
        self.identification.as_deref()
    }

    pub fn ident(&self) -> Option<Ident> {
        self.identification
            .as_deref()
            .and_then(|id| Ident::try_from(id).ok())
    }

    pub fn state(&self) -> CorrelatorState {
        self.correlator.state()
    }

    pub fn is_closed(&self) -> bool {
        self.correlator.is_closed()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.correlator.close_reason()
    }

    /// Send a command and wait for the line that answers it.
    pub async fn send_command(&self, text: &str) -> Result<Response> {
        let pending = self.correlator.begin(text)?;
        self.write(&pending.command().text).await?;
        pending.wait(self.response_timeout).await
    }

    /// Run `commands` one after another, stopping at the first failure.
    pub async fn query_all<I, S>(&self, commands: I) -> Result<Vec<Response>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut responses = Vec::new();
        for command in commands {
            responses.push(self.send_command(command.as_ref()).await?);
        }
        Ok(responses)
    }

    /// Write a line without waiting for anything. Streaming sessions only.
    pub async fn send_line(&self, text: &str) -> Result<()> {
        if self.mode() != Mode::Streaming {
            return Err(ProtoError::ModeMismatch {
                expected: Mode::Streaming.as_str(),
                actual: self.mode().as_str(),
            });
        }
        self.correlator.ensure_open()?;
        let command = Command::new(text)?;
        self.write(&command.text).await
    }

    /// Live feed of inbound lines. Streaming sessions only.
    ///
    /// Lines that arrive before the first subscription are held, up to
    /// [`FEED_BACKLOG`](crate::correlator::FEED_BACKLOG) of the most recent.
    /// Ends when the session closes; a link failure is reported as a final
    /// `SessionClosed` item.
    pub fn subscribe(&self) -> Result<impl Stream<Item = FeedItem> + Send + 'static> {
        let mut rx = self.correlator.subscribe()?;
        Ok(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        })
    }

    async fn write(&self, text: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let result = match writer.as_mut() {
            Some(writer) => {
                let result = writer.send_line(text).await;
                if matches!(result, Err(ProtoError::WriteTimeout { .. })) && writer.left_partial_line() {
                    // Replies can no longer be attributed once a fragment is on the wire.
                    warn!(endpoint = %self.endpoint, command = text, "partial line sent, closing session");
                    self.correlator.close(Some(format!(
                        "write of {:?} timed out after part of it was sent",
                        text
                    )));
                }
                result
            }
            None => Err(ProtoError::SessionClosed {
                reason: self.correlator.close_reason(),
            }),
        };
        if let Err(err) = &result {
            if err.is_fatal() {
                self.correlator.close(Some(err.to_string()));
            }
        }
        result
    }

    /// Stop the listener and release the channel. Calling it again does nothing.
    pub async fn close(&self) {
        if self.correlator.close(None) {
            debug!(endpoint = %self.endpoint, "closing session");
        }
        self.listener.lock().await.stop().await;
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(err) = writer.shutdown().await {
                debug!(endpoint = %self.endpoint, error = %err, "shutdown failed");
            }
            info!(endpoint = %self.endpoint, "session closed");
        }
    }
}

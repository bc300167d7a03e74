use bytes::BufMut;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_serial::{SerialPort, SerialPortBuilderExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::proto::codec::{is_valid_command, InboundLine, LineCodec, LINE_DELIMITER};
use crate::proto::framing::FramingConfig;
use crate::proto::{ProtoError, Result};

pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

type BoxedTransport = Box<dyn Transport>;

/// Something that can claim an endpoint and hand out a [`Channel`] for it.
pub trait Connector: Send + Sync {
    fn open(&self, endpoint: &str, framing: &FramingConfig) -> Result<Channel>;
}

/// Opens real serial ports through tokio-serial.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(&self, endpoint: &str, framing: &FramingConfig) -> Result<Channel> {
        framing.validate()?;
        debug!(endpoint, %framing, "opening serial port");

        #[allow(unused_mut)]
        let mut port = tokio_serial::new(endpoint, framing.bit_rate)
            .data_bits(framing.data_bits.into())
            .parity(framing.parity.into())
            .stop_bits(framing.stop_bits.into())
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(framing.read_timeout)
            .open_native_async()
            .map_err(|source| link_error(endpoint, source))?;

        #[cfg(unix)]
        port.set_exclusive(true)
            .map_err(|source| link_error(endpoint, source))?;

        // Drop whatever the instrument sent before we were listening.
        port.clear(tokio_serial::ClearBuffer::All)?;

        Ok(Channel::from_transport(endpoint, *framing, port))
    }
}

fn link_error(endpoint: &str, source: tokio_serial::Error) -> ProtoError {
    match source.kind() {
        tokio_serial::ErrorKind::InvalidInput => ProtoError::InvalidFraming(source.to_string()),
        _ => ProtoError::LinkUnavailable {
            endpoint: endpoint.to_string(),
            source,
        },
    }
}

/// Receiving direction of a channel.
pub struct LineReader {
    inner: FramedRead<ReadHalf<BoxedTransport>, LineCodec>,
    read_timeout: Duration,
}

impl LineReader {
    /// Wait for the next line. `Ok(None)` means the read timeout elapsed
    /// without a complete line, which is the normal idle outcome.
    pub async fn receive_line(&mut self) -> Result<Option<String>> {
        match tokio::time::timeout(self.read_timeout, self.inner.next()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(InboundLine::Text(line)))) => {
                trace!(%line, "received");
                Ok(Some(line))
            }
            Ok(Some(Ok(InboundLine::Malformed { raw, reason }))) => {
                warn!(?raw, reason, "malformed line");
                Err(ProtoError::MalformedLine { raw, reason })
            }
            Ok(Some(Err(ioerr))) => Err(ioerr.into()),
            Ok(None) => Err(ProtoError::Disconnected),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

/// Sending direction of a channel.
pub struct LineWriter {
    inner: FramedWrite<WriteHalf<BoxedTransport>, LineCodec>,
    write_timeout: Duration,
    // A timed out line reached the wire only in part.
    torn: bool,
}

impl LineWriter {
    /// Write one line. On `WriteTimeout` the unsent rest of the line is
    /// discarded, so it never precedes a later line.
    pub async fn send_line(&mut self, text: &str) -> Result<()> {
        if !is_valid_command(text) {
            return Err(ProtoError::InvalidCommand(text.to_string()));
        }
        if self.torn {
            // Terminate the fragment instead of gluing it to this line.
            self.inner.write_buffer_mut().put_u8(LINE_DELIMITER);
        }
        let encoded = self.inner.write_buffer().len() + text.len() + 1;
        self.inner.feed(text).await?;

        let flushed = tokio::time::timeout(self.write_timeout, SinkExt::<&str>::flush(&mut self.inner)).await;
        match flushed {
            Err(_) => {
                let unsent = self.inner.write_buffer().len();
                self.inner.write_buffer_mut().clear();
                self.torn = self.torn || unsent < encoded;
                warn!(command = text, timeout = ?self.write_timeout, partial = self.torn, "write timeout");
                Err(ProtoError::WriteTimeout {
                    command: text.to_string(),
                    timeout: self.write_timeout,
                })
            }
            Ok(res) => {
                res?;
                self.torn = false;
                trace!(command = text, "sent");
                Ok(())
            }
        }
    }

    /// True after a write timed out with part of its line already sent.
    /// Cleared by the next successful write.
    pub fn left_partial_line(&self) -> bool {
        self.torn
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        SinkExt::<&str>::close(&mut self.inner).await?;
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }
}

/// A byte stream with fixed framing and line-based send/receive.
pub struct Channel {
    endpoint: String,
    framing: FramingConfig,
    reader: Option<LineReader>,
    writer: Option<LineWriter>,
}

impl Channel {
    /// Open a serial endpoint.
    pub fn open(endpoint: impl AsRef<str>, framing: FramingConfig) -> Result<Self> {
        SerialConnector.open(endpoint.as_ref(), &framing)
    }

    /// Wrap an already claimed byte stream.
    pub fn from_transport<T>(endpoint: impl Into<String>, framing: FramingConfig, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        let boxed: BoxedTransport = Box::new(transport);
        let (read_half, write_half) = tokio::io::split(boxed);
        Self {
            endpoint: endpoint.into(),
            framing,
            reader: Some(LineReader {
                inner: FramedRead::new(read_half, LineCodec::default()),
                read_timeout: framing.read_timeout,
            }),
            writer: Some(LineWriter {
                inner: FramedWrite::new(write_half, LineCodec::default()),
                write_timeout: framing.write_timeout,
                torn: false,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn framing(&self) -> &FramingConfig {
        &self.framing
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some() && self.writer.is_some()
    }

    pub async fn send_line(&mut self, text: &str) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.send_line(text).await,
            None => Err(ProtoError::closed("channel is closed")),
        }
    }

    pub async fn receive_line(&mut self) -> Result<Option<String>> {
        match self.reader.as_mut() {
            Some(reader) => reader.receive_line().await,
            None => Err(ProtoError::closed("channel is closed")),
        }
    }

    /// Like [`Channel::receive_line`], but a timeout is an error.
    pub async fn expect_line(&mut self) -> Result<String> {
        match self.receive_line().await? {
            Some(line) => Ok(line),
            None => Err(ProtoError::ReadTimeout(self.framing.read_timeout)),
        }
    }

    /// Release the endpoint. Calling it again does nothing.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.shutdown().await {
                debug!(endpoint = %self.endpoint, error = %err, "shutdown failed");
            }
        }
        if self.reader.take().is_some() {
            debug!(endpoint = %self.endpoint, "channel closed");
        }
    }

    /// Hand the two directions to independent owners.
    pub fn into_split(mut self) -> Result<(LineReader, LineWriter)> {
        match (self.reader.take(), self.writer.take()) {
            (Some(reader), Some(writer)) => Ok((reader, writer)),
            _ => Err(ProtoError::closed("channel is closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn pair(timeout: Duration) -> (Channel, DuplexStream) {
        let (client, server) = tokio::io::duplex(256);
        let framing = FramingConfig {
            read_timeout: timeout,
            write_timeout: timeout,
            ..FramingConfig::default()
        };
        (Channel::from_transport("fake0", framing, client), server)
    }

    #[tokio::test]
    async fn send_appends_delimiter() {
        let (mut channel, mut server) = pair(Duration::from_millis(200));
        channel.send_line("*IDN?").await.unwrap();
        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"*IDN?\n");
    }

    #[tokio::test]
    async fn receive_strips_crlf() {
        let (mut channel, mut server) = pair(Duration::from_millis(200));
        server.write_all(b"+1.0E+0 VDC\r\n").await.unwrap();
        assert_eq!(
            channel.receive_line().await.unwrap().as_deref(),
            Some("+1.0E+0 VDC")
        );
    }

    #[tokio::test]
    async fn receive_timeout_is_not_an_error() {
        let (mut channel, _server) = pair(Duration::from_millis(30));
        assert_eq!(channel.receive_line().await.unwrap(), None);
        assert!(matches!(
            channel.expect_line().await,
            Err(ProtoError::ReadTimeout(_))
        ));
    }

    #[tokio::test]
    async fn eof_is_disconnect() {
        let (mut channel, server) = pair(Duration::from_millis(200));
        drop(server);
        let err = channel.receive_line().await.unwrap_err();
        assert!(matches!(err, ProtoError::Disconnected));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn malformed_line_is_reported_and_stream_continues() {
        let (mut channel, mut server) = pair(Duration::from_millis(200));
        server.write_all(b"\xff\xfe\nOK\n").await.unwrap();
        assert!(matches!(
            channel.receive_line().await,
            Err(ProtoError::MalformedLine { .. })
        ));
        assert_eq!(channel.receive_line().await.unwrap().as_deref(), Some("OK"));
    }

    #[tokio::test]
    async fn write_timeout_when_peer_stalls() {
        // A 16 byte pipe nobody drains fills up quickly.
        let (client, _server) = tokio::io::duplex(16);
        let framing = FramingConfig {
            write_timeout: Duration::from_millis(30),
            ..FramingConfig::default()
        };
        let mut channel = Channel::from_transport("fake0", framing, client);
        let err = channel
            .send_line("MEASure:VOLTage:DC? 10,0.001")
            .await
            .unwrap_err();
        assert!(matches!(err, ProtoError::WriteTimeout { .. }));
    }

    #[tokio::test]
    async fn timed_out_rest_is_never_sent() {
        let (client, server) = tokio::io::duplex(16);
        let framing = FramingConfig {
            write_timeout: Duration::from_millis(30),
            ..FramingConfig::default()
        };
        let mut channel = Channel::from_transport("fake0", framing, client);
        assert!(matches!(
            channel.send_line("MEASure:VOLTage:DC? 10,0.001").await,
            Err(ProtoError::WriteTimeout { .. })
        ));

        let mut lines = BufReader::new(server).lines();
        let (sent, seen) = tokio::join!(channel.send_line("VAL1?"), async {
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            (first, second)
        });
        sent.unwrap();
        assert_eq!(seen.0, "MEASure:VOLTage:");
        assert_eq!(seen.1, "VAL1?");
    }

    #[tokio::test]
    async fn unsent_line_is_dropped_whole() {
        let (client, server) = tokio::io::duplex(16);
        let framing = FramingConfig {
            write_timeout: Duration::from_millis(30),
            ..FramingConfig::default()
        };
        let (_reader, mut writer) = Channel::from_transport("fake0", framing, client)
            .into_split()
            .unwrap();
        // Exactly fills the pipe.
        writer.send_line("0123456789ABCDE").await.unwrap();
        assert!(matches!(
            writer.send_line("VAL1?").await,
            Err(ProtoError::WriteTimeout { .. })
        ));
        assert!(!writer.left_partial_line());

        let mut lines = BufReader::new(server).lines();
        let (sent, seen) = tokio::join!(writer.send_line("VAL2?"), async {
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            (first, second)
        });
        sent.unwrap();
        assert_eq!(seen.0, "0123456789ABCDE");
        assert_eq!(seen.1, "VAL2?");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut channel, _server) = pair(Duration::from_millis(200));
        assert!(channel.is_open());
        channel.close().await;
        channel.close().await;
        assert!(!channel.is_open());
        assert!(matches!(
            channel.send_line("*IDN?").await,
            Err(ProtoError::SessionClosed { .. })
        ));
    }
}

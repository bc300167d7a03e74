use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf};

use super::framing::FramingConfig;
use super::{ProtoError, Result};
use crate::channel::{Channel, Connector};

pub(crate) type Responder = Arc<dyn Fn(u32, &str) -> Vec<String> + Send + Sync>;

/// Client side of an in-memory link. Counts itself out when dropped.
pub(crate) struct FakeEndpoint {
    inner: DuplexStream,
    open: Arc<AtomicUsize>,
}

impl Drop for FakeEndpoint {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for FakeEndpoint {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FakeEndpoint {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, std::io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Answer every received line through `responder` until the client goes away.
pub(crate) fn spawn_instrument(remote: DuplexStream, bit_rate: u32, responder: Responder) {
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(remote);
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            for reply in responder(bit_rate, line.trim()) {
                let framed = format!("{}\r\n", reply);
                if write_half.write_all(framed.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });
}

/// A channel whose far end is handed back to the test.
pub(crate) fn link(framing: FramingConfig) -> (Channel, DuplexStream) {
    let (client, remote) = tokio::io::duplex(1024);
    (Channel::from_transport("fake0", framing, client), remote)
}

/// A channel backed by a scripted instrument.
pub(crate) fn scripted(
    framing: FramingConfig,
    responder: impl Fn(u32, &str) -> Vec<String> + Send + Sync + 'static,
) -> Channel {
    let (channel, remote) = link(framing);
    spawn_instrument(remote, framing.bit_rate, Arc::new(responder));
    channel
}

/// Connector for in-memory instruments that keeps track of every channel it opened.
#[derive(Clone)]
pub(crate) struct FakeConnector {
    responder: Responder,
    attempts: Arc<Mutex<Vec<u32>>>,
    open: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
    unavailable: bool,
}

impl FakeConnector {
    pub(crate) fn new(responder: impl Fn(u32, &str) -> Vec<String> + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            attempts: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(AtomicUsize::new(0)),
            max_open: Arc::new(AtomicUsize::new(0)),
            unavailable: false,
        }
    }

    /// Identifies itself with `ident` at `bit_rate` only; line noise elsewhere.
    pub(crate) fn answering_at(bit_rate: u32, ident: &'static str) -> Self {
        Self::new(move |rate, line| match (rate == bit_rate, line) {
            (true, "*IDN?") => vec![ident.to_string()],
            (true, _) => vec!["+1.00000E+0".to_string()],
            (false, _) => vec!["\u{7f}?x".to_string()],
        })
    }

    pub(crate) fn silent() -> Self {
        Self::new(|_, _| Vec::new())
    }

    pub(crate) fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::silent()
        }
    }

    pub(crate) fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().expect("attempts lock").clone()
    }

    pub(crate) fn open_channels(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn open(&self, endpoint: &str, framing: &FramingConfig) -> Result<Channel> {
        if self.unavailable {
            return Err(ProtoError::LinkUnavailable {
                endpoint: endpoint.to_string(),
                source: tokio_serial::Error::new(tokio_serial::ErrorKind::NoDevice, "no such device"),
            });
        }
        self.attempts
            .lock()
            .expect("attempts lock")
            .push(framing.bit_rate);
        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);

        let (client, remote) = tokio::io::duplex(1024);
        spawn_instrument(remote, framing.bit_rate, self.responder.clone());
        let endpoint_io = FakeEndpoint {
            inner: client,
            open: self.open.clone(),
        };
        Ok(Channel::from_transport(endpoint, *framing, endpoint_io))
    }
}

//! Request/response correlation.
//!
//! The wire protocol carries no request identifiers, so a reply can only be
//! attributed by order. In request/response mode at most one command is
//! outstanding and the first line that arrives answers it. In streaming mode
//! nothing is correlated and every line goes to the subscribers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::proto::command::Command;
use crate::proto::response::Response;
use crate::proto::{ProtoError, Result};

/// Chosen once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    RequestResponse,
    Streaming,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestResponse => "request/response",
            Self::Streaming => "streaming",
        }
    }
}

/// Observable correlator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    Idle,
    AwaitingResponse,
    Closed,
}

pub type FeedItem = Result<Response>;

enum State {
    Idle,
    Awaiting {
        ticket: u64,
        command: Command,
        reply: oneshot::Sender<Result<Response>>,
    },
    Closed {
        reason: Option<String>,
    },
}

/// Lines kept for the first subscriber of a streaming session; older ones
/// are dropped.
pub const FEED_BACKLOG: usize = 1024;

struct Feed {
    // Lines received before the first subscription.
    backlog: Option<VecDeque<FeedItem>>,
    senders: Vec<mpsc::UnboundedSender<FeedItem>>,
}

impl Feed {
    fn new() -> Self {
        Self {
            backlog: Some(VecDeque::new()),
            senders: Vec::new(),
        }
    }

    fn publish(&mut self, make: impl Fn() -> FeedItem) {
        if let Some(backlog) = self.backlog.as_mut() {
            if backlog.len() == FEED_BACKLOG {
                backlog.pop_front();
                trace!("feed backlog full, dropping oldest line");
            }
            backlog.push_back(make());
        }
        self.senders.retain(|tx| tx.send(make()).is_ok());
    }
}

struct Inner {
    state: State,
    next_ticket: u64,
    feed: Feed,
}

pub struct Correlator {
    mode: Mode,
    inner: Mutex<Inner>,
}

/// The single-flight slot of one outstanding command.
///
/// Dropping it before the reply arrived frees the slot again.
pub struct Pending<'a> {
    correlator: &'a Correlator,
    ticket: u64,
    command: Command,
    since: Instant,
    reply: oneshot::Receiver<Result<Response>>,
}

impl Correlator {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            inner: Mutex::new(Inner {
                state: State::Idle,
                next_ticket: 0,
                feed: Feed::new(),
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require(&self, expected: Mode) -> Result<()> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(ProtoError::ModeMismatch {
                expected: expected.as_str(),
                actual: self.mode.as_str(),
            })
        }
    }

    pub fn state(&self) -> CorrelatorState {
        match self.lock().state {
            State::Idle => CorrelatorState::Idle,
            State::Awaiting { .. } => CorrelatorState::AwaitingResponse,
            State::Closed { .. } => CorrelatorState::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CorrelatorState::Closed
    }

    /// Why the correlator was closed, if a failure closed it.
    pub fn close_reason(&self) -> Option<String> {
        match &self.lock().state {
            State::Closed { reason } => reason.clone(),
            _ => None,
        }
    }

    /// Fails with `SessionClosed` once closed.
    pub fn ensure_open(&self) -> Result<()> {
        match &self.lock().state {
            State::Closed { reason } => Err(ProtoError::SessionClosed {
                reason: reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Claim the single-flight slot for `text`.
    pub fn begin(&self, text: &str) -> Result<Pending<'_>> {
        self.require(Mode::RequestResponse)?;
        let mut inner = self.lock();
        match &inner.state {
            State::Closed { reason } => {
                return Err(ProtoError::SessionClosed {
                    reason: reason.clone(),
                })
            }
            State::Awaiting { command, .. } => {
                return Err(ProtoError::AlreadyOutstanding {
                    outstanding: command.text.clone(),
                })
            }
            State::Idle => {}
        }

        let command = Command::new(text)?;
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        inner.state = State::Awaiting {
            ticket,
            command: command.clone(),
            reply: tx,
        };
        trace!(ticket, command = %command.text, "awaiting response");

        Ok(Pending {
            correlator: self,
            ticket,
            command,
            since: Instant::now(),
            reply: rx,
        })
    }

    /// Return to `Idle` if `ticket` still holds the slot.
    fn release(&self, ticket: u64) -> bool {
        let mut inner = self.lock();
        let holds = matches!(inner.state, State::Awaiting { ticket: t, .. } if t == ticket);
        if holds {
            inner.state = State::Idle;
        }
        holds
    }

    /// An inbound line from the listener.
    pub fn on_line(&self, text: String) {
        let mut inner = self.lock();
        if self.mode == Mode::Streaming {
            if matches!(inner.state, State::Closed { .. }) {
                return;
            }
            let response = Response::unsolicited(text);
            inner.feed.publish(|| Ok(response.clone()));
            return;
        }

        match std::mem::replace(&mut inner.state, State::Idle) {
            State::Awaiting { command, reply, .. } => {
                debug!(command = %command.text, response = %text, "correlated");
                if reply.send(Ok(Response::correlated(text, command))).is_err() {
                    debug!("requester went away before the response arrived");
                }
            }
            State::Idle => {
                warn!(line = %text, "discarding unsolicited line");
            }
            closed @ State::Closed { .. } => {
                inner.state = closed;
                trace!(line = %text, "line after close");
            }
        }
    }

    /// Inbound bytes that did not form a valid line.
    pub fn on_malformed(&self, raw: Vec<u8>, reason: &'static str) {
        let mut inner = self.lock();
        if self.mode == Mode::Streaming {
            if !matches!(inner.state, State::Closed { .. }) {
                inner.feed.publish(|| {
                    Err(ProtoError::MalformedLine {
                        raw: raw.clone(),
                        reason,
                    })
                });
            }
            return;
        }

        match std::mem::replace(&mut inner.state, State::Idle) {
            State::Awaiting { reply, .. } => {
                let _ = reply.send(Err(ProtoError::MalformedLine { raw, reason }));
            }
            State::Idle => {
                warn!(?raw, reason, "discarding malformed line");
            }
            closed @ State::Closed { .. } => inner.state = closed,
        }
    }

    /// Move to `Closed`. The outstanding command and all feeds learn about it.
    /// Returns false if it was closed already.
    pub fn close(&self, reason: Option<String>) -> bool {
        let mut inner = self.lock();
        let previous = std::mem::replace(
            &mut inner.state,
            State::Closed {
                reason: reason.clone(),
            },
        );
        match previous {
            closed @ State::Closed { .. } => {
                inner.state = closed;
                return false;
            }
            State::Awaiting { command, reply, .. } => {
                debug!(command = %command.text, "failing outstanding command");
                let _ = reply.send(Err(ProtoError::SessionClosed {
                    reason: reason.clone(),
                }));
            }
            State::Idle => {}
        }

        if reason.is_some() {
            inner.feed.publish(|| {
                Err(ProtoError::SessionClosed {
                    reason: reason.clone(),
                })
            });
        }
        inner.feed.senders.clear();
        true
    }

    /// Inbound feed of a streaming session. The first subscriber also gets
    /// the last [`FEED_BACKLOG`] lines received before it subscribed.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<FeedItem>> {
        self.require(Mode::Streaming)?;
        let mut inner = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(backlog) = inner.feed.backlog.take() {
            for item in backlog {
                let _ = tx.send(item);
            }
        }
        if !matches!(inner.state, State::Closed { .. }) {
            inner.feed.senders.push(tx);
        }
        Ok(rx)
    }
}

impl<'a> Pending<'a> {
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Wait for the correlated reply.
    pub async fn wait(mut self, timeout: Duration) -> Result<Response> {
        match tokio::time::timeout(timeout, &mut self.reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                if self.correlator.release(self.ticket) {
                    let elapsed = self.since.elapsed();
                    warn!(command = %self.command.text, ?elapsed, "response timeout");
                    Err(ProtoError::ResponseTimeout {
                        command: self.command.text.clone(),
                        elapsed,
                    })
                } else {
                    // Resolved between the timer firing and taking the lock.
                    self.reply.try_recv().unwrap_or_else(|_| Err(self.closed_error()))
                }
            }
        }
    }

    fn closed_error(&self) -> ProtoError {
        ProtoError::SessionClosed {
            reason: self.correlator.close_reason(),
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.correlator.release(self.ticket) {
            debug!(command = %self.command.text, "outstanding command abandoned");
        }
    }
}

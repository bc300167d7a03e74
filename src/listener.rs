use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::LineReader;
use crate::correlator::Correlator;
use crate::proto::ProtoError;

/// Background task draining inbound lines into a [`Correlator`].
///
/// Runs until stopped or until the channel fails; a fatal read error closes
/// the correlator with the error as reason.
pub struct Listener {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn spawn(reader: LineReader, correlator: Arc<Correlator>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(reader, correlator, shutdown_rx));
        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the task and wait for it. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "listener task failed");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run(mut reader: LineReader, correlator: Arc<Correlator>, mut shutdown_rx: watch::Receiver<bool>) {
    debug!("listener started");
    loop {
        let received = tokio::select! {
            received = reader.receive_line() => received,
            _ = shutdown_rx.changed() => {
                debug!("listener stopping");
                break;
            }
        };

        match received {
            Ok(Some(line)) if !line.is_empty() => correlator.on_line(line),
            Ok(_) => continue,
            Err(ProtoError::MalformedLine { raw, reason }) => correlator.on_malformed(raw, reason),
            Err(err) if err.is_fatal() => {
                warn!(error = %err, "link failed, closing session");
                correlator.close(Some(err.to_string()));
                break;
            }
            Err(err) => warn!(error = %err, "read failed"),
        }
    }
}

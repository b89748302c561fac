//! Single-flight transport control with an inactivity watchdog

use super::FrameStream;
use crate::error::{StreamError, StreamErrorKind};
use crate::protocol::Frame;
use crate::timer::Watchdog;
use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identity of one opened transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Raw signal from a reader task or the watchdog
#[derive(Debug)]
pub struct TransportSignal {
    pub transport: TransportId,
    pub kind: SignalKind,
}

#[derive(Debug)]
pub enum SignalKind {
    Frame(Frame),
    Failed(StreamError),
    /// The server ended the stream
    Closed,
    /// No inbound frame within the inactivity window
    Inactive,
}

/// A signal admitted by [`TransportGuard::filter`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(Frame),
    /// Terminal failure; the transport is already released
    Failed(StreamError),
    /// Terminal close; the transport is already released
    Closed,
}

struct Active {
    id: TransportId,
    key: String,
    token: CancellationToken,
    watchdog: Watchdog,
}

impl Active {
    fn shutdown(self) {
        self.token.cancel();
        self.watchdog.cancel();
    }
}

/// Keeps at most one streaming connection open.
///
/// Reader tasks never call back into the owner; they push
/// [`TransportSignal`]s onto the channel returned by [`TransportGuard::new`]
/// and the owner passes each one through [`TransportGuard::filter`], which
/// drops everything from transports that are no longer active.
pub struct TransportGuard {
    inactivity: Duration,
    next_id: u64,
    active: Option<Active>,
    signal_tx: mpsc::UnboundedSender<TransportSignal>,
}

impl TransportGuard {
    pub fn new(inactivity: Duration) -> (Self, mpsc::UnboundedReceiver<TransportSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let guard = Self {
            inactivity,
            next_id: 0,
            active: None,
            signal_tx,
        };
        (guard, signal_rx)
    }

    /// Open a transport for `key` unless one is already open for it.
    ///
    /// Returns `None` when `key` is already active. A transport for a
    /// different key is cancelled before the new one is opened.
    pub fn start_exclusive<F, Fut>(&mut self, key: &str, open: F) -> Option<TransportId>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FrameStream, StreamError>> + Send + 'static,
    {
        if self.active_key() == Some(key) {
            tracing::debug!(key = %key, "Transport already open for key");
            return None;
        }
        if let Some(previous) = self.active.take() {
            tracing::info!(
                transport = %previous.id,
                key = %previous.key,
                "Cancelling transport superseded by new key"
            );
            previous.shutdown();
        }

        self.next_id += 1;
        let id = TransportId(self.next_id);
        let token = CancellationToken::new();

        let expired_tx = self.signal_tx.clone();
        let watchdog = Watchdog::start(self.inactivity, move || {
            let _ = expired_tx.send(TransportSignal {
                transport: id,
                kind: SignalKind::Inactive,
            });
        });

        tokio::spawn(pump(id, open(), token.clone(), self.signal_tx.clone()));
        tracing::debug!(transport = %id, key = %key, "Transport opened");

        self.active = Some(Active {
            id,
            key: key.to_string(),
            token,
            watchdog,
        });
        Some(id)
    }

    /// Admit a signal from the active transport, dropping stale ones.
    ///
    /// Terminal signals release the transport, so each transport yields at
    /// most one `Failed` or `Closed`.
    pub fn filter(&mut self, signal: TransportSignal) -> Option<TransportEvent> {
        let active = self.active.as_ref()?;
        if active.id != signal.transport {
            tracing::trace!(transport = %signal.transport, "Dropping signal from stale transport");
            return None;
        }

        match signal.kind {
            SignalKind::Frame(frame) => {
                active.watchdog.kick();
                Some(TransportEvent::Frame(frame))
            }
            SignalKind::Failed(error) => {
                self.release();
                Some(TransportEvent::Failed(error))
            }
            SignalKind::Closed => {
                self.release();
                Some(TransportEvent::Closed)
            }
            SignalKind::Inactive => {
                tracing::warn!(
                    transport = %signal.transport,
                    timeout_secs = self.inactivity.as_secs(),
                    "Transport inactive, cancelling"
                );
                self.release();
                Some(TransportEvent::Failed(StreamError::inactive(format!(
                    "no activity for {}s",
                    self.inactivity.as_secs()
                ))))
            }
        }
    }

    /// Close the active transport, if any. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(transport = %active.id, key = %active.key, "Transport cancelled");
            active.shutdown();
        }
    }

    pub fn active_key(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.key.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn release(&mut self) {
        if let Some(active) = self.active.take() {
            active.shutdown();
        }
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Reader task: forwards frames until the stream ends or is cancelled
async fn pump<Fut>(
    id: TransportId,
    open: Fut,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<TransportSignal>,
) where
    Fut: Future<Output = Result<FrameStream, StreamError>>,
{
    let send = |kind| {
        let _ = tx.send(TransportSignal {
            transport: id,
            kind,
        });
    };

    let opened = tokio::select! {
        biased;
        () = token.cancelled() => return,
        opened = open => opened,
    };
    let mut frames = match opened {
        Ok(frames) => frames,
        Err(e) => {
            send(SignalKind::Failed(e));
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            () = token.cancelled() => return,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => send(SignalKind::Frame(frame)),
            Some(Err(e)) if e.kind == StreamErrorKind::Protocol => {
                tracing::warn!(transport = %id, error = %e, "Dropping malformed frame");
            }
            Some(Err(e)) => {
                send(SignalKind::Failed(e));
                return;
            }
            None => {
                send(SignalKind::Closed);
                return;
            }
        }
    }
}

//! Per-stream callbacks

use crate::error::StreamError;
use crate::store::Turn;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Hooks invoked by the driver for one stream.
///
/// Every method defaults to a no-op. Exactly one of `on_complete`,
/// `on_error` or `on_cancelled` is invoked per stream, and nothing is
/// invoked after it.
pub trait StreamCallbacks: Send + 'static {
    fn on_open(&mut self) {}

    fn on_first_fragment(&mut self, _turn_id: &str) {}

    fn on_meta(&mut self, _meta: &Value) {}

    fn on_limit(&mut self, _limit: &Value) {}

    /// A retry is scheduled; `attempt` counts from 1
    fn on_retry(&mut self, _attempt: u32, _delay: Duration, _error: &StreamError) {}

    fn on_complete(&mut self, _turn: &Turn) {}

    fn on_error(&mut self, _error: &StreamError) {}

    /// Stopped by the caller or superseded by a newer stream
    fn on_cancelled(&mut self) {}
}

/// Callbacks that ignore everything
impl StreamCallbacks for () {}

/// Callback invocations as values
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    Open,
    FirstFragment { turn_id: String },
    Meta(Value),
    Limit(Value),
    Retry {
        attempt: u32,
        delay: Duration,
        error: StreamError,
    },
    Complete(Turn),
    Error(StreamError),
    Cancelled,
}

impl CallbackEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_) | Self::Cancelled)
    }
}

/// Forwards every callback onto a channel
pub struct ChannelCallbacks {
    tx: mpsc::UnboundedSender<CallbackEvent>,
}

impl ChannelCallbacks {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallbackEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: CallbackEvent) {
        let _ = self.tx.send(event);
    }
}

impl StreamCallbacks for ChannelCallbacks {
    fn on_open(&mut self) {
        self.emit(CallbackEvent::Open);
    }

    fn on_first_fragment(&mut self, turn_id: &str) {
        self.emit(CallbackEvent::FirstFragment {
            turn_id: turn_id.to_string(),
        });
    }

    fn on_meta(&mut self, meta: &Value) {
        self.emit(CallbackEvent::Meta(meta.clone()));
    }

    fn on_limit(&mut self, limit: &Value) {
        self.emit(CallbackEvent::Limit(limit.clone()));
    }

    fn on_retry(&mut self, attempt: u32, delay: Duration, error: &StreamError) {
        self.emit(CallbackEvent::Retry {
            attempt,
            delay,
            error: error.clone(),
        });
    }

    fn on_complete(&mut self, turn: &Turn) {
        self.emit(CallbackEvent::Complete(turn.clone()));
    }

    fn on_error(&mut self, error: &StreamError) {
        self.emit(CallbackEvent::Error(error.clone()));
    }

    fn on_cancelled(&mut self) {
        self.emit(CallbackEvent::Cancelled);
    }
}

//! Connection driver
//!
//! One tokio task per conversation owns the transport guard, the turn
//! store and every stream timer. [`StreamClient`] is the cloneable handle
//! the rest of the application talks to; it never touches the transport
//! directly.

mod callbacks;
mod executor;
mod health;
mod session;

#[cfg(test)]
pub mod testing;

pub use callbacks::{CallbackEvent, ChannelCallbacks, StreamCallbacks};
pub use health::ConnectionHealth;
pub use session::{Admission, StreamSession};

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::mode::ModeMachine;
use crate::store::{Outcome, Turn, TurnStore};
use crate::transport::FrameSource;
use executor::StreamDriver;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Observable state of the driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub is_streaming: bool,
    pub is_connecting: bool,
    pub is_retrying: bool,
    pub retry_count: u32,
    pub connection_health: ConnectionHealth,
}

/// Options for [`StreamClient::start_stream`]
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Assistant turn to fill; a fresh id is generated when absent
    pub turn_id: Option<String>,
}

impl StreamOptions {
    pub fn for_turn(turn_id: impl Into<String>) -> Self {
        Self {
            turn_id: Some(turn_id.into()),
        }
    }
}

/// Direct edits of the turn store
#[derive(Debug)]
pub(crate) enum StoreOp {
    AddUser { id: String, text: String },
    AddPlaceholder { id: String },
    Finalize { id: String, text: Option<String> },
    SetError { id: String, message: String },
    ClearStreaming,
}

pub(crate) enum Command {
    Start {
        prompt: String,
        options: StreamOptions,
        callbacks: Box<dyn StreamCallbacks>,
        reply: oneshot::Sender<Result<String, StreamError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Store {
        op: StoreOp,
        reply: oneshot::Sender<Outcome>,
    },
}

/// Handle to a running stream driver
#[derive(Clone)]
pub struct StreamClient {
    command_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<StreamStatus>,
    store_rx: watch::Receiver<TurnStore>,
}

impl StreamClient {
    /// Spawn the driver task for one conversation.
    ///
    /// The task stops once every handle has been dropped.
    pub fn spawn<S>(
        config: StreamConfig,
        session_id: impl Into<String>,
        source: S,
        mode: Arc<ModeMachine>,
    ) -> Self
    where
        S: FrameSource + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(StreamStatus::default());
        let (store_tx, store_rx) = watch::channel(TurnStore::new(config.limits));

        let driver = StreamDriver::new(
            config,
            session_id.into(),
            Arc::new(source),
            mode,
            command_rx,
            status_tx,
            store_tx,
        );
        tokio::spawn(driver.run());

        Self {
            command_tx,
            status_rx,
            store_rx,
        }
    }

    /// Start streaming a reply to `prompt`; resolves to the assistant turn id
    pub async fn start_stream(
        &self,
        prompt: impl Into<String>,
        callbacks: impl StreamCallbacks,
        options: StreamOptions,
    ) -> Result<String, StreamError> {
        let prompt = prompt.into();
        let callbacks: Box<dyn StreamCallbacks> = Box::new(callbacks);
        self.request(|reply| Command::Start {
            prompt,
            options,
            callbacks,
            reply,
        })
        .await?
    }

    /// Stop the running stream, keeping what was received. Safe to call
    /// at any time, any number of times.
    pub async fn stop_stream(&self) {
        if self.request(|reply| Command::Stop { reply }).await.is_err() {
            tracing::debug!("Stop requested after the driver stopped");
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.status_rx.borrow().is_streaming
    }

    pub fn is_connecting(&self) -> bool {
        self.status_rx.borrow().is_connecting
    }

    pub fn is_retrying(&self) -> bool {
        self.status_rx.borrow().is_retrying
    }

    pub fn retry_count(&self) -> u32 {
        self.status_rx.borrow().retry_count
    }

    pub fn connection_health(&self) -> ConnectionHealth {
        self.status_rx.borrow().connection_health
    }

    /// Snapshot of the turn store
    pub fn store(&self) -> TurnStore {
        self.store_rx.borrow().clone()
    }

    /// Ordered copy of every turn
    pub fn messages(&self) -> Vec<Turn> {
        self.store_rx.borrow().messages()
    }

    /// Store snapshots; the current one is reported on the first `changed()`
    pub fn subscribe_messages(&self) -> watch::Receiver<TurnStore> {
        let mut rx = self.store_rx.clone();
        rx.mark_changed();
        rx
    }

    /// Status updates; the current one is reported on the first `changed()`
    pub fn subscribe_status(&self) -> watch::Receiver<StreamStatus> {
        let mut rx = self.status_rx.clone();
        rx.mark_changed();
        rx
    }

    pub async fn add_user_message(
        &self,
        id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Outcome, StreamError> {
        self.edit(StoreOp::AddUser {
            id: id.into(),
            text: text.into(),
        })
        .await
    }

    pub async fn add_ai_placeholder(&self, id: impl Into<String>) -> Result<Outcome, StreamError> {
        self.edit(StoreOp::AddPlaceholder { id: id.into() }).await
    }

    pub async fn finalize_message(
        &self,
        id: impl Into<String>,
        text: Option<String>,
    ) -> Result<Outcome, StreamError> {
        self.edit(StoreOp::Finalize { id: id.into(), text }).await
    }

    pub async fn set_error(
        &self,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Outcome, StreamError> {
        self.edit(StoreOp::SetError {
            id: id.into(),
            message: message.into(),
        })
        .await
    }

    pub async fn clear_streaming(&self) -> Result<Outcome, StreamError> {
        self.edit(StoreOp::ClearStreaming).await
    }

    async fn edit(&self, op: StoreOp) -> Result<Outcome, StreamError> {
        self.request(|reply| Command::Store { op, reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, StreamError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StreamError::shutdown())?;
        reply_rx.await.map_err(|_| StreamError::shutdown())
    }
}

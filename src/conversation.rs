//! Conversation composition root
//!
//! Builds the services one conversation needs (mode machine, stream driver,
//! HTTP transport) and ties their lifetime to the [`Conversation`] value.

use crate::config::StreamConfig;
use crate::driver::{StreamCallbacks, StreamClient, StreamOptions};
use crate::error::StreamError;
use crate::mode::ModeMachine;
use crate::transport::{FrameSource, HttpFrameSource};
use std::sync::Arc;
use uuid::Uuid;

pub struct Conversation {
    session_id: String,
    mode: Arc<ModeMachine>,
    client: StreamClient,
}

impl Conversation {
    /// Open a conversation against the configured HTTP endpoint
    pub fn connect(config: StreamConfig) -> Result<Self, StreamError> {
        let source = HttpFrameSource::new(&config)?;
        Ok(Self::with_source(config, source))
    }

    pub fn with_source<S>(config: StreamConfig, source: S) -> Self
    where
        S: FrameSource + 'static,
    {
        let session_id = Uuid::new_v4().to_string();
        let mode = ModeMachine::new();
        let client = StreamClient::spawn(config, session_id.clone(), source, Arc::clone(&mode));
        tracing::info!(session_id = %session_id, "Conversation opened");
        Self {
            session_id,
            mode,
            client,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn mode(&self) -> &Arc<ModeMachine> {
        &self.mode
    }

    pub fn client(&self) -> &StreamClient {
        &self.client
    }

    /// Record the user's prompt and stream the reply into a new assistant turn.
    ///
    /// Resolves to the assistant turn id once the stream has started.
    pub async fn send(
        &self,
        prompt: impl Into<String>,
        callbacks: impl StreamCallbacks,
    ) -> Result<String, StreamError> {
        let prompt = prompt.into();
        let user_id = Uuid::new_v4().to_string();
        let turn_id = Uuid::new_v4().to_string();

        self.client.add_user_message(&user_id, &prompt).await?;
        self.client.add_ai_placeholder(&turn_id).await?;
        self.client
            .start_stream(prompt, callbacks, StreamOptions::for_turn(turn_id))
            .await
    }

    /// Stop any running stream
    pub async fn stop(&self) {
        self.client.stop_stream().await;
    }
}

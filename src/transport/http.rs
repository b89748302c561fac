//! SSE frame source over HTTP

use super::{FrameSource, FrameStream};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::protocol::Frame;
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use reqwest::{Client, Url};

/// Opens reply streams with a plain `GET` and decodes the SSE body
#[derive(Debug, Clone)]
pub struct HttpFrameSource {
    client: Client,
    auth_token: Option<String>,
}

impl HttpFrameSource {
    pub fn new(config: &StreamConfig) -> Result<Self, StreamError> {
        // No overall timeout: the stream is long-lived and the guard's
        // watchdog bounds inactivity instead.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| StreamError::invalid_request(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            auth_token: config.auth_token.clone(),
        })
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn open(&self, url: Url) -> Result<FrameStream, StreamError> {
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.auth_token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::from_status(status, &body));
        }

        let frames = response
            .bytes_stream()
            .eventsource()
            .map(|item| match item {
                Ok(event) => Frame::parse(&event.event, &event.data),
                Err(EventStreamError::Transport(e)) => Err(StreamError::from(e)),
                Err(e) => Err(StreamError::protocol(format!("SSE decode error: {e}"))),
            });
        Ok(frames.boxed())
    }
}

//! Streaming transport
//!
//! A [`FrameSource`] opens one long-lived connection and yields decoded
//! frames. The [`TransportGuard`] makes sure only one such connection is
//! open at a time and watches it for inactivity.

mod guard;
mod http;

pub use guard::{SignalKind, TransportEvent, TransportGuard, TransportId, TransportSignal};
pub use http::HttpFrameSource;

use crate::error::StreamError;
use crate::protocol::Frame;
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Url;
use std::sync::Arc;

/// Frames from one connection. Protocol errors are per-frame and non-fatal;
/// any other error ends the connection.
pub type FrameStream = BoxStream<'static, Result<Frame, StreamError>>;

/// Parameters of one streaming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub session_id: String,
    pub prompt: String,
    pub uid: String,
    /// Correlation id: the assistant turn this stream fills
    pub client_message_id: String,
    pub expand: bool,
}

impl StreamRequest {
    /// Build the connection URL on top of `base`
    pub fn url(&self, base: &str) -> Result<Url, StreamError> {
        let mut url = Url::parse(base)
            .map_err(|e| StreamError::invalid_request(format!("invalid stream URL {base}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("sessionId", &self.session_id)
                .append_pair("message", &self.prompt)
                .append_pair("uid", &self.uid)
                .append_pair("clientMessageId", &self.client_message_id);
            if self.expand {
                query.append_pair("expand", "1");
            }
        }
        Ok(url)
    }
}

/// Something that can open a reply stream
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&self, url: Url) -> Result<FrameStream, StreamError>;
}

#[async_trait]
impl<T: FrameSource + ?Sized> FrameSource for Arc<T> {
    async fn open(&self, url: Url) -> Result<FrameStream, StreamError> {
        (**self).open(url).await
    }
}

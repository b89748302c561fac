//! Stream error types

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Stream error with classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Timeout, message)
    }

    /// Watchdog expiry: the server went quiet mid-stream
    pub fn inactive(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Inactive, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::RateLimit, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Connection, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Server, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Protocol, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Auth, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::InvalidRequest, message)
    }

    pub fn shutdown() -> Self {
        Self::new(StreamErrorKind::Shutdown, "stream driver has stopped")
    }

    /// Wrap the last retryable error once the retry budget is spent
    pub fn retries_exhausted(attempts: u32, last: &StreamError) -> Self {
        Self::new(
            StreamErrorKind::RetriesExhausted,
            format!("Failed after {attempts} retries: {}", last.message),
        )
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };
        match status.as_u16() {
            401 | 403 => Self::auth(message),
            408 => Self::timeout(message),
            429 => Self::rate_limit(message),
            400..=499 => Self::invalid_request(message),
            _ => Self::server(message),
        }
    }

    /// Classify the payload of an `error` frame
    pub fn from_error_frame(payload: Option<&Value>) -> Self {
        let Some(payload) = payload else {
            return Self::server("server reported an error");
        };

        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| payload.as_str())
            .unwrap_or("server reported an error")
            .to_string();

        let code = payload.get("code").and_then(Value::as_str).unwrap_or("");
        if matches!(code, "unauthenticated" | "unauthorized" | "forbidden") {
            return Self::auth(message);
        }

        match payload.get("retryable").and_then(Value::as_bool) {
            Some(false) => Self::new(StreamErrorKind::Fatal, message),
            _ => Self::server(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_connect() {
            Self::connection(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status, "")
        } else {
            Self::network(err.to_string())
        }
    }
}

/// Error classification for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Network issues - retryable
    Network,
    /// Request or connect timeout - retryable
    Timeout,
    /// Rate limited (429) - retryable with backoff
    RateLimit,
    /// No frame within the inactivity window - ends the turn
    Inactive,
    /// Connection refused, reset or closed early - retryable
    Connection,
    /// Server error (5xx or error frame) - retryable
    Server,
    /// Malformed frame or mismatched correlation id - dropped
    Protocol,
    /// Missing identity or rejected credentials (401, 403)
    Auth,
    /// Bad request (4xx)
    InvalidRequest,
    /// Server asked us not to retry
    Fatal,
    /// Retry budget spent
    RetriesExhausted,
    /// The driver task is gone
    Shutdown,
}

impl StreamErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::Connection | Self::Server
        )
    }

    /// Errors that end the turn instead of being absorbed
    pub fn is_fatal(self) -> bool {
        !self.is_retryable() && self != Self::Protocol
    }
}

//! Stream configuration

use std::time::Duration;

pub const DEFAULT_STREAM_URL: &str = "http://127.0.0.1:8000/api/chat/stream";

/// Retry schedule for retryable transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            multiplier: 2,
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based): 1s, 2s, 4s, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.multiplier.saturating_pow(attempt))
            .min(self.max_delay)
    }

    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Size caps applied while assembling a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnLimits {
    /// Longest single fragment, in chars
    pub max_fragment_chars: usize,
    /// Longest buffer while streaming, in chars
    pub max_buffer_chars: usize,
    /// Longest finalized text, in chars (before the truncation notice)
    pub max_text_chars: usize,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_fragment_chars: 1_000,
            max_buffer_chars: 8_000,
            max_text_chars: 8_000,
        }
    }
}

/// Connection health polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub poll_interval: Duration,
    pub degraded_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            degraded_after: Duration::from_secs(30),
        }
    }
}

/// Configuration for one conversation's stream
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub base_url: String,
    /// Caller identity sent as `uid`; required to open a stream
    pub uid: Option<String>,
    /// Optional bearer token for the stream endpoint
    pub auth_token: Option<String>,
    /// Ask the server for verbose replies
    pub expand: bool,
    pub inactivity_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub limits: TurnLimits,
    pub health: HealthConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_STREAM_URL.to_string(),
            uid: None,
            auth_token: None,
            expand: false,
            inactivity_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            limits: TurnLimits::default(),
            health: HealthConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("REPLY_STREAM_URL").unwrap_or(defaults.base_url),
            uid: std::env::var("REPLY_STREAM_UID").ok().filter(|v| !v.is_empty()),
            auth_token: std::env::var("REPLY_STREAM_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            expand: std::env::var("REPLY_STREAM_EXPAND")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            inactivity_timeout: std::env::var("REPLY_STREAM_INACTIVITY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(defaults.inactivity_timeout, Duration::from_secs),
            ..defaults
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }
}

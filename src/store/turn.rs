//! Conversation turn types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Text shown in place of a reply that could not be produced
pub const FAILED_TURN_TEXT: &str =
    "Sorry, I couldn't finish that reply. Please try again in a moment.";

/// Appended to a finalized reply that hit the size cap
pub const TRUNCATION_NOTICE: &str = "\n\n[Response truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Timing and volume of one streamed reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub elapsed_ms: u64,
    pub time_to_first_fragment_ms: Option<u64>,
    pub fragments: u32,
    pub dropped_fragments: u32,
    pub retries: u32,
    pub characters: usize,
}

/// One message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub buffered_text: String,
    pub is_streaming: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Value>,
    #[serde(default)]
    pub truncated: bool,
    /// Diagnostic for failed turns; never shown to users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Turn {
    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            text: text.into(),
            buffered_text: String::new(),
            is_streaming: false,
            timestamp: Utc::now(),
            performance: None,
            evidence: None,
            truncated: false,
            error: None,
        }
    }

    /// Empty assistant turn waiting for its first fragment
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            is_streaming: true,
            ..Self::user(id, "")
        }
    }

    /// Final turns never change again
    pub fn is_final(&self) -> bool {
        !self.is_streaming
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Text the UI should render right now
    pub fn display_text(&self) -> &str {
        if self.is_streaming {
            &self.buffered_text
        } else {
            &self.text
        }
    }
}

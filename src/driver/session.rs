//! Per-conversation stream bookkeeping and the fragment admission filter

use crate::protocol::DeltaFrame;
use std::time::Duration;
use tokio::time::Instant;

/// What to do with an incoming fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Tagged with another turn's correlation id
    Foreign,
    /// Sequence number already seen for this turn
    Duplicate,
}

/// Stream state that outlives a single turn
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub session_id: String,
    /// Highest sequence number admitted for the current turn
    pub last_seq: Option<u64>,
    pub last_activity_at: Instant,
}

impl StreamSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last_seq: None,
            last_activity_at: Instant::now(),
        }
    }

    /// Reset ordering state for a new turn. Retries of a turn keep it.
    pub fn begin_turn(&mut self) {
        self.last_seq = None;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity_at.elapsed()
    }

    /// Exclusivity key for the transport of `turn_id`
    pub fn transport_key(&self, turn_id: &str) -> String {
        format!("{}:{}", self.session_id, turn_id)
    }

    /// Apply the ordering/dedup filter to a fragment for `turn_id`
    pub fn admit(&mut self, delta: &DeltaFrame, turn_id: &str) -> Admission {
        if let Some(tagged) = &delta.client_message_id {
            if tagged != turn_id {
                return Admission::Foreign;
            }
        }
        if let Some(seq) = delta.seq {
            if self.last_seq.is_some_and(|last| seq <= last) {
                return Admission::Duplicate;
            }
            self.last_seq = Some(seq);
        }
        Admission::Accept
    }
}

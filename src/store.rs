//! Message assembly store
//!
//! An immutable, id-keyed list of conversation turns. Every operation
//! returns a new store built from the previous one plus an [`Outcome`]
//! tag; the previous store is never touched, so readers holding an older
//! snapshot never see a half-applied change. Turns are shared between
//! snapshots through `Arc` and copied only when modified.

mod turn;

#[cfg(test)]
mod proptests;

pub use turn::{PerformanceSummary, Role, Turn, FAILED_TURN_TEXT, TRUNCATION_NOTICE};

use crate::config::TurnLimits;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// How an operation was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Applied to the turn that was asked for
    Normal,
    /// Target was missing; a turn was recreated or another turn was used
    Recovered,
    /// Nothing changed
    NoOp,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnStore {
    turns: Vec<Arc<Turn>>,
    index: HashMap<String, usize>,
    streaming_id: Option<String>,
    limits: TurnLimits,
}

impl TurnStore {
    pub fn new(limits: TurnLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Turns in insertion order
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().map(AsRef::as_ref)
    }

    /// Owned copy of the ordered turns
    pub fn messages(&self) -> Vec<Turn> {
        self.turns().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Turn> {
        self.index.get(id).map(|&i| self.turns[i].as_ref())
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last().map(AsRef::as_ref)
    }

    /// Id of the turn currently marked as streaming
    pub fn streaming_id(&self) -> Option<&str> {
        self.streaming_id.as_deref()
    }

    pub fn streaming_count(&self) -> usize {
        self.turns.iter().filter(|t| t.is_streaming).count()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn limits(&self) -> TurnLimits {
        self.limits
    }

    #[must_use]
    pub fn add_user(&self, id: &str, text: &str) -> (Self, Outcome) {
        if self.index.contains_key(id) {
            tracing::warn!(turn_id = %id, "Ignoring duplicate user turn");
            return (self.clone(), Outcome::NoOp);
        }
        let mut next = self.clone();
        next.push(Turn::user(id, text));
        (next, Outcome::Normal)
    }

    /// Insert an empty streaming assistant turn and mark it current
    #[must_use]
    pub fn add_placeholder(&self, id: &str) -> (Self, Outcome) {
        if let Some(existing) = self.get(id) {
            if existing.is_final() {
                tracing::warn!(turn_id = %id, "Refusing to reopen a final turn");
            }
            return (self.clone(), Outcome::NoOp);
        }
        let mut next = self.clone();
        next.settle_streaming_except(id);
        next.push(Turn::placeholder(id));
        next.streaming_id = Some(id.to_string());
        (next, Outcome::Normal)
    }

    /// Append one fragment to a streaming turn's buffer
    #[must_use]
    pub fn append_delta(&self, id: &str, fragment: &str) -> (Self, Outcome) {
        let mut next = self.clone();
        let mut outcome = Outcome::Normal;

        let idx = if let Some(&idx) = self.index.get(id) {
            idx
        } else {
            tracing::warn!(turn_id = %id, "Delta for unknown turn, recreating placeholder");
            next.settle_streaming_except(id);
            next.push(Turn::placeholder(id));
            next.streaming_id = Some(id.to_string());
            outcome = Outcome::Recovered;
            next.turns.len() - 1
        };

        let turn = &next.turns[idx];
        if turn.is_final() {
            tracing::debug!(turn_id = %id, "Dropping delta for final turn");
            return (self.clone(), Outcome::NoOp);
        }
        if turn.truncated {
            // Cap reached earlier; the delta is accepted and ignored
            return (self.clone(), Outcome::NoOp);
        }

        let limits = self.limits;
        let fragment_chars = fragment.chars().count();
        if fragment_chars > limits.max_fragment_chars {
            tracing::debug!(
                turn_id = %id,
                chars = fragment_chars,
                max = limits.max_fragment_chars,
                "Truncating oversized fragment"
            );
        }
        let fragment_chars = fragment_chars.min(limits.max_fragment_chars);
        let used = turn.buffered_text.chars().count();
        let room = limits.max_buffer_chars.saturating_sub(used);

        let turn = Arc::make_mut(&mut next.turns[idx]);
        turn.buffered_text
            .extend(fragment.chars().take(fragment_chars.min(room)));
        if fragment_chars > room {
            tracing::info!(turn_id = %id, max = limits.max_buffer_chars, "Turn buffer reached its cap");
            turn.truncated = true;
        }
        if next.streaming_id.is_none() {
            next.streaming_id = Some(id.to_string());
        }
        (next, outcome)
    }

    /// Make a turn permanent. Idempotent.
    #[must_use]
    pub fn finalize(
        &self,
        id: &str,
        final_text: Option<String>,
        performance: Option<PerformanceSummary>,
        evidence: Option<Value>,
    ) -> (Self, Outcome) {
        let (idx, outcome) = match self.index.get(id) {
            Some(&idx) => (idx, Outcome::Normal),
            None => match self.streaming_index() {
                Some(idx) => {
                    tracing::warn!(
                        turn_id = %id,
                        finalized = %self.turns[idx].id,
                        "Finalize for unknown turn, finalizing the streaming turn instead"
                    );
                    (idx, Outcome::Recovered)
                }
                None => return (self.clone(), Outcome::NoOp),
            },
        };

        if self.turns[idx].is_final() {
            return (self.clone(), Outcome::NoOp);
        }

        let mut next = self.clone();
        next.finalize_at(idx, final_text, performance, evidence);
        (next, outcome)
    }

    /// Turn a reply into its terminal failure state
    #[must_use]
    pub fn set_error(&self, id: &str, message: &str) -> (Self, Outcome) {
        let mut next = self.clone();
        let (idx, outcome) = if let Some(&idx) = self.index.get(id) {
            (idx, Outcome::Normal)
        } else {
            tracing::warn!(turn_id = %id, "Error for unknown turn, recording a failed turn");
            next.settle_streaming_except(id);
            next.push(Turn::placeholder(id));
            (next.turns.len() - 1, Outcome::Recovered)
        };

        if next.turns[idx].is_final() {
            return (self.clone(), Outcome::NoOp);
        }

        let turn = Arc::make_mut(&mut next.turns[idx]);
        turn.text = FAILED_TURN_TEXT.to_string();
        turn.buffered_text.clear();
        turn.is_streaming = false;
        turn.error = Some(message.to_string());
        if next.streaming_id.as_deref() == Some(id) {
            next.streaming_id = None;
        }
        (next, outcome)
    }

    /// Forget which turn is streaming without touching any text
    #[must_use]
    pub fn clear_streaming(&self) -> (Self, Outcome) {
        if self.streaming_id.is_none() {
            return (self.clone(), Outcome::NoOp);
        }
        let mut next = self.clone();
        next.streaming_id = None;
        (next, Outcome::Normal)
    }

    fn push(&mut self, turn: Turn) {
        self.index.insert(turn.id.clone(), self.turns.len());
        self.turns.push(Arc::new(turn));
    }

    fn streaming_index(&self) -> Option<usize> {
        let id = self.streaming_id.as_deref()?;
        let idx = *self.index.get(id)?;
        self.turns[idx].is_streaming.then_some(idx)
    }

    /// Keep at most one streaming turn: settle every other one with its buffer
    fn settle_streaming_except(&mut self, id: &str) {
        let stale: Vec<usize> = self
            .turns
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_streaming && t.id != id)
            .map(|(i, _)| i)
            .collect();
        for idx in stale {
            tracing::warn!(turn_id = %self.turns[idx].id, "Settling superseded streaming turn");
            self.finalize_at(idx, None, None, None);
        }
    }

    fn finalize_at(
        &mut self,
        idx: usize,
        final_text: Option<String>,
        performance: Option<PerformanceSummary>,
        evidence: Option<Value>,
    ) {
        let max = self.limits.max_text_chars;
        let turn = Arc::make_mut(&mut self.turns[idx]);

        let text = match final_text {
            Some(text) => text,
            None if !turn.buffered_text.is_empty() => std::mem::take(&mut turn.buffered_text),
            None => std::mem::take(&mut turn.text),
        };

        if text.chars().count() > max {
            let mut capped: String = text.chars().take(max).collect();
            capped.push_str(TRUNCATION_NOTICE);
            turn.text = capped;
            turn.truncated = true;
        } else {
            turn.text = text;
        }

        turn.buffered_text.clear();
        turn.is_streaming = false;
        if performance.is_some() {
            turn.performance = performance;
        }
        if evidence.is_some() {
            turn.evidence = evidence;
        }

        if self.streaming_id.as_deref() == Some(turn.id.as_str()) {
            self.streaming_id = None;
        }
    }
}

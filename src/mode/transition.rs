//! Pure mode transition function
//!
//! Given the same state, target, reason and clock reading, `transition`
//! always produces the same new state and effects. Timers and subscriber
//! notification are effects executed by [`super::ModeMachine`].

use super::state::{
    Mode, ModeState, Transition, HISTORY_CAP, MAX_CONSECUTIVE_ERRORS, MAX_RECOVERY_ATTEMPTS,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_FORCED_RECOVERY: &str = "forced_recovery";

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeEffect {
    /// Drop any pending auto-timeout
    CancelTimeout,
    /// Time out of `mode` after `after` unless it is left first
    ArmTimeout { mode: Mode, after: Duration },
    /// Too many errors in a row; state was reset to idle
    ForcedRecovery { recovery_attempts: u32 },
    /// Publish the new state to subscribers
    Notify,
}

#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ModeState,
    pub effects: Vec<ModeEffect>,
}

impl TransitionResult {
    fn unchanged(state: &ModeState) -> Self {
        Self {
            new_state: state.clone(),
            effects: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid mode transition: {from} -> {to}")]
    InvalidTransition { from: Mode, to: Mode },
}

pub fn transition(
    state: &ModeState,
    next: Mode,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<TransitionResult, TransitionError> {
    let from = state.current;
    if next == from {
        return Ok(TransitionResult::unchanged(state));
    }
    if !from.can_transition_to(next) {
        return Err(TransitionError::InvalidTransition { from, to: next });
    }

    let mut new_state = state.clone();
    record(&mut new_state, next, reason, now);

    new_state.consecutive_errors = match next {
        Mode::Error => state.consecutive_errors + 1,
        // Fallback is the degraded way out of error; it is not a recovery
        Mode::Fallback => state.consecutive_errors,
        _ => 0,
    };

    let mut effects = vec![ModeEffect::CancelTimeout];

    if new_state.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
        record(&mut new_state, Mode::Idle, REASON_FORCED_RECOVERY, now);
        new_state.consecutive_errors = 0;
        new_state.recovery_attempts = (new_state.recovery_attempts + 1).min(MAX_RECOVERY_ATTEMPTS);
        effects.push(ModeEffect::ForcedRecovery {
            recovery_attempts: new_state.recovery_attempts,
        });
    } else if let Some(after) = next.auto_timeout() {
        effects.push(ModeEffect::ArmTimeout { mode: next, after });
    }

    effects.push(ModeEffect::Notify);
    Ok(TransitionResult { new_state, effects })
}

fn record(state: &mut ModeState, to: Mode, reason: &str, now: DateTime<Utc>) {
    state.history.push_back(Transition {
        from: state.current,
        to,
        timestamp: now,
        reason: reason.to_string(),
        duration_in_prior_state: state.time_in_current(now),
    });
    while state.history.len() > HISTORY_CAP {
        state.history.pop_front();
    }
    state.current = to;
    state.last_transition_at = now;
}

//! Statistics derived from the transition history
//!
//! Nothing here is stored: every figure is recomputed from `ModeState`
//! when asked for.

use super::state::{Mode, ModeState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Point-in-time summary of the mode machine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeStats {
    pub current: Mode,
    pub is_stable: bool,
    pub time_in_current: Duration,
    pub total_transitions: usize,
    pub consecutive_errors: u32,
    pub recovery_attempts: u32,
    pub error_rate: f64,
}

/// History-wide breakdown of the mode machine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeAnalytics {
    /// Time spent in each mode within the retained history, current stint included
    pub time_in_mode: BTreeMap<Mode, Duration>,
    /// Count per `from->to` pair
    pub transition_frequency: BTreeMap<String, u32>,
    /// Count of entries into each mode
    pub entries: BTreeMap<Mode, u32>,
    /// Share of transitions that entered `error`
    pub error_rate: f64,
    pub average_time_in_mode: BTreeMap<Mode, Duration>,
}

impl ModeStats {
    pub fn from_state(state: &ModeState, now: DateTime<Utc>) -> Self {
        Self {
            current: state.current,
            is_stable: state.is_stable(),
            time_in_current: state.time_in_current(now),
            total_transitions: state.history.len(),
            consecutive_errors: state.consecutive_errors,
            recovery_attempts: state.recovery_attempts,
            error_rate: error_rate(state),
        }
    }
}

impl ModeAnalytics {
    pub fn from_state(state: &ModeState, now: DateTime<Utc>) -> Self {
        let mut time_in_mode: BTreeMap<Mode, Duration> = BTreeMap::new();
        let mut stints: BTreeMap<Mode, u32> = BTreeMap::new();
        let mut transition_frequency: BTreeMap<String, u32> = BTreeMap::new();
        let mut entries: BTreeMap<Mode, u32> = BTreeMap::new();

        for t in &state.history {
            *time_in_mode.entry(t.from).or_default() += t.duration_in_prior_state;
            *stints.entry(t.from).or_default() += 1;
            *transition_frequency
                .entry(format!("{}->{}", t.from, t.to))
                .or_default() += 1;
            *entries.entry(t.to).or_default() += 1;
        }
        *time_in_mode.entry(state.current).or_default() += state.time_in_current(now);
        *stints.entry(state.current).or_default() += 1;

        let average_time_in_mode = time_in_mode
            .iter()
            .map(|(mode, total)| {
                let count = stints.get(mode).copied().unwrap_or(1).max(1);
                (*mode, *total / count)
            })
            .collect();

        Self {
            time_in_mode,
            transition_frequency,
            entries,
            error_rate: error_rate(state),
            average_time_in_mode,
        }
    }
}

#[allow(clippy::cast_precision_loss)] // history is capped far below f64 precision
fn error_rate(state: &ModeState) -> f64 {
    if state.history.is_empty() {
        return 0.0;
    }
    let errors = state.history.iter().filter(|t| t.to == Mode::Error).count();
    errors as f64 / state.history.len() as f64
}

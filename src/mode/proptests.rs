//! Property-based tests for the mode state machine

use super::state::*;
use super::transition::*;
use chrono::{DateTime, TimeDelta, Utc};
use proptest::prelude::*;

fn arb_mode() -> impl Strategy<Value = Mode> {
    prop::sample::select(Mode::ALL.to_vec())
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + TimeDelta::seconds(secs)
}

/// Drive a state through a sequence of requested modes, skipping rejections
fn run(targets: &[Mode]) -> ModeState {
    let mut state = ModeState::new(at(0));
    for (i, &next) in targets.iter().enumerate() {
        let secs = i64::try_from(i).unwrap_or(i64::MAX) + 1;
        if let Ok(result) = transition(&state, next, "prop", at(secs)) {
            state = result.new_state;
        }
    }
    state
}

proptest! {
    /// Pairs outside the adjacency table are rejected and change nothing
    #[test]
    fn prop_invalid_pairs_rejected(history in proptest::collection::vec(arb_mode(), 0..20), next in arb_mode()) {
        let state = run(&history);
        let from = state.current;
        let result = transition(&state, next, "prop", at(1_000));

        if next == from {
            let result = result.unwrap();
            prop_assert_eq!(result.new_state, state);
            prop_assert!(result.effects.is_empty());
        } else if from.can_transition_to(next) {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(result.unwrap_err(), TransitionError::InvalidTransition { from, to: next });
        }
    }

    /// Every recorded transition is a legal edge and the history is bounded
    #[test]
    fn prop_history_is_legal_and_bounded(targets in proptest::collection::vec(arb_mode(), 0..200)) {
        let state = run(&targets);
        prop_assert!(state.history.len() <= HISTORY_CAP);
        for t in &state.history {
            let forced = t.reason == REASON_FORCED_RECOVERY;
            prop_assert!(forced || t.from.can_transition_to(t.to), "{} -> {}", t.from, t.to);
        }
        for pair in state.history.iter().collect::<Vec<_>>().windows(2) {
            prop_assert_eq!(pair[0].to, pair[1].from);
        }
        if let Some(last) = state.history.back() {
            prop_assert_eq!(last.to, state.current);
        }
    }

    /// The error streak never reaches the forced-recovery threshold
    #[test]
    fn prop_error_streak_below_threshold(targets in proptest::collection::vec(arb_mode(), 0..200)) {
        let state = run(&targets);
        prop_assert!(state.consecutive_errors < MAX_CONSECUTIVE_ERRORS);
        prop_assert!(state.recovery_attempts <= MAX_RECOVERY_ATTEMPTS);
        if state.consecutive_errors > 0 {
            prop_assert!(matches!(state.current, Mode::Error | Mode::Fallback));
        }
    }

    /// Unstable targets arm exactly one timeout; stable targets arm none
    #[test]
    fn prop_timeout_armed_for_unstable_modes(history in proptest::collection::vec(arb_mode(), 0..20), next in arb_mode()) {
        let state = run(&history);
        if let Ok(result) = transition(&state, next, "prop", at(1_000)) {
            let armed = result
                .effects
                .iter()
                .filter(|e| matches!(e, ModeEffect::ArmTimeout { .. }))
                .count();
            let forced = result.effects.iter().any(|e| matches!(e, ModeEffect::ForcedRecovery { .. }));
            let expected = usize::from(next != state.current && !next.is_stable() && !forced);
            prop_assert_eq!(armed, expected);
        }
    }
}

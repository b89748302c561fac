//! Mode machine service: owns the state, runs transition effects

use super::state::{Mode, ModeState};
use super::stats::{ModeAnalytics, ModeStats};
use super::transition::{transition, ModeEffect, TransitionError, REASON_TIMEOUT};
use crate::timer::Timer;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Session mode state machine
///
/// Constructed once per conversation and shared by `Arc`. The lock is only
/// ever held for the duration of one synchronous transition.
pub struct ModeMachine {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ModeState>,
    this: Weak<ModeMachine>,
}

struct Inner {
    state: ModeState,
    timeout: Option<Timer>,
    /// Bumped whenever the pending timeout changes; stale timers compare unequal
    timeout_generation: u64,
}

impl ModeMachine {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| {
            let state = ModeState::default();
            let (state_tx, _) = watch::channel(state.clone());
            Self {
                inner: Mutex::new(Inner {
                    state,
                    timeout: None,
                    timeout_generation: 0,
                }),
                state_tx,
                this: this.clone(),
            }
        })
    }

    /// Move to `next`. Moving to the current mode is a successful no-op.
    pub fn transition_to(&self, next: Mode, reason: &str) -> Result<Mode, TransitionError> {
        let mut inner = self.lock();
        self.apply(&mut inner, next, reason)
    }

    /// Re-arm the current mode's auto-timeout (activity while in that mode)
    pub fn heartbeat(&self) {
        let mut inner = self.lock();
        let mode = inner.state.current;
        if let Some(after) = mode.auto_timeout() {
            self.run_effect(&mut inner, ModeEffect::ArmTimeout { mode, after });
        }
    }

    pub fn current(&self) -> Mode {
        self.lock().state.current
    }

    pub fn get_state(&self) -> ModeState {
        self.lock().state.clone()
    }

    pub fn get_stats(&self) -> ModeStats {
        ModeStats::from_state(&self.lock().state, Utc::now())
    }

    pub fn get_analytics(&self) -> ModeAnalytics {
        ModeAnalytics::from_state(&self.lock().state, Utc::now())
    }

    /// Receiver that reports the current state on its first `changed()`
    pub fn subscribe(&self) -> watch::Receiver<ModeState> {
        let mut rx = self.state_tx.subscribe();
        rx.mark_changed();
        rx
    }

    /// Stream of states, starting with the current one
    pub fn updates(&self) -> WatchStream<ModeState> {
        WatchStream::new(self.state_tx.subscribe())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, inner: &mut Inner, next: Mode, reason: &str) -> Result<Mode, TransitionError> {
        let result = match transition(&inner.state, next, reason, Utc::now()) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, reason = %reason, "Rejected mode transition");
                return Err(e);
            }
        };

        if result.effects.is_empty() {
            return Ok(inner.state.current);
        }

        tracing::debug!(
            from = %inner.state.current,
            to = %next,
            reason = %reason,
            "Mode transition"
        );
        inner.state = result.new_state;
        for effect in result.effects {
            self.run_effect(inner, effect);
        }
        Ok(inner.state.current)
    }

    fn run_effect(&self, inner: &mut Inner, effect: ModeEffect) {
        match effect {
            ModeEffect::CancelTimeout => {
                inner.timeout_generation += 1;
                inner.timeout = None;
            }
            ModeEffect::ArmTimeout { mode, after } => {
                inner.timeout_generation += 1;
                let generation = inner.timeout_generation;
                let machine = self.this.clone();
                inner.timeout = Some(Timer::once(after, move || {
                    if let Some(machine) = machine.upgrade() {
                        machine.on_timeout(mode, generation);
                    }
                }));
            }
            ModeEffect::ForcedRecovery { recovery_attempts } => {
                tracing::warn!(
                    recovery_attempts,
                    "Too many consecutive errors, forcing mode back to idle"
                );
            }
            ModeEffect::Notify => {
                self.state_tx.send_replace(inner.state.clone());
            }
        }
    }

    fn on_timeout(&self, mode: Mode, generation: u64) {
        let mut inner = self.lock();
        if inner.timeout_generation != generation || inner.state.current != mode {
            return;
        }
        tracing::warn!(mode = %mode, "Mode timed out");
        let _ = self.apply(&mut inner, Mode::Error, REASON_TIMEOUT);
    }
}

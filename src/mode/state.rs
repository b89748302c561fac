//! Session mode types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// Oldest transitions are dropped past this many
pub const HISTORY_CAP: usize = 50;

/// Consecutive entries into `error` that force a reset to `idle`
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// `recovery_attempts` saturates here; forced resets keep happening
pub const MAX_RECOVERY_ATTEMPTS: u32 = 5;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Idle,
    Thinking,
    Streaming,
    CollectingInfo,
    Processing,
    Error,
    Fallback,
}

impl Mode {
    pub const ALL: [Mode; 7] = [
        Mode::Idle,
        Mode::Thinking,
        Mode::Streaming,
        Mode::CollectingInfo,
        Mode::Processing,
        Mode::Error,
        Mode::Fallback,
    ];

    /// Modes reachable in one step
    pub fn allowed_targets(self) -> &'static [Mode] {
        match self {
            Mode::Idle => &[Mode::Thinking, Mode::CollectingInfo, Mode::Error],
            Mode::Thinking => &[Mode::Streaming, Mode::CollectingInfo, Mode::Error],
            Mode::Streaming => &[Mode::Idle, Mode::Error],
            Mode::CollectingInfo => &[Mode::Processing, Mode::Idle, Mode::Error],
            Mode::Processing => &[Mode::Streaming, Mode::Idle, Mode::Error],
            Mode::Error => &[Mode::Idle, Mode::Fallback],
            Mode::Fallback => &[Mode::Idle, Mode::Error],
        }
    }

    pub fn can_transition_to(self, next: Mode) -> bool {
        self.allowed_targets().contains(&next)
    }

    /// Stable modes have no auto-timeout
    pub fn is_stable(self) -> bool {
        matches!(self, Mode::Idle | Mode::Error | Mode::Fallback)
    }

    /// How long an unstable mode may last before it times out into `error`
    pub fn auto_timeout(self) -> Option<Duration> {
        match self {
            Mode::Thinking => Some(Duration::from_secs(10)),
            Mode::Streaming => Some(Duration::from_secs(30)),
            Mode::CollectingInfo => Some(Duration::from_secs(60)),
            Mode::Processing => Some(Duration::from_secs(15)),
            Mode::Idle | Mode::Error | Mode::Fallback => None,
        }
    }

    /// Shortest legal path from `self` to `target`, excluding `self`
    pub fn route_to(self, target: Mode) -> Option<Vec<Mode>> {
        if self == target {
            return Some(Vec::new());
        }
        let mut seen = HashSet::from([self]);
        let mut queue = VecDeque::from([vec![self]]);
        while let Some(path) = queue.pop_front() {
            let last = *path.last()?;
            for &next in last.allowed_targets() {
                if !seen.insert(next) {
                    continue;
                }
                let mut extended = path.clone();
                extended.push(next);
                if next == target {
                    extended.remove(0);
                    return Some(extended);
                }
                queue.push_back(extended);
            }
        }
        None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Thinking => "thinking",
            Mode::Streaming => "streaming",
            Mode::CollectingInfo => "collecting_info",
            Mode::Processing => "processing",
            Mode::Error => "error",
            Mode::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded mode change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Mode,
    pub to: Mode,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub duration_in_prior_state: Duration,
}

/// Session mode state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeState {
    pub current: Mode,
    pub history: VecDeque<Transition>,
    pub consecutive_errors: u32,
    pub recovery_attempts: u32,
    pub last_transition_at: DateTime<Utc>,
}

impl ModeState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current: Mode::Idle,
            history: VecDeque::new(),
            consecutive_errors: 0,
            recovery_attempts: 0,
            last_transition_at: now,
        }
    }

    pub fn is_stable(&self) -> bool {
        self.current.is_stable()
    }

    /// Time spent in the current mode so far
    pub fn time_in_current(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_transition_at).to_std().unwrap_or_default()
    }

    pub fn last_transition(&self) -> Option<&Transition> {
        self.history.back()
    }
}

impl Default for ModeState {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

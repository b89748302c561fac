//! Session mode state machine
//!
//! Pure transitions (`transition`) plus a service (`ModeMachine`) that
//! executes their effects: auto-timeouts, forced recovery and subscriber
//! notification.

mod machine;
pub mod state;
mod stats;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use machine::ModeMachine;
pub use state::{Mode, ModeState, Transition};
pub use stats::{ModeAnalytics, ModeStats};
pub use transition::{transition, ModeEffect, TransitionError, TransitionResult};

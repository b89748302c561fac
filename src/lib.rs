//! Reply streaming client
//!
//! Consumes incrementally generated assistant replies over a long-lived
//! server-sent events connection and assembles them into a local
//! conversation store, surviving retries, duplicate or out-of-order
//! fragments and stalled connections. A small session-mode state machine
//! tracks what the conversation is doing for the UI.

pub mod config;
pub mod conversation;
pub mod driver;
pub mod error;
pub mod mode;
pub mod protocol;
pub mod store;
pub mod timer;
pub mod transport;

pub use config::StreamConfig;
pub use conversation::Conversation;
pub use driver::{
    CallbackEvent, ChannelCallbacks, ConnectionHealth, StreamCallbacks, StreamClient,
    StreamOptions, StreamStatus,
};
pub use error::{StreamError, StreamErrorKind};
pub use mode::{Mode, ModeMachine};
pub use store::{Outcome, Turn, TurnStore};

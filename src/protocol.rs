//! Typed frames of the reply stream
//!
//! The server pushes one SSE event per frame; the event name selects the
//! frame type. Frames sent under the default `message` event name carry
//! their type in a JSON `type` field instead.

use crate::error::StreamError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incremental fragment of assistant text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaFrame {
    pub text: String,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub client_message_id: Option<String>,
}

impl DeltaFrame {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            seq: None,
            client_message_id: None,
        }
    }

    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    #[must_use]
    pub fn for_turn(mut self, turn_id: impl Into<String>) -> Self {
        self.client_message_id = Some(turn_id.into());
        self
    }
}

/// Successful end of stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneFrame {
    #[serde(default)]
    pub full: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open,
    Meta(Value),
    Delta(DeltaFrame),
    Limit(Value),
    Done(DoneFrame),
    Error(Option<Value>),
    Ping,
}

impl Frame {
    /// Decode one SSE event into a frame
    pub fn parse(event: &str, data: &str) -> Result<Self, StreamError> {
        match event {
            "open" => Ok(Frame::Open),
            "ping" | "heartbeat" => Ok(Frame::Ping),
            "meta" => Ok(Frame::Meta(loose_json(data))),
            "limit" => Ok(Frame::Limit(loose_json(data))),
            "delta" => serde_json::from_str(data)
                .map(Frame::Delta)
                .map_err(|e| StreamError::protocol(format!("malformed delta frame: {e}"))),
            "done" => {
                if data.trim().is_empty() {
                    return Ok(Frame::Done(DoneFrame::default()));
                }
                serde_json::from_str(data)
                    .map(Frame::Done)
                    .map_err(|e| StreamError::protocol(format!("malformed done frame: {e}")))
            }
            "error" => {
                if data.trim().is_empty() {
                    Ok(Frame::Error(None))
                } else {
                    Ok(Frame::Error(Some(loose_json(data))))
                }
            }
            "" | "message" => Self::parse_tagged(data),
            other => Err(StreamError::protocol(format!("unknown frame type: {other}"))),
        }
    }

    fn parse_tagged(data: &str) -> Result<Self, StreamError> {
        let value: Value = serde_json::from_str(data)
            .map_err(|e| StreamError::protocol(format!("malformed frame: {e}")))?;
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(StreamError::protocol("frame without type"));
        };
        if kind == "message" {
            return Err(StreamError::protocol("frame type cannot be message"));
        }
        Self::parse(kind, data)
    }
}

/// JSON if it parses, otherwise the raw text
fn loose_json(data: &str) -> Value {
    if data.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()))
}

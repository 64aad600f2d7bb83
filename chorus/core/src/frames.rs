//! Event Frames
//!
//! The normalized push-protocol vocabulary between the session manager and
//! its subscribers. Every subscriber of a session observes a sequence of
//! zero or more `Status`/`Chunk` frames followed by exactly one terminal
//! frame (`Complete` or `Error`), which also closes the connection.
//!
//! On the wire a frame is an SSE record:
//!
//! ```text
//! event: chunk
//! data: "partial text"
//!
//! event: complete
//! data: {"technicalSkills":["A","B"]}
//! ```
//!
//! The frame kind travels in the `event` field; the `data` field carries
//! only the payload (a JSON string for `status`/`chunk`/`error`, a JSON
//! object or string for `complete`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The finalized result of a session
///
/// The shape is declared by the caller when the session starts; it is never
/// sniffed from content at runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FinalResult {
    /// The accumulated text, returned as-is
    ///
    /// Listed first so untagged deserialization keeps JSON strings textual
    /// instead of wrapping them as generic values.
    Text(String),
    /// A recovered JSON object
    Structured(Value),
}

impl FinalResult {
    /// The payload as a JSON value (identity for structured results)
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Structured(v) => v.clone(),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

/// One frame of the push protocol
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventFrame {
    /// Progress information (session accepted, retrying, ...)
    Status {
        /// Human-readable progress message
        message: String,
    },
    /// One incremental unit of generated content
    Chunk {
        /// The content delta
        text: String,
    },
    /// Terminal frame: the session finished with a usable result
    Complete {
        /// The finalized result
        result: FinalResult,
    },
    /// Terminal frame: the session failed
    Error {
        /// Human-readable failure reason
        message: String,
    },
}

impl EventFrame {
    /// The SSE `event:` name for this frame
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Chunk { .. } => "chunk",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this frame ends the session's event sequence
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// The `data:` payload for the wire representation
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::Status { message } | Self::Error { message } => Value::String(message.clone()),
            Self::Chunk { text } => Value::String(text.clone()),
            Self::Complete { result } => result.to_value(),
        }
    }

    /// Rebuild a frame from a decoded SSE record
    ///
    /// Returns `None` for unknown event names or payloads that do not match
    /// the kind (a `status` record whose data is not a JSON string, say).
    /// A `complete` payload keeps its wire shape: objects become structured
    /// results, strings become text results.
    #[must_use]
    pub fn from_sse(event: Option<&str>, data: &str) -> Option<Self> {
        let payload: Value = serde_json::from_str(data).ok()?;
        match event {
            Some("status") => Some(Self::Status {
                message: payload.as_str()?.to_string(),
            }),
            Some("chunk") => Some(Self::Chunk {
                text: payload.as_str()?.to_string(),
            }),
            Some("complete") => Some(Self::Complete {
                result: match payload {
                    Value::String(s) => FinalResult::Text(s),
                    other => FinalResult::Structured(other),
                },
            }),
            Some("error") => Some(Self::Error {
                message: payload.as_str()?.to_string(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_frame_kinds() {
        assert_eq!(
            EventFrame::Status {
                message: "ok".into()
            }
            .kind(),
            "status"
        );
        assert_eq!(EventFrame::Chunk { text: "a".into() }.kind(), "chunk");
        assert_eq!(
            EventFrame::Complete {
                result: FinalResult::Text("done".into())
            }
            .kind(),
            "complete"
        );
        assert_eq!(
            EventFrame::Error {
                message: "boom".into()
            }
            .kind(),
            "error"
        );
    }

    #[test]
    fn test_terminal_frames() {
        assert!(!EventFrame::Status {
            message: "ok".into()
        }
        .is_terminal());
        assert!(!EventFrame::Chunk { text: "a".into() }.is_terminal());
        assert!(EventFrame::Complete {
            result: FinalResult::Text("done".into())
        }
        .is_terminal());
        assert!(EventFrame::Error {
            message: "boom".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_wire_round_trip() {
        let frames = vec![
            EventFrame::Status {
                message: "session accepted".into(),
            },
            EventFrame::Chunk {
                text: "{\"technicalSkills\":[\"A".into(),
            },
            EventFrame::Complete {
                result: FinalResult::Structured(json!({"technicalSkills": ["A", "B"]})),
            },
            EventFrame::Error {
                message: "upstream authentication failed".into(),
            },
        ];

        for frame in frames {
            let data = frame.payload().to_string();
            let back = EventFrame::from_sse(Some(frame.kind()), &data).expect("round trip");
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn test_complete_payload_keeps_wire_shape() {
        let structured = EventFrame::from_sse(Some("complete"), r#"{"a": 1}"#).unwrap();
        assert_eq!(
            structured,
            EventFrame::Complete {
                result: FinalResult::Structured(json!({"a": 1}))
            }
        );

        let text = EventFrame::from_sse(Some("complete"), r#""all done""#).unwrap();
        assert_eq!(
            text,
            EventFrame::Complete {
                result: FinalResult::Text("all done".into())
            }
        );
    }

    #[test]
    fn test_unknown_or_mismatched_records_are_rejected() {
        assert!(EventFrame::from_sse(Some("heartbeat"), "\"x\"").is_none());
        assert!(EventFrame::from_sse(None, "\"x\"").is_none());
        assert!(EventFrame::from_sse(Some("chunk"), "{\"not\": \"a string\"}").is_none());
        assert!(EventFrame::from_sse(Some("chunk"), "not json at all").is_none());
    }
}

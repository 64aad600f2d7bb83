//! Session Data Model
//!
//! A session represents one in-flight or completed streaming inference
//! request. The session manager keeps sessions in memory so subscribers can
//! connect, disconnect, and reconnect while the upstream call is running,
//! and so late subscribers briefly see the cached terminal state after it
//! finishes.
//!
//! # Invariants
//!
//! - The outcome moves `Pending -> Complete` or `Pending -> Failed` exactly
//!   once; the first writer wins and later writes are no-ops.
//! - The accumulated output buffer only grows while the outcome is pending
//!   (a retry of the upstream call resets it before re-accumulating).
//! - `started` is set at most once, guarding the single upstream call.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ChorusError;
use crate::frames::{EventFrame, FinalResult};

/// Opaque session identifier
///
/// Time-based with a random suffix (`sess-<unix-millis>-<8 hex>`), so ids
/// sort roughly by creation time and collisions are negligible.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new unique session id
    #[must_use]
    pub fn new() -> Self {
        let millis = Utc::now().timestamp_millis();
        let suffix: [u8; 4] = rand::random();
        Self(format!("sess-{millis}-{}", hex::encode(suffix)))
    }

    /// Wrap a raw id string (from a URL path, for example)
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw id string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for an attached subscriber
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Create a new unique subscriber id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A live push-connection handle attached to one session
///
/// The subscriber does not own the session: dropping the channel simply
/// removes it from the session's subscriber list on the next write.
#[derive(Debug)]
pub struct Subscriber {
    /// Unique subscriber id
    pub id: SubscriberId,
    /// Channel to the subscriber's connection handler
    pub tx: mpsc::Sender<EventFrame>,
}

/// The result shape the caller expects, declared up front
///
/// Replaces runtime content sniffing: the reconstructor either runs the
/// recovery ladder (`Structured`) or returns the buffer as-is (`Text`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// A JSON object is expected; the recovery ladder applies
    Structured,
    /// Free text; the accumulated buffer is the result
    #[default]
    Text,
}

/// Model parameters for a start request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceOptions {
    /// Model identifier to request upstream
    pub model: String,
    /// Optional system prompt prepended to the conversation
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Sampling temperature (provider default when absent)
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Declared result shape
    #[serde(default)]
    pub expect: OutputShape,
}

/// Input payload of a start request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartRequest {
    /// The raw text to send upstream
    pub content: String,
    /// Model/prompt parameters
    pub options: InferenceOptions,
}

impl StartRequest {
    /// Validate required fields
    ///
    /// # Errors
    ///
    /// Returns `ChorusError::MissingField` when `content` or
    /// `options.model` is absent or blank.
    pub fn validate(&self) -> Result<(), ChorusError> {
        if self.content.trim().is_empty() {
            return Err(ChorusError::MissingField("content"));
        }
        if self.options.model.trim().is_empty() {
            return Err(ChorusError::MissingField("options.model"));
        }
        Ok(())
    }
}

/// Tri-state session outcome
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    /// The upstream call has not finished yet
    Pending,
    /// The session finished with a usable result
    Complete(FinalResult),
    /// The session failed; carries the human-readable reason
    Failed(String),
}

impl SessionOutcome {
    /// Whether a terminal outcome has been set
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Coarse lifecycle phase, derived from outcome + started flag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Created, no upstream call issued yet
    Created,
    /// The upstream call is running
    Streaming,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
}

/// Read-only view of a session for health/status surfaces
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    /// Session id
    pub id: SessionId,
    /// Lifecycle phase
    pub phase: SessionPhase,
    /// Currently attached subscribers
    pub subscriber_count: usize,
    /// Bytes accumulated so far
    pub buffered_bytes: usize,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
}

/// One streaming inference session
#[derive(Debug)]
pub struct Session {
    /// Session id
    pub id: SessionId,
    /// The start request that created this session
    pub input: StartRequest,
    subscribers: Vec<Subscriber>,
    buffer: String,
    outcome: SessionOutcome,
    started: bool,
    created: Instant,
    created_at: DateTime<Utc>,
    finished: Option<Instant>,
}

impl Session {
    /// Create a new pending session for the given input
    #[must_use]
    pub fn new(input: StartRequest) -> Self {
        Self {
            id: SessionId::new(),
            input,
            subscribers: Vec::new(),
            buffer: String::new(),
            outcome: SessionOutcome::Pending,
            started: false,
            created: Instant::now(),
            created_at: Utc::now(),
            finished: None,
        }
    }

    /// Current outcome
    #[must_use]
    pub fn outcome(&self) -> &SessionOutcome {
        &self.outcome
    }

    /// Whether the single upstream call has been claimed
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Claim the single upstream call
    ///
    /// Returns true only for the first caller.
    pub fn mark_started(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        true
    }

    /// The accumulated output so far
    #[must_use]
    pub fn accumulated(&self) -> &str {
        &self.buffer
    }

    /// Append a content delta to the accumulated output
    ///
    /// No-op once a terminal outcome is set.
    pub fn append(&mut self, delta: &str) -> bool {
        if self.outcome.is_terminal() {
            return false;
        }
        self.buffer.push_str(delta);
        true
    }

    /// Clear the accumulated output ahead of an upstream retry
    ///
    /// No-op once a terminal outcome is set.
    pub fn reset_buffer(&mut self) -> bool {
        if self.outcome.is_terminal() {
            return false;
        }
        self.buffer.clear();
        true
    }

    /// Set the terminal `Complete` outcome
    ///
    /// First writer wins; returns false if an outcome was already set.
    pub fn complete(&mut self, result: FinalResult) -> bool {
        if self.outcome.is_terminal() {
            return false;
        }
        self.outcome = SessionOutcome::Complete(result);
        self.finished = Some(Instant::now());
        true
    }

    /// Set the terminal `Failed` outcome
    ///
    /// First writer wins; returns false if an outcome was already set.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.outcome.is_terminal() {
            return false;
        }
        self.outcome = SessionOutcome::Failed(reason.into());
        self.finished = Some(Instant::now());
        true
    }

    /// The cached terminal frame, if the session has finished
    #[must_use]
    pub fn terminal_frame(&self) -> Option<EventFrame> {
        match &self.outcome {
            SessionOutcome::Pending => None,
            SessionOutcome::Complete(result) => Some(EventFrame::Complete {
                result: result.clone(),
            }),
            SessionOutcome::Failed(reason) => Some(EventFrame::Error {
                message: reason.clone(),
            }),
        }
    }

    /// Attach a subscriber handle
    pub fn attach(&mut self, tx: mpsc::Sender<EventFrame>) -> SubscriberId {
        let id = SubscriberId::new();
        self.subscribers.push(Subscriber { id, tx });
        id
    }

    /// Detach a subscriber by id; returns true if it was attached
    pub fn detach(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Remove and return all subscriber handles (used on terminal frames)
    pub fn take_subscribers(&mut self) -> Vec<Subscriber> {
        std::mem::take(&mut self.subscribers)
    }

    /// Drop subscribers whose ids are in `ids` (failed writers)
    pub fn drop_subscribers(&mut self, ids: &[SubscriberId]) {
        self.subscribers.retain(|s| !ids.contains(&s.id));
    }

    /// Currently attached subscribers
    #[must_use]
    pub fn subscribers(&self) -> &[Subscriber] {
        &self.subscribers
    }

    /// Number of attached subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Age of the session
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    /// Time since the terminal outcome was set, if finished
    #[must_use]
    pub fn finished_for(&self) -> Option<std::time::Duration> {
        self.finished.map(|at| at.elapsed())
    }

    /// Derived lifecycle phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        match &self.outcome {
            SessionOutcome::Complete(_) => SessionPhase::Completed,
            SessionOutcome::Failed(_) => SessionPhase::Failed,
            SessionOutcome::Pending if self.started => SessionPhase::Streaming,
            SessionOutcome::Pending => SessionPhase::Created,
        }
    }

    /// Read-only view for health/status surfaces
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            phase: self.phase(),
            subscriber_count: self.subscribers.len(),
            buffered_bytes: self.buffer.len(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StartRequest {
        StartRequest {
            content: "Job description X".to_string(),
            options: InferenceOptions {
                model: "test-model".to_string(),
                system_prompt: None,
                temperature: None,
                expect: OutputShape::Structured,
            },
        }
    }

    #[test]
    fn test_session_id_format() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess-"));
        let other = SessionId::new();
        assert_ne!(id, other);
    }

    #[test]
    fn test_validation_rejects_missing_fields() {
        let mut req = request();
        req.content = "   ".to_string();
        assert!(matches!(
            req.validate(),
            Err(ChorusError::MissingField("content"))
        ));

        let mut req = request();
        req.options.model = String::new();
        assert!(matches!(
            req.validate(),
            Err(ChorusError::MissingField("options.model"))
        ));

        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_mark_started_is_once_only() {
        let mut session = Session::new(request());
        assert!(!session.is_started());
        assert!(session.mark_started());
        assert!(!session.mark_started());
        assert!(session.is_started());
    }

    #[test]
    fn test_outcome_transitions_exactly_once() {
        let mut session = Session::new(request());
        assert!(session.complete(FinalResult::Text("done".into())));
        assert!(!session.fail("too late"));
        assert!(!session.complete(FinalResult::Text("again".into())));
        assert!(matches!(session.outcome(), SessionOutcome::Complete(_)));

        let mut session = Session::new(request());
        assert!(session.fail("upstream authentication failed"));
        assert!(!session.complete(FinalResult::Text("too late".into())));
        assert!(matches!(session.outcome(), SessionOutcome::Failed(_)));
    }

    #[test]
    fn test_buffer_is_append_only_after_terminal() {
        let mut session = Session::new(request());
        assert!(session.append("hello "));
        assert!(session.append("world"));
        assert_eq!(session.accumulated(), "hello world");

        session.complete(FinalResult::Text("hello world".into()));
        assert!(!session.append("more"));
        assert!(!session.reset_buffer());
        assert_eq!(session.accumulated(), "hello world");
    }

    #[test]
    fn test_reset_buffer_before_terminal() {
        let mut session = Session::new(request());
        session.append("partial from failed attempt");
        assert!(session.reset_buffer());
        assert_eq!(session.accumulated(), "");
    }

    #[test]
    fn test_terminal_frame_caching() {
        let mut session = Session::new(request());
        assert!(session.terminal_frame().is_none());

        session.fail("transient upstream failure: retries exhausted");
        let frame = session.terminal_frame().expect("terminal frame");
        assert!(matches!(frame, EventFrame::Error { .. }));
        assert!(frame.is_terminal());
    }

    #[tokio::test]
    async fn test_attach_detach_subscribers() {
        let mut session = Session::new(request());
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        let a = session.attach(tx1);
        let b = session.attach(tx2);
        assert_eq!(session.subscriber_count(), 2);

        assert!(session.detach(a));
        assert!(!session.detach(a));
        assert_eq!(session.subscriber_count(), 1);
        assert_eq!(session.subscribers()[0].id, b);

        let drained = session.take_subscribers();
        assert_eq!(drained.len(), 1);
        assert_eq!(session.subscriber_count(), 0);
    }

    #[test]
    fn test_phase_progression() {
        let mut session = Session::new(request());
        assert_eq!(session.phase(), SessionPhase::Created);

        session.mark_started();
        assert_eq!(session.phase(), SessionPhase::Streaming);

        session.complete(FinalResult::Text("x".into()));
        assert_eq!(session.phase(), SessionPhase::Completed);
    }
}

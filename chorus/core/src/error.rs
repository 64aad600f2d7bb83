//! Error Taxonomy
//!
//! Every failure the session manager can surface is one of the variants
//! below. The taxonomy exists so the lifecycle controller can decide what to
//! do from the error kind alone:
//!
//! - `UpstreamTransient` is the only retryable class (connection resets,
//!   timeouts, 5xx responses).
//! - `UpstreamAuth` and `UpstreamRejected` are terminal provider answers and
//!   are never retried.
//! - `Reconstruction` is terminal: retrying the upstream call would not fix
//!   a parsing defect, so the raw accumulated text is carried for diagnosis.
//! - `SubscriberWrite` is isolated to one client and never fails a session.
//! - `Render` failures come from the external rendering collaborator and are
//!   never retried here.

use thiserror::Error;

/// Unified error type for chorus-core
#[derive(Debug, Error)]
pub enum ChorusError {
    /// A start request was missing a required field
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The session id is unknown or the session has been evicted
    #[error("unknown or expired session: {0}")]
    UnknownSession(String),

    /// The upstream provider rejected our credentials (401/403 class)
    #[error("upstream authentication failed: {0}")]
    UpstreamAuth(String),

    /// The upstream provider rejected the request itself (other 4xx class)
    #[error("upstream rejected the request: {0}")]
    UpstreamRejected(String),

    /// Connection-level upstream failure (reset, timeout, 5xx) — retryable
    #[error("transient upstream failure: {0}")]
    UpstreamTransient(String),

    /// The recovery ladder could not extract a structured result
    ///
    /// Carries the raw accumulated text so callers can log or inspect what
    /// the provider actually produced.
    #[error("could not reconstruct a structured result: {reason}")]
    Reconstruction {
        /// Why the last ladder step gave up
        reason: String,
        /// The full accumulated buffer that failed to parse
        raw: String,
    },

    /// A single subscriber connection could not be written to
    #[error("subscriber write failed: {0}")]
    SubscriberWrite(String),

    /// The external document renderer failed
    #[error("document rendering failed: {0}")]
    Render(String),
}

impl ChorusError {
    /// Whether the lifecycle controller may retry after this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTransient(_))
    }

    /// Map a transport-layer error onto the taxonomy
    ///
    /// Everything reqwest reports at the connection level (connect failures,
    /// timeouts, broken bodies) is transient by definition; provider status
    /// codes are classified separately where the response is available.
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTransient(format!("request timed out: {err}"))
        } else if err.is_connect() {
            Self::UpstreamTransient(format!("connection failed: {err}"))
        } else {
            Self::UpstreamTransient(err.to_string())
        }
    }

    /// Classify a non-success upstream HTTP status
    #[must_use]
    pub fn from_upstream_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::UpstreamAuth(format!("provider returned {status}: {body}")),
            408 | 429 => Self::UpstreamTransient(format!("provider returned {status}: {body}")),
            s if s >= 500 => Self::UpstreamTransient(format!("provider returned {s}: {body}")),
            s => Self::UpstreamRejected(format!("provider returned {s}: {body}")),
        }
    }
}

//! Session Store
//!
//! In-memory registry mapping session ids to session state. The store is
//! the only cross-request shared resource in the system; it is safe to call
//! from arbitrary request-handling tasks.
//!
//! # Locking
//!
//! Sessions live in a `DashMap`, so every mutation happens under that
//! entry's lock: all writers to one session are serialized, and different
//! sessions never contend with each other. `mark_started` is therefore an
//! atomic check-and-set, which is what makes the single-flight guarantee
//! hold under concurrent first subscribers.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::frames::{EventFrame, FinalResult};
use crate::session::{
    Session, SessionId, SessionSnapshot, StartRequest, Subscriber, SubscriberId,
};

/// Result of attaching a subscriber to a session
#[derive(Debug)]
pub enum AttachOutcome {
    /// The session is live; the subscriber was added to its list
    Attached(SubscriberId),
    /// The session already finished; the cached terminal frame should be
    /// written to the caller and the connection closed (no chunk replay)
    Replay(EventFrame),
}

/// Thread-safe registry of sessions
#[derive(Default)]
pub struct SessionStore {
    inner: DashMap<SessionId, Session>,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Create a new pending session, returning its id
    pub fn create(&self, input: StartRequest) -> SessionId {
        let session = Session::new(input);
        let id = session.id.clone();
        self.inner.insert(id.clone(), session);
        tracing::info!(session_id = %id, "Session created");
        id
    }

    /// Whether a session is registered
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.contains_key(id)
    }

    /// Number of registered sessions
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.len()
    }

    /// Read-only view of one session
    #[must_use]
    pub fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.inner.get(id).map(|s| s.snapshot())
    }

    /// Read-only view of every session
    #[must_use]
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.inner.iter().map(|s| s.snapshot()).collect()
    }

    /// Clone of a session's start request (for the upstream driver)
    #[must_use]
    pub fn input(&self, id: &SessionId) -> Option<StartRequest> {
        self.inner.get(id).map(|s| s.input.clone())
    }

    /// Attach a subscriber, or hand back the cached terminal frame
    ///
    /// Returns `None` for unknown ids.
    pub fn attach_subscriber(
        &self,
        id: &SessionId,
        tx: mpsc::Sender<EventFrame>,
    ) -> Option<AttachOutcome> {
        let mut session = self.inner.get_mut(id)?;
        if let Some(frame) = session.terminal_frame() {
            return Some(AttachOutcome::Replay(frame));
        }
        let sub_id = session.attach(tx);
        tracing::debug!(
            session_id = %id,
            subscriber_id = %sub_id,
            subscribers = session.subscriber_count(),
            "Subscriber attached"
        );
        Some(AttachOutcome::Attached(sub_id))
    }

    /// Detach a subscriber; returns true if it was attached
    pub fn detach_subscriber(&self, id: &SessionId, sub_id: SubscriberId) -> bool {
        match self.inner.get_mut(id) {
            Some(mut session) => {
                let removed = session.detach(sub_id);
                if removed {
                    tracing::debug!(
                        session_id = %id,
                        subscriber_id = %sub_id,
                        subscribers = session.subscriber_count(),
                        "Subscriber detached"
                    );
                }
                removed
            }
            None => false,
        }
    }

    /// Number of subscribers attached to a session
    #[must_use]
    pub fn subscriber_count(&self, id: &SessionId) -> usize {
        self.inner.get(id).map_or(0, |s| s.subscriber_count())
    }

    /// Atomically claim the single upstream call for a session
    ///
    /// True only for the first caller; all concurrent callers see false.
    pub fn mark_started(&self, id: &SessionId) -> bool {
        self.inner
            .get_mut(id)
            .is_some_and(|mut s| s.mark_started())
    }

    /// Append a content delta to a session's accumulated output
    pub fn append_output(&self, id: &SessionId, delta: &str) -> bool {
        self.inner.get_mut(id).is_some_and(|mut s| s.append(delta))
    }

    /// Reset a session's accumulated output ahead of an upstream retry
    pub fn reset_output(&self, id: &SessionId) -> bool {
        self.inner.get_mut(id).is_some_and(|mut s| s.reset_buffer())
    }

    /// The accumulated output so far
    #[must_use]
    pub fn accumulated(&self, id: &SessionId) -> Option<String> {
        self.inner.get(id).map(|s| s.accumulated().to_string())
    }

    /// Transition a session to `Complete`; first writer wins
    pub fn complete(&self, id: &SessionId, result: FinalResult) -> bool {
        let won = self
            .inner
            .get_mut(id)
            .is_some_and(|mut s| s.complete(result));
        if won {
            tracing::info!(session_id = %id, "Session completed");
        }
        won
    }

    /// Transition a session to `Failed`; first writer wins
    pub fn fail(&self, id: &SessionId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let won = self
            .inner
            .get_mut(id)
            .is_some_and(|mut s| s.fail(reason.clone()));
        if won {
            tracing::warn!(session_id = %id, reason = %reason, "Session failed");
        }
        won
    }

    /// The cached terminal frame, if the session has finished
    #[must_use]
    pub fn terminal_frame(&self, id: &SessionId) -> Option<EventFrame> {
        self.inner.get(id).and_then(|s| s.terminal_frame())
    }

    /// Remove and return all subscriber handles of a session
    pub fn take_subscribers(&self, id: &SessionId) -> Vec<Subscriber> {
        self.inner
            .get_mut(id)
            .map_or_else(Vec::new, |mut s| s.take_subscribers())
    }

    /// Drop specific subscribers (failed writers) from a session
    pub fn drop_subscribers(&self, id: &SessionId, sub_ids: &[SubscriberId]) {
        if let Some(mut session) = self.inner.get_mut(id) {
            session.drop_subscribers(sub_ids);
        }
    }

    /// Run a closure against one session under its entry lock
    ///
    /// The relay uses this so a whole broadcast pass (write to every
    /// subscriber, drop the dead ones) is serialized against attaches and
    /// detaches on the same session.
    pub(crate) fn with_session<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        self.inner.get_mut(id).map(|mut s| f(&mut s))
    }

    /// Remove a session outright; returns true if it existed
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self.inner.remove(id).is_some();
        if removed {
            tracing::info!(session_id = %id, "Session evicted");
        }
        removed
    }

    /// Evict a session that never attracted a subscriber or an upstream call
    ///
    /// Bounds memory for sessions that were created but whose client never
    /// opened the push connection.
    pub fn evict_if_idle(&self, id: &SessionId, max_idle: Duration) -> bool {
        let idle = self.inner.get(id).is_some_and(|s| {
            !s.outcome().is_terminal()
                && !s.is_started()
                && s.subscriber_count() == 0
                && s.age() > max_idle
        });
        if idle {
            self.remove(id)
        } else {
            false
        }
    }

    /// Sweep every session, evicting idle and expired ones
    ///
    /// Evicts pending sessions that were never started and have no
    /// subscribers after `idle_ttl`, and finished sessions whose terminal
    /// grace window of `completed_ttl` has passed. Returns how many were
    /// evicted.
    pub fn sweep(&self, idle_ttl: Duration, completed_ttl: Duration) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, session| {
            let expired_idle = !session.outcome().is_terminal()
                && !session.is_started()
                && session.subscriber_count() == 0
                && session.age() > idle_ttl;
            let expired_terminal = session
                .finished_for()
                .is_some_and(|elapsed| elapsed > completed_ttl);
            !(expired_idle || expired_terminal)
        });
        let evicted = before.saturating_sub(self.inner.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.inner.len(), "Session sweep");
        }
        evicted
    }
}

//! Broadcast Relay
//!
//! Pushes event frames to every subscriber currently attached to a session.
//! A failed write means the client went away: that subscriber is dropped
//! from the session without affecting delivery to the others. Terminal
//! frames additionally drain the subscriber list, which closes every push
//! connection.
//!
//! Ordering: the relay is only ever driven by the single upstream task of a
//! session, so frames reach subscribers in reconstructor emission order. A
//! subscriber attached after a frame was broadcast never sees that frame
//! again — only the cached terminal frame is replayed, by the store.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;

use crate::error::ChorusError;
use crate::frames::EventFrame;
use crate::session::{SessionId, SubscriberId};
use crate::store::SessionStore;

/// Result of a broadcast operation
#[derive(Clone, Debug, Default)]
pub struct BroadcastOutcome {
    /// Subscribers that received the frame
    pub delivered: usize,
    /// Subscribers dropped because their connection was gone
    pub dropped: usize,
}

/// Fans event frames out to a session's subscribers
#[derive(Clone)]
pub struct BroadcastRelay {
    store: Arc<SessionStore>,
}

impl BroadcastRelay {
    /// Create a relay over the given store
    #[must_use]
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Write a frame to every subscriber of a session
    ///
    /// Uses `try_send` so one slow or dead client cannot stall the stream
    /// for the rest. Runs under the session's entry lock, so a broadcast
    /// pass never interleaves with an attach or detach on the same session.
    /// On terminal frames all subscriber handles are drained afterwards,
    /// closing their connections.
    pub fn broadcast(&self, id: &SessionId, frame: &EventFrame) -> BroadcastOutcome {
        let outcome = self.store.with_session(id, |session| {
            let mut outcome = BroadcastOutcome::default();
            let mut dead: Vec<SubscriberId> = Vec::new();

            for subscriber in session.subscribers() {
                match subscriber.tx.try_send(frame.clone()) {
                    Ok(()) => outcome.delivered += 1,
                    Err(e) => {
                        let error = ChorusError::SubscriberWrite(match e {
                            TrySendError::Full(_) => "subscriber channel full".to_string(),
                            TrySendError::Closed(_) => "subscriber disconnected".to_string(),
                        });
                        tracing::debug!(
                            session_id = %id,
                            subscriber_id = %subscriber.id,
                            error = %error,
                            "Dropping subscriber"
                        );
                        dead.push(subscriber.id);
                    }
                }
            }
            outcome.dropped = dead.len();
            session.drop_subscribers(&dead);

            if frame.is_terminal() {
                // Dropping the handles closes every push connection.
                session.take_subscribers();
            }
            outcome
        });

        let outcome = outcome.unwrap_or_default();
        tracing::trace!(
            session_id = %id,
            kind = frame.kind(),
            delivered = outcome.delivered,
            dropped = outcome.dropped,
            "Frame broadcast"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::FinalResult;
    use crate::session::{InferenceOptions, OutputShape, StartRequest};
    use tokio::sync::mpsc;

    fn request() -> StartRequest {
        StartRequest {
            content: "hello".to_string(),
            options: InferenceOptions {
                model: "test-model".to_string(),
                system_prompt: None,
                temperature: None,
                expect: OutputShape::Text,
            },
        }
    }

    fn chunk(text: &str) -> EventFrame {
        EventFrame::Chunk { text: text.into() }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let store = Arc::new(SessionStore::new());
        let relay = BroadcastRelay::new(store.clone());
        let id = store.create(request());

        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        store.attach_subscriber(&id, tx1);
        store.attach_subscriber(&id, tx2);

        let outcome = relay.broadcast(&id, &chunk("hello"));
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.dropped, 0);

        assert_eq!(rx1.recv().await.unwrap(), chunk("hello"));
        assert_eq!(rx2.recv().await.unwrap(), chunk("hello"));
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_is_isolated() {
        let store = Arc::new(SessionStore::new());
        let relay = BroadcastRelay::new(store.clone());
        let id = store.create(request());

        let (tx1, rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        store.attach_subscriber(&id, tx1);
        store.attach_subscriber(&id, tx2);

        // First client goes away mid-stream
        drop(rx1);

        let outcome = relay.broadcast(&id, &chunk("still here"));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(store.subscriber_count(&id), 1);

        // The healthy subscriber keeps receiving later frames
        relay.broadcast(&id, &chunk("and another"));
        assert_eq!(rx2.recv().await.unwrap(), chunk("still here"));
        assert_eq!(rx2.recv().await.unwrap(), chunk("and another"));
    }

    #[tokio::test]
    async fn test_terminal_frame_closes_subscribers() {
        let store = Arc::new(SessionStore::new());
        let relay = BroadcastRelay::new(store.clone());
        let id = store.create(request());

        let (tx, mut rx) = mpsc::channel(8);
        store.attach_subscriber(&id, tx);

        let frame = EventFrame::Complete {
            result: FinalResult::Text("done".into()),
        };
        let outcome = relay.broadcast(&id, &frame);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(store.subscriber_count(&id), 0);

        // The terminal frame arrives, then the channel closes
        assert_eq!(rx.recv().await.unwrap(), frame);
        assert!(rx.recv().await.is_none());
    }
}

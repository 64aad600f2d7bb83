//! Session Lifecycle Controller
//!
//! Orchestrates every session from creation to eviction:
//!
//! ```text
//! created ──▶ starting ──▶ streaming ──▶ { completed, failed }
//!    │            │             │                  │
//!    │      mark_started   chunk frames      terminal frame,
//!    │      (single-flight) to subscribers   subscribers closed,
//!    │                                       grace-window eviction
//!    └── idle sweep (never started, no subscribers)
//! ```
//!
//! The first subscriber to attach claims the single upstream call through
//! the store's atomic `mark_started`; every later subscriber — concurrent
//! or not — just attaches and receives whatever is broadcast from then on.
//! Connection-level upstream failures are retried with exponential backoff
//! up to the policy ceiling; authentication failures and reconstruction
//! failures are terminal immediately.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::ChorusConfig;
use crate::error::ChorusError;
use crate::frames::{EventFrame, FinalResult};
use crate::reconstruct;
use crate::relay::BroadcastRelay;
use crate::session::{SessionId, SessionSnapshot, StartRequest, SubscriberId};
use crate::store::{AttachOutcome, SessionStore};
use crate::upstream::{InferenceBackend, InferenceRequest, StreamToken};

/// Result of subscribing to a session
#[derive(Debug)]
pub enum SubscribeOutcome {
    /// The session is live; the subscriber will receive broadcast frames
    Live(SubscriberId),
    /// The session had already finished; the cached terminal frame was
    /// written and the channel closed
    Replayed,
}

/// The session lifecycle controller
pub struct SessionController<B: InferenceBackend + 'static> {
    config: ChorusConfig,
    backend: Arc<B>,
    store: Arc<SessionStore>,
    relay: BroadcastRelay,
    /// Abort handles of in-flight upstream drivers
    active: DashMap<SessionId, AbortHandle>,
}

impl<B: InferenceBackend + 'static> SessionController<B> {
    /// Create a controller over the given backend
    pub fn new(backend: B, config: ChorusConfig) -> Arc<Self> {
        let store = Arc::new(SessionStore::new());
        let relay = BroadcastRelay::new(Arc::clone(&store));
        Arc::new(Self {
            config,
            backend: Arc::new(backend),
            store,
            relay,
            active: DashMap::new(),
        })
    }

    /// The underlying session store
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The controller configuration
    #[must_use]
    pub fn config(&self) -> &ChorusConfig {
        &self.config
    }

    /// Whether the upstream backend is reachable
    pub async fn upstream_healthy(&self) -> bool {
        self.backend.health_check().await
    }

    /// Snapshots of every registered session
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.store.snapshots()
    }

    /// Create a session for a start request
    ///
    /// # Errors
    ///
    /// Returns `ChorusError::MissingField` when required request fields are
    /// absent. The upstream call is not issued here; it starts when the
    /// first subscriber attaches.
    pub fn start_session(&self, request: StartRequest) -> Result<SessionId, ChorusError> {
        request.validate()?;
        Ok(self.store.create(request))
    }

    /// Attach a subscriber channel to a session
    ///
    /// The first attach triggers the upstream call (exactly once, however
    /// many subscribers race here). A subscriber attaching after the
    /// session finished gets the cached terminal frame and a closed
    /// channel — chunk frames are never replayed.
    ///
    /// # Errors
    ///
    /// Returns `ChorusError::UnknownSession` for unknown or evicted ids.
    pub fn subscribe(
        self: &Arc<Self>,
        id: &SessionId,
        tx: mpsc::Sender<EventFrame>,
    ) -> Result<SubscribeOutcome, ChorusError> {
        match self.store.attach_subscriber(id, tx.clone()) {
            None => Err(ChorusError::UnknownSession(id.to_string())),
            Some(AttachOutcome::Replay(frame)) => {
                let _ = tx.try_send(frame);
                Ok(SubscribeOutcome::Replayed)
            }
            Some(AttachOutcome::Attached(sub_id)) => {
                self.start_upstream(id);
                Ok(SubscribeOutcome::Live(sub_id))
            }
        }
    }

    /// Open a subscriber stream, hiding the channel plumbing
    ///
    /// # Errors
    ///
    /// Same as [`Self::subscribe`].
    pub fn open_stream(
        self: &Arc<Self>,
        id: &SessionId,
    ) -> Result<mpsc::Receiver<EventFrame>, ChorusError> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity);
        self.subscribe(id, tx)?;
        Ok(rx)
    }

    /// Start the upstream call without waiting for a subscriber
    ///
    /// Normally the first attach triggers the call; this is the explicit
    /// alternative for callers that want inference running before any push
    /// connection opens. Single-flight still holds: returns false when the
    /// call was already claimed (or the id is unknown).
    pub fn start_upstream(self: &Arc<Self>, id: &SessionId) -> bool {
        if !self.store.mark_started(id) {
            return false;
        }
        self.relay.broadcast(
            id,
            &EventFrame::Status {
                message: "session accepted, contacting upstream".to_string(),
            },
        );
        self.spawn_driver(id.clone());
        true
    }

    /// Detach a subscriber explicitly
    ///
    /// Detaching the last subscriber does not cancel an in-flight upstream
    /// call; use [`Self::abort`] for that.
    pub fn detach(&self, id: &SessionId, sub_id: SubscriberId) -> bool {
        self.store.detach_subscriber(id, sub_id)
    }

    /// Cancel a session's in-flight upstream call
    ///
    /// Fails the session and notifies subscribers. Returns false when no
    /// upstream call was active.
    pub fn abort(&self, id: &SessionId) -> bool {
        let Some((_, handle)) = self.active.remove(id) else {
            return false;
        };
        handle.abort();
        let message = "session aborted by caller".to_string();
        if self.store.fail(id, message.clone()) {
            self.relay.broadcast(id, &EventFrame::Error { message });
            self.schedule_eviction(id.clone());
        }
        tracing::info!(session_id = %id, "Upstream call aborted");
        true
    }

    /// Spawn the periodic eviction sweep
    ///
    /// Evicts never-started sessions without subscribers after the idle
    /// window, and finished sessions past the terminal grace window (a
    /// backstop for the per-session eviction timers).
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.config.sweep_interval());
            loop {
                ticker.tick().await;
                controller
                    .store
                    .sweep(controller.config.idle_ttl(), controller.config.completed_ttl());
            }
        })
    }

    /// Build the upstream request for a session's input
    fn request_for(&self, input: &StartRequest) -> InferenceRequest {
        let mut request = InferenceRequest::new(&input.content, &input.options.model)
            .with_stream(true)
            .with_timeout(self.config.request_timeout());
        if let Some(ref system) = input.options.system_prompt {
            request = request.with_system(system.clone());
        }
        if let Some(temperature) = input.options.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }

    /// Spawn the upstream driver task for a session
    fn spawn_driver(self: &Arc<Self>, id: SessionId) {
        let Some(input) = self.store.input(&id) else {
            tracing::warn!(session_id = %id, "Session vanished before driver start");
            return;
        };
        let request = self.request_for(&input);

        let controller = Arc::clone(self);
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            controller.run_upstream(&task_id, &request).await;
            controller.active.remove(&task_id);
        });
        self.active.insert(id, task.abort_handle());
    }

    /// Drive the upstream call to a terminal outcome, retrying transients
    async fn run_upstream(&self, id: &SessionId, request: &InferenceRequest) {
        let policy = self.config.retry.clone();
        let mut attempt: u32 = 0;

        loop {
            let result =
                match tokio::time::timeout(self.config.attempt_timeout(), self.attempt(id, request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ChorusError::UpstreamTransient(format!(
                        "attempt exceeded the {}ms budget",
                        self.config.attempt_timeout_ms
                    ))),
                };

            match result {
                // Terminal outcome already recorded by the attempt
                Ok(()) => return,
                Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                    let delay = policy.backoff_for_attempt(attempt);
                    attempt += 1;
                    tracing::warn!(
                        session_id = %id,
                        attempt,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream attempt failed, backing off"
                    );
                    // A fresh attempt restarts accumulation from scratch
                    self.store.reset_output(id);
                    self.relay.broadcast(
                        id,
                        &EventFrame::Status {
                            message: format!(
                                "upstream connection failed, retrying (attempt {} of {})",
                                attempt + 1,
                                policy.max_attempts()
                            ),
                        },
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.finish_failed(id, &e);
                    return;
                }
            }
        }
    }

    /// One upstream attempt: stream, accumulate, broadcast, finalize
    ///
    /// Returns `Ok(())` when a terminal outcome was recorded (including a
    /// reconstruction failure, which must not be retried) and `Err` for
    /// failures the caller may classify for retry.
    async fn attempt(&self, id: &SessionId, request: &InferenceRequest) -> Result<(), ChorusError> {
        let mut handle = self.backend.send_streaming(request).await?;

        while let Some(token) = handle.rx.recv().await {
            match token {
                StreamToken::Delta(text) => {
                    if self.store.append_output(id, &text) {
                        self.relay.broadcast(id, &EventFrame::Chunk { text });
                    }
                }
                StreamToken::Done => {
                    let buffer = self.store.accumulated(id).unwrap_or_default();
                    let shape = self
                        .store
                        .input(id)
                        .map(|input| input.options.expect)
                        .unwrap_or_default();
                    match reconstruct::finalize(shape, &buffer) {
                        Ok(result) => self.finish_complete(id, result),
                        // A parsing defect would not be fixed by retrying
                        Err(e) => self.finish_failed(id, &e),
                    }
                    return Ok(());
                }
                StreamToken::Failed(e) => return Err(e),
            }
        }

        Err(ChorusError::UpstreamTransient(
            "upstream stream closed unexpectedly".to_string(),
        ))
    }

    /// Record completion and deliver the terminal frame (first writer wins)
    fn finish_complete(&self, id: &SessionId, result: FinalResult) {
        if self.store.complete(id, result.clone()) {
            self.relay.broadcast(id, &EventFrame::Complete { result });
            self.schedule_eviction(id.clone());
        }
    }

    /// Record failure and deliver the terminal frame (first writer wins)
    fn finish_failed(&self, id: &SessionId, error: &ChorusError) {
        let message = error.to_string();
        if self.store.fail(id, message.clone()) {
            self.relay.broadcast(id, &EventFrame::Error { message });
            self.schedule_eviction(id.clone());
        }
    }

    /// Evict the session once its terminal grace window passes
    fn schedule_eviction(&self, id: SessionId) {
        let store = Arc::clone(&self.store);
        let ttl = self.config.completed_ttl();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            store.remove(&id);
        });
    }
}

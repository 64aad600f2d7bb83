//! Client Reconnection Agent
//!
//! Consumer-side counterpart of the event-stream endpoint. Opens the push
//! connection for a session id, decodes frames with the same record
//! framing the upstream side uses, and hides connection flakiness from the
//! caller:
//!
//! - connection-level errors retry up to a small fixed number of attempts
//!   with a fixed delay; HTTP 4xx answers (unknown session) do not retry;
//! - a provider-style end-of-stream token in the data, or a clean EOF
//!   after content without a terminal frame, is treated as `Complete` with
//!   the locally accumulated buffer — some providers terminate without an
//!   explicit structured completion event.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::frames::{EventFrame, FinalResult};
use crate::session::SessionId;
use crate::sse::SseDecoder;

/// Reconnect behavior of the agent
#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// Maximum connection attempts (including the first)
    pub max_connect_attempts: u32,
    /// Fixed delay between connection attempts
    pub reconnect_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Push-connection client for a session's event stream
#[derive(Clone)]
pub struct EventStreamClient {
    base_url: String,
    http_client: reqwest::Client,
    config: ReconnectConfig,
}

impl EventStreamClient {
    /// Create a client for the given daemon base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_config(base_url, ReconnectConfig::default())
    }

    /// Create a client with explicit reconnect behavior
    pub fn with_config(base_url: impl Into<String>, config: ReconnectConfig) -> Self {
        Self {
            base_url: base_url.into(),
            http_client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            config,
        }
    }

    fn events_url(&self, id: &SessionId) -> String {
        format!(
            "{}/sessions/{}/events",
            self.base_url.trim_end_matches('/'),
            id
        )
    }

    /// Subscribe to a session's event stream
    ///
    /// Frames arrive on the returned receiver; the channel closes after the
    /// terminal frame. The abort handle tears the connection down early.
    pub fn subscribe(&self, id: &SessionId) -> (mpsc::Receiver<EventFrame>, AbortHandle) {
        let (tx, rx) = mpsc::channel(64);
        let url = self.events_url(id);
        let http_client = self.http_client.clone();
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            run_subscription(http_client, url, config, tx).await;
        });

        (rx, task.abort_handle())
    }

    /// Subscribe and wait for the terminal frame
    ///
    /// Convenience wrapper that discards status and chunk frames and
    /// returns the session's single `Complete` or `Error` frame. If the
    /// stream closes without one (which the connection loop already guards
    /// against), an `Error` frame is synthesized.
    pub async fn wait_for_terminal(&self, id: &SessionId) -> EventFrame {
        let (mut rx, _abort) = self.subscribe(id);
        while let Some(frame) = rx.recv().await {
            if frame.is_terminal() {
                return frame;
            }
        }
        EventFrame::Error {
            message: "event stream closed without a terminal frame".to_string(),
        }
    }
}

/// Connection loop: fixed retry budget, fixed delay
async fn run_subscription(
    http_client: reqwest::Client,
    url: String,
    config: ReconnectConfig,
    tx: mpsc::Sender<EventFrame>,
) {
    let mut accumulated = String::new();

    for attempt in 1..=config.max_connect_attempts {
        match try_stream(&http_client, &url, &tx, &mut accumulated).await {
            StreamEnd::Terminal => return,
            StreamEnd::Rejected(message) => {
                // The server answered; retrying will not change its mind
                let _ = tx.send(EventFrame::Error { message }).await;
                return;
            }
            StreamEnd::ConnectionLost(reason) => {
                tracing::warn!(
                    attempt,
                    max_attempts = config.max_connect_attempts,
                    reason = %reason,
                    "Event stream connection lost"
                );
                if attempt < config.max_connect_attempts {
                    tokio::time::sleep(config.reconnect_delay).await;
                }
            }
        }
    }

    let _ = tx
        .send(EventFrame::Error {
            message: "could not reach the event stream".to_string(),
        })
        .await;
}

/// How one connection attempt ended
enum StreamEnd {
    /// A terminal frame was delivered (or synthesized); we are done
    Terminal,
    /// The server rejected the subscription; no retry
    Rejected(String),
    /// Connection-level trouble; eligible for another attempt
    ConnectionLost(String),
}

async fn try_stream(
    http_client: &reqwest::Client,
    url: &str,
    tx: &mpsc::Sender<EventFrame>,
    accumulated: &mut String,
) -> StreamEnd {
    let response = match http_client.get(url).send().await {
        Ok(response) => response,
        Err(e) => return StreamEnd::ConnectionLost(e.to_string()),
    };

    let status = response.status();
    if status.is_client_error() {
        let body = response.text().await.unwrap_or_default();
        return StreamEnd::Rejected(format!("server rejected subscription ({status}): {body}"));
    }
    if !status.is_success() {
        return StreamEnd::ConnectionLost(format!("server returned {status}"));
    }

    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => return StreamEnd::ConnectionLost(e.to_string()),
        };
        decoder.push(&bytes);

        while let Some(record) = decoder.next_record() {
            // Guard against providers that end the stream with a bare
            // token instead of a structured terminal event.
            if record.is_end_of_stream() {
                let _ = tx
                    .send(EventFrame::Complete {
                        result: FinalResult::Text(std::mem::take(accumulated)),
                    })
                    .await;
                return StreamEnd::Terminal;
            }

            let Some(frame) = EventFrame::from_sse(record.event.as_deref(), &record.data) else {
                tracing::warn!(data = %record.data, "Skipping undecodable frame");
                continue;
            };

            if let EventFrame::Chunk { ref text } = frame {
                accumulated.push_str(text);
            }
            let terminal = frame.is_terminal();
            if tx.send(frame).await.is_err() {
                // Caller went away; nothing left to do
                return StreamEnd::Terminal;
            }
            if terminal {
                return StreamEnd::Terminal;
            }
        }
    }

    // Clean EOF without a terminal frame: content seen means the provider
    // simply stopped talking — surface what we accumulated.
    if accumulated.is_empty() {
        StreamEnd::ConnectionLost("stream ended before any content".to_string())
    } else {
        let _ = tx
            .send(EventFrame::Complete {
                result: FinalResult::Text(std::mem::take(accumulated)),
            })
            .await;
        StreamEnd::Terminal
    }
}

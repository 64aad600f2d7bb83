//! Inference Backend Traits
//!
//! Trait definitions for upstream inference providers. The backend opens
//! the chunked call and yields content deltas over a channel; it never
//! touches session state — that is the lifecycle controller's job.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::ChorusError;

/// Token stream events from an inference backend
#[derive(Debug)]
pub enum StreamToken {
    /// A content delta from the response
    Delta(String),
    /// The provider signaled end-of-stream
    Done,
    /// The stream failed mid-flight
    Failed(ChorusError),
}

/// Parameters for one upstream call
#[derive(Clone, Debug)]
pub struct InferenceRequest {
    /// The user content to send
    pub content: String,
    /// Model to use (provider-specific identifier)
    pub model: String,
    /// Whether to stream the response
    pub stream: bool,
    /// Sampling temperature (provider default when `None`)
    pub temperature: Option<f32>,
    /// System prompt (optional, prepended to the conversation)
    pub system: Option<String>,
    /// Per-request timeout, distinct from the session-level budget
    pub timeout: Duration,
}

impl Default for InferenceRequest {
    fn default() -> Self {
        Self {
            content: String::new(),
            model: String::new(),
            stream: true,
            temperature: None,
            system: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl InferenceRequest {
    /// Create a new request with content and model
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the per-request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A live upstream stream
///
/// Tokens arrive on `rx`; `abort` cancels the reader task (and with it the
/// network call) without waiting for the provider.
#[derive(Debug)]
pub struct StreamHandle {
    /// Receiver for stream tokens
    pub rx: mpsc::Receiver<StreamToken>,
    /// Cancellation handle for the in-flight call
    pub abort: AbortHandle,
}

/// Upstream inference provider
///
/// Implement this trait to add support for different providers.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// The backend name (for logs and health reporting)
    fn name(&self) -> &str;

    /// Whether the backend is reachable
    async fn health_check(&self) -> bool;

    /// Open a streaming call
    ///
    /// # Errors
    ///
    /// Fails before any token is produced with the classified upstream
    /// error: `UpstreamAuth` for credential rejections, `UpstreamRejected`
    /// for other 4xx answers, `UpstreamTransient` for connection-level
    /// trouble. Mid-stream failures arrive as [`StreamToken::Failed`].
    async fn send_streaming(&self, request: &InferenceRequest)
        -> Result<StreamHandle, ChorusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = InferenceRequest::new("Hello", "skill-extractor")
            .with_stream(true)
            .with_temperature(0.3)
            .with_system("Reply with JSON only")
            .with_timeout(Duration::from_secs(30));

        assert_eq!(request.content, "Hello");
        assert_eq!(request.model, "skill-extractor");
        assert!(request.stream);
        assert_eq!(request.temperature, Some(0.3));
        assert_eq!(request.system.as_deref(), Some("Reply with JSON only"));
        assert_eq!(request.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_temperature_is_clamped() {
        let request = InferenceRequest::new("x", "m").with_temperature(9.0);
        assert_eq!(request.temperature, Some(2.0));
    }
}

//! Chat Completions Backend
//!
//! Concrete client for OpenAI-style `/v1/chat/completions` endpoints with
//! `stream: true`. The response is a sequence of SSE records, each carrying
//! a JSON body with a content delta under `choices[0].delta.content`,
//! terminated by a `data: [DONE]` record. `[DONE]` is a marker, never
//! content.
//!
//! Status classification happens here, before any token flows: 401/403 is
//! an authentication failure (terminal), 408/429/5xx and connection errors
//! are transient (the controller may retry), everything else is a terminal
//! rejection.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{InferenceBackend, InferenceRequest, StreamHandle, StreamToken};
use crate::error::ChorusError;
use crate::sse::SseDecoder;

/// Channel capacity between the stream reader task and the consumer
const TOKEN_CHANNEL_CAPACITY: usize = 100;

/// Client for an OpenAI-style chat completions endpoint
#[derive(Clone)]
pub struct ChatBackend {
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl ChatBackend {
    /// Create a new backend for the given base URL
    ///
    /// `base_url` is the provider root, e.g. `https://api.example.com`.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            http_client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    /// Create from environment variables
    ///
    /// Reads `CHORUS_UPSTREAM_URL` (default `http://localhost:11434`) and
    /// `CHORUS_UPSTREAM_API_KEY`.
    #[must_use]
    pub fn from_env() -> Self {
        let base_url = std::env::var("CHORUS_UPSTREAM_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        let api_key = std::env::var("CHORUS_UPSTREAM_API_KEY").ok();
        Self::new(base_url, api_key)
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn models_url(&self) -> String {
        format!("{}/v1/models", self.base_url.trim_end_matches('/'))
    }

    fn build_body(request: &InferenceRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.content}));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        body
    }

    /// Pull the content delta out of one stream record body
    fn extract_delta(data: &str) -> Option<String> {
        let value: serde_json::Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed stream record");
                return None;
            }
        };
        value
            .get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()
            .map(String::from)
    }
}

#[async_trait]
impl InferenceBackend for ChatBackend {
    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.models_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }

    async fn send_streaming(
        &self,
        request: &InferenceRequest,
    ) -> Result<StreamHandle, ChorusError> {
        let url = self.completions_url();
        let body = Self::build_body(request);

        let mut http_request = self
            .http_client
            .post(&url)
            .timeout(request.timeout)
            .json(&body);
        if let Some(ref key) = self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| ChorusError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChorusError::from_upstream_status(status.as_u16(), body));
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let mut stream = response.bytes_stream();

        let task = tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut saw_content = false;

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(StreamToken::Failed(ChorusError::from_transport(&e)))
                            .await;
                        return;
                    }
                };
                decoder.push(&bytes);

                while let Some(record) = decoder.next_record() {
                    if record.is_end_of_stream() {
                        let _ = tx.send(StreamToken::Done).await;
                        return;
                    }
                    if let Some(delta) = Self::extract_delta(&record.data) {
                        if delta.is_empty() {
                            continue;
                        }
                        saw_content = true;
                        if tx.send(StreamToken::Delta(delta)).await.is_err() {
                            // Receiver dropped, stop streaming
                            return;
                        }
                    }
                }
            }

            // Stream ended without the explicit marker. Content followed by
            // a clean EOF still counts as done; an empty stream does not.
            if saw_content {
                let _ = tx.send(StreamToken::Done).await;
            } else {
                let _ = tx
                    .send(StreamToken::Failed(ChorusError::UpstreamTransient(
                        "stream ended before any content".to_string(),
                    )))
                    .await;
            }
        });

        Ok(StreamHandle {
            rx,
            abort: task.abort_handle(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_construction() {
        let backend = ChatBackend::new("http://localhost:8080/", None);
        assert_eq!(
            backend.completions_url(),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(backend.models_url(), "http://localhost:8080/v1/models");
    }

    #[test]
    fn test_build_body() {
        let request = InferenceRequest::new("Describe the job", "skill-model")
            .with_system("Reply with JSON")
            .with_temperature(0.5);
        let body = ChatBackend::build_body(&request);

        assert_eq!(body["model"], "skill-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "Describe the job");
    }

    #[test]
    fn test_build_body_without_optionals() {
        let request = InferenceRequest::new("hi", "m");
        let body = ChatBackend::build_body(&request);

        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_extract_delta() {
        let data = r#"{"choices": [{"delta": {"content": "Hel"}}]}"#;
        assert_eq!(ChatBackend::extract_delta(data), Some("Hel".to_string()));

        // Finish record carries no delta content
        let finish = r#"{"choices": [{"delta": {}, "finish_reason": "stop"}]}"#;
        assert_eq!(ChatBackend::extract_delta(finish), None);

        // Malformed records are skipped, not fatal
        assert_eq!(ChatBackend::extract_delta("{not json"), None);
    }
}

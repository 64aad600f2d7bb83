//! Upstream Streaming Client
//!
//! Abstraction over the inference provider. The [`InferenceBackend`] trait
//! lets the lifecycle controller run against any provider (or a test mock)
//! without changing core logic; [`ChatBackend`] is the concrete client for
//! OpenAI-style chat-completion endpoints with SSE streaming.

pub mod chat;
pub mod traits;

pub use chat::ChatBackend;
pub use traits::{InferenceBackend, InferenceRequest, StreamHandle, StreamToken};

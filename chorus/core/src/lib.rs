//! Chorus Core - Streaming Inference Session Management
//!
//! This crate is the headless core of chorus: it drives one chunked
//! upstream inference call per session, reconstructs a well-formed result
//! from the token stream, and fans event frames out to any number of
//! subscribers. It has no HTTP-server dependencies; the daemon crate puts
//! the SSE surface on top.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Subscribers (SSE)                          │
//! │   ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐  │
//! │   │ Browser  │   │ Browser  │   │ Reconnect│   │   Headless   │  │
//! │   │ (first)  │   │ (late)   │   │  agent   │   │    tests     │  │
//! │   └────┬─────┘   └────┬─────┘   └────┬─────┘   └──────┬───────┘  │
//! │        └──────────────┴──────────────┴────────────────┘          │
//! │                           │  EventFrame                           │
//! └───────────────────────────┼───────────────────────────────────────┘
//!                             │
//! ┌───────────────────────────┼───────────────────────────────────────┐
//! │                      CHORUS CORE                                   │
//! │  ┌────────────────────────┴─────────────────────────────────────┐ │
//! │  │                  SessionController                            │ │
//! │  │  ┌──────────┐  ┌──────────┐  ┌───────────┐  ┌─────────────┐  │ │
//! │  │  │ Session  │  │Broadcast │  │ Response  │  │  Upstream   │  │ │
//! │  │  │  Store   │  │  Relay   │  │Reconstruct│  │  Backend    │  │ │
//! │  │  └──────────┘  └──────────┘  └───────────┘  └──────┬──────┘  │ │
//! │  └─────────────────────────────────────────────────────┼────────┘ │
//! └────────────────────────────────────────────────────────┼──────────┘
//!                                                          │
//!                                          chunked SSE from the provider
//! ```
//!
//! # Lifecycle
//!
//! A start request creates a session and returns its id. The first
//! subscriber to attach claims the single upstream call (`mark_started` is
//! atomic, so N concurrent subscribers trigger exactly one call). Deltas
//! are appended to the session buffer and broadcast as `chunk` frames as
//! they arrive. At end-of-stream the reconstructor produces the final
//! result — for structured sessions through a recovery ladder that
//! tolerates noisy provider output — and the single terminal frame closes
//! every subscriber. The session then stays queryable for a grace window
//! so late or reconnecting subscribers receive the cached terminal frame,
//! and is evicted afterwards.
//!
//! # Module Overview
//!
//! - [`frames`]: the event frame vocabulary (`status`/`chunk`/`complete`/`error`)
//! - [`session`]: session state, ids, outcome transitions
//! - [`store`]: the in-memory session registry (per-session serialization)
//! - [`relay`]: frame fan-out to subscribers
//! - [`sse`]: incremental record framing shared by both stream directions
//! - [`reconstruct`]: delta accumulation into a final result, recovery ladder
//! - [`upstream`]: the inference provider abstraction and SSE chat client
//! - [`controller`]: lifecycle orchestration, single-flight, retry, eviction
//! - [`retry`]: exponential backoff policy
//! - [`client`]: consumer-side reconnection agent
//! - [`render`]: external document-rendering collaborator contract
//! - [`config`]: file + environment configuration
//! - [`error`]: the unified error taxonomy

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod frames;
pub mod reconstruct;
pub mod relay;
pub mod render;
pub mod retry;
pub mod session;
pub mod sse;
pub mod store;
pub mod upstream;

// Re-exports for convenience
pub use client::{EventStreamClient, ReconnectConfig};
pub use config::{default_config_path, load_config, load_config_from_path, ChorusConfig, ConfigError};
pub use controller::{SessionController, SubscribeOutcome};
pub use error::ChorusError;
pub use frames::{EventFrame, FinalResult};
pub use relay::{BroadcastOutcome, BroadcastRelay};
pub use render::{CommandRenderer, DocumentRenderer, RenderFormat};
pub use retry::RetryPolicy;
pub use session::{
    InferenceOptions, OutputShape, SessionId, SessionPhase, SessionSnapshot, StartRequest,
    Subscriber, SubscriberId,
};
pub use store::{AttachOutcome, SessionStore};
pub use upstream::{ChatBackend, InferenceBackend, InferenceRequest, StreamHandle, StreamToken};

//! Daemon HTTP Surface
//!
//! Thin axum layer over the session controller:
//!
//! - `POST /sessions` validates a start request and returns the new
//!   session id; missing fields are a `400` with a reason.
//! - `GET /sessions/{id}/events` upgrades to an SSE stream emitting
//!   `event: <kind>` / `data: <json>` frames; unknown or expired ids get
//!   an immediate `400` JSON answer, never a push connection.
//! - `GET /healthz` reports upstream reachability and session counts.
//!
//! All session semantics (single-flight, retry, broadcast, eviction) live
//! in chorus-core; handlers here only translate HTTP.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use chorus_core::{
    ChorusError, InferenceBackend, InferenceOptions, OutputShape, SessionController, SessionId,
    StartRequest,
};

/// Build the daemon router over a controller
pub fn router<B: InferenceBackend + 'static>(
    controller: Arc<SessionController<B>>,
) -> Router {
    Router::new()
        .route("/sessions", post(start_session::<B>))
        .route("/sessions/{id}/events", get(session_events::<B>))
        .route("/healthz", get(healthz::<B>))
        .with_state(controller)
}

/// Map a start-request body onto the core type
///
/// Absent fields become empty values so `StartRequest::validate` produces
/// the precise `MissingField` answer instead of a generic decode error.
fn parse_start_body(body: &Value) -> StartRequest {
    let content = body
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let options = body.get("options").cloned().unwrap_or_else(|| json!({}));

    let expect = options
        .get("expect")
        .and_then(|v| serde_json::from_value::<OutputShape>(v.clone()).ok())
        .unwrap_or_default();

    StartRequest {
        content,
        options: InferenceOptions {
            model: options
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            system_prompt: options
                .get("system_prompt")
                .and_then(Value::as_str)
                .map(String::from),
            temperature: options
                .get("temperature")
                .and_then(Value::as_f64)
                .map(|t| t as f32),
            expect,
        },
    }
}

/// `POST /sessions`
async fn start_session<B: InferenceBackend + 'static>(
    State(controller): State<Arc<SessionController<B>>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    match controller.start_session(parse_start_body(&body)) {
        Ok(id) => (
            StatusCode::CREATED,
            Json(json!({ "sessionId": id.as_str() })),
        ),
        Err(e) => {
            tracing::debug!(error = %e, "Rejected start request");
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
        }
    }
}

/// `GET /sessions/{id}/events`
async fn session_events<B: InferenceBackend + 'static>(
    State(controller): State<Arc<SessionController<B>>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    let session_id = SessionId::from_raw(id);

    let rx = controller.open_stream(&session_id).map_err(|e| {
        let status = match e {
            ChorusError::UnknownSession(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": e.to_string() })))
    })?;

    let stream = ReceiverStream::new(rx).map(|frame| {
        Ok(Event::default()
            .event(frame.kind())
            .data(frame.payload().to_string()))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /healthz`
async fn healthz<B: InferenceBackend + 'static>(
    State(controller): State<Arc<SessionController<B>>>,
) -> Json<Value> {
    let upstream = controller.upstream_healthy().await;
    Json(json!({
        "status": "ok",
        "upstream_reachable": upstream,
        "active_sessions": controller.store().count(),
    }))
}

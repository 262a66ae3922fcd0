//! HTTP interface.
//!
//! Endpoints:
//! - `GET  /health` - service and database health
//! - `POST /sessions` - create a tutoring session
//! - `GET  /sessions` - list the caller's sessions
//! - `GET  /sessions/:id/messages` - full transcript of one session
//! - `POST /sessions/:id/chat` - run one turn, streamed as SSE
//! - `POST /messages/:id/feedback` - rate an assistant message
//!
//! Every route except `/health` requires a bearer token. Handlers stay thin;
//! the logic lives in `_inner` functions that return plain status/JSON pairs
//! so tests can call them without a socket.
//!
//! The chat route answers either an SSE stream (turn admitted, provider
//! stream open) or a plain JSON error with a meaningful status: 429 when
//! saturated, 404 outside the caller's scope, 503 when the provider is rate
//! limited, 502 when it cannot be reached.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use mentor_core::history::DialogueMode;
use mentor_core::llm::LlmError;
use mentor_core::models::FeedbackRating;
use mentor_core::{MentorConfig, MentorError};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::auth::{AuthVerifier, Identity};
use crate::chat::{self, ChatError, TurnContext, TurnEvent};
use crate::store::{StoreError, TranscriptStore};

/// Upper bound on a single question, in characters.
const MAX_QUESTION_CHARS: usize = 8_000;

// ============================================================================
// State and request types
// ============================================================================

pub struct HttpState {
    pub pool: PgPool,
    pub config: MentorConfig,
    pub auth: AuthVerifier,
    pub turn: TurnContext,
}

impl HttpState {
    fn store(&self) -> &dyn TranscriptStore {
        self.turn.store.as_ref()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub mode: DialogueMode,
}

#[derive(Debug, Deserialize)]
pub struct ChatTurnRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub rating: FeedbackRating,
    pub text: Option<String>,
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id/messages", get(list_messages))
        .route("/sessions/:id/chat", post(chat_turn))
        .route("/messages/:id/feedback", post(record_feedback))
        .with_state(state)
}

/// Bind and serve until the shutdown channel fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), MentorError> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "HTTP interface listening");

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP interface shutting down");
        })
        .await?;
    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({"error": message, "status": status.as_u16()})),
    )
        .into_response()
}

fn authenticate(state: &HttpState, headers: &HeaderMap) -> Result<Identity, Response> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    state.auth.verify_bearer(header).map_err(|e| {
        tracing::warn!(error = %e, "Rejected request credentials");
        error_response(StatusCode::UNAUTHORIZED, "authentication required")
    })
}

fn store_error_body(error: &StoreError) -> (StatusCode, Value) {
    match error {
        StoreError::Denied => (
            StatusCode::NOT_FOUND,
            json!({"error": "not found", "status": 404}),
        ),
        StoreError::Database(e) => {
            tracing::error!(error = %e, "Storage operation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "internal error", "status": 500}),
            )
        }
    }
}

fn chat_error_response(error: &ChatError) -> Response {
    match error {
        ChatError::Busy => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "1".to_string())],
            Json(json!({"error": error.client_message(), "status": 429})),
        )
            .into_response(),
        ChatError::Provider(LlmError::RateLimited { retry_after_secs }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, retry_after_secs.to_string())],
            Json(json!({"error": error.client_message(), "status": 503})),
        )
            .into_response(),
        ChatError::Provider(_) => error_response(StatusCode::BAD_GATEWAY, error.client_message()),
        ChatError::Store(e) => {
            let (status, body) = store_error_body(e);
            (status, Json(body)).into_response()
        }
    }
}

fn sse_event(session_id: Uuid, event: TurnEvent) -> Event {
    match event {
        TurnEvent::Delta(delta) => Event::default().data(json!({"delta": delta}).to_string()),
        TurnEvent::Completed {
            user_message_id,
            assistant_message_id,
            persisted,
        } => {
            let mut payload = json!({
                "session_id": session_id,
                "user_message_id": user_message_id,
                "assistant_message_id": assistant_message_id,
                "persisted": persisted,
            });
            if !persisted {
                payload["warning"] = json!("the reply was delivered but could not be saved");
            }
            Event::default().event("done").data(payload.to_string())
        }
        TurnEvent::Failed(e) => Event::default().event("error").data(
            json!({
                "kind": e.kind(),
                "error": e.client_message(),
            })
            .to_string(),
        ),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<Arc<HttpState>>) -> (StatusCode, Json<Value>) {
    let (status, body) = health_inner(&state.pool).await;
    (status, Json(body))
}

pub async fn health_inner(pool: &PgPool) -> (StatusCode, Value) {
    match mentor_core::db::health_check(pool).await {
        Ok(pg_version) => (
            StatusCode::OK,
            json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "database": pg_version,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"status": "unavailable", "error": "database unreachable"}),
            )
        }
    }
}

async fn create_session(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let (status, body) = create_session_inner(state.store(), &identity, request).await;
    (status, Json(body)).into_response()
}

pub async fn create_session_inner(
    store: &dyn TranscriptStore,
    identity: &Identity,
    request: CreateSessionRequest,
) -> (StatusCode, Value) {
    match store.create_session(identity, request.mode).await {
        Ok(session) => (StatusCode::CREATED, json!(session)),
        Err(e) => store_error_body(&e),
    }
}

async fn list_sessions(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let (status, body) = list_sessions_inner(state.store(), &identity).await;
    (status, Json(body)).into_response()
}

pub async fn list_sessions_inner(
    store: &dyn TranscriptStore,
    identity: &Identity,
) -> (StatusCode, Value) {
    match store.list_sessions(identity).await {
        Ok(sessions) => (StatusCode::OK, json!({"sessions": sessions})),
        Err(e) => store_error_body(&e),
    }
}

async fn list_messages(
    State(state): State<Arc<HttpState>>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let (status, body) = list_messages_inner(state.store(), &identity, session_id).await;
    (status, Json(body)).into_response()
}

pub async fn list_messages_inner(
    store: &dyn TranscriptStore,
    identity: &Identity,
    session_id: Uuid,
) -> (StatusCode, Value) {
    match store.list_messages(identity, session_id).await {
        Ok(messages) => (StatusCode::OK, json!({"messages": messages})),
        Err(e) => store_error_body(&e),
    }
}

async fn chat_turn(
    State(state): State<Arc<HttpState>>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ChatTurnRequest>,
) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let text = request.text.trim().to_string();
    if text.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "text must not be empty");
    }
    if text.chars().count() > MAX_QUESTION_CHARS {
        return error_response(StatusCode::BAD_REQUEST, "text is too long");
    }

    match chat::start_turn(&state.turn, identity, session_id, text).await {
        Ok(handle) => {
            let stream = ReceiverStream::new(handle.events)
                .map(move |event| Ok::<Event, Infallible>(sse_event(session_id, event)));
            Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Err(e) => chat_error_response(&e),
    }
}

async fn record_feedback(
    State(state): State<Arc<HttpState>>,
    Path(message_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<FeedbackRequest>,
) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    match state
        .store()
        .record_feedback(&identity, message_id, request.rating, request.text.as_deref())
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            let (status, body) = store_error_body(&e);
            (status, Json(body)).into_response()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

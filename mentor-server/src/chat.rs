//! Turn orchestration.
//!
//! One chat turn runs through a fixed sequence:
//!
//! 1. Claim an admission slot (non-blocking; saturated means Busy)
//! 2. Resolve the session under the caller's identity
//! 3. Persist the user message (kept even if generation then fails)
//! 4. Load the transcript and shape the provider window
//! 5. Open the provider stream (retried inside the client)
//! 6. Relay fragments until Done, error, or client disconnect
//! 7. Persist the assistant message only after a complete stream
//!
//! Steps 1-5 happen before the event channel is handed back, so their
//! failures surface as plain errors with status codes. Once relaying starts,
//! failures travel down the channel as [`TurnEvent::Failed`]. A disconnect
//! mid-stream closes the provider stream and returns the admission slot
//! right away; partial output is discarded, never persisted.

use std::sync::Arc;

use mentor_core::config::ChatConfig;
use mentor_core::history::build_window;
use mentor_core::llm::{ChatBackend, ChatRequest, CompletionEvent, CompletionStream, LlmError};
use mentor_core::models::Role;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionToken};
use crate::auth::Identity;
use crate::store::{StoreError, TranscriptStore};

// ============================================================================
// Errors and events
// ============================================================================

#[derive(Debug, Error)]
pub enum ChatError {
    /// Every generation slot is in use.
    #[error("all tutoring slots are in use")]
    Busy,

    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatError {
    /// Stable machine-readable tag for client payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Busy => "busy",
            ChatError::Provider(LlmError::RateLimited { .. }) => "rate_limited",
            ChatError::Provider(_) => "provider",
            ChatError::Store(StoreError::Denied) => "not_found",
            ChatError::Store(_) => "storage",
        }
    }

    /// Client-facing text. Never leaks provider or database internals.
    pub fn client_message(&self) -> &'static str {
        match self {
            ChatError::Busy => "All tutoring slots are in use; retry shortly",
            ChatError::Provider(LlmError::RateLimited { .. }) => {
                "The tutor is rate limited; retry shortly"
            }
            ChatError::Provider(_) => "The tutor could not be reached; try again",
            ChatError::Store(StoreError::Denied) => "not found",
            ChatError::Store(_) => "Internal storage error",
        }
    }
}

/// Events delivered to the client while a turn runs.
#[derive(Debug)]
pub enum TurnEvent {
    /// One fragment of assistant output, in arrival order.
    Delta(String),

    /// The stream finished cleanly. `persisted` is false when the reply was
    /// delivered but could not be saved; the transcript then holds only the
    /// user message.
    Completed {
        user_message_id: Uuid,
        assistant_message_id: Option<Uuid>,
        persisted: bool,
    },

    /// The provider stream broke mid-turn. Partial output was discarded.
    Failed(ChatError),
}

/// A running turn: the id of the already-persisted user message plus the
/// event stream for everything that happens after.
pub struct TurnHandle {
    pub user_message_id: Uuid,
    pub events: mpsc::Receiver<TurnEvent>,
}

/// Everything a turn needs, bundled so handlers stay thin.
#[derive(Clone)]
pub struct TurnContext {
    pub store: Arc<dyn TranscriptStore>,
    pub backend: Arc<dyn ChatBackend>,
    pub admission: AdmissionController,
    pub chat: ChatConfig,
}

// ============================================================================
// Turn startup
// ============================================================================

/// Run steps 1-5 of a turn, then hand the relay off to a background task.
///
/// On success the user message is already durable and the provider stream is
/// open; the caller streams [`TurnEvent`]s to the client. Dropping the
/// receiver cancels the turn.
pub async fn start_turn(
    ctx: &TurnContext,
    identity: Identity,
    session_id: Uuid,
    text: String,
) -> Result<TurnHandle, ChatError> {
    let token = ctx.admission.try_admit().ok_or(ChatError::Busy)?;

    let session = ctx.store.fetch_session(&identity, session_id).await?;
    tracing::info!(
        session = %session_id,
        user = %identity.user_id(),
        mode = %session.mode,
        "Starting turn"
    );

    let user_message = ctx
        .store
        .append_message(&identity, session_id, Role::User, &text)
        .await?;

    let history = ctx.store.list_messages(&identity, session_id).await?;
    let window = build_window(
        session.mode,
        &ctx.chat.course_material,
        &history,
        ctx.chat.max_turns as usize,
    );
    let request = ChatRequest {
        messages: window,
        temperature: session.mode.temperature(&ctx.chat),
    };

    let stream = ctx.backend.stream_completion(request).await?;

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(relay_turn(RelayTurn {
        store: ctx.store.clone(),
        tx,
        stream,
        token,
        identity,
        session_id,
        user_message_id: user_message.id,
    }));

    Ok(TurnHandle {
        user_message_id: user_message.id,
        events: rx,
    })
}

// ============================================================================
// Relay worker
// ============================================================================

struct RelayTurn {
    store: Arc<dyn TranscriptStore>,
    tx: mpsc::Sender<TurnEvent>,
    stream: CompletionStream,
    token: AdmissionToken,
    identity: Identity,
    session_id: Uuid,
    user_message_id: Uuid,
}

enum RelayOutcome {
    Completed,
    Failed(LlmError),
    Cancelled,
}

async fn relay_turn(turn: RelayTurn) {
    use futures::StreamExt;

    let RelayTurn {
        store,
        tx,
        mut stream,
        token,
        identity,
        session_id,
        user_message_id,
    } = turn;

    let mut full_text = String::new();
    let outcome = loop {
        tokio::select! {
            // Receiver dropped: the client went away.
            _ = tx.closed() => break RelayOutcome::Cancelled,
            event = stream.next() => match event {
                Some(Ok(CompletionEvent::Delta(delta))) => {
                    full_text.push_str(&delta);
                    if tx.send(TurnEvent::Delta(delta)).await.is_err() {
                        break RelayOutcome::Cancelled;
                    }
                }
                Some(Ok(CompletionEvent::Done)) => {
                    if full_text.is_empty() {
                        break RelayOutcome::Failed(LlmError::Stream(
                            "provider completed without content".to_string(),
                        ));
                    }
                    break RelayOutcome::Completed;
                }
                Some(Err(e)) => break RelayOutcome::Failed(e),
                None => break RelayOutcome::Failed(LlmError::Stream(
                    "provider stream ended unexpectedly".to_string(),
                )),
            },
        }
    };

    // Provider connection and admission slot are released here, before any
    // persistence work, on every path out of the loop.
    drop(stream);
    drop(token);

    match outcome {
        RelayOutcome::Completed => {
            match store
                .append_message(&identity, session_id, Role::Assistant, &full_text)
                .await
            {
                Ok(message) => {
                    tracing::info!(
                        session = %session_id,
                        chars = full_text.len(),
                        "Turn completed"
                    );
                    let _ = tx
                        .send(TurnEvent::Completed {
                            user_message_id,
                            assistant_message_id: Some(message.id),
                            persisted: true,
                        })
                        .await;
                }
                Err(e) => {
                    tracing::error!(
                        session = %session_id,
                        error = %e,
                        "Assistant message was delivered but could not be saved"
                    );
                    let _ = tx
                        .send(TurnEvent::Completed {
                            user_message_id,
                            assistant_message_id: None,
                            persisted: false,
                        })
                        .await;
                }
            }
        }
        RelayOutcome::Failed(e) => {
            tracing::warn!(
                session = %session_id,
                error = %e,
                discarded_chars = full_text.len(),
                "Turn failed mid-stream"
            );
            let _ = tx.send(TurnEvent::Failed(ChatError::Provider(e))).await;
        }
        RelayOutcome::Cancelled => {
            tracing::info!(
                session = %session_id,
                discarded_chars = full_text.len(),
                "Turn cancelled by client; partial output discarded"
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

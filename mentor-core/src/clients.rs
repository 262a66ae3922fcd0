//! Process-wide shared network clients.
//!
//! Every session works through the same provider client and database pool.
//! Both handles cap their own connection usage internally, so constructing
//! them per request would defeat those caps. The cell below constructs them
//! exactly once, on first use, even when the first callers arrive
//! concurrently.

use crate::config::MentorConfig;
use crate::db;
use crate::error::MentorError;
use crate::llm::{ChatClientConfig, OpenAiChatClient};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Long-lived handles shared across all sessions. Cloning is cheap: the pool
/// and the client are both reference-counted internally.
#[derive(Clone)]
pub struct SharedClients {
    pub pool: PgPool,
    pub llm: Arc<OpenAiChatClient>,
}

static SHARED: OnceCell<Result<SharedClients, String>> = OnceCell::const_new();

/// Get-or-create the shared clients. The first caller runs the construction;
/// concurrent first callers wait for that one construction instead of racing
/// their own. The stored value is the `Result` itself, so a construction
/// failure (missing API key, unreachable database) is sticky: every later
/// caller sees the same error and nothing silently rebuilds per request.
pub async fn shared(config: &MentorConfig) -> Result<SharedClients, MentorError> {
    let slot = SHARED
        .get_or_init(|| async { build_clients(config).await.map_err(|e| e.to_string()) })
        .await;

    match slot {
        Ok(clients) => Ok(clients.clone()),
        Err(message) => Err(MentorError::ClientInit(message.clone())),
    }
}

async fn build_clients(config: &MentorConfig) -> Result<SharedClients, MentorError> {
    let llm = OpenAiChatClient::new(ChatClientConfig::from_settings(&config.llm, None))?;
    let pool = db::create_pool(&config.database).await?;

    tracing::info!(
        model = %config.llm.model,
        db_max_connections = config.database.max_connections,
        "Shared clients initialized"
    );

    Ok(SharedClients {
        pool,
        llm: Arc::new(llm),
    })
}

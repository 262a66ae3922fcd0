use crate::history::DialogueMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One dialogue thread. Owned by exactly one identity and immutable after
/// creation; only messages are ever appended to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub mode: DialogueMode,
    pub created_at: DateTime<Utc>,
}

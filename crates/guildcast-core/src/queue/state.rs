//! Task state machine for the active queue.

use serde::{Deserialize, Serialize};

use crate::domain::GuildcastError;

/// State transitions:
/// - Pending -> InProgress -> (removed on success)
/// - Pending -> InProgress -> Pending (failed or claim expired, attempts+1, visible after backoff)
/// - Pending -> InProgress -> (moved to dead letters: budget spent or permanent failure)
///
/// Dead-lettered tasks leave the active queue, so they have no state here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
}

impl TaskState {
    pub fn parse(s: &str) -> Result<Self, GuildcastError> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "in_progress" => Ok(TaskState::InProgress),
            other => Err(GuildcastError::Persistence(format!(
                "invalid task state: {other}"
            ))),
        }
    }
}

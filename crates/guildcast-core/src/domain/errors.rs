//! Errors - エラー型と分類
//!
//! すべての失敗は `ErrorKind` に分類され、キューはその分類だけを見て
//! retry するか dead-letter にするかを決めます。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{DispatchId, GuildId, TaskId};

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味、即 dead-letter）
/// - Infrastructure: ストレージ等の障害（バックオフ付きでリトライ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

#[derive(Debug, Error)]
pub enum GuildcastError {
    #[error("dispatch {0} not found")]
    DispatchNotFound(DispatchId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("recipient resolver unavailable: {0}")]
    ResolverUnavailable(String),

    #[error("delivery to guild {guild_id} failed: {reason}")]
    DeliveryFailed { guild_id: GuildId, reason: String },

    #[error("delivery to guild {guild_id} timed out")]
    DeliveryTimedOut { guild_id: GuildId },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid task parameters: {0}")]
    InvalidParameters(String),

    #[error("dispatch {dispatch_id} still has {} pending recipient(s)", .pending.len())]
    PendingRecipients {
        dispatch_id: DispatchId,
        pending: Vec<GuildId>,
    },

    #[error("lease on task {0} was lost (claim expired or taken over)")]
    LeaseLost(TaskId),
}

impl GuildcastError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuildcastError::DispatchNotFound(_)
            | GuildcastError::TaskNotFound(_)
            | GuildcastError::Configuration(_)
            | GuildcastError::InvalidParameters(_) => ErrorKind::Permanent,
            GuildcastError::Persistence(_) | GuildcastError::LeaseLost(_) => {
                ErrorKind::Infrastructure
            }
            GuildcastError::ResolverUnavailable(_)
            | GuildcastError::DeliveryFailed { .. }
            | GuildcastError::DeliveryTimedOut { .. }
            | GuildcastError::PendingRecipients { .. } => ErrorKind::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Structured context kept with a dead letter so an operator can replay it.
    pub fn context(&self) -> serde_json::Value {
        match self {
            GuildcastError::DispatchNotFound(id) => {
                serde_json::json!({ "dispatch_id": id.as_ulid().to_string() })
            }
            GuildcastError::PendingRecipients {
                dispatch_id,
                pending,
            } => serde_json::json!({
                "dispatch_id": dispatch_id.as_ulid().to_string(),
                "pending_recipients": pending,
            }),
            GuildcastError::DeliveryFailed { guild_id, reason } => {
                serde_json::json!({ "guild_id": guild_id, "reason": reason })
            }
            GuildcastError::DeliveryTimedOut { guild_id } => {
                serde_json::json!({ "guild_id": guild_id })
            }
            _ => serde_json::Value::Null,
        }
    }
}

/// What the queue keeps about a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl TaskFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    /// Recorded when a claim runs past the visibility timeout with no ack or fail
    /// (worker crashed or the handler hung).
    pub fn claim_expired(visibility_timeout: std::time::Duration) -> Self {
        Self {
            kind: ErrorKind::Infrastructure,
            message: format!("claim expired after {visibility_timeout:?} without ack or fail"),
            context: serde_json::Value::Null,
        }
    }
}

impl From<&GuildcastError> for TaskFailure {
    fn from(err: &GuildcastError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            context: err.context(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn dispatch_id() -> DispatchId {
        DispatchId::from_ulid(Ulid::new())
    }

    #[rstest]
    #[case(GuildcastError::DispatchNotFound(dispatch_id()), ErrorKind::Permanent)]
    #[case(GuildcastError::Configuration("no handler".into()), ErrorKind::Permanent)]
    #[case(GuildcastError::InvalidParameters("missing".into()), ErrorKind::Permanent)]
    #[case(GuildcastError::Persistence("disk".into()), ErrorKind::Infrastructure)]
    #[case(GuildcastError::ResolverUnavailable("down".into()), ErrorKind::Transient)]
    #[case(
        GuildcastError::PendingRecipients { dispatch_id: dispatch_id(), pending: vec![] },
        ErrorKind::Transient
    )]
    fn errors_are_classified(#[case] err: GuildcastError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
        assert_eq!(err.is_retryable(), expected != ErrorKind::Permanent);
    }

    #[test]
    fn pending_recipients_context_names_the_guilds() {
        let id = dispatch_id();
        let err = GuildcastError::PendingRecipients {
            dispatch_id: id,
            pending: vec![GuildId::new("b"), GuildId::new("c")],
        };

        let failure = TaskFailure::from(&err);
        assert_eq!(failure.kind, ErrorKind::Transient);
        assert_eq!(failure.context["dispatch_id"], id.as_ulid().to_string());
        assert_eq!(failure.context["pending_recipients"], serde_json::json!(["b", "c"]));
        assert!(failure.message.contains("2 pending"));
    }
}

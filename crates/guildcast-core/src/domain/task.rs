use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::errors::GuildcastError;

/// Closed set of task kinds the queue knows about.
///
/// The wire names are what producers and the durable store use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "addReaction")]
    AddReaction,
    #[serde(rename = "scheduledDelete")]
    ScheduledDelete,
    #[serde(rename = "dispatchAlertMessage")]
    DispatchAlertMessage,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [
        TaskKind::AddReaction,
        TaskKind::ScheduledDelete,
        TaskKind::DispatchAlertMessage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::AddReaction => "addReaction",
            TaskKind::ScheduledDelete => "scheduledDelete",
            TaskKind::DispatchAlertMessage => "dispatchAlertMessage",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = GuildcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| GuildcastError::Configuration(format!("unknown task kind {s:?}")))
    }
}

/// Handler-specific key/value parameters. Opaque to the queue.
pub type TaskParameters = BTreeMap<String, String>;

/// The atomic unit of deferred work.
///
/// Producers build this with [`TaskRecord::new`] only. The failure counter is
/// bookkeeping owned by the queue: it starts at zero, can be read by anyone, and
/// can only be advanced from inside this crate (or rebuilt by a store that
/// persisted it, see [`TaskRecord::restore`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    kind: TaskKind,
    parameters: TaskParameters,
    failed_attempts: u32,
}

impl TaskRecord {
    pub fn new(kind: TaskKind, parameters: TaskParameters) -> Self {
        Self {
            kind,
            parameters,
            failed_attempts: 0,
        }
    }

    /// Rehydrate a record loaded from a durable queue.
    ///
    /// Only storage backends should call this; the counter they pass in must be
    /// the value they previously persisted for the same task.
    pub fn restore(kind: TaskKind, parameters: TaskParameters, failed_attempts: u32) -> Self {
        Self {
            kind,
            parameters,
            failed_attempts,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn parameters(&self) -> &TaskParameters {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Counts one more failed attempt. Never decreases.
    pub(crate) fn record_failure(&mut self) -> u32 {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.failed_attempts
    }

    /// A fresh record with the same work and a zeroed counter (manual replay).
    pub fn to_replay(&self) -> Self {
        Self::new(self.kind, self.parameters.clone())
    }
}

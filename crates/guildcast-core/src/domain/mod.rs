//! Domain model (IDs, records, errors, decisions, events).

pub mod decision;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod ids;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use dispatch::{ConsumeOutcome, ConsumptionRecord, DispatchRecord, RecipientScope};
pub use errors::{ErrorKind, GuildcastError, TaskFailure};
pub use events::DomainEvent;
pub use ids::{DispatchId, GuildId, TaskId};
pub use task::{TaskKind, TaskParameters, TaskRecord};

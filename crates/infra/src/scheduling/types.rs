//! Scheduled command records and trigger results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use chronicle_core::AggregateId;

/// "Only after `sequence_number` exists in `aggregate_id`'s stream."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPrecondition {
    pub aggregate_id: AggregateId,
    pub sequence_number: u64,
}

impl DeliveryPrecondition {
    pub fn event_exists(aggregate_id: AggregateId, sequence_number: u64) -> Self {
        Self {
            aggregate_id,
            sequence_number,
        }
    }
}

/// Lifecycle of a scheduled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Scheduled,
    Applied,
    PermanentlyFailed,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandState::Scheduled)
    }
}

/// Identity of a scheduled command: the stream and the reserved position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScheduledCommandKey {
    pub aggregate_id: AggregateId,
    pub sequence_number: u64,
}

impl core::fmt::Display for ScheduledCommandKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}#{}", self.aggregate_id, self.sequence_number)
    }
}

/// A durable intent to apply a command at or after `due_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCommand {
    pub aggregate_id: AggregateId,
    /// Routes the record to a registered applier.
    pub aggregate_type: String,
    /// Reserved at scheduling time; doubles as the idempotency token.
    pub sequence_number: u64,
    pub command_name: String,
    pub command: JsonValue,
    pub created_at: DateTime<Utc>,
    /// `None` means eligible immediately.
    pub due_time: Option<DateTime<Utc>>,
    pub precondition: Option<DeliveryPrecondition>,
    /// Failed application attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub applied_time: Option<DateTime<Utc>>,
    pub final_attempt_time: Option<DateTime<Utc>>,
}

impl ScheduledCommand {
    pub fn key(&self) -> ScheduledCommandKey {
        ScheduledCommandKey {
            aggregate_id: self.aggregate_id,
            sequence_number: self.sequence_number,
        }
    }

    pub fn state(&self) -> CommandState {
        if self.applied_time.is_some() {
            CommandState::Applied
        } else if self.final_attempt_time.is_some() {
            CommandState::PermanentlyFailed
        } else {
            CommandState::Scheduled
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_time.is_none_or(|due| due <= now)
    }

    /// Token stamped on the events this command produces.
    pub fn etag(&self) -> String {
        format!("scheduled:{}:{}", self.aggregate_id, self.sequence_number)
    }
}

/// Filter over records still `Scheduled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSelector {
    pub due_at_or_before: DateTime<Utc>,
    pub aggregate_id: Option<AggregateId>,
    pub aggregate_type: Option<String>,
    pub limit: Option<usize>,
}

impl TriggerSelector {
    pub fn due_by(at: DateTime<Utc>) -> Self {
        Self {
            due_at_or_before: at,
            aggregate_id: None,
            aggregate_type: None,
            limit: None,
        }
    }

    pub fn for_aggregate(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn of_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, command: &ScheduledCommand) -> bool {
        !command.is_resolved()
            && command.is_due(self.due_at_or_before)
            && self.aggregate_id.is_none_or(|id| id == command.aggregate_id)
            && self
                .aggregate_type
                .as_deref()
                .is_none_or(|t| t == command.aggregate_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The aggregate rejected the command.
    Rejected,
    /// Another writer committed first.
    Concurrency,
    /// Storage or transport trouble; no attempt consumed.
    Transient,
    PreconditionTimedOut,
    /// No applier for the aggregate type, or the body does not decode.
    Undeliverable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandFailure {
    pub command: ScheduledCommand,
    pub error: String,
    pub will_retry: bool,
    pub kind: FailureKind,
}

/// Outcome of one trigger pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerResult {
    pub successful_commands: Vec<ScheduledCommand>,
    pub failed_commands: Vec<CommandFailure>,
    /// Due, but waiting on a precondition within its allowed wait.
    pub deferred_commands: Vec<ScheduledCommand>,
}

impl TriggerResult {
    pub fn is_empty(&self) -> bool {
        self.successful_commands.is_empty()
            && self.failed_commands.is_empty()
            && self.deferred_commands.is_empty()
    }
}

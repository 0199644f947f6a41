use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chronicle_core::AggregateId;

use crate::scheduling::{ScheduledCommand, ScheduledCommandKey};

/// Queue message pointing at a scheduled command.
///
/// Carries only the lookup key; the command body stays in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCommandMessage {
    pub aggregate_id: AggregateId,
    pub sequence_number: u64,
    pub due_time: Option<DateTime<Utc>>,
}

impl ScheduledCommandMessage {
    pub fn for_command(command: &ScheduledCommand) -> Self {
        Self {
            aggregate_id: command.aggregate_id,
            sequence_number: command.sequence_number,
            due_time: command.due_time,
        }
    }

    pub fn key(&self) -> ScheduledCommandKey {
        ScheduledCommandKey {
            aggregate_id: self.aggregate_id,
            sequence_number: self.sequence_number,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// One delivery of a queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Transport-assigned id, used to complete the message.
    pub message_id: String,
    pub body: String,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

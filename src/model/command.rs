//! Commands addressed to execution agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// An out-of-band instruction for one agent.
///
/// Written once by the dispatcher, consumed by the agent. Only `status`
/// ever changes after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub id: Uuid,
    pub agent_id: String,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub payload: CommandPayload,
}

impl AgentCommand {
    /// A fresh command in `Created` status.
    pub fn new(agent_id: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            status: CommandStatus::Created,
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn cancel(agent_id: impl Into<String>, instance_id: Uuid) -> Self {
        Self::new(agent_id, CommandPayload::Cancel { instance_id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandPayload {
    Cancel { instance_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Created,
    Sent,
    Acknowledged,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Created => "CREATED",
            CommandStatus::Sent => "SENT",
            CommandStatus::Acknowledged => "ACKNOWLEDGED",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(CommandStatus::Created),
            "SENT" => Ok(CommandStatus::Sent),
            "ACKNOWLEDGED" => Ok(CommandStatus::Acknowledged),
            other => Err(Error::Other(format!("unknown command status: {other}"))),
        }
    }
}

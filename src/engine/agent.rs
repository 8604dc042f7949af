//! Agent command dispatch.
//!
//! Cancellation of a process that no agent has picked up yet is resolved
//! directly in the queue. Otherwise a command is left for the owning agent,
//! which reports the outcome through its own status updates. Delivery is
//! fire-and-forget: nothing here waits for an acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{info, warn};
use uuid::Uuid;

use super::scheduler::ScheduledTask;
use crate::error::{Error, Result};
use crate::model::{AgentCommand, ProcessKey, ProcessStatus};
use crate::store::{CommandStore, QueueStore};
use crate::telemetry::metrics;

/// What `kill_process` did.
#[derive(Debug, Clone, PartialEq)]
pub enum KillOutcome {
    /// No agent was assigned; the entry was cancelled in place.
    Cancelled,
    /// A cancel command was queued for the owning agent.
    CommandIssued(AgentCommand),
    /// The process had already finished; nothing to do.
    AlreadyTerminal(ProcessStatus),
}

/// What `kill_processes` did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KillSummary {
    pub cancelled: Vec<ProcessKey>,
    pub commands: Vec<AgentCommand>,
    pub already_terminal: Vec<ProcessKey>,
    pub missing: Vec<ProcessKey>,
}

pub struct AgentManager {
    queue: Arc<dyn QueueStore>,
    commands: Arc<dyn CommandStore>,
}

impl AgentManager {
    pub fn new(queue: Arc<dyn QueueStore>, commands: Arc<dyn CommandStore>) -> Self {
        Self { queue, commands }
    }

    /// Cancel one process.
    pub async fn kill_process(&self, key: &ProcessKey) -> Result<KillOutcome> {
        let entry = self
            .queue
            .get(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("process {key}")))?;

        if entry.status.is_terminal() {
            return Ok(KillOutcome::AlreadyTerminal(entry.status));
        }

        let Some(agent_id) = entry.last_agent_id else {
            warn!(instance_id = %key, "killing a process without an agent");
            self.queue
                .update_status(key, ProcessStatus::Cancelled)
                .await?;
            metrics::status_updates().add(1, &[KeyValue::new("to", "CANCELLED")]);
            return Ok(KillOutcome::Cancelled);
        };

        let command = AgentCommand::cancel(agent_id, key.instance_id);
        self.commands.insert(&command).await?;
        metrics::commands_issued().add(1, &[KeyValue::new("command", "cancel")]);
        info!(instance_id = %key, agent_id = %command.agent_id, command_id = %command.id, "cancel command issued");

        Ok(KillOutcome::CommandIssued(command))
    }

    /// Cancel several processes with one lookup, at most one bulk status
    /// update and at most one bulk command insert.
    pub async fn kill_processes(&self, keys: &[ProcessKey]) -> Result<KillSummary> {
        let entries = self.queue.get_many(keys).await?;
        let mut summary = KillSummary::default();

        for key in keys {
            if !entries.iter().any(|e| &e.key == key) {
                summary.missing.push(*key);
            }
        }

        for entry in entries {
            if entry.status.is_terminal() {
                summary.already_terminal.push(entry.key);
                continue;
            }
            match entry.last_agent_id {
                None => summary.cancelled.push(entry.key),
                Some(agent_id) => summary
                    .commands
                    .push(AgentCommand::cancel(agent_id, entry.key.instance_id)),
            }
        }

        if !summary.cancelled.is_empty() {
            for key in &summary.cancelled {
                warn!(instance_id = %key, "killing a process without an agent");
            }
            self.queue
                .update_status_batch(&summary.cancelled, ProcessStatus::Cancelled)
                .await?;
            metrics::status_updates().add(
                summary.cancelled.len() as u64,
                &[KeyValue::new("to", "CANCELLED")],
            );
        }

        if !summary.commands.is_empty() {
            self.commands.insert_batch(&summary.commands).await?;
            metrics::commands_issued().add(
                summary.commands.len() as u64,
                &[KeyValue::new("command", "cancel")],
            );
        }

        info!(
            cancelled = summary.cancelled.len(),
            commands = summary.commands.len(),
            already_terminal = summary.already_terminal.len(),
            missing = summary.missing.len(),
            "kill processed"
        );

        Ok(summary)
    }

    /// Commands waiting for an agent. Handed-out commands are marked sent.
    pub async fn poll_commands(&self, agent_id: &str, limit: usize) -> Result<Vec<AgentCommand>> {
        self.commands.poll_for_agent(agent_id, limit).await
    }

    pub async fn acknowledge(&self, command_id: Uuid) -> Result<()> {
        self.commands.acknowledge(command_id).await
    }
}

/// Puts commands that were handed out but never acknowledged back in line,
/// so an agent that restarted mid-delivery receives them again.
pub struct CommandRedelivery {
    commands: Arc<dyn CommandStore>,
    interval: Duration,
    ack_timeout: Duration,
}

impl CommandRedelivery {
    pub fn new(commands: Arc<dyn CommandStore>, interval: Duration, ack_timeout: Duration) -> Self {
        Self {
            commands,
            interval,
            ack_timeout,
        }
    }

    pub async fn run_once(&self) -> Result<u64> {
        let timeout = chrono::Duration::from_std(self.ack_timeout)
            .map_err(|e| Error::Config(format!("command ack timeout out of range: {e}")))?;
        let moved = self.commands.requeue_sent_before(Utc::now() - timeout).await?;
        if moved > 0 {
            warn!(moved, "unacknowledged commands queued for redelivery");
            metrics::commands_redelivered().add(moved, &[]);
        }
        Ok(moved)
    }
}

#[async_trait]
impl ScheduledTask for CommandRedelivery {
    fn name(&self) -> &'static str {
        "command-redelivery"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn perform(&self) -> Result<()> {
        self.run_once().await.map(|_| ())
    }
}

//! Storage seams for the process queue and the agent command queue.
//!
//! [`crate::db::Db`] implements both traits on Postgres; [`memory`] provides
//! an in-process implementation with the same semantics for tests and
//! single-node development.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    AgentCapabilities, AgentCommand, NewProcess, ProcessKey, ProcessQueueEntry, ProcessStatus,
    WaitCondition,
};

pub use memory::{MemoryCommandStore, MemoryQueueStore};

/// A suspended process picked up by the watchdog scan.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitingProcess {
    pub key: ProcessKey,
    pub project_id: Option<Uuid>,
    pub last_updated_at: DateTime<Utc>,
    pub waits: WaitCondition,
}

impl WaitingProcess {
    pub fn cursor(&self) -> WaitCursor {
        WaitCursor {
            last_updated_at: self.last_updated_at,
            instance_id: self.key.instance_id,
        }
    }
}

/// Keyset position of the watchdog scan. Entries are visited in
/// `(last_updated_at, instance_id)` order, strictly after the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WaitCursor {
    pub last_updated_at: DateTime<Utc>,
    pub instance_id: Uuid,
}

/// Durable bookkeeping of every process instance.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new entry in `Preparing` status.
    ///
    /// Fails with `DuplicateKey` if the key already exists.
    async fn insert_initial(&self, new: NewProcess) -> Result<()>;

    /// Set the status of one entry. Terminal entries are left as they are.
    /// A stored wait condition is cleared unless the new status is
    /// `Suspended`.
    async fn update_status(&self, key: &ProcessKey, status: ProcessStatus) -> Result<()>;

    /// Batch form of [`QueueStore::update_status`]. Unknown keys are skipped.
    async fn update_status_batch(&self, keys: &[ProcessKey], status: ProcessStatus) -> Result<()>;

    /// Claim the oldest `Enqueued` entry the agent is capable of running.
    ///
    /// The entry moves to `Starting` with `last_agent_id` set. Never blocks
    /// on rows another poller is claiming; returns `None` when nothing is
    /// eligible.
    async fn poll(
        &self,
        agent_id: &str,
        capabilities: &AgentCapabilities,
    ) -> Result<Option<ProcessQueueEntry>>;

    /// Set or clear the wait condition.
    ///
    /// Setting a condition suspends the entry; an exclusive condition also
    /// enrols the entry in its group. Clearing it moves a suspended entry
    /// back to `Enqueued` in the same write.
    async fn update_wait(&self, key: &ProcessKey, condition: Option<WaitCondition>) -> Result<()>;

    async fn get(&self, key: &ProcessKey) -> Result<Option<ProcessQueueEntry>>;

    /// Look up several entries at once. Missing keys are absent from the result.
    async fn get_many(&self, keys: &[ProcessKey]) -> Result<Vec<ProcessQueueEntry>>;

    /// Current status of each known instance id. Unknown ids are absent.
    async fn get_statuses(&self, instance_ids: &[Uuid]) -> Result<HashMap<Uuid, ProcessStatus>>;

    /// Resolve a full key from an instance id alone.
    async fn find_key(&self, instance_id: Uuid) -> Result<Option<ProcessKey>>;

    /// Next suspended entry with a wait condition, strictly after `after`.
    async fn next_wait_item(&self, after: Option<WaitCursor>) -> Result<Option<WaitingProcess>>;

    /// Non-terminal members of an exclusive group, oldest first.
    async fn list_exclusive_group(
        &self,
        project_id: Option<Uuid>,
        group_key: &str,
    ) -> Result<Vec<ProcessQueueEntry>>;
}

/// Durable queue of commands for agents.
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn insert(&self, command: &AgentCommand) -> Result<()>;

    async fn insert_batch(&self, commands: &[AgentCommand]) -> Result<()>;

    /// Hand out up to `limit` `Created` commands for an agent, oldest first,
    /// marking them `Sent`.
    async fn poll_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<AgentCommand>>;

    /// `Sent` → `Acknowledged`. Fails with `NotFound` for an unknown id.
    async fn acknowledge(&self, command_id: Uuid) -> Result<()>;

    async fn get(&self, command_id: Uuid) -> Result<Option<AgentCommand>>;

    /// Every command ever addressed to an agent, oldest first.
    async fn list_for_agent(&self, agent_id: &str) -> Result<Vec<AgentCommand>>;

    /// Move `Sent` commands handed out before `cutoff` back to `Created`.
    /// Returns how many were moved.
    async fn requeue_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

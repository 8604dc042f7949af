//! In-memory stores.
//!
//! One `tokio::sync::Mutex` per store serializes every operation, which
//! makes `poll` trivially claim-exclusive. Timestamps come from a per-store
//! monotonic clock so `last_updated_at` strictly increases with every write.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{CommandStore, QueueStore, WaitCursor, WaitingProcess};
use crate::error::{Error, Result};
use crate::model::{
    AgentCapabilities, AgentCommand, CommandStatus, NewProcess, ProcessKey, ProcessQueueEntry,
    ProcessStatus, WaitCondition,
};

/// Strictly increasing wall clock at microsecond resolution.
#[derive(Debug, Default)]
struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let next = match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

// ---------------------------------------------------------------------------
// Process queue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<ProcessKey, ProcessQueueEntry>,
    clock: MonotonicClock,
}

impl QueueState {
    fn set_status(&mut self, key: &ProcessKey, status: ProcessStatus) -> bool {
        let now = self.clock.tick();
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.status.is_terminal() {
            return true;
        }
        entry.status = status;
        if status != ProcessStatus::Suspended {
            entry.wait_conditions = None;
        }
        entry.last_updated_at = now;
        true
    }
}

/// Process queue held in memory.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    state: Mutex<QueueState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry in the store, oldest first.
    pub async fn snapshot(&self) -> Vec<ProcessQueueEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.key.fifo_order());
        entries
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert_initial(&self, new: NewProcess) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = new.key();
        if state.entries.contains_key(&key) {
            return Err(Error::DuplicateKey(key));
        }
        let now = state.clock.tick();
        state.entries.insert(key, new.into_entry(now));
        Ok(())
    }

    async fn update_status(&self, key: &ProcessKey, status: ProcessStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.set_status(key, status) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("process {key}")))
        }
    }

    async fn update_status_batch(&self, keys: &[ProcessKey], status: ProcessStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        for key in keys {
            state.set_status(key, status);
        }
        Ok(())
    }

    async fn poll(
        &self,
        agent_id: &str,
        capabilities: &AgentCapabilities,
    ) -> Result<Option<ProcessQueueEntry>> {
        let mut state = self.state.lock().await;
        let next = state
            .entries
            .values()
            .filter(|e| e.status == ProcessStatus::Enqueued)
            .filter(|e| capabilities.satisfies(e.requirements.as_ref()))
            .map(|e| e.key)
            .min_by_key(|k| k.fifo_order());

        let Some(key) = next else {
            return Ok(None);
        };

        let now = state.clock.tick();
        let Some(entry) = state.entries.get_mut(&key) else {
            return Ok(None);
        };
        entry.status = ProcessStatus::Starting;
        entry.last_agent_id = Some(agent_id.to_string());
        entry.last_updated_at = now;

        debug!(instance_id = %key, agent_id, "claimed");
        Ok(Some(entry.clone()))
    }

    async fn update_wait(&self, key: &ProcessKey, condition: Option<WaitCondition>) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = state.clock.tick();
        let entry = state
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("process {key}")))?;

        if entry.status.is_terminal() {
            return Ok(());
        }

        match condition {
            Some(c) => {
                if let WaitCondition::Exclusive(wait) = &c {
                    entry.exclusive_group = Some(wait.group_key.clone());
                }
                entry.status = ProcessStatus::Suspended;
                entry.wait_conditions = Some(c);
            }
            None => {
                if entry.status == ProcessStatus::Suspended {
                    entry.status = ProcessStatus::Enqueued;
                }
                entry.wait_conditions = None;
            }
        }
        entry.last_updated_at = now;
        Ok(())
    }

    async fn get(&self, key: &ProcessKey) -> Result<Option<ProcessQueueEntry>> {
        let state = self.state.lock().await;
        Ok(state.entries.get(key).cloned())
    }

    async fn get_many(&self, keys: &[ProcessKey]) -> Result<Vec<ProcessQueueEntry>> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter_map(|k| state.entries.get(k).cloned())
            .collect())
    }

    async fn get_statuses(&self, instance_ids: &[Uuid]) -> Result<HashMap<Uuid, ProcessStatus>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .values()
            .filter(|e| instance_ids.contains(&e.key.instance_id))
            .map(|e| (e.key.instance_id, e.status))
            .collect())
    }

    async fn find_key(&self, instance_id: Uuid) -> Result<Option<ProcessKey>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .keys()
            .find(|k| k.instance_id == instance_id)
            .copied())
    }

    async fn next_wait_item(&self, after: Option<WaitCursor>) -> Result<Option<WaitingProcess>> {
        let state = self.state.lock().await;
        let next = state
            .entries
            .values()
            .filter(|e| e.status == ProcessStatus::Suspended)
            .filter_map(|e| {
                let waits = e.wait_conditions.clone()?;
                Some(WaitingProcess {
                    key: e.key,
                    project_id: e.project_id,
                    last_updated_at: e.last_updated_at,
                    waits,
                })
            })
            .filter(|p| after.is_none_or(|cursor| p.cursor() > cursor))
            .min_by_key(|p| p.cursor());
        Ok(next)
    }

    async fn list_exclusive_group(
        &self,
        project_id: Option<Uuid>,
        group_key: &str,
    ) -> Result<Vec<ProcessQueueEntry>> {
        let state = self.state.lock().await;
        let mut members: Vec<_> = state
            .entries
            .values()
            .filter(|e| e.project_id == project_id)
            .filter(|e| e.exclusive_group.as_deref() == Some(group_key))
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        members.sort_by_key(|e| e.key.fifo_order());
        Ok(members)
    }
}

// ---------------------------------------------------------------------------
// Agent commands
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StoredCommand {
    command: AgentCommand,
    sent_at: Option<DateTime<Utc>>,
}

/// Agent command queue held in memory.
#[derive(Debug, Default)]
pub struct MemoryCommandStore {
    commands: Mutex<Vec<StoredCommand>>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command in insertion order.
    pub async fn all(&self) -> Vec<AgentCommand> {
        let commands = self.commands.lock().await;
        commands.iter().map(|c| c.command.clone()).collect()
    }
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn insert(&self, command: &AgentCommand) -> Result<()> {
        self.insert_batch(std::slice::from_ref(command)).await
    }

    async fn insert_batch(&self, commands: &[AgentCommand]) -> Result<()> {
        let mut stored = self.commands.lock().await;
        for command in commands {
            if stored.iter().any(|c| c.command.id == command.id) {
                return Err(Error::Other(format!("duplicate command id {}", command.id)));
            }
        }
        stored.extend(commands.iter().cloned().map(|command| StoredCommand {
            command,
            sent_at: None,
        }));
        Ok(())
    }

    async fn poll_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<AgentCommand>> {
        let mut stored = self.commands.lock().await;
        let now = Utc::now();
        let mut out = Vec::new();
        // insertion order is creation order
        for c in stored.iter_mut() {
            if out.len() >= limit {
                break;
            }
            if c.command.agent_id == agent_id && c.command.status == CommandStatus::Created {
                c.command.status = CommandStatus::Sent;
                c.sent_at = Some(now);
                out.push(c.command.clone());
            }
        }
        Ok(out)
    }

    async fn acknowledge(&self, command_id: Uuid) -> Result<()> {
        let mut stored = self.commands.lock().await;
        let c = stored
            .iter_mut()
            .find(|c| c.command.id == command_id)
            .ok_or_else(|| Error::NotFound(format!("command {command_id}")))?;
        if c.command.status == CommandStatus::Sent {
            c.command.status = CommandStatus::Acknowledged;
        }
        Ok(())
    }

    async fn get(&self, command_id: Uuid) -> Result<Option<AgentCommand>> {
        let stored = self.commands.lock().await;
        Ok(stored
            .iter()
            .find(|c| c.command.id == command_id)
            .map(|c| c.command.clone()))
    }

    async fn list_for_agent(&self, agent_id: &str) -> Result<Vec<AgentCommand>> {
        let stored = self.commands.lock().await;
        Ok(stored
            .iter()
            .filter(|c| c.command.agent_id == agent_id)
            .map(|c| c.command.clone())
            .collect())
    }

    async fn requeue_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut stored = self.commands.lock().await;
        let mut moved = 0;
        for c in stored.iter_mut() {
            if c.command.status == CommandStatus::Sent && c.sent_at.is_some_and(|t| t < cutoff) {
                c.command.status = CommandStatus::Created;
                c.sent_at = None;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_strictly_monotonic() {
        let mut clock = MonotonicClock::default();
        let mut prev = clock.tick();
        for _ in 0..1_000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[tokio::test]
    async fn status_update_on_missing_key_is_not_found() {
        let store = MemoryQueueStore::new();
        let err = store
            .update_status(&ProcessKey::generate(), ProcessStatus::Enqueued)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn terminal_entries_stay_terminal() {
        let store = MemoryQueueStore::new();
        let key = ProcessKey::generate();
        store.insert_initial(NewProcess::new(key)).await.unwrap();
        store
            .update_status(&key, ProcessStatus::Cancelled)
            .await
            .unwrap();
        store
            .update_status(&key, ProcessStatus::Enqueued)
            .await
            .unwrap();
        let entry = store.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, ProcessStatus::Cancelled);
    }
}

//! Exclusive groups: at most one member of a `(project, group)` pair
//! proceeds at a time.
//!
//! Members are ordered by `(created_at, instance_id)`. Contenders are the
//! other live members of the group. A contender is a *waiter* when it is
//! itself suspended on an exclusive condition for the same group, otherwise
//! it is *active*. A waiter resolves once no active contender is left and
//! no waiter is ordered before it; when two waiters become eligible in the
//! same pass the earlier one in that order wins.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::info;

use super::{ProcessWaitHandler, unexpected_condition};
use crate::engine::agent::AgentManager;
use crate::error::Result;
use crate::model::{
    ExclusiveMode, ExclusiveWait, ProcessKey, ProcessQueueEntry, ProcessStatus, WaitCondition,
    WaitType,
};
use crate::store::{QueueStore, WaitingProcess};
use crate::telemetry::metrics;

pub struct ExclusiveHandler {
    queue: Arc<dyn QueueStore>,
    agents: Arc<AgentManager>,
}

impl ExclusiveHandler {
    pub fn new(queue: Arc<dyn QueueStore>, agents: Arc<AgentManager>) -> Self {
        Self { queue, agents }
    }
}

fn is_waiter(entry: &ProcessQueueEntry, group_key: &str) -> bool {
    entry.status == ProcessStatus::Suspended
        && matches!(
            &entry.wait_conditions,
            Some(WaitCondition::Exclusive(w)) if w.group_key == group_key
        )
}

#[async_trait]
impl ProcessWaitHandler for ExclusiveHandler {
    fn wait_type(&self) -> WaitType {
        WaitType::Exclusive
    }

    async fn process(&self, process: &WaitingProcess) -> Result<Option<WaitCondition>> {
        let WaitCondition::Exclusive(wait) = &process.waits else {
            return Err(unexpected_condition(self.wait_type(), process));
        };

        let me = process.key.fifo_order();
        let contenders: Vec<ProcessQueueEntry> = self
            .queue
            .list_exclusive_group(process.project_id, &wait.group_key)
            .await?
            .into_iter()
            .filter(|e| e.key != process.key)
            .collect();

        if wait.mode == ExclusiveMode::CancelOld {
            // last_agent_id outlives the claim, so only members an agent is
            // executing get a command; the rest are cancelled in the queue
            let (on_agent, parked): (Vec<&ProcessQueueEntry>, Vec<&ProcessQueueEntry>) = contenders
                .iter()
                .filter(|e| e.key.fifo_order() < me)
                .filter(|e| !wait.cancelled.contains(&e.key.instance_id))
                .partition(|e| e.status.is_on_agent());
            let on_agent: Vec<ProcessKey> = on_agent.iter().map(|e| e.key).collect();
            let parked: Vec<ProcessKey> = parked.iter().map(|e| e.key).collect();

            if !on_agent.is_empty() || !parked.is_empty() {
                info!(
                    instance_id = %process.key,
                    group = %wait.group_key,
                    signalled = on_agent.len(),
                    cancelled = parked.len(),
                    "cancelling older members of the exclusive group"
                );
                if !parked.is_empty() {
                    self.queue
                        .update_status_batch(&parked, ProcessStatus::Cancelled)
                        .await?;
                    metrics::status_updates()
                        .add(parked.len() as u64, &[KeyValue::new("to", "CANCELLED")]);
                }
                if !on_agent.is_empty() {
                    self.agents.kill_processes(&on_agent).await?;
                }

                let mut cancelled = wait.cancelled.clone();
                cancelled.extend(on_agent.iter().chain(&parked).map(|k| k.instance_id));
                // re-evaluated on the next pass against fresh state
                return Ok(Some(WaitCondition::Exclusive(ExclusiveWait {
                    group_key: wait.group_key.clone(),
                    mode: wait.mode,
                    cancelled,
                })));
            }
        }

        let blocked = contenders.iter().any(|e| {
            if is_waiter(e, &wait.group_key) {
                e.key.fifo_order() < me
            } else {
                true
            }
        });

        if blocked {
            Ok(Some(process.waits.clone()))
        } else {
            info!(instance_id = %process.key, group = %wait.group_key, "exclusive group acquired");
            Ok(None)
        }
    }
}

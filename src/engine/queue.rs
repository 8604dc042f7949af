//! Producer and agent facing operations on the process queue.
//!
//! The store applies writes as given; this layer checks them against the
//! status state machine first.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    AgentCapabilities, NewProcess, ProcessKey, ProcessQueueEntry, ProcessStatus, WaitCondition,
};
use crate::store::QueueStore;
use crate::telemetry::metrics;
use crate::telemetry::queue::{record_status_change, start_claim_span};

#[derive(Clone)]
pub struct ProcessQueue {
    store: Arc<dyn QueueStore>,
}

impl ProcessQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Record a new process in `Preparing` status.
    pub async fn submit(&self, new: NewProcess) -> Result<ProcessKey> {
        let key = new.key();
        self.store.insert_initial(new).await?;
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "insert")]);
        info!(instance_id = %key, "process submitted");
        Ok(key)
    }

    /// Make a prepared process available to agents.
    pub async fn enqueue(&self, key: &ProcessKey) -> Result<()> {
        self.report_status(key, ProcessStatus::Enqueued).await
    }

    /// Apply a status reported for a process.
    ///
    /// Reporting the current status again is accepted and changes nothing.
    /// Anything the state machine does not allow fails with
    /// `InvalidTransition`.
    pub async fn report_status(&self, key: &ProcessKey, status: ProcessStatus) -> Result<()> {
        let entry = self.require(key).await?;
        if entry.status == status {
            debug!(instance_id = %key, %status, "status unchanged");
            return Ok(());
        }
        if !entry.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: entry.status,
                to: status,
            });
        }

        self.store.update_status(key, status).await?;
        metrics::status_updates().add(1, &[KeyValue::new("to", status.as_str())]);
        record_status_change(&Span::current(), key, entry.status.as_str(), status.as_str());
        Ok(())
    }

    /// Suspend a running process until `condition` is met.
    pub async fn suspend(&self, key: &ProcessKey, condition: WaitCondition) -> Result<()> {
        let entry = self.require(key).await?;
        if entry.status != ProcessStatus::Running {
            return Err(Error::InvalidTransition {
                from: entry.status,
                to: ProcessStatus::Suspended,
            });
        }

        let wait_type = condition.wait_type();
        self.store.update_wait(key, Some(condition)).await?;
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "update_wait")]);
        record_status_change(
            &Span::current(),
            key,
            entry.status.as_str(),
            ProcessStatus::Suspended.as_str(),
        );
        info!(instance_id = %key, %wait_type, "process suspended");
        Ok(())
    }

    /// Claim the oldest enqueued process this agent can run.
    pub async fn poll(
        &self,
        agent_id: &str,
        capabilities: &AgentCapabilities,
    ) -> Result<Option<ProcessQueueEntry>> {
        let span = start_claim_span(agent_id);
        let claimed = self
            .store
            .poll(agent_id, capabilities)
            .instrument(span.clone())
            .await?;

        match &claimed {
            Some(entry) => {
                span.record("process.instance_id", tracing::field::display(entry.key.instance_id));
                metrics::queue_operations().add(1, &[KeyValue::new("operation", "poll")]);
                span.in_scope(|| info!(instance_id = %entry.key, agent_id, "process claimed"));
            }
            None => {
                metrics::queue_operations().add(1, &[KeyValue::new("operation", "poll_empty")]);
            }
        }
        Ok(claimed)
    }

    pub async fn get(&self, key: &ProcessKey) -> Result<Option<ProcessQueueEntry>> {
        self.store.get(key).await
    }

    pub async fn find_key(&self, instance_id: Uuid) -> Result<Option<ProcessKey>> {
        self.store.find_key(instance_id).await
    }

    async fn require(&self, key: &ProcessKey) -> Result<ProcessQueueEntry> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("process {key}")))
    }
}

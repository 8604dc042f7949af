//! Waiting for other processes to finish.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ProcessWaitHandler, unexpected_condition};
use crate::error::Result;
use crate::model::{ProcessCompletionWait, WaitCondition, WaitType};
use crate::store::{QueueStore, WaitingProcess};

pub struct ProcessCompletionHandler {
    queue: Arc<dyn QueueStore>,
}

impl ProcessCompletionHandler {
    pub fn new(queue: Arc<dyn QueueStore>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl ProcessWaitHandler for ProcessCompletionHandler {
    fn wait_type(&self) -> WaitType {
        WaitType::ProcessCompletion
    }

    async fn process(&self, process: &WaitingProcess) -> Result<Option<WaitCondition>> {
        let WaitCondition::ProcessCompletion(wait) = &process.waits else {
            return Err(unexpected_condition(self.wait_type(), process));
        };

        let targets: Vec<Uuid> = wait.targets.iter().copied().collect();
        let statuses = self.queue.get_statuses(&targets).await?;

        let remaining: BTreeSet<Uuid> = targets
            .into_iter()
            .filter(|id| match statuses.get(id) {
                Some(status) => !status.is_terminal(),
                None => {
                    warn!(instance_id = %process.key, target = %id, "wait target not found, treating as finished");
                    false
                }
            })
            .collect();

        if remaining.is_empty() {
            debug!(instance_id = %process.key, "all wait targets finished");
            return Ok(None);
        }

        Ok(Some(WaitCondition::ProcessCompletion(ProcessCompletionWait {
            targets: remaining,
        })))
    }
}

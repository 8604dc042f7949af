//! Wait resolution watchdog.
//!
//! Each pass walks every suspended process with a wait condition in
//! `(last_updated_at, instance_id)` order and hands it to the handler for
//! its condition type. The result is written back only when it differs
//! from what is stored, so an unresolved entry keeps its `last_updated_at`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use super::handlers::HandlerRegistry;
use super::scheduler::ScheduledTask;
use crate::error::Result;
use crate::store::{QueueStore, WaitCursor, WaitingProcess};
use crate::telemetry::metrics;
use crate::telemetry::queue::{record_pass_summary, start_watchdog_span};

/// Counts from one watchdog pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub visited: usize,
    pub unchanged: usize,
    /// Narrowed but still waiting.
    pub updated: usize,
    /// Condition cleared; the process went back to the queue.
    pub resolved: usize,
    pub failed: usize,
    pub no_handler: usize,
}

enum Outcome {
    Unchanged,
    Updated,
    Resolved,
    Failed,
    NoHandler,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Unchanged => "unchanged",
            Outcome::Updated => "updated",
            Outcome::Resolved => "resolved",
            Outcome::Failed => "error",
            Outcome::NoHandler => "no_handler",
        }
    }
}

pub struct ProcessWaitWatchdog {
    queue: Arc<dyn QueueStore>,
    handlers: HandlerRegistry,
    interval: Duration,
}

impl ProcessWaitWatchdog {
    pub fn new(queue: Arc<dyn QueueStore>, handlers: HandlerRegistry, interval: Duration) -> Self {
        Self {
            queue,
            handlers,
            interval,
        }
    }

    /// Run one full pass over the suspended processes.
    ///
    /// Handler failures are logged and counted; only a failure to read the
    /// next entry aborts the pass.
    pub async fn run_pass(&self) -> Result<PassSummary> {
        let span = start_watchdog_span();
        let started = Instant::now();
        let summary = self.scan().instrument(span.clone()).await?;

        record_pass_summary(&span, summary.visited, summary.resolved);
        metrics::watchdog_pass_duration_ms()
            .record(started.elapsed().as_secs_f64() * 1000.0, &[]);

        if summary.visited > 0 {
            info!(
                visited = summary.visited,
                unchanged = summary.unchanged,
                updated = summary.updated,
                resolved = summary.resolved,
                failed = summary.failed,
                no_handler = summary.no_handler,
                "watchdog pass complete"
            );
        }

        Ok(summary)
    }

    async fn scan(&self) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        let mut cursor: Option<WaitCursor> = None;
        // an entry rewritten during the pass sorts after the cursor again
        let mut seen: HashSet<Uuid> = HashSet::new();

        while let Some(item) = self.queue.next_wait_item(cursor).await? {
            cursor = Some(item.cursor());
            if !seen.insert(item.key.instance_id) {
                continue;
            }

            summary.visited += 1;
            let outcome = self.visit(&item).await;
            metrics::watchdog_entries().add(
                1,
                &[
                    KeyValue::new("wait_type", item.waits.wait_type().to_string()),
                    KeyValue::new("result", outcome.label()),
                ],
            );

            match outcome {
                Outcome::Unchanged => summary.unchanged += 1,
                Outcome::Updated => summary.updated += 1,
                Outcome::Resolved => summary.resolved += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::NoHandler => summary.no_handler += 1,
            }
        }

        Ok(summary)
    }

    async fn visit(&self, item: &WaitingProcess) -> Outcome {
        let wait_type = item.waits.wait_type();
        let Some(handler) = self.handlers.get(wait_type) else {
            warn!(instance_id = %item.key, %wait_type, "no handler for wait condition");
            return Outcome::NoHandler;
        };

        let next = match handler.process(item).await {
            Ok(next) => next,
            Err(e) => {
                error!(instance_id = %item.key, %wait_type, error = %e, "wait handler failed");
                return Outcome::Failed;
            }
        };

        if next.as_ref() == Some(&item.waits) {
            return Outcome::Unchanged;
        }

        let resolved = next.is_none();
        if let Err(e) = self.queue.update_wait(&item.key, next).await {
            error!(instance_id = %item.key, %wait_type, error = %e, "failed to store wait condition");
            return Outcome::Failed;
        }

        metrics::queue_operations().add(1, &[KeyValue::new("operation", "update_wait")]);
        if resolved {
            debug!(instance_id = %item.key, %wait_type, "wait resolved");
            Outcome::Resolved
        } else {
            debug!(instance_id = %item.key, %wait_type, "wait narrowed");
            Outcome::Updated
        }
    }
}

#[async_trait]
impl ScheduledTask for ProcessWaitWatchdog {
    fn name(&self) -> &'static str {
        "process-wait-watchdog"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn perform(&self) -> Result<()> {
        self.run_pass().await.map(|_| ())
    }
}

//! Periodic task runner.
//!
//! Every registered task runs in its own loop on a fixed interval. A firing
//! is awaited before the next tick is taken, so one task never overlaps
//! itself; ticks missed while a slow firing runs are skipped, not queued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, error, info};

use crate::error::{Error, Result};
use crate::telemetry::metrics;
use crate::telemetry::queue::start_task_span;

/// A unit of periodic background work.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn perform(&self) -> Result<()>;
}

/// Stops a running [`TaskScheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    /// Signal every task loop to stop after its current firing.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

pub struct TaskScheduler {
    tasks: Vec<Arc<dyn ScheduledTask>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tasks: Vec::new(),
            shutdown: Arc::new(tx),
        }
    }

    pub fn register(mut self, task: Arc<dyn ScheduledTask>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Run all task loops until shutdown is signalled.
    pub async fn run(self) -> Result<()> {
        let mut loops = JoinSet::new();
        for task in self.tasks {
            let shutdown = self.shutdown.subscribe();
            loops.spawn(run_task(task, shutdown));
        }

        info!(tasks = loops.len(), "scheduler started");

        while let Some(joined) = loops.join_next().await {
            joined.map_err(|e| Error::Other(format!("scheduled task panicked: {e}")))?;
        }

        info!("scheduler stopped");
        Ok(())
    }
}

async fn run_task(task: Arc<dyn ScheduledTask>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(task.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let result = task.perform().instrument(start_task_span(task.name())).await;
        let label = match &result {
            Ok(()) => "ok",
            Err(e) => {
                error!(task = task.name(), error = %e, "scheduled task failed");
                "error"
            }
        };
        metrics::task_runs().add(
            1,
            &[
                KeyValue::new("task", task.name()),
                KeyValue::new("result", label),
            ],
        );
    }

    info!(task = task.name(), "task loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        overlapped: AtomicUsize,
    }

    #[async_trait]
    impl ScheduledTask for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn perform(&self) -> Result<()> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            // slower than the interval
            tokio::time::sleep(Duration::from_millis(25)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn firings_never_overlap_and_shutdown_stops_loops() {
        let task = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            overlapped: AtomicUsize::new(0),
        });
        let scheduler = TaskScheduler::new().register(task.clone());
        let handle = scheduler.handle();
        let running = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown();
        running.await.unwrap().unwrap();

        assert!(task.runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(task.overlapped.load(Ordering::SeqCst), 0);
    }
}

//! Wait resolution: one watchdog pass over suspended processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use procq::engine::{
    AgentManager, Engine, HandlerRegistry, ProcessQueue, ProcessWaitHandler, ProcessWaitWatchdog,
};
use procq::config::SchedulerConfig;
use procq::error::{Error, Result};
use procq::model::{
    AgentCapabilities, CommandPayload, ExclusiveMode, NewProcess, ProcessKey, ProcessStatus,
    WaitCondition, WaitType,
};
use procq::store::{MemoryCommandStore, MemoryQueueStore, QueueStore, WaitingProcess};
use uuid::Uuid;

fn key_at(secs: i64) -> ProcessKey {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    ProcessKey::new(Uuid::new_v4(), base + Duration::seconds(secs))
}

struct Fixture {
    store: Arc<MemoryQueueStore>,
    commands: Arc<MemoryCommandStore>,
    engine: Engine,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(MemoryQueueStore::new());
        let commands = Arc::new(MemoryCommandStore::new());
        let engine = Engine::new(store.clone(), commands.clone(), &SchedulerConfig::default());
        Self {
            store,
            commands,
            engine,
        }
    }

    fn queue(&self) -> &ProcessQueue {
        &self.engine.queue
    }

    fn watchdog_with(&self, handlers: HandlerRegistry) -> ProcessWaitWatchdog {
        ProcessWaitWatchdog::new(self.store.clone(), handlers, StdDuration::from_secs(5))
    }

    /// Submit, enqueue, claim and start a process.
    async fn running(&self, new: NewProcess) -> ProcessKey {
        let key = self.queue().submit(new).await.unwrap();
        self.queue().enqueue(&key).await.unwrap();
        let claimed = self
            .queue()
            .poll(&format!("agent-{}", key.instance_id), &AgentCapabilities::none())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.key, key);
        self.queue()
            .report_status(&key, ProcessStatus::Running)
            .await
            .unwrap();
        key
    }

    async fn suspended(&self, new: NewProcess, condition: WaitCondition) -> ProcessKey {
        let key = self.running(new).await;
        self.queue().suspend(&key, condition).await.unwrap();
        key
    }

    async fn status(&self, key: &ProcessKey) -> ProcessStatus {
        self.store.get(key).await.unwrap().unwrap().status
    }
}

#[tokio::test]
async fn one_pass_resolves_every_satisfied_wait() {
    let fx = Fixture::new();
    let target_a = fx.running(NewProcess::new(key_at(0))).await;
    let target_b = fx.running(NewProcess::new(key_at(1))).await;

    let on_a = fx
        .suspended(
            NewProcess::new(key_at(10)),
            WaitCondition::process_completion([target_a.instance_id]),
        )
        .await;
    let on_both = fx
        .suspended(
            NewProcess::new(key_at(11)),
            WaitCondition::process_completion([target_a.instance_id, target_b.instance_id]),
        )
        .await;
    let on_b = fx
        .suspended(
            NewProcess::new(key_at(12)),
            WaitCondition::process_completion([target_b.instance_id]),
        )
        .await;

    fx.queue()
        .report_status(&target_a, ProcessStatus::Finished)
        .await
        .unwrap();
    let untouched = fx.store.get(&on_b).await.unwrap().unwrap();

    let summary = fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(summary.visited, 3);
    assert_eq!(summary.resolved, 1);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.unchanged, 1);

    let resolved = fx.store.get(&on_a).await.unwrap().unwrap();
    assert_eq!(resolved.status, ProcessStatus::Enqueued);
    assert!(resolved.wait_conditions.is_none());

    let narrowed = fx.store.get(&on_both).await.unwrap().unwrap();
    assert_eq!(narrowed.status, ProcessStatus::Suspended);
    assert_eq!(
        narrowed.wait_conditions,
        Some(WaitCondition::process_completion([target_b.instance_id]))
    );

    let after = fx.store.get(&on_b).await.unwrap().unwrap();
    assert_eq!(after, untouched);
}

#[tokio::test]
async fn missing_targets_count_as_finished() {
    let fx = Fixture::new();
    let key = fx
        .suspended(
            NewProcess::new(key_at(0)),
            WaitCondition::process_completion([Uuid::new_v4()]),
        )
        .await;

    let summary = fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(summary.resolved, 1);
    assert_eq!(fx.status(&key).await, ProcessStatus::Enqueued);
}

#[tokio::test]
async fn resolved_process_can_be_claimed_again() {
    let fx = Fixture::new();
    let target = fx.running(NewProcess::new(key_at(0))).await;
    let waiter = fx
        .suspended(
            NewProcess::new(key_at(1)),
            WaitCondition::process_completion([target.instance_id]),
        )
        .await;
    fx.queue()
        .report_status(&target, ProcessStatus::Failed)
        .await
        .unwrap();

    fx.engine.watchdog.run_pass().await.unwrap();

    let claimed = fx
        .queue()
        .poll("agent-next", &AgentCapabilities::none())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.key, waiter);
    assert_eq!(claimed.last_agent_id.as_deref(), Some("agent-next"));
}

/// Returns a different condition every time it is asked.
struct Restless {
    calls: AtomicUsize,
}

#[async_trait]
impl ProcessWaitHandler for Restless {
    fn wait_type(&self) -> WaitType {
        WaitType::ProcessCompletion
    }

    async fn process(&self, _process: &WaitingProcess) -> Result<Option<WaitCondition>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(WaitCondition::process_completion([Uuid::new_v4()])))
    }
}

#[tokio::test]
async fn pass_visits_each_entry_once_even_when_rewritten() {
    let fx = Fixture::new();
    for i in 0..25 {
        fx.suspended(
            NewProcess::new(key_at(i)),
            WaitCondition::process_completion([Uuid::new_v4()]),
        )
        .await;
    }

    let handler = Arc::new(Restless {
        calls: AtomicUsize::new(0),
    });
    let watchdog = fx.watchdog_with(HandlerRegistry::empty().with(handler.clone()));

    let summary = watchdog.run_pass().await.unwrap();
    assert_eq!(summary.visited, 25);
    assert_eq!(summary.updated, 25);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 25);
}

#[tokio::test]
async fn condition_without_handler_is_left_alone() {
    let fx = Fixture::new();
    let key = fx.running(NewProcess::new(key_at(0))).await;
    fx.store
        .update_wait(&key, Some(WaitCondition::Unknown))
        .await
        .unwrap();
    let before = fx.store.get(&key).await.unwrap().unwrap();

    let summary = fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(summary.visited, 1);
    assert_eq!(summary.no_handler, 1);

    let after = fx.store.get(&key).await.unwrap().unwrap();
    assert_eq!(after, before);
}

struct Broken;

#[async_trait]
impl ProcessWaitHandler for Broken {
    fn wait_type(&self) -> WaitType {
        WaitType::Exclusive
    }

    async fn process(&self, _process: &WaitingProcess) -> Result<Option<WaitCondition>> {
        Err(Error::Other("handler exploded".to_string()))
    }
}

#[tokio::test]
async fn failing_handler_does_not_stop_the_pass() {
    let fx = Fixture::new();
    let org = Uuid::new_v4();
    let project = Uuid::new_v4();
    let exclusive = fx
        .suspended(
            NewProcess::new(key_at(0)).project(org, project),
            WaitCondition::exclusive("deploy", ExclusiveMode::Wait),
        )
        .await;
    let completion = fx
        .suspended(
            NewProcess::new(key_at(1)),
            WaitCondition::process_completion([Uuid::new_v4()]),
        )
        .await;

    let handlers = HandlerRegistry::empty()
        .with(Arc::new(Broken))
        .with(Arc::new(procq::engine::ProcessCompletionHandler::new(
            fx.store.clone(),
        )));
    let summary = fx.watchdog_with(handlers).run_pass().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.resolved, 1);
    assert_eq!(fx.status(&exclusive).await, ProcessStatus::Suspended);
    assert_eq!(fx.status(&completion).await, ProcessStatus::Enqueued);
}

#[tokio::test]
async fn exclusive_wait_lets_one_member_through_at_a_time() {
    let fx = Fixture::new();
    let org = Uuid::new_v4();
    let project = Uuid::new_v4();
    let member = |secs| NewProcess::new(key_at(secs)).project(org, project);
    let wait = || WaitCondition::exclusive("deploy", ExclusiveMode::Wait);

    let first = fx.suspended(member(0), wait()).await;
    let second = fx.suspended(member(1), wait()).await;
    let third = fx.suspended(member(2), wait()).await;

    fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(fx.status(&first).await, ProcessStatus::Enqueued);
    assert_eq!(fx.status(&second).await, ProcessStatus::Suspended);
    assert_eq!(fx.status(&third).await, ProcessStatus::Suspended);

    // first is active again, so nobody moves
    let summary = fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(summary.resolved, 0);

    fx.queue()
        .report_status(&first, ProcessStatus::Cancelled)
        .await
        .unwrap();
    fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(fx.status(&second).await, ProcessStatus::Enqueued);
    assert_eq!(fx.status(&third).await, ProcessStatus::Suspended);
}

#[tokio::test]
async fn exclusive_groups_are_scoped_by_project() {
    let fx = Fixture::new();
    let org = Uuid::new_v4();
    let wait = || WaitCondition::exclusive("deploy", ExclusiveMode::Wait);

    let a = fx
        .suspended(NewProcess::new(key_at(0)).project(org, Uuid::new_v4()), wait())
        .await;
    let b = fx
        .suspended(NewProcess::new(key_at(1)).project(org, Uuid::new_v4()), wait())
        .await;

    let summary = fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(summary.resolved, 2);
    assert_eq!(fx.status(&a).await, ProcessStatus::Enqueued);
    assert_eq!(fx.status(&b).await, ProcessStatus::Enqueued);
}

#[tokio::test]
async fn cancel_old_signals_older_members_once() {
    let fx = Fixture::new();
    let org = Uuid::new_v4();
    let project = Uuid::new_v4();

    let old = fx
        .running(
            NewProcess::new(key_at(0))
                .project(org, project)
                .exclusive_group("deploy"),
        )
        .await;
    let new = fx
        .suspended(
            NewProcess::new(key_at(1)).project(org, project),
            WaitCondition::exclusive("deploy", ExclusiveMode::CancelOld),
        )
        .await;

    let summary = fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(summary.updated, 1);

    let issued = fx.commands.all().await;
    assert_eq!(issued.len(), 1);
    assert_eq!(
        issued[0].payload,
        CommandPayload::Cancel {
            instance_id: old.instance_id
        }
    );
    assert_eq!(fx.status(&new).await, ProcessStatus::Suspended);

    // still running, but already signalled
    let summary = fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(summary.unchanged, 1);
    assert_eq!(fx.commands.all().await.len(), 1);

    // the agent reports the cancellation
    fx.queue()
        .report_status(&old, ProcessStatus::Cancelled)
        .await
        .unwrap();
    let summary = fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(summary.resolved, 1);
    assert_eq!(fx.status(&new).await, ProcessStatus::Enqueued);
}

#[tokio::test]
async fn cancel_old_cancels_unclaimed_members_in_place() {
    let fx = Fixture::new();
    let org = Uuid::new_v4();
    let project = Uuid::new_v4();

    let queued = fx
        .queue()
        .submit(
            NewProcess::new(key_at(0))
                .project(org, project)
                .exclusive_group("deploy"),
        )
        .await
        .unwrap();
    let new = fx
        .suspended(
            NewProcess::new(key_at(1)).project(org, project),
            WaitCondition::exclusive("deploy", ExclusiveMode::CancelOld),
        )
        .await;

    fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(fx.status(&queued).await, ProcessStatus::Cancelled);
    assert!(fx.commands.all().await.is_empty());

    fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(fx.status(&new).await, ProcessStatus::Enqueued);
}

#[tokio::test]
async fn cancel_old_cancels_released_members_in_place() {
    let fx = Fixture::new();
    let org = Uuid::new_v4();
    let project = Uuid::new_v4();
    let blocker = fx.running(NewProcess::new(key_at(0))).await;

    // both were claimed once, so both still name their last agent
    let parked = fx
        .suspended(
            NewProcess::new(key_at(1))
                .project(org, project)
                .exclusive_group("deploy"),
            WaitCondition::process_completion([blocker.instance_id]),
        )
        .await;
    let requeued = fx
        .suspended(
            NewProcess::new(key_at(2))
                .project(org, project)
                .exclusive_group("deploy"),
            WaitCondition::process_completion([blocker.instance_id]),
        )
        .await;
    let new = fx
        .suspended(
            NewProcess::new(key_at(3)).project(org, project),
            WaitCondition::exclusive("deploy", ExclusiveMode::CancelOld),
        )
        .await;
    fx.store.update_wait(&requeued, None).await.unwrap();
    assert_eq!(fx.status(&requeued).await, ProcessStatus::Enqueued);

    fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(fx.status(&parked).await, ProcessStatus::Cancelled);
    assert_eq!(fx.status(&requeued).await, ProcessStatus::Cancelled);
    assert!(fx.commands.all().await.is_empty());

    fx.engine.watchdog.run_pass().await.unwrap();
    assert_eq!(fx.status(&new).await, ProcessStatus::Enqueued);
    assert_eq!(fx.status(&blocker).await, ProcessStatus::Running);
}

#[tokio::test]
async fn standard_registry_covers_known_wait_types() {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
    let agents = Arc::new(AgentManager::new(
        store.clone(),
        Arc::new(MemoryCommandStore::new()),
    ));
    let registry = procq::engine::standard_handlers(store, agents);

    assert_eq!(registry.len(), 2);
    assert!(registry.get(WaitType::ProcessCompletion).is_some());
    assert!(registry.get(WaitType::Exclusive).is_some());
    assert!(registry.get(WaitType::Unknown).is_none());
}

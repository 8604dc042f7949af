//! Property tests: a stored wait condition always implies `Suspended`,
//! whatever order status updates, wait updates, claims and watchdog passes
//! arrive in.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use uuid::Uuid;

use procq::config::SchedulerConfig;
use procq::engine::Engine;
use procq::model::{
    AgentCapabilities, ExclusiveMode, NewProcess, ProcessKey, ProcessStatus, WaitCondition,
};
use procq::store::{MemoryCommandStore, MemoryQueueStore, QueueStore};

const ENTRIES: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Status(usize, ProcessStatus),
    Wait(usize, Option<WaitCondition>),
    Poll,
    Watchdog,
}

fn arb_status() -> impl Strategy<Value = ProcessStatus> {
    prop::sample::select(ProcessStatus::ALL.to_vec())
}

fn arb_condition(keys: Vec<Uuid>) -> impl Strategy<Value = WaitCondition> {
    prop_oneof![
        prop::sample::subsequence(keys, 1..=ENTRIES).prop_map(WaitCondition::process_completion),
        prop::sample::select(vec![ExclusiveMode::Wait, ExclusiveMode::CancelOld])
            .prop_map(|mode| WaitCondition::exclusive("group", mode)),
    ]
}

fn arb_op(keys: Vec<Uuid>) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..ENTRIES, arb_status()).prop_map(|(i, s)| Op::Status(i, s)),
        3 => (0..ENTRIES, prop::option::of(arb_condition(keys))).prop_map(|(i, c)| Op::Wait(i, c)),
        1 => Just(Op::Poll),
        1 => Just(Op::Watchdog),
    ]
}

fn keys() -> Vec<ProcessKey> {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    (0..ENTRIES)
        .map(|i| ProcessKey::new(Uuid::from_u128(i as u128 + 1), base + Duration::seconds(i as i64)))
        .collect()
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    let ids: Vec<Uuid> = keys().iter().map(|k| k.instance_id).collect();
    prop::collection::vec(arb_op(ids), 1..40)
}

async fn check(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let store = Arc::new(MemoryQueueStore::new());
    let commands = Arc::new(MemoryCommandStore::new());
    let engine = Engine::new(store.clone(), commands, &SchedulerConfig::default());
    let org = Uuid::from_u128(100);
    let project = Uuid::from_u128(200);

    let keys = keys();
    for key in &keys {
        store
            .insert_initial(NewProcess::new(*key).project(org, project))
            .await
            .unwrap();
    }

    for op in ops {
        match op {
            Op::Status(i, status) => store.update_status(&keys[i], status).await.unwrap(),
            Op::Wait(i, condition) => store.update_wait(&keys[i], condition).await.unwrap(),
            Op::Poll => {
                store.poll("agent", &AgentCapabilities::none()).await.unwrap();
            }
            Op::Watchdog => {
                engine.watchdog.run_pass().await.unwrap();
            }
        }

        for entry in store.snapshot().await {
            prop_assert!(
                entry.wait_conditions.is_none() || entry.status == ProcessStatus::Suspended,
                "{} has a wait condition in status {}",
                entry.key,
                entry.status
            );
        }
    }

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn wait_condition_implies_suspended(ops in ops()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(check(ops))?;
    }
}

proptest! {
    #[test]
    fn terminal_status_is_final(
        status in prop::sample::select(ProcessStatus::TERMINAL.to_vec()),
        later in prop::collection::vec(arb_status(), 1..10),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let store = MemoryQueueStore::new();
            let key = keys()[0];
            store.insert_initial(NewProcess::new(key)).await.unwrap();
            store.update_status(&key, status).await.unwrap();
            for next in later {
                store.update_status(&key, next).await.unwrap();
                store
                    .update_wait(&key, Some(WaitCondition::process_completion([Uuid::nil()])))
                    .await
                    .unwrap();
            }
            let entry = store.get(&key).await.unwrap().unwrap();
            prop_assert_eq!(entry.status, status);
            prop_assert!(entry.wait_conditions.is_none());
            Ok(())
        })?;
    }
}

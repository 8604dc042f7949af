//! Span helpers for queue activity.

use tracing::Span;

use crate::model::ProcessKey;

/// Start a span for one firing of a scheduled task.
pub fn start_task_span(task: &str) -> Span {
    tracing::info_span!("scheduler.task", "task.name" = task)
}

/// Start a span for one claim attempt by an agent.
///
/// `process.instance_id` is filled in when the claim succeeds.
pub fn start_claim_span(agent_id: &str) -> Span {
    tracing::info_span!(
        "queue.claim",
        "agent.id" = agent_id,
        "process.instance_id" = tracing::field::Empty,
    )
}

/// Start a span for one watchdog pass.
///
/// The `watchdog.visited` and `watchdog.resolved` fields are declared empty
/// and filled in by [`record_pass_summary`].
pub fn start_watchdog_span() -> Span {
    tracing::info_span!(
        "watchdog.pass",
        "watchdog.visited" = tracing::field::Empty,
        "watchdog.resolved" = tracing::field::Empty,
    )
}

pub fn record_pass_summary(span: &Span, visited: usize, resolved: usize) {
    span.record("watchdog.visited", visited);
    span.record("watchdog.resolved", resolved);
}

/// Record a status transition event on the given span.
pub fn record_status_change(span: &Span, key: &ProcessKey, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(instance_id = %key, from, to, "status_change");
    });
}

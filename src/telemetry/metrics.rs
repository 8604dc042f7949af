//! Metric instrument factories for procq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"procq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for procq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("procq")
}

/// Counter: queue-level operations.
/// Labels: `operation` ("insert" | "poll" | "poll_empty" | "update_wait").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("procq.queue.operations")
        .with_description("Number of process queue operations")
        .build()
}

/// Counter: status updates written to the queue.
/// Labels: `to`.
pub fn status_updates() -> Counter<u64> {
    meter()
        .u64_counter("procq.process.status_updates")
        .with_description("Number of process status updates")
        .build()
}

/// Counter: entries visited by the wait watchdog.
/// Labels: `wait_type`, `result` ("unchanged" | "updated" | "resolved" | "error" | "no_handler").
pub fn watchdog_entries() -> Counter<u64> {
    meter()
        .u64_counter("procq.watchdog.entries")
        .with_description("Suspended processes visited by the wait watchdog")
        .build()
}

/// Histogram: duration of one watchdog pass in milliseconds.
pub fn watchdog_pass_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("procq.watchdog.pass_duration_ms")
        .with_description("Duration of one wait watchdog pass")
        .with_unit("ms")
        .build()
}

/// Counter: commands issued to agents.
/// Labels: `command`.
pub fn commands_issued() -> Counter<u64> {
    meter()
        .u64_counter("procq.commands.issued")
        .with_description("Number of commands issued to agents")
        .build()
}

/// Counter: sent commands moved back to created for redelivery.
pub fn commands_redelivered() -> Counter<u64> {
    meter()
        .u64_counter("procq.commands.redelivered")
        .with_description("Unacknowledged commands queued for redelivery")
        .build()
}

/// Counter: scheduled task firings.
/// Labels: `task`, `result` ("ok" | "error").
pub fn task_runs() -> Counter<u64> {
    meter()
        .u64_counter("procq.scheduler.task_runs")
        .with_description("Number of scheduled task firings")
        .build()
}

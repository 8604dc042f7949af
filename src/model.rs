//! Core data model.
//!
//! A process queue entry is the mutable record of one process instance:
//! its identity, lifecycle status, the agent that owns it and, while it is
//! suspended, the condition it is waiting on.

pub mod command;
pub mod wait;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

pub use command::{AgentCommand, CommandPayload, CommandStatus};
pub use wait::{ExclusiveMode, ExclusiveWait, ProcessCompletionWait, WaitCondition, WaitType};

// ---------------------------------------------------------------------------
// Process Key
// ---------------------------------------------------------------------------

/// Stable identity of a process instance.
///
/// The creation timestamp is part of the identity: it orders the queue and
/// partitions storage, so it has to survive every round trip unchanged.
/// Timestamps are truncated to microseconds, the precision Postgres keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessKey {
    pub instance_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl ProcessKey {
    pub fn new(instance_id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            created_at: created_at.trunc_subsecs(6),
        }
    }

    /// A fresh key for a new instance created now.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4(), Utc::now())
    }

    /// Queue order: oldest first, instance id breaks ties.
    pub fn fifo_order(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.instance_id)
    }
}

impl std::fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.instance_id)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    /// Inserted by a producer, not yet eligible for claiming.
    Preparing,
    /// Waiting in the claim pool.
    Enqueued,
    /// Claimed by an agent, execution starting.
    Starting,
    Running,
    /// Parked until its wait condition resolves.
    Suspended,
    /// Being resumed in place by its agent.
    Resuming,
    Finished,
    Failed,
    Cancelled,
    TimedOut,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 10] = [
        ProcessStatus::Preparing,
        ProcessStatus::Enqueued,
        ProcessStatus::Starting,
        ProcessStatus::Running,
        ProcessStatus::Suspended,
        ProcessStatus::Resuming,
        ProcessStatus::Finished,
        ProcessStatus::Failed,
        ProcessStatus::Cancelled,
        ProcessStatus::TimedOut,
    ];

    pub const TERMINAL: [ProcessStatus; 4] = [
        ProcessStatus::Finished,
        ProcessStatus::Failed,
        ProcessStatus::Cancelled,
        ProcessStatus::TimedOut,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ProcessStatus) -> bool {
        use ProcessStatus::*;
        if self.is_terminal() {
            return false;
        }
        if to == Cancelled {
            return true;
        }
        matches!(
            (self, to),
            (Preparing, Enqueued)
                | (Preparing, Failed)
                | (Enqueued, Starting)
                | (Starting, Running)
                | (Running, Suspended)
                | (Suspended, Resuming)
                | (Suspended, Enqueued) // wait condition resolved
                | (Resuming, Running)
                | (Enqueued | Starting | Running | Suspended | Resuming, Finished | Failed | TimedOut)
        )
    }

    /// Is an agent executing the process right now?
    pub fn is_on_agent(self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Resuming
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Finished
                | ProcessStatus::Failed
                | ProcessStatus::Cancelled
                | ProcessStatus::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Preparing => "PREPARING",
            ProcessStatus::Enqueued => "ENQUEUED",
            ProcessStatus::Starting => "STARTING",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Suspended => "SUSPENDED",
            ProcessStatus::Resuming => "RESUMING",
            ProcessStatus::Finished => "FINISHED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::Cancelled => "CANCELLED",
            ProcessStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        ProcessStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == upper)
            .ok_or_else(|| Error::Other(format!("unknown process status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// What started the process: a regular run or one of the handler processes
/// spawned when a parent fails, is cancelled or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    #[default]
    Default,
    FailureHandler,
    CancelHandler,
    TimeoutHandler,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Default => "default",
            ProcessKind::FailureHandler => "failure_handler",
            ProcessKind::CancelHandler => "cancel_handler",
            ProcessKind::TimeoutHandler => "timeout_handler",
        }
    }
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(ProcessKind::Default),
            "failure_handler" => Ok(ProcessKind::FailureHandler),
            "cancel_handler" => Ok(ProcessKind::CancelHandler),
            "timeout_handler" => Ok(ProcessKind::TimeoutHandler),
            other => Err(Error::Other(format!("unknown process kind: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue Entry
// ---------------------------------------------------------------------------

/// The queue's record of one process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessQueueEntry {
    pub key: ProcessKey,
    pub kind: ProcessKind,
    pub parent_instance_id: Option<Uuid>,
    pub status: ProcessStatus,

    /// Agent that claimed the entry last. `None` until the first claim.
    pub last_agent_id: Option<String>,

    /// Present only while `status == Suspended`.
    pub wait_conditions: Option<WaitCondition>,

    pub project_id: Option<Uuid>,
    pub org_id: Option<Uuid>,

    /// Capabilities an agent must advertise to claim this entry.
    /// `None` means any agent will do.
    pub requirements: Option<serde_json::Value>,

    /// Exclusive group the entry belongs to while it is active.
    pub exclusive_group: Option<String>,

    /// Arguments supplied by the producer. Opaque to the queue.
    pub meta: serde_json::Value,

    pub last_updated_at: DateTime<Utc>,
}

impl ProcessQueueEntry {
    pub fn instance_id(&self) -> Uuid {
        self.key.instance_id
    }
}

/// Agent capabilities presented on `poll`. Matched against entry
/// requirements with JSON containment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentCapabilities(pub Option<serde_json::Value>);

impl AgentCapabilities {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(value: serde_json::Value) -> Self {
        Self(Some(value))
    }

    /// Does an agent with these capabilities satisfy `requirements`?
    pub fn satisfies(&self, requirements: Option<&serde_json::Value>) -> bool {
        match (requirements, &self.0) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(req), Some(caps)) => json_contains(caps, req),
        }
    }
}

/// JSON containment with the same rules as Postgres `jsonb @>`.
pub fn json_contains(container: &serde_json::Value, contained: &serde_json::Value) -> bool {
    contains_at(container, contained, true)
}

fn contains_at(
    container: &serde_json::Value,
    contained: &serde_json::Value,
    top_level: bool,
) -> bool {
    use serde_json::Value;
    match (container, contained) {
        (Value::Object(outer), Value::Object(inner)) => inner
            .iter()
            .all(|(k, v)| outer.get(k).is_some_and(|o| contains_at(o, v, false))),
        (Value::Array(outer), Value::Array(inner)) => inner
            .iter()
            .all(|v| outer.iter().any(|o| contains_at(o, v, false))),
        // only a top-level array contains a bare scalar
        (Value::Array(outer), scalar)
            if top_level && !scalar.is_object() && !scalar.is_array() =>
        {
            outer.iter().any(|o| o == scalar)
        }
        (a, b) => a == b,
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// A process about to be inserted. The producer's entry point into the queue.
#[derive(Debug, Clone)]
pub struct NewProcess {
    pub(crate) key: ProcessKey,
    pub(crate) kind: ProcessKind,
    pub(crate) parent_instance_id: Option<Uuid>,
    pub(crate) project_id: Option<Uuid>,
    pub(crate) org_id: Option<Uuid>,
    pub(crate) requirements: Option<serde_json::Value>,
    pub(crate) exclusive_group: Option<String>,
    pub(crate) meta: serde_json::Value,
}

impl NewProcess {
    pub fn new(key: ProcessKey) -> Self {
        Self {
            key,
            kind: ProcessKind::Default,
            parent_instance_id: None,
            project_id: None,
            org_id: None,
            requirements: None,
            exclusive_group: None,
            meta: serde_json::Value::Null,
        }
    }

    pub fn key(&self) -> ProcessKey {
        self.key
    }

    pub fn kind(mut self, kind: ProcessKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn parent(mut self, parent_instance_id: Uuid) -> Self {
        self.parent_instance_id = Some(parent_instance_id);
        self
    }

    pub fn project(mut self, org_id: Uuid, project_id: Uuid) -> Self {
        self.org_id = Some(org_id);
        self.project_id = Some(project_id);
        self
    }

    pub fn requirements(mut self, requirements: serde_json::Value) -> Self {
        self.requirements = Some(requirements);
        self
    }

    pub fn exclusive_group(mut self, group: impl Into<String>) -> Self {
        self.exclusive_group = Some(group.into());
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }

    /// The entry as it looks right after `insert_initial`.
    pub(crate) fn into_entry(self, now: DateTime<Utc>) -> ProcessQueueEntry {
        ProcessQueueEntry {
            key: self.key,
            kind: self.kind,
            parent_instance_id: self.parent_instance_id,
            status: ProcessStatus::Preparing,
            last_agent_id: None,
            wait_conditions: None,
            project_id: self.project_id,
            org_id: self.org_id,
            requirements: self.requirements,
            exclusive_group: self.exclusive_group,
            meta: self.meta,
            last_updated_at: now,
        }
    }
}

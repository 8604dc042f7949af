//! Wait conditions attached to suspended processes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a suspended process is waiting for.
///
/// Persisted as a JSON blob tagged by `type`. Tags this build does not know
/// about decode as [`WaitCondition::Unknown`] and are left alone by the
/// watchdog until a build with a matching handler picks them up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitCondition {
    ProcessCompletion(ProcessCompletionWait),
    Exclusive(ExclusiveWait),
    #[serde(other)]
    Unknown,
}

impl WaitCondition {
    pub fn process_completion(targets: impl IntoIterator<Item = Uuid>) -> Self {
        WaitCondition::ProcessCompletion(ProcessCompletionWait {
            targets: targets.into_iter().collect(),
        })
    }

    pub fn exclusive(group_key: impl Into<String>, mode: ExclusiveMode) -> Self {
        WaitCondition::Exclusive(ExclusiveWait {
            group_key: group_key.into(),
            mode,
            cancelled: BTreeSet::new(),
        })
    }

    /// Tag used to pick the handler.
    pub fn wait_type(&self) -> WaitType {
        match self {
            WaitCondition::ProcessCompletion(_) => WaitType::ProcessCompletion,
            WaitCondition::Exclusive(_) => WaitType::Exclusive,
            WaitCondition::Unknown => WaitType::Unknown,
        }
    }
}

/// Waits for other process instances to reach a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCompletionWait {
    pub targets: BTreeSet<Uuid>,
}

/// Serializes processes that share a group key within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusiveWait {
    pub group_key: String,
    pub mode: ExclusiveMode,
    /// Older contenders this waiter has already asked to cancel.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub cancelled: BTreeSet<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusiveMode {
    /// Wait until every older member of the group is done.
    Wait,
    /// Cancel older members of the group instead of waiting for them.
    CancelOld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitType {
    ProcessCompletion,
    Exclusive,
    Unknown,
}

impl std::fmt::Display for WaitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WaitType::ProcessCompletion => "PROCESS_COMPLETION",
            WaitType::Exclusive => "EXCLUSIVE",
            WaitType::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

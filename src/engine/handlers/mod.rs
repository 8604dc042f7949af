//! Wait condition handlers.
//!
//! A handler looks at one suspended process and returns the condition it
//! should wait on from now on: the same condition when nothing changed,
//! a narrower one when part of it is satisfied, or `None` when the process
//! can go back into the queue.

pub mod completion;
pub mod exclusive;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{WaitCondition, WaitType};
use crate::store::WaitingProcess;

pub use completion::ProcessCompletionHandler;
pub use exclusive::ExclusiveHandler;

#[async_trait]
pub trait ProcessWaitHandler: Send + Sync {
    /// The condition type this handler resolves.
    fn wait_type(&self) -> WaitType;

    async fn process(&self, process: &WaitingProcess) -> Result<Option<WaitCondition>>;
}

/// Handlers indexed by the condition type they resolve. Built once at
/// startup and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<WaitType, Arc<dyn ProcessWaitHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a handler. A later handler for the same type replaces an earlier one.
    pub fn with(mut self, handler: Arc<dyn ProcessWaitHandler>) -> Self {
        self.handlers.insert(handler.wait_type(), handler);
        self
    }

    pub fn get(&self, wait_type: WaitType) -> Option<&Arc<dyn ProcessWaitHandler>> {
        self.handlers.get(&wait_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub(crate) fn unexpected_condition(expected: WaitType, process: &WaitingProcess) -> Error {
    Error::Other(format!(
        "{expected} handler got a {} condition for process {}",
        process.waits.wait_type(),
        process.key
    ))
}

//! Queue operations, wait resolution, agent command dispatch and the
//! periodic task runner that drives them.

pub mod agent;
pub mod handlers;
pub mod queue;
pub mod scheduler;
pub mod watchdog;

use std::sync::Arc;

pub use agent::{AgentManager, CommandRedelivery, KillOutcome, KillSummary};
pub use handlers::{
    ExclusiveHandler, HandlerRegistry, ProcessCompletionHandler, ProcessWaitHandler,
};
pub use queue::ProcessQueue;
pub use scheduler::{ScheduledTask, SchedulerHandle, TaskScheduler};
pub use watchdog::{PassSummary, ProcessWaitWatchdog};

use crate::config::SchedulerConfig;
use crate::store::{CommandStore, QueueStore};

/// Everything the service needs, wired against one pair of stores.
#[derive(Clone)]
pub struct Engine {
    pub queue: ProcessQueue,
    pub agents: Arc<AgentManager>,
    pub watchdog: Arc<ProcessWaitWatchdog>,
    pub redelivery: Arc<CommandRedelivery>,
}

impl Engine {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        commands: Arc<dyn CommandStore>,
        config: &SchedulerConfig,
    ) -> Self {
        let agents = Arc::new(AgentManager::new(
            Arc::clone(&queue),
            Arc::clone(&commands),
        ));
        let handlers = standard_handlers(Arc::clone(&queue), Arc::clone(&agents));
        let watchdog = Arc::new(ProcessWaitWatchdog::new(
            Arc::clone(&queue),
            handlers,
            config.watchdog_interval(),
        ));
        let redelivery = Arc::new(CommandRedelivery::new(
            commands,
            config.command_redelivery_interval(),
            config.command_ack_timeout(),
        ));

        Self {
            queue: ProcessQueue::new(queue),
            agents,
            watchdog,
            redelivery,
        }
    }

    /// A scheduler with the watchdog and command redelivery registered.
    pub fn scheduler(&self) -> TaskScheduler {
        TaskScheduler::new()
            .register(self.watchdog.clone())
            .register(self.redelivery.clone())
    }
}

/// Handlers for every wait condition this build understands.
pub fn standard_handlers(queue: Arc<dyn QueueStore>, agents: Arc<AgentManager>) -> HandlerRegistry {
    HandlerRegistry::empty()
        .with(Arc::new(ProcessCompletionHandler::new(Arc::clone(&queue))))
        .with(Arc::new(ExclusiveHandler::new(queue, agents)))
}

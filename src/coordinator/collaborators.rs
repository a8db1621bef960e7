//! Seams to the outside world.
//!
//! The engine never executes work itself. It asks a [`TaskDecomposer`] to split composite
//! tasks, hands awarded sub-tasks to a [`WorkerDispatch`], and optionally mirrors
//! announcements to an [`EventPublisher`].

use async_trait::async_trait;
use tracing::info;

use crate::domain::{AgentId, Announcement, Task};

/// Splits a composite task into independently negotiable sub-tasks
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskDecomposer: Send + Sync {
    async fn decompose(&self, task: &Task) -> anyhow::Result<Vec<Task>>;
}

/// Returns the task unchanged as its only sub-task
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityDecomposer;

#[async_trait]
impl TaskDecomposer for IdentityDecomposer {
    async fn decompose(&self, task: &Task) -> anyhow::Result<Vec<Task>> {
        Ok(vec![task.clone()])
    }
}

/// Delivers an awarded sub-task to the winning worker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerDispatch: Send + Sync {
    async fn dispatch(&self, worker: AgentId, subtask_id: &str, task: &Task) -> anyhow::Result<()>;
}

/// Only logs the assignment; used when workers pick up awards from events instead
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDispatch;

#[async_trait]
impl WorkerDispatch for LoggingDispatch {
    async fn dispatch(&self, worker: AgentId, subtask_id: &str, task: &Task) -> anyhow::Result<()> {
        info!(worker = %worker, subtask_id, action = %task.action, "Sub-task assigned");
        Ok(())
    }
}

/// External event bus for announcement visibility. Fire-and-forget.
#[cfg_attr(test, mockall::automock)]
pub trait EventPublisher: Send + Sync {
    fn publish_announcement(&self, announcement: &Announcement) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn identity_returns_single_subtask() {
        let task = Task::new("craft").with_param("item", "pickaxe");
        let parts = IdentityDecomposer.decompose(&task).await.unwrap();
        assert_eq!(parts, vec![task]);
    }

    #[tokio::test]
    async fn logging_dispatch_accepts_everything() {
        let result = LoggingDispatch
            .dispatch(Uuid::new_v4(), "coord_1_sub0", &Task::new("mine"))
            .await;
        assert!(result.is_ok());
    }
}

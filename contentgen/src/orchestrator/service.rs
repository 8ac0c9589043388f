//! Client-facing task operations.

use std::sync::Arc;
use tracing::info;

use super::log_sink::TaskLogger;
use super::registry::ExecutionRegistry;
use crate::Result;
use crate::database::repositories::TaskRepository;
use crate::domain::{LogEntry, Task, TaskStatus, TaskType};

/// Facade over the store and the in-process registry, used by the HTTP API.
#[derive(Clone)]
pub struct TaskService {
    repo: Arc<dyn TaskRepository>,
    registry: Arc<ExecutionRegistry>,
    logger: TaskLogger,
}

impl TaskService {
    pub fn new(repo: Arc<dyn TaskRepository>, registry: Arc<ExecutionRegistry>) -> Self {
        let logger = TaskLogger::new(repo.clone());
        Self {
            repo,
            registry,
            logger,
        }
    }

    /// Create a pending task and wake an idle worker.
    pub async fn submit(&self, resource_ref: &str, task_type: TaskType) -> Result<Task> {
        let task = self.repo.submit(resource_ref, task_type).await?;
        info!(
            task_id = %task.task_id,
            resource_ref = %task.resource_ref,
            task_type = %task.task_type,
            "Task submitted"
        );
        self.registry.notify_submitted();
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.repo.get(task_id).await
    }

    pub async fn list_active(&self, resource_ref: Option<&str>) -> Result<Vec<Task>> {
        self.repo.list_active(resource_ref).await
    }

    /// Chronological log entries; `NotFound` for an unknown task.
    pub async fn logs(&self, task_id: &str) -> Result<Vec<LogEntry>> {
        self.repo.get(task_id).await?;
        self.repo.list_logs(task_id).await
    }

    /// Cooperative cancellation. A running task stops at its next stage boundary.
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let before = self.repo.get(task_id).await?;
        let after = self.repo.request_cancel(task_id).await?;

        match (before.status, after.status) {
            (TaskStatus::Pending, TaskStatus::Cancelled) => {
                self.logger
                    .info(task_id, "Cancelled by client before a worker picked it up")
                    .await;
            }
            (TaskStatus::Running, TaskStatus::Cancelling) => {
                self.logger
                    .info(
                        task_id,
                        "Cancellation requested by client; stopping at the next stage boundary",
                    )
                    .await;
            }
            _ => {}
        }

        if after.status.is_active() || after.status == TaskStatus::Cancelled {
            self.registry.cancel(task_id);
        }
        Ok(after)
    }

    /// Remove a terminal task and its log entries.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.repo.delete(task_id).await?;
        info!(task_id, "Task deleted");
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.registry.in_flight()
    }
}

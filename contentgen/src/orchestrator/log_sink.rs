//! Per-task diagnostic trail.
//!
//! Entries go to `generation_task_log` and are mirrored as tracing events.
//! A failed log write never fails the task.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::database::repositories::TaskRepository;
use crate::domain::LogLevel;

#[derive(Clone)]
pub struct TaskLogger {
    repo: Arc<dyn TaskRepository>,
}

impl TaskLogger {
    pub fn new(repo: Arc<dyn TaskRepository>) -> Self {
        Self { repo }
    }

    pub async fn info(&self, task_id: &str, message: impl AsRef<str>) {
        self.append(task_id, LogLevel::Info, message.as_ref()).await;
    }

    pub async fn warning(&self, task_id: &str, message: impl AsRef<str>) {
        self.append(task_id, LogLevel::Warning, message.as_ref()).await;
    }

    pub async fn error(&self, task_id: &str, message: impl AsRef<str>) {
        self.append(task_id, LogLevel::Error, message.as_ref()).await;
    }

    pub async fn append(&self, task_id: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => info!(task_id, "{}", message),
            LogLevel::Warning => warn!(task_id, "{}", message),
            LogLevel::Error => error!(task_id, "{}", message),
        }

        if let Err(e) = self.repo.append_log(task_id, level, message).await {
            warn!(task_id, error = %e, "Failed to persist task log entry");
        }
    }
}

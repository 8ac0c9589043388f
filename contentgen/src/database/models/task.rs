//! Row models for `generation_task` and `generation_task_log`.

use sqlx::FromRow;

use crate::database::time::{ms_to_datetime, opt_ms_to_datetime};
use crate::domain::{LogEntry, LogLevel, Task, TaskStatus, TaskType};
use crate::{Error, Result};

/// Raw `generation_task` row.
#[derive(Debug, Clone, FromRow)]
pub struct TaskDbModel {
    pub task_id: String,
    pub resource_ref: String,
    pub task_type: String,
    pub status: String,
    pub progress: i64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl TaskDbModel {
    /// Map into the domain entity, rejecting values the schema should never hold.
    pub fn into_task(self) -> Result<Task> {
        let task_type = TaskType::parse(&self.task_type).ok_or_else(|| {
            Error::Other(format!(
                "task {} has unknown task_type '{}'",
                self.task_id, self.task_type
            ))
        })?;
        let status = TaskStatus::parse(&self.status).ok_or_else(|| {
            Error::Other(format!(
                "task {} has unknown status '{}'",
                self.task_id, self.status
            ))
        })?;

        Ok(Task {
            task_id: self.task_id,
            resource_ref: self.resource_ref,
            task_type,
            status,
            progress: self.progress.clamp(0, 100) as u8,
            message: self.message,
            error: self.error,
            cancel_requested: self.cancel_requested,
            version: self.version,
            created_at: ms_to_datetime(self.created_at),
            updated_at: ms_to_datetime(self.updated_at),
            started_at: opt_ms_to_datetime(self.started_at),
            cancelled_at: opt_ms_to_datetime(self.cancelled_at),
            completed_at: opt_ms_to_datetime(self.completed_at),
        })
    }
}

/// Raw `generation_task_log` row.
#[derive(Debug, Clone, FromRow)]
pub struct TaskLogDbModel {
    pub id: i64,
    pub task_id: String,
    pub level: String,
    pub message: String,
    pub created_at: i64,
}

impl TaskLogDbModel {
    pub fn into_entry(self) -> Result<LogEntry> {
        let level = self
            .level
            .parse::<LogLevel>()
            .map_err(|_| Error::Other(format!("log {} has unknown level '{}'", self.id, self.level)))?;

        Ok(LogEntry {
            id: self.id,
            task_id: self.task_id,
            level,
            message: self.message,
            created_at: ms_to_datetime(self.created_at),
        })
    }
}

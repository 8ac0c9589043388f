//! Request and response bodies for the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{LogEntry, Task, TaskType};

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitTaskRequest {
    pub resource_ref: String,
    pub task_type: TaskType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksQuery {
    pub resource_ref: Option<String>,
}

/// Task as exposed to clients.
pub type TaskResponse = Task;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogsResponse {
    pub task_id: String,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub in_flight_tasks: usize,
    pub checked_at: DateTime<Utc>,
}

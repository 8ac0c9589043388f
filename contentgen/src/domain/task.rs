//! Generation task entity and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Kind of generation job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FullGeneration,
    SvgOnly,
    QuizOnly,
    FlashcardsOnly,
    ImagesOnly,
    PastPapersOnly,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullGeneration => "full_generation",
            Self::SvgOnly => "svg_only",
            Self::QuizOnly => "quiz_only",
            Self::FlashcardsOnly => "flashcards_only",
            Self::ImagesOnly => "images_only",
            Self::PastPapersOnly => "past_papers_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// Task lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, waiting for a worker.
    Pending,
    /// Claimed by a worker and running stages.
    Running,
    /// Cancellation requested while running; the worker has not acknowledged yet.
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Statuses that hold the resource exclusivity lock.
    pub const ACTIVE: [TaskStatus; 3] = [Self::Pending, Self::Running, Self::Cancelling];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal transitions of the task state machine.
    ///
    /// `* -> Cancelled` from any active status covers both the worker
    /// acknowledging a cancellation and the admin force-cancel path.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, target) {
            (Pending, Running) => true,
            (Running, Completed | Failed | Cancelling) => true,
            (Pending | Running | Cancelling, Cancelled) => true,
            _ => false,
        }
    }

    /// Validate a transition, returning the target on success.
    pub fn transition_to(&self, target: TaskStatus) -> Result<TaskStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::invalid_transition(self, target))
        }
    }

    /// Only finished tasks may be removed from the store.
    pub fn ensure_deletable(&self) -> Result<(), Error> {
        if self.is_terminal() {
            Ok(())
        } else {
            Err(Error::invalid_transition(self, "deleted"))
        }
    }
}

/// Severity of a task log entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One generation job against a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub resource_ref: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    /// Incremented by every successful mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Append-only diagnostic line attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub task_id: String,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Result of the executor's stage-boundary check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Keep going.
    Continue,
    /// `cancel_requested` is set and the task is still active.
    CancelRequested,
    /// The task reached a terminal status behind the worker's back.
    Finalized(TaskStatus),
}

//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An active task already exists for the resource.
    #[error("Resource {resource_ref} already has an active task {active_task_id}")]
    Conflict {
        resource_ref: String,
        active_task_id: String,
    },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Retryable stage failure that survived every retry.
    #[error("Stage {stage} failed after {attempts} attempt(s): {message}")]
    TransientStage {
        stage: String,
        attempts: u32,
        message: String,
    },

    #[error("Stage {stage} failed: {message}")]
    FatalStage { stage: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn conflict(resource_ref: impl Into<String>, active_task_id: impl Into<String>) -> Self {
        Self::Conflict {
            resource_ref: resource_ref.into(),
            active_task_id: active_task_id.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error came out of a pipeline stage.
    pub fn is_stage_failure(&self) -> bool {
        matches!(self, Self::TransientStage { .. } | Self::FatalStage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_active_task() {
        let err = Error::conflict("phys.p1.1", "task-a");
        assert_eq!(
            err.to_string(),
            "Resource phys.p1.1 already has an active task task-a"
        );
    }

    #[test]
    fn test_stage_failure_classification() {
        let fatal = Error::FatalStage {
            stage: "quiz".into(),
            message: "bad request".into(),
        };
        assert!(fatal.is_stage_failure());
        assert!(!Error::validation("x").is_stage_failure());
    }
}

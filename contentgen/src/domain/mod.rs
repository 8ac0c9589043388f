//! Domain types: the task entity, its state machine and retry policy.

pub mod retry_policy;
pub mod task;

pub use retry_policy::RetryPolicy;
pub use task::{Checkpoint, LogEntry, LogLevel, Task, TaskStatus, TaskType};

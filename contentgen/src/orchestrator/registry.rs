//! In-process bookkeeping for tasks currently held by a worker.
//!
//! The registry owns one cancellation token per in-flight task and a lease per
//! resource. A lease outlives a force-cancel of its task: the row is already
//! `cancelled`, but the worker is still inside a stage and the pool must not
//! start new work on that resource until the worker lets go.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::Task;

/// Shared between the worker pool, the executor and the client facade.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    /// task_id -> token observed by the running stage.
    tokens: DashMap<String, CancellationToken>,
    /// resource_ref -> task_id holding the lease.
    leases: DashMap<String, String>,
    /// Signalled on submission so idle workers wake before the next poll.
    notify: Arc<Notify>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Wake one idle worker.
    pub fn notify_submitted(&self) {
        self.notify.notify_one();
    }

    /// Track a freshly claimed task. The lease is released when the guard drops.
    pub fn register(self: &Arc<Self>, task: &Task, parent: &CancellationToken) -> ExecutionGuard {
        let token = parent.child_token();
        self.tokens.insert(task.task_id.clone(), token.clone());
        self.leases
            .insert(task.resource_ref.clone(), task.task_id.clone());
        debug!(task_id = %task.task_id, resource_ref = %task.resource_ref, "Registered execution");

        ExecutionGuard {
            registry: Arc::clone(self),
            task_id: task.task_id.clone(),
            resource_ref: task.resource_ref.clone(),
            token,
        }
    }

    /// Signal the in-flight execution of `task_id`, if this process holds it.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_executing(&self, task_id: &str) -> bool {
        self.tokens.contains_key(task_id)
    }

    /// Resources the pool must skip when claiming.
    pub fn leased_resources(&self) -> Vec<String> {
        self.leases.iter().map(|e| e.key().clone()).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.tokens.len()
    }

    fn release(&self, task_id: &str, resource_ref: &str) {
        self.tokens.remove(task_id);
        self.leases
            .remove_if(resource_ref, |_, holder| holder.as_str() == task_id);
        debug!(task_id, resource_ref, "Released execution");
    }
}

/// Lease on one in-flight task.
#[derive(Debug)]
pub struct ExecutionGuard {
    registry: Arc<ExecutionRegistry>,
    task_id: String,
    resource_ref: String,
    token: CancellationToken,
}

impl ExecutionGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.task_id, &self.resource_ref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskStatus, TaskType};
    use chrono::Utc;

    fn task(id: &str, resource: &str) -> Task {
        Task {
            task_id: id.into(),
            resource_ref: resource.into(),
            task_type: TaskType::QuizOnly,
            status: TaskStatus::Running,
            progress: 0,
            message: None,
            error: None,
            cancel_requested: false,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: Some(Utc::now()),
            cancelled_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_guard_releases_lease() {
        let registry = Arc::new(ExecutionRegistry::new());
        let root = CancellationToken::new();

        let guard = registry.register(&task("t1", "bio.2"), &root);
        assert!(registry.is_executing("t1"));
        assert_eq!(registry.leased_resources(), vec!["bio.2".to_string()]);

        drop(guard);
        assert!(!registry.is_executing("t1"));
        assert!(registry.leased_resources().is_empty());
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_cancel_signals_only_the_target() {
        let registry = Arc::new(ExecutionRegistry::new());
        let root = CancellationToken::new();
        let a = registry.register(&task("a", "r1"), &root);
        let b = registry.register(&task("b", "r2"), &root);

        assert!(registry.cancel("a"));
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
        assert!(!registry.cancel("missing"));
    }

    #[test]
    fn test_parent_cancel_reaches_children() {
        let registry = Arc::new(ExecutionRegistry::new());
        let root = CancellationToken::new();
        let guard = registry.register(&task("a", "r1"), &root);

        root.cancel();
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn test_stale_guard_keeps_newer_lease() {
        let registry = Arc::new(ExecutionRegistry::new());
        let root = CancellationToken::new();
        let old = registry.register(&task("old", "r1"), &root);
        let _new = registry.register(&task("new", "r1"), &root);

        drop(old);
        assert_eq!(registry.leased_resources(), vec!["r1".to_string()]);
    }
}

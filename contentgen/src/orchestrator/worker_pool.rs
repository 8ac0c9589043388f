//! Worker pool that claims pending generation tasks and runs them.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::{Executor, report_outcome};
use super::registry::ExecutionRegistry;
use crate::database::repositories::TaskRepository;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent workers.
    pub max_workers: usize,
    /// Poll interval when no submission wakes the workers.
    pub poll_interval: Duration,
    /// How long `stop` waits for in-flight stages before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            poll_interval: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// A pool of workers sharing one store, one executor and one registry.
///
/// Each worker runs one task at a time, so `max_workers` bounds concurrency.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    cancellation_token: CancellationToken,
    registry: Arc<ExecutionRegistry>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, registry: Arc<ExecutionRegistry>) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            config: WorkerPoolConfig {
                max_workers,
                ..config
            },
            cancellation_token: CancellationToken::new(),
            registry,
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    pub fn start(&self, repo: Arc<dyn TaskRepository>, executor: Arc<Executor>) {
        let poll_interval = self.config.poll_interval;

        info!(
            max_workers = self.config.max_workers,
            "Starting generation worker pool"
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Worker pool already stopped; not starting workers");
            return;
        };

        for worker_id in 0..self.config.max_workers {
            let cancellation_token = self.cancellation_token.clone();
            let registry = self.registry.clone();
            let notifier = registry.notifier();
            let repo = repo.clone();
            let executor = executor.clone();

            join_set.spawn(async move {
                debug!(worker_id, "Worker started");

                while !cancellation_token.is_cancelled() {
                    // Resources still leased by an abandoned run stay off-limits.
                    let excluded = registry.leased_resources();
                    let task = match repo.claim_next_pending(&excluded).await {
                        Ok(Some(task)) => task,
                        Ok(None) => {
                            tokio::select! {
                                _ = cancellation_token.cancelled() => break,
                                _ = notifier.notified() => {}
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                            continue;
                        }
                        Err(e) => {
                            error!(worker_id, error = %e, "Error claiming pending task");
                            tokio::select! {
                                _ = cancellation_token.cancelled() => break,
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                            continue;
                        }
                    };

                    info!(
                        worker_id,
                        task_id = %task.task_id,
                        resource_ref = %task.resource_ref,
                        task_type = %task.task_type,
                        "Claimed task"
                    );

                    let guard = registry.register(&task, &cancellation_token);
                    let outcome = executor.run_task(task, guard.token().clone()).await;
                    report_outcome(guard.task_id(), &outcome);
                }

                debug!(worker_id, "Worker shutting down");
            });
        }
    }

    /// Stop the pool: signal every worker, wait up to the grace period, then abort.
    pub async fn stop(&self) {
        info!("Stopping generation worker pool");
        self.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        let Some(mut join_set) = join_set else {
            return;
        };

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                in_flight = self.registry.in_flight(),
                grace_secs = self.config.shutdown_grace.as_secs(),
                "Workers still busy after grace period; aborting"
            );
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        info!("Generation worker pool stopped");
    }

    /// Number of tasks currently inside a worker.
    pub fn active_count(&self) -> usize {
        self.registry.in_flight()
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_workers_is_raised_to_one() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                max_workers: 0,
                ..Default::default()
            },
            Arc::new(ExecutionRegistry::new()),
        );
        assert_eq!(pool.config.max_workers, 1);
        assert!(pool.is_running());
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let pool = WorkerPool::new(WorkerPoolConfig::default(), Arc::new(ExecutionRegistry::new()));
        pool.stop().await;
        assert!(!pool.is_running());
    }
}

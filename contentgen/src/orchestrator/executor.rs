//! Drives one claimed task through its stage plan.
//!
//! Cancellation is only looked at between stages. Every terminal write goes
//! through a conditional transition, so whatever happened to the row while a
//! stage was running (client cancel, admin force-cancel) wins over the
//! worker's view.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::log_sink::TaskLogger;
use super::stages::{StageContext, StageKind, StageOutput, StageSet, plan_for, progress_after};
use crate::database::repositories::TaskRepository;
use crate::domain::{Checkpoint, RetryPolicy, Task, TaskStatus};
use crate::{Error, Result};

const SHUTDOWN_ERROR: &str = "Executor shut down before the task finished";

/// How a run ended from the worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed(String),
    Cancelled,
    /// The row turned terminal behind the worker (force-cancel); nothing was written.
    Abandoned(TaskStatus),
}

pub struct Executor {
    repo: Arc<dyn TaskRepository>,
    stages: StageSet,
    retry: RetryPolicy,
    logger: TaskLogger,
}

impl Executor {
    pub fn new(repo: Arc<dyn TaskRepository>, stages: StageSet, retry: RetryPolicy) -> Self {
        let logger = TaskLogger::new(repo.clone());
        Self {
            repo,
            stages,
            retry,
            logger,
        }
    }

    /// Run every stage of a task already moved to `running`.
    pub async fn run_task(
        &self,
        task: Task,
        cancellation: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let task_id = task.task_id.as_str();
        let plan = plan_for(task.task_type);
        let total = plan.len();

        let names: Vec<&str> = plan.iter().map(|k| k.as_str()).collect();
        self.logger
            .info(
                task_id,
                format!(
                    "Claimed by worker for {}; {} stage(s): {}",
                    task.resource_ref,
                    total,
                    names.join(", ")
                ),
            )
            .await;

        for (index, kind) in plan.iter().copied().enumerate() {
            let checkpoint = self.repo.checkpoint(task_id).await;
            match self.fail_on_store_error(task_id, checkpoint).await? {
                Checkpoint::Continue if cancellation.is_cancelled() => {
                    self.logger.error(task_id, SHUTDOWN_ERROR).await;
                    return self.finish_failed(task_id, SHUTDOWN_ERROR).await;
                }
                Checkpoint::Continue => {}
                Checkpoint::CancelRequested => {
                    return self
                        .acknowledge_cancel(
                            task_id,
                            &format!("Cancelled before stage {}", kind.as_str()),
                        )
                        .await;
                }
                Checkpoint::Finalized(status) => return Ok(self.abandon(task_id, status)),
            }

            self.logger
                .info(
                    task_id,
                    format!("Stage {}/{} {} started", index + 1, total, kind.as_str()),
                )
                .await;
            let started = self
                .repo
                .update_progress(task_id, progress_after(index, total), kind.label())
                .await;
            self.fail_on_store_error(task_id, started).await?;

            match self.run_stage(&task, kind, &cancellation).await {
                Ok(output) => {
                    let progress = progress_after(index + 1, total);
                    let mut line = format!(
                        "Stage {}/{} {} completed ({}%)",
                        index + 1,
                        total,
                        kind.as_str(),
                        progress
                    );
                    if let Some(summary) = output.summary.as_deref() {
                        line.push_str(": ");
                        line.push_str(summary);
                    }
                    self.logger.info(task_id, line).await;
                    let finished = self
                        .repo
                        .update_progress(task_id, progress, &format!("{} finished", kind.label()))
                        .await;
                    self.fail_on_store_error(task_id, finished).await?;
                }
                Err(err) => {
                    let error = err.to_string();
                    self.logger.error(task_id, &error).await;
                    return self.finish_failed(task_id, &error).await;
                }
            }
        }

        self.finish_completed(task_id).await
    }

    /// Run one stage, retrying transient failures per the retry policy.
    async fn run_stage(
        &self,
        task: &Task,
        kind: StageKind,
        cancellation: &CancellationToken,
    ) -> Result<StageOutput> {
        let Some(stage) = self.stages.get(kind) else {
            return Err(Error::FatalStage {
                stage: kind.to_string(),
                message: "no implementation registered".to_string(),
            });
        };

        let mut failures = 0u32;
        loop {
            let attempt = failures + 1;
            let ctx = StageContext {
                task_id: task.task_id.clone(),
                resource_ref: task.resource_ref.clone(),
                task_type: task.task_type,
                stage: kind,
                attempt,
                cancellation: cancellation.clone(),
            };

            let err = match stage.run(&ctx).await {
                Ok(output) => return Ok(output),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err.into_error(kind, attempt)),
            };

            failures += 1;
            if !self.retry.should_retry(failures) {
                return Err(err.into_error(kind, attempt));
            }

            let delay = self.retry.delay_for_retry(failures);
            self.logger
                .warning(
                    &task.task_id,
                    format!(
                        "Stage {} attempt {}/{} failed: {}; retrying in {:?}",
                        kind.as_str(),
                        attempt,
                        self.retry.max_attempts(),
                        err.message(),
                        delay
                    ),
                )
                .await;

            tokio::select! {
                _ = cancellation.cancelled() => {
                    debug!(task_id = %task.task_id, stage = %kind, "Retry wait interrupted");
                    return Err(err.into_error(kind, attempt));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn finish_completed(&self, task_id: &str) -> Result<ExecutionOutcome> {
        match self.repo.mark_completed(task_id).await {
            Ok(true) => {
                self.logger.info(task_id, "Generation completed").await;
                Ok(ExecutionOutcome::Completed)
            }
            Ok(false) => {
                let status = self.repo.get(task_id).await?.status;
                Ok(self.abandon(task_id, status))
            }
            // Cancellation was requested while the last stage ran.
            Err(Error::InvalidStateTransition { .. }) => {
                self.acknowledge_cancel(task_id, "Cancelled after the final stage")
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_failed(&self, task_id: &str, error: &str) -> Result<ExecutionOutcome> {
        match self.repo.mark_failed(task_id, error).await {
            Ok(true) => Ok(ExecutionOutcome::Failed(error.to_string())),
            Ok(false) => {
                let status = self.repo.get(task_id).await?.status;
                Ok(self.abandon(task_id, status))
            }
            Err(Error::InvalidStateTransition { .. }) => {
                self.acknowledge_cancel(task_id, &format!("Cancelled; stage failure discarded: {error}"))
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Pass a store result through, first trying to fail the task on error
    /// so it does not stay `running` with nobody driving it.
    async fn fail_on_store_error<T>(&self, task_id: &str, result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let message = format!("Task store error: {err}");
        self.logger.error(task_id, &message).await;
        if let Err(e) = self.repo.mark_failed(task_id, &message).await {
            warn!(task_id, error = %e, "Could not mark task failed after store error");
        }
        Err(err)
    }

    async fn acknowledge_cancel(&self, task_id: &str, message: &str) -> Result<ExecutionOutcome> {
        if self.repo.mark_cancelled(task_id, message).await? {
            self.logger.info(task_id, message).await;
            Ok(ExecutionOutcome::Cancelled)
        } else {
            let status = self.repo.get(task_id).await?.status;
            Ok(self.abandon(task_id, status))
        }
    }

    fn abandon(&self, task_id: &str, status: TaskStatus) -> ExecutionOutcome {
        warn!(
            task_id,
            status = %status,
            "Task was finalized outside the worker; abandoning without further writes"
        );
        ExecutionOutcome::Abandoned(status)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("stages", &self.stages)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Log the outcome of a run at the right level.
pub(crate) fn report_outcome(task_id: &str, outcome: &Result<ExecutionOutcome>) {
    match outcome {
        Ok(ExecutionOutcome::Completed) => info!(task_id, "Task completed"),
        Ok(ExecutionOutcome::Cancelled) => info!(task_id, "Task cancelled"),
        Ok(ExecutionOutcome::Failed(error)) => warn!(task_id, error = %error, "Task failed"),
        Ok(ExecutionOutcome::Abandoned(status)) => {
            info!(task_id, status = %status, "Task abandoned")
        }
        Err(e) => tracing::error!(task_id, error = %e, "Task execution aborted by store error"),
    }
}

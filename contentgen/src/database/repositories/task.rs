//! Task store repository.
//!
//! Every status change is a conditional `UPDATE ... WHERE status IN (...)`
//! keyed on the expected source status, so a late writer can never move a
//! task out of a state it did not observe. When such an update touches no
//! row, the current row decides between a silent no-op (terminal),
//! `InvalidStateTransition` (wrong non-terminal source) and `NotFound`.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::database::begin_immediate;
use crate::database::models::{TaskDbModel, TaskLogDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::domain::{Checkpoint, LogEntry, LogLevel, Task, TaskStatus, TaskType};
use crate::{Error, Result};

pub const COMPLETED_MESSAGE: &str = "Generation completed";
const CLAIMED_MESSAGE: &str = "Started";
const CANCELLED_BEFORE_START_MESSAGE: &str = "Cancelled before start";
const CANCEL_REQUESTED_MESSAGE: &str = "Cancellation requested";

/// Which tasks an administrative force-cancel targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceCancelScope {
    Task(String),
    AllActive,
}

/// Snapshots captured inside the force-cancel transaction.
#[derive(Debug, Clone, Default)]
pub struct ForceCancelOutcome {
    /// Rows in scope before the update.
    pub before: Vec<Task>,
    /// The same rows after the update.
    pub after: Vec<Task>,
    /// Ids actually moved to `cancelled`.
    pub affected: Vec<String>,
    /// Active tasks left once the transaction committed.
    pub remaining_active: Vec<Task>,
}

impl ForceCancelOutcome {
    pub fn affected_count(&self) -> usize {
        self.affected.len()
    }
}

/// Task store operations.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Create a `pending` task; `Conflict` if the resource already has an active one.
    async fn submit(&self, resource_ref: &str, task_type: TaskType) -> Result<Task>;
    async fn get(&self, task_id: &str) -> Result<Task>;
    async fn list_active(&self, resource_ref: Option<&str>) -> Result<Vec<Task>>;

    /// `pending -> running`.
    async fn claim(&self, task_id: &str) -> Result<Task>;
    /// Claim the oldest pending task whose resource is not excluded.
    async fn claim_next_pending(&self, excluded_resources: &[String]) -> Result<Option<Task>>;

    /// Returns `false` when the task is no longer running.
    async fn update_progress(&self, task_id: &str, progress: u8, message: &str) -> Result<bool>;
    async fn request_cancel(&self, task_id: &str) -> Result<Task>;
    async fn mark_completed(&self, task_id: &str) -> Result<bool>;
    async fn mark_failed(&self, task_id: &str, error: &str) -> Result<bool>;
    async fn mark_cancelled(&self, task_id: &str, message: &str) -> Result<bool>;
    async fn checkpoint(&self, task_id: &str) -> Result<Checkpoint>;
    /// Delete a terminal task together with its log entries.
    async fn delete(&self, task_id: &str) -> Result<()>;

    /// Administrative force-cancel, bypassing the executor.
    async fn force_cancel(
        &self,
        scope: ForceCancelScope,
        message: &str,
    ) -> Result<ForceCancelOutcome>;
    /// `cancelling -> cancelled` for every task; returns the finalized ids.
    async fn finalize_cancelling(&self, message: &str) -> Result<Vec<String>>;
    /// `running -> failed` for every task; returns the failed ids.
    async fn fail_orphaned_running(&self, error: &str) -> Result<Vec<String>>;

    // Log sink
    async fn append_log(&self, task_id: &str, level: LogLevel, message: &str) -> Result<i64>;
    async fn list_logs(&self, task_id: &str) -> Result<Vec<LogEntry>>;
}

/// SQLx implementation of [`TaskRepository`].
#[derive(Clone)]
pub struct SqlxTaskRepository {
    pool: SqlitePool,
}

impl SqlxTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Explain why a conditional transition to `target` touched no row.
    ///
    /// Terminal rows are the idempotent no-op case.
    async fn unapplied(&self, task_id: &str, target: TaskStatus) -> Result<bool> {
        let task = self.get(task_id).await?;
        if task.status.is_terminal() {
            Ok(false)
        } else {
            Err(refused(task.status, target))
        }
    }
}

/// Error for a guarded update that matched no row while the task is active.
fn refused(current: TaskStatus, target: TaskStatus) -> Error {
    match current.transition_to(target) {
        Err(e) => e,
        // No status re-enters a transition's source, so this only happens
        // when a guard and the state machine disagree.
        Ok(_) => Error::Other(format!(
            "store refused legal transition from {current} to {target}"
        )),
    }
}

fn into_tasks(rows: Vec<TaskDbModel>) -> Result<Vec<Task>> {
    rows.into_iter().map(TaskDbModel::into_task).collect()
}

async fn fetch_active(conn: &mut SqliteConnection) -> Result<Vec<Task>> {
    let rows = sqlx::query_as::<_, TaskDbModel>(
        "SELECT * FROM generation_task \
         WHERE status IN ('pending', 'running', 'cancelling') \
         ORDER BY created_at, task_id",
    )
    .fetch_all(&mut *conn)
    .await?;
    into_tasks(rows)
}

async fn fetch_by_ids(conn: &mut SqliteConnection, ids: &[String]) -> Result<Vec<Task>> {
    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        let row = sqlx::query_as::<_, TaskDbModel>("SELECT * FROM generation_task WHERE task_id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(row) = row {
            tasks.push(row.into_task()?);
        }
    }
    Ok(tasks)
}

async fn insert_log(
    conn: &mut SqliteConnection,
    task_id: &str,
    level: LogLevel,
    message: &str,
    created_at: i64,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO generation_task_log (task_id, level, message, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(level.as_str())
    .bind(message)
    .bind(created_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

#[async_trait]
impl TaskRepository for SqlxTaskRepository {
    async fn submit(&self, resource_ref: &str, task_type: TaskType) -> Result<Task> {
        let resource_ref = resource_ref.trim();
        if resource_ref.is_empty() {
            return Err(Error::validation("resource_ref must not be blank"));
        }

        retry_on_sqlite_busy("submit_task", || async {
            let task_id = uuid::Uuid::new_v4().to_string();
            let now = now_ms();
            let mut tx = self.pool.begin().await?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO generation_task
                    (task_id, resource_ref, task_type, status, progress, cancel_requested,
                     version, created_at, updated_at)
                VALUES (?, ?, ?, 'pending', 0, 0, 0, ?, ?)
                "#,
            )
            .bind(&task_id)
            .bind(resource_ref)
            .bind(task_type.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    tx.rollback().await?;
                    let active: Option<String> = sqlx::query_scalar(
                        "SELECT task_id FROM generation_task \
                         WHERE resource_ref = ? AND status IN ('pending', 'running', 'cancelling') \
                         LIMIT 1",
                    )
                    .bind(resource_ref)
                    .fetch_optional(&self.pool)
                    .await?;
                    return Err(Error::conflict(
                        resource_ref,
                        active.unwrap_or_else(|| "unknown".to_string()),
                    ));
                }
                Err(e) => return Err(e.into()),
            }

            insert_log(
                &mut *tx,
                &task_id,
                LogLevel::Info,
                &format!("Task submitted ({})", task_type.as_str()),
                now,
            )
            .await?;

            let row =
                sqlx::query_as::<_, TaskDbModel>("SELECT * FROM generation_task WHERE task_id = ?")
                    .bind(&task_id)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.commit().await?;
            row.into_task()
        })
        .await
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        sqlx::query_as::<_, TaskDbModel>("SELECT * FROM generation_task WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Task", task_id))?
            .into_task()
    }

    async fn list_active(&self, resource_ref: Option<&str>) -> Result<Vec<Task>> {
        let rows = match resource_ref {
            Some(resource_ref) => {
                sqlx::query_as::<_, TaskDbModel>(
                    "SELECT * FROM generation_task \
                     WHERE resource_ref = ? AND status IN ('pending', 'running', 'cancelling') \
                     ORDER BY created_at, task_id",
                )
                .bind(resource_ref)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, TaskDbModel>(
                    "SELECT * FROM generation_task \
                     WHERE status IN ('pending', 'running', 'cancelling') \
                     ORDER BY created_at, task_id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        into_tasks(rows)
    }

    async fn claim(&self, task_id: &str) -> Result<Task> {
        let claimed = retry_on_sqlite_busy("claim_task", || async {
            let now = now_ms();
            let row = sqlx::query_as::<_, TaskDbModel>(
                r#"
                UPDATE generation_task
                SET status = 'running', started_at = COALESCE(started_at, ?), message = ?,
                    updated_at = ?, version = version + 1
                WHERE task_id = ? AND status = 'pending'
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(CLAIMED_MESSAGE)
            .bind(now)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await?;

        match claimed {
            Some(row) => row.into_task(),
            None => {
                let current = self.get(task_id).await?;
                Err(refused(current.status, TaskStatus::Running))
            }
        }
    }

    async fn claim_next_pending(&self, excluded_resources: &[String]) -> Result<Option<Task>> {
        let claimed = retry_on_sqlite_busy("claim_next_pending", || async {
            let now = now_ms();
            let mut qb = QueryBuilder::<Sqlite>::new(
                "UPDATE generation_task SET status = 'running', started_at = COALESCE(started_at, ",
            );
            qb.push_bind(now);
            qb.push("), message = ");
            qb.push_bind(CLAIMED_MESSAGE);
            qb.push(", updated_at = ");
            qb.push_bind(now);
            qb.push(
                ", version = version + 1 WHERE status = 'pending' AND task_id = \
                 (SELECT task_id FROM generation_task WHERE status = 'pending'",
            );
            if !excluded_resources.is_empty() {
                qb.push(" AND resource_ref NOT IN (");
                let mut separated = qb.separated(", ");
                for resource_ref in excluded_resources {
                    separated.push_bind(resource_ref.clone());
                }
                separated.push_unseparated(")");
            }
            qb.push(" ORDER BY created_at, task_id LIMIT 1) RETURNING *");

            let row = qb
                .build_query_as::<TaskDbModel>()
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        })
        .await?;

        claimed.map(TaskDbModel::into_task).transpose()
    }

    async fn update_progress(&self, task_id: &str, progress: u8, message: &str) -> Result<bool> {
        let progress = i64::from(progress.min(100));
        let rows = retry_on_sqlite_busy("update_progress", || async {
            let result = sqlx::query(
                r#"
                UPDATE generation_task
                SET progress = MAX(progress, ?), message = ?, updated_at = ?, version = version + 1
                WHERE task_id = ? AND status = 'running'
                "#,
            )
            .bind(progress)
            .bind(message)
            .bind(now_ms())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            // Leaving `running` is not an error here; an unknown id is.
            self.get(task_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn request_cancel(&self, task_id: &str) -> Result<Task> {
        retry_on_sqlite_busy("request_cancel", || async {
            let now = now_ms();
            // SQLite evaluates every SET expression against the pre-update row.
            sqlx::query(
                r#"
                UPDATE generation_task
                SET status = CASE status WHEN 'pending' THEN 'cancelled' ELSE 'cancelling' END,
                    cancel_requested = 1,
                    message = CASE status WHEN 'pending' THEN ? ELSE ? END,
                    cancelled_at = CASE status WHEN 'pending' THEN COALESCE(cancelled_at, ?)
                                   ELSE cancelled_at END,
                    completed_at = CASE status WHEN 'pending' THEN COALESCE(completed_at, ?)
                                   ELSE completed_at END,
                    updated_at = ?, version = version + 1
                WHERE task_id = ? AND status IN ('pending', 'running')
                "#,
            )
            .bind(CANCELLED_BEFORE_START_MESSAGE)
            .bind(CANCEL_REQUESTED_MESSAGE)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        self.get(task_id).await
    }

    async fn mark_completed(&self, task_id: &str) -> Result<bool> {
        let rows = retry_on_sqlite_busy("mark_completed", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE generation_task
                SET status = 'completed', progress = 100, message = ?,
                    completed_at = COALESCE(completed_at, ?), updated_at = ?, version = version + 1
                WHERE task_id = ? AND status = 'running'
                "#,
            )
            .bind(COMPLETED_MESSAGE)
            .bind(now)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            return self.unapplied(task_id, TaskStatus::Completed).await;
        }
        Ok(true)
    }

    async fn mark_failed(&self, task_id: &str, error: &str) -> Result<bool> {
        let rows = retry_on_sqlite_busy("mark_failed", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE generation_task
                SET status = 'failed', error = ?, message = ?,
                    completed_at = COALESCE(completed_at, ?), updated_at = ?, version = version + 1
                WHERE task_id = ? AND status = 'running'
                "#,
            )
            .bind(error)
            .bind(format!("Failed: {error}"))
            .bind(now)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            return self.unapplied(task_id, TaskStatus::Failed).await;
        }
        Ok(true)
    }

    async fn mark_cancelled(&self, task_id: &str, message: &str) -> Result<bool> {
        let rows = retry_on_sqlite_busy("mark_cancelled", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE generation_task
                SET status = 'cancelled', cancel_requested = 1, message = ?,
                    cancelled_at = COALESCE(cancelled_at, ?),
                    completed_at = COALESCE(completed_at, ?),
                    updated_at = ?, version = version + 1
                WHERE task_id = ? AND status IN ('pending', 'running', 'cancelling')
                "#,
            )
            .bind(message)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            return self.unapplied(task_id, TaskStatus::Cancelled).await;
        }
        Ok(true)
    }

    async fn checkpoint(&self, task_id: &str) -> Result<Checkpoint> {
        let task = self.get(task_id).await?;
        if task.status.is_terminal() {
            Ok(Checkpoint::Finalized(task.status))
        } else if task.cancel_requested || task.status == TaskStatus::Cancelling {
            Ok(Checkpoint::CancelRequested)
        } else {
            Ok(Checkpoint::Continue)
        }
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        let rows = retry_on_sqlite_busy("delete_task", || async {
            // Log entries go with the task via ON DELETE CASCADE.
            let result = sqlx::query(
                "DELETE FROM generation_task \
                 WHERE task_id = ? AND status IN ('completed', 'failed', 'cancelled')",
            )
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            self.get(task_id).await?.status.ensure_deletable()?;
        }
        Ok(())
    }

    async fn force_cancel(
        &self,
        scope: ForceCancelScope,
        message: &str,
    ) -> Result<ForceCancelOutcome> {
        retry_on_sqlite_busy("force_cancel", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let now = now_ms();

            let before = match &scope {
                ForceCancelScope::Task(task_id) => {
                    let row = sqlx::query_as::<_, TaskDbModel>(
                        "SELECT * FROM generation_task WHERE task_id = ?",
                    )
                    .bind(task_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| Error::not_found("Task", task_id.as_str()))?;
                    vec![row.into_task()?]
                }
                ForceCancelScope::AllActive => fetch_active(&mut *tx).await?,
            };

            let in_scope: Vec<String> = before.iter().map(|t| t.task_id.clone()).collect();
            let mut affected = Vec::new();
            for task in before.iter().filter(|t| t.status.is_active()) {
                let result = sqlx::query(
                    r#"
                    UPDATE generation_task
                    SET status = 'cancelled', cancel_requested = 1, message = ?,
                        cancelled_at = COALESCE(cancelled_at, ?),
                        completed_at = COALESCE(completed_at, ?),
                        updated_at = ?, version = version + 1
                    WHERE task_id = ? AND status IN ('pending', 'running', 'cancelling')
                    "#,
                )
                .bind(message)
                .bind(now)
                .bind(now)
                .bind(now)
                .bind(&task.task_id)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() > 0 {
                    insert_log(&mut *tx, &task.task_id, LogLevel::Warning, message, now).await?;
                    affected.push(task.task_id.clone());
                }
            }

            let after = fetch_by_ids(&mut *tx, &in_scope).await?;
            let remaining_active = fetch_active(&mut *tx).await?;
            tx.commit().await?;

            Ok(ForceCancelOutcome {
                before,
                after,
                affected,
                remaining_active,
            })
        })
        .await
    }

    async fn finalize_cancelling(&self, message: &str) -> Result<Vec<String>> {
        retry_on_sqlite_busy("finalize_cancelling", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let now = now_ms();

            let ids: Vec<String> = sqlx::query_scalar(
                "SELECT task_id FROM generation_task WHERE status = 'cancelling' ORDER BY created_at",
            )
            .fetch_all(&mut *tx)
            .await?;

            for task_id in &ids {
                sqlx::query(
                    r#"
                    UPDATE generation_task
                    SET status = 'cancelled', cancel_requested = 1, message = ?,
                        cancelled_at = COALESCE(cancelled_at, ?),
                        completed_at = COALESCE(completed_at, ?),
                        updated_at = ?, version = version + 1
                    WHERE task_id = ? AND status = 'cancelling'
                    "#,
                )
                .bind(message)
                .bind(now)
                .bind(now)
                .bind(now)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                insert_log(&mut *tx, task_id, LogLevel::Warning, message, now).await?;
            }

            tx.commit().await?;
            Ok(ids)
        })
        .await
    }

    async fn fail_orphaned_running(&self, error: &str) -> Result<Vec<String>> {
        retry_on_sqlite_busy("fail_orphaned_running", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let now = now_ms();

            let ids: Vec<String> = sqlx::query_scalar(
                "SELECT task_id FROM generation_task WHERE status = 'running' ORDER BY created_at",
            )
            .fetch_all(&mut *tx)
            .await?;

            for task_id in &ids {
                sqlx::query(
                    r#"
                    UPDATE generation_task
                    SET status = 'failed', error = ?, message = ?,
                        completed_at = COALESCE(completed_at, ?),
                        updated_at = ?, version = version + 1
                    WHERE task_id = ? AND status = 'running'
                    "#,
                )
                .bind(error)
                .bind(format!("Failed: {error}"))
                .bind(now)
                .bind(now)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                insert_log(&mut *tx, task_id, LogLevel::Error, error, now).await?;
            }

            tx.commit().await?;
            Ok(ids)
        })
        .await
    }

    async fn append_log(&self, task_id: &str, level: LogLevel, message: &str) -> Result<i64> {
        retry_on_sqlite_busy("append_task_log", || async {
            let mut conn = self.pool.acquire().await?;
            insert_log(&mut *conn, task_id, level, message, now_ms()).await
        })
        .await
    }

    async fn list_logs(&self, task_id: &str) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, TaskLogDbModel>(
            "SELECT * FROM generation_task_log WHERE task_id = ? ORDER BY id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskLogDbModel::into_entry).collect()
    }
}

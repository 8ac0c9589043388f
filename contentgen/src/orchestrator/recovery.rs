//! Recovery after an executor restart, and the PID file the admin tool uses
//! to find the executor.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::database::repositories::TaskRepository;
use crate::domain::TaskStatus;
use crate::{Error, Result};

/// Message written on tasks the admin tool force-cancels.
pub const DEFAULT_FORCE_CANCEL_MESSAGE: &str = "Force-cancelled by admin script";

const FINALIZED_ON_STARTUP_MESSAGE: &str =
    "Cancellation finalized on executor startup; no worker held the task";
const ORPHANED_RUNNING_ERROR: &str = "Executor restarted while the task was running";

#[derive(Debug, Clone, Default)]
pub struct RecoveryConfig {
    /// Cancel tasks left `cancelling` by a previous process. Only safe when a
    /// single executor uses the store.
    pub finalize_cancelling: bool,
    /// Fail tasks left `running` by a previous process. Same caveat.
    pub fail_orphaned_running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub cancelled: Vec<String>,
    pub failed: Vec<String>,
}

/// Settle tasks a previous executor process left behind.
pub async fn recover_on_startup(
    repo: &dyn TaskRepository,
    config: &RecoveryConfig,
) -> Result<RecoveryReport> {
    let cancelled = if config.finalize_cancelling {
        repo.finalize_cancelling(FINALIZED_ON_STARTUP_MESSAGE).await?
    } else {
        let pending_cancel = count_with_status(repo, TaskStatus::Cancelling).await?;
        if pending_cancel > 0 {
            warn!(
                pending_cancel,
                "Tasks are waiting for a worker to acknowledge cancellation; force-cancel them if no executor holds them"
            );
        }
        Vec::new()
    };

    let failed = if config.fail_orphaned_running {
        repo.fail_orphaned_running(ORPHANED_RUNNING_ERROR).await?
    } else {
        let orphaned = count_with_status(repo, TaskStatus::Running).await?;
        if orphaned > 0 {
            warn!(
                orphaned,
                "Tasks are marked running from a previous run; force-cancel them if no executor holds them"
            );
        }
        Vec::new()
    };

    if !cancelled.is_empty() || !failed.is_empty() {
        info!(
            cancelled = cancelled.len(),
            failed = failed.len(),
            "Startup recovery settled tasks"
        );
    }

    Ok(RecoveryReport { cancelled, failed })
}

async fn count_with_status(repo: &dyn TaskRepository, status: TaskStatus) -> Result<usize> {
    Ok(repo
        .list_active(None)
        .await?
        .iter()
        .filter(|t| t.status == status)
        .count())
}

/// PID file written by the server and read by `contentgen-admin`.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the current process id.
    pub fn write_current(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{}\n", std::process::id()))?;
        Ok(())
    }

    pub fn read(&self) -> Result<u32> {
        let raw = std::fs::read_to_string(&self.path)?;
        raw.trim().parse::<u32>().map_err(|_| {
            Error::validation(format!(
                "PID file {} does not contain a process id",
                self.path.display()
            ))
        })
    }

    /// Remove the file if it still names this process.
    pub fn remove_if_current(&self) {
        match self.read() {
            Ok(pid) if pid == std::process::id() => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("run").join("contentgen.pid"));

        pid_file.write_current().unwrap();
        assert_eq!(pid_file.read().unwrap(), std::process::id());

        pid_file.remove_if_current();
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn test_pid_file_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contentgen.pid");
        std::fs::write(&path, "not-a-pid").unwrap();

        let pid_file = PidFile::new(&path);
        assert!(matches!(pid_file.read(), Err(Error::Validation(_))));

        // Someone else's file is left alone.
        pid_file.remove_if_current();
        assert!(path.exists());
    }
}

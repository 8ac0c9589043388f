use clap::{ArgGroup, Parser};
use std::path::PathBuf;

use contentgen::config::{DEFAULT_DATABASE_URL, DEFAULT_PID_FILE};
use contentgen::database::repositories::ForceCancelScope;
use contentgen::orchestrator::DEFAULT_FORCE_CANCEL_MESSAGE;

/// Force-cancel stuck generation tasks and restart the executor.
#[derive(Parser, Debug)]
#[command(name = "contentgen-admin", author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("target")
        .required(true)
        .multiple(false)
        .args(["task_id", "all_active"]),
))]
pub struct Cli {
    /// Force-cancel a single task by id
    #[arg(long, value_name = "ID")]
    pub task_id: Option<String>,

    /// Force-cancel every pending, running and cancelling task
    #[arg(long)]
    pub all_active: bool,

    /// Message recorded on each cancelled task
    #[arg(long, default_value = DEFAULT_FORCE_CANCEL_MESSAGE)]
    pub message: String,

    /// Task store location
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,

    /// Only touch the store; leave the executor running
    #[arg(long)]
    pub no_restart: bool,

    /// Shell command that restarts the executor
    #[arg(long, env = "CONTENTGEN_RESTART_COMMAND")]
    pub restart_command: Option<String>,

    /// PID file written by the executor, signalled when no restart command is set
    #[arg(long, env = "CONTENTGEN_PID_FILE", default_value = DEFAULT_PID_FILE)]
    pub pid_file: PathBuf,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    pub fn scope(&self) -> ForceCancelScope {
        match &self.task_id {
            Some(task_id) => ForceCancelScope::Task(task_id.clone()),
            None => ForceCancelScope::AllActive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_single_task_mode() {
        let cli = Cli::try_parse_from(["contentgen-admin", "--task-id", "abc"]).unwrap();
        assert_eq!(cli.scope(), ForceCancelScope::Task("abc".into()));
        assert_eq!(cli.message, DEFAULT_FORCE_CANCEL_MESSAGE);
        assert!(!cli.no_restart);
    }

    #[test]
    fn test_all_active_mode_with_options() {
        let cli = Cli::try_parse_from([
            "contentgen-admin",
            "--all-active",
            "--message",
            "maintenance window",
            "--no-restart",
            "--database-url",
            "sqlite:/tmp/x.db",
        ])
        .unwrap();
        assert_eq!(cli.scope(), ForceCancelScope::AllActive);
        assert_eq!(cli.message, "maintenance window");
        assert_eq!(cli.database_url, "sqlite:/tmp/x.db");
        assert!(cli.no_restart);
    }

    #[test]
    fn test_both_modes_rejected() {
        let err = Cli::try_parse_from(["contentgen-admin", "--task-id", "abc", "--all-active"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_neither_mode_rejected() {
        let err = Cli::try_parse_from(["contentgen-admin"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert_eq!(err.exit_code(), 2);
    }
}

//! Second phase of recovery: bounce the executor so no worker keeps a stale
//! lease on a force-cancelled resource.

use anyhow::{Context, bail};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use contentgen::orchestrator::PidFile;

use crate::cli::Cli;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartStrategy {
    /// Run a shell command (e.g. `systemctl restart contentgen`).
    Command(String),
    /// Terminate the PID recorded by the executor; its supervisor starts a new one.
    Signal(PathBuf),
    Skip(&'static str),
}

impl RestartStrategy {
    pub fn choose(cli: &Cli, affected: usize) -> Self {
        if cli.no_restart {
            return Self::Skip("--no-restart given");
        }
        if affected == 0 {
            return Self::Skip("no tasks were cancelled");
        }
        match cli.restart_command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => Self::Command(command.to_string()),
            _ => Self::Signal(cli.pid_file.clone()),
        }
    }

    pub async fn execute(&self) -> anyhow::Result<()> {
        match self {
            Self::Skip(reason) => {
                info!(reason, "Executor restart skipped");
                Ok(())
            }
            Self::Command(command) => {
                info!(command, "Restarting executor");
                run(shell(command)).await
            }
            Self::Signal(path) => {
                let pid = PidFile::new(path)
                    .read()
                    .with_context(|| format!("Failed to read executor PID from {}", path.display()))?;
                info!(pid, "Sending termination signal to executor");
                run(terminate(pid)).await
            }
        }
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(unix)]
fn terminate(pid: u32) -> Command {
    let mut cmd = Command::new("kill");
    cmd.arg("-TERM").arg(pid.to_string());
    cmd
}

#[cfg(windows)]
fn terminate(pid: u32) -> Command {
    let mut cmd = Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string());
    cmd
}

async fn run(mut cmd: Command) -> anyhow::Result<()> {
    debug!(?cmd, "Spawning");
    let output = cmd
        .output()
        .await
        .context("Failed to spawn restart process")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "Restart process exited with {}: {}",
            output.status,
            stderr.trim()
        );
    }
    Ok(())
}

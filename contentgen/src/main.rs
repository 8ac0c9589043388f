use std::sync::Arc;
use tracing::{error, info};

use contentgen::api::{ApiServer, AppState};
use contentgen::config::AppConfig;
use contentgen::database::{self, repositories::SqlxTaskRepository};
use contentgen::logging::init_logging;
use contentgen::orchestrator::{
    ExecutionRegistry, Executor, PidFile, StageSet, TaskService, WorkerPool, recover_on_startup,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let (logging_config, _log_guard) = init_logging(config.log_dir.as_deref())?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let repo = Arc::new(SqlxTaskRepository::new(pool));
    let report = recover_on_startup(repo.as_ref(), &config.recovery).await?;
    info!(
        finalized = report.cancelled.len(),
        failed = report.failed.len(),
        "Startup recovery finished"
    );

    let pid_file = PidFile::new(&config.pid_file);
    pid_file.write_current()?;
    info!(pid = std::process::id(), path = %pid_file.path().display(), "PID file written");

    let stages = StageSet::http(&config.backend.url, config.backend.connect_timeout)?;
    let executor = Arc::new(Executor::new(repo.clone(), stages, config.retry));
    let registry = Arc::new(ExecutionRegistry::new());

    let workers = WorkerPool::new(config.workers.clone(), registry.clone());
    workers.start(repo.clone(), executor);

    let state = AppState::new(TaskService::new(repo.clone(), registry))
        .with_logging_config(logging_config);
    let server = ApiServer::new(config.api.clone(), state);

    let shutdown = server.cancel_token();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    let served = server.run().await;
    if let Err(e) = &served {
        error!(error = %e, "API server stopped with an error");
    }

    workers.stop().await;
    pid_file.remove_if_current();
    info!("contentgen stopped");

    served.map_err(Into::into)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

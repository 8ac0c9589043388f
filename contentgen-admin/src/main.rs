mod cli;
mod output;
mod restart;

use anyhow::Context;
use clap::Parser;
use colored::*;
use std::process;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use contentgen::database::repositories::{SqlxTaskRepository, TaskRepository};
use contentgen::database::{init_pool_with_size, run_migrations};

use crate::cli::Cli;
use crate::restart::RestartStrategy;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Usage errors exit with 2 before anything touches the store.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    init_logging(cli.verbose, cli.quiet);

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let pool = init_pool_with_size(&cli.database_url, 1)
        .await
        .with_context(|| format!("Failed to open task store at {}", cli.database_url))?;
    run_migrations(&pool).await?;
    let repo = SqlxTaskRepository::new(pool);

    let scope = cli.scope();
    info!(?scope, message = %cli.message, "Force-cancelling tasks");
    let outcome = repo
        .force_cancel(scope, &cli.message)
        .await
        .context("Force-cancel failed")?;

    output::print_outcome(&outcome);

    let strategy = RestartStrategy::choose(&cli, outcome.affected_count());
    strategy
        .execute()
        .await
        .context("Tasks were cancelled but the executor restart failed")?;

    if !matches!(strategy, RestartStrategy::Skip(_)) {
        println!("{}", "Executor restart triggered".green());
    }
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

//! One-shot reconciliation pass, for cron and operators.
//!
//! Exits 0 when the pass completed with no unrecovered errors, 1
//! otherwise, so shell pipelines can alert on drift-handling failures.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use tracktags::actors::application::ApplicationActor;
use tracktags::billing::reconciliation;
use tracktags::models::Config;
use tracktags::state::AppState;
use tracktags::store::SqliteRowStore;

#[derive(Parser, Debug)]
#[command(name = "reconcile", about = "Run one billing reconciliation pass")]
struct Args {
    /// Override the row-store path from the environment.
    #[arg(long)]
    database: Option<String>,
}

async fn run(args: Args) -> Result<u64> {
    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(database) = args.database {
        config.database_path = database;
    }

    let row_store = Arc::new(
        SqliteRowStore::new(&config.database_path).context("failed to open row store")?,
    );
    let state = Arc::new(AppState::new(config, row_store)?);
    ApplicationActor::spawn(state.clone())
        .map_err(|e| anyhow::anyhow!("failed to start application actor: {e}"))?;

    let record = reconciliation::run_once(&state).await?;
    info!(
        totals = record.totals,
        found = record.mismatches_found,
        fixed = record.mismatches_fixed,
        errors = record.errors,
        "reconciliation finished"
    );
    Ok(record.errors)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(errors) => {
            error!(errors, "reconciliation completed with errors");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = ?e, "reconciliation failed");
            ExitCode::FAILURE
        }
    }
}

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowlog_sync::{report_daily_markdown, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "flowlog-cli")]
#[command(about = "Issue and board tracker history ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, reconstruct and store history for every enabled source.
    Sync,
    /// Test connectivity and credentials of every enabled source.
    Validate,
    /// Print a markdown summary of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FLOWLOG_LOG")
        .unwrap_or_else(|_| EnvFilter::new("flowlog=info,warn"));
    let format = env::var("FLOWLOG_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} sources={} raw={} common={} reports={}",
                summary.run_id,
                summary.enabled_sources,
                summary.raw_items,
                summary.common_records,
                summary.reports_dir
            );

            if let Some(mut sched) = pipeline.maybe_build_scheduler().await? {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
                tokio::signal::ctrl_c()
                    .await
                    .context("waiting for shutdown signal")?;
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Validate => {
            let pipeline = SyncPipeline::new(config)?;
            let results = pipeline.validate_sources().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&results).context("serializing validation results")?
            );
            let failed = results.iter().filter(|r| !r.report.is_ok()).count();
            if failed > 0 {
                bail!("{failed} of {} sources failed validation", results.len());
            }
        }
        Commands::Report { runs } => {
            let report = report_daily_markdown(runs, Some(config.workspace_root))?;
            println!("{report}");
        }
    }

    Ok(())
}

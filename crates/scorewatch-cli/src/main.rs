use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use scorewatch_storage::StoreKind;
use scorewatch_sync::{pipeline_from_config, MarkScheduler, SyncConfig};
use scorewatch_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scorewatch")]
#[command(about = "Polls top-agent scores and charts the diff of newly seen agents")]
struct Cli {
    /// Storage backend (`memory` or `file`); overrides SCOREWATCH_STORE.
    #[arg(long, global = true)]
    store: Option<StoreKind>,
    /// Directory for agent_id.json and diff_log.csv; overrides SCOREWATCH_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Dashboard port; overrides SCOREWATCH_WEB_PORT.
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the background sync loop and the dashboard.
    Serve,
    /// Run a single fetch cycle and exit.
    Sync,
    /// Print when the next aligned cycle would run.
    NextRun,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_env().context("reading configuration from environment")?;
    if let Some(store) = cli.store {
        config.store_kind = store;
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(port) = cli.port {
        config.web_port = port;
    }
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let interval = config.interval_label();
            let port = config.web_port;
            info!(
                store = %config.store_kind,
                data_dir = %config.data_dir.display(),
                api_url = %config.api_url,
                "starting scorewatch"
            );

            let pipeline = Arc::new(pipeline_from_config(config)?);
            let state = AppState::new(pipeline.store(), pipeline.threshold_source())
                .with_interval(interval);
            let worker = Arc::clone(&pipeline).spawn();

            let listener = scorewatch_web::bind(port)
                .await
                .with_context(|| format!("binding dashboard port {port}"))?;
            let served = scorewatch_web::serve(listener, state, shutdown_signal()).await;
            worker.abort();
            served?;
        }
        Commands::Sync => {
            let summary = pipeline_from_config(config)?.run_once().await?;
            println!(
                "sync complete: run_id={} timestamp={} fetched={} saved={} new={} threshold={} total_diff={}",
                summary.run_id,
                summary.timestamp,
                summary.fetched_items,
                summary.saved_agents,
                summary.new_agents,
                summary.threshold,
                summary.total_diff
            );
        }
        Commands::NextRun => {
            let scheduler = MarkScheduler::new(config.interval_minutes, config.boundary_rule);
            let (mark, delay) = scheduler.plan(Local::now().naive_local());
            println!("next run at {mark} (in {} seconds)", delay.as_secs());
        }
    }

    Ok(())
}

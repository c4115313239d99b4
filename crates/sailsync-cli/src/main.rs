use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sailsync_adapters::{read_payload_file, ParseOptions};
use sailsync_core::TriggerSource;
use sailsync_sync::{Admission, PgStore, SyncConfig, SyncEngine};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sailsync-cli")]
#[command(about = "Sailing inventory sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the webhook server, dispatch loop, and schedules.
    Serve,
    /// Queue and run one cruise line now.
    Sync {
        #[arg(long)]
        line: i32,
        /// Ignore the recently-completed window.
        #[arg(long)]
        force: bool,
    },
    /// Run retention once.
    Cleanup,
    Migrate,
    /// Open the feed pool, sweep it, and print its stats.
    PoolCheck,
    /// Parse one payload file and print the record.
    Inspect {
        file: PathBuf,
        #[arg(long)]
        no_repair: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sailsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Sync { line, force } => {
            let engine = SyncEngine::from_config(config).await?;
            engine.start().await.context("opening feed pool")?;
            match engine.request_sync(line, force, TriggerSource::Admin).await? {
                Admission::Queued { event_id } => info!(%event_id, "sync queued"),
                Admission::Deduplicated { reason, .. } => {
                    warn!(reason, "nothing queued; running whatever is pending")
                }
            }
            let summaries = engine.run_pending().await?;
            engine.pool().shutdown().await;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Commands::Cleanup => {
            let engine = SyncEngine::from_config(config).await?;
            let report = engine.cleanup().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, config.db_max_connections).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::PoolCheck => {
            let engine = SyncEngine::from_config(config).await?;
            let opened = engine.start().await.context("opening feed pool")?;
            let swept = engine.pool_health().await;
            engine.pool().shutdown().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "opened": opened, "after_sweep": swept }))?
            );
        }
        Commands::Inspect { file, no_repair } => {
            let parsed = read_payload_file(
                &file,
                ParseOptions {
                    repair_char_indexed: !no_repair,
                },
            )?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "record": parsed.record,
                    "repairs": parsed.repairs,
                }))?
            );
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let engine = Arc::new(SyncEngine::from_config(config).await?);
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => {
                warn!(error = %err, "no ctrl-c handler; stop the process externally");
                std::future::pending::<()>().await;
            }
        }
        let _ = stop_tx.send(true);
    });

    let web = sailsync_web::serve(Arc::clone(&engine), stop_rx.clone());
    let sync = Arc::clone(&engine).run(stop_rx);
    tokio::try_join!(web, sync)?;
    Ok(())
}

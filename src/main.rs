//! Disk buffer agent: inspects and drains the signal folders

use clap::{Parser, Subcommand};
use otel_disk_buffer::drainer::watch_gateway;
use otel_disk_buffer::{
    BufferFileInfo, BufferedQueue, Config, Drain, DrainScheduler, FolderManager, HttpForwarder,
    JsonCodec, Result, SignalType, SystemClock,
};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "otel-disk-buffer")]
#[command(about = "Disk buffer for telemetry exports", long_about = None)]
struct Cli {
    /// Directory holding one buffer folder per signal
    #[arg(long, global = true)]
    root_dir: Option<PathBuf>,

    /// Telemetry gateway URL
    #[arg(long, global = true)]
    gateway_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the buffer files of every signal as JSON
    Status,

    /// Drain one signal folder to the gateway once
    Drain {
        /// spans, metrics or logs
        #[arg(long)]
        signal: SignalType,
    },

    /// Drain every signal folder periodically until interrupted
    Run {
        /// Seconds between drain passes
        #[arg(long)]
        interval_seconds: Option<u64>,
    },
}

#[derive(Serialize)]
struct SignalStatus {
    signal: SignalType,
    folder: PathBuf,
    total_bytes: u64,
    files: Vec<BufferFileInfo>,
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env();

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(gateway_url) = cli.gateway_url {
        config.gateway_url = gateway_url;
    }
    if let Commands::Run {
        interval_seconds: Some(seconds),
    } = cli.command
    {
        config.drain_interval = Duration::from_secs(seconds);
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    match cli.command {
        Commands::Status => status(&config).await,
        Commands::Drain { signal } => drain(&config, signal).await,
        Commands::Run { .. } => run(&config).await,
    }
}

async fn open_queue(config: &Config, signal: SignalType) -> Result<BufferedQueue<Value>> {
    let forwarder = HttpForwarder::new(
        &config.gateway_url,
        signal,
        config.http_timeout,
        config.max_retries,
        config.retry_backoff_ms,
    )?;

    BufferedQueue::builder(&config.root_dir, signal.folder_name())
        .with_storage_config(config.storage)
        .with_codec(Arc::new(JsonCodec::<Value>::new(signal.folder_name())))
        .with_forwarder(Arc::new(forwarder))
        .build()
        .await
}

async fn status(config: &Config) -> Result<()> {
    let mut statuses = Vec::new();

    for signal in SignalType::ALL {
        let files = FolderManager::inspect(
            &config.root_dir,
            signal.folder_name(),
            config.storage,
            Arc::new(SystemClock),
        )
        .await?;

        statuses.push(SignalStatus {
            signal,
            folder: config.root_dir.join(signal.folder_name()),
            total_bytes: files.iter().map(|file| file.size).sum(),
            files,
        });
    }

    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn drain(config: &Config, signal: SignalType) -> Result<()> {
    let queue = open_queue(config, signal).await?;
    let result = queue.drain_all(config.drain_timeout).await;
    let stats = queue.storage().stats();
    queue.shutdown().await;

    let exported = result?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "signal": signal,
            "exported": exported,
            "stats": stats,
        }))?
    );
    Ok(())
}

async fn run(config: &Config) -> Result<()> {
    info!(
        "Starting disk buffer agent v{} - Root: {}, Gateway: {}",
        env!("CARGO_PKG_VERSION"),
        config.root_dir.display(),
        config.gateway_url
    );

    let mut queues: Vec<Arc<dyn Drain>> = Vec::new();
    for signal in SignalType::ALL {
        queues.push(Arc::new(open_queue(config, signal).await?));
    }

    let scheduler = DrainScheduler::new(queues, config.drain_interval, config.drain_timeout);

    let health = HttpForwarder::new(
        &config.gateway_url,
        SignalType::Logs,
        config.http_timeout,
        0,
        config.retry_backoff_ms,
    )?;
    let watcher = tokio::spawn(watch_gateway(
        health,
        config.drain_interval,
        scheduler.trigger_handle(),
    ));

    let exported = scheduler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to wait for shutdown signal: {}", e);
            }
        })
        .await;

    info!("Shutting down disk buffer agent");
    watcher.abort();
    scheduler.shutdown().await;

    info!("Disk buffer agent stopped, {} batches exported", exported);
    Ok(())
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

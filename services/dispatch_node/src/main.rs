//! Dispatcher node - boots the core with the built-in capabilities and
//! bridges newline-delimited JSON messages on stdin/stdout
//!
//! Usage:
//!   dispatch-node --config config/dispatch.toml
//!   echo '{"kind":"command","type":"Memory.Set",...}' | dispatch-node
//!
//! Logs go to stderr so stdout carries only outbound messages.

mod memory;

use anyhow::{Context, Result};
use clap::Parser;
use dispatch_core::{DispatchConfig, Dispatcher, Egress, Inbound};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dispatch-node")]
#[command(about = "Message routing and scheduling node")]
#[command(version)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("Starting dispatch node");
    let config = DispatchConfig::load(args.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {:#}", e);
        e
    })?;

    let (mut dispatcher, egress) =
        Dispatcher::boot(config, vec![memory::capability()]).context("Dispatcher boot failed")?;

    let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_stdin(ingress_tx));
    let writer = tokio::spawn(write_stdout(egress));

    dispatcher.run(ingress_rx, shutdown_signal()).await;

    let stats = dispatcher.stats();
    info!(
        turns = stats.counters.turns,
        resolved = stats.counters.resolved,
        timeouts = stats.counters.timeouts,
        orphans = stats.counters.orphans,
        "Dispatch node stopped"
    );

    // Dropping the dispatcher closes egress so the writer can finish
    drop(dispatcher);
    reader.abort();
    writer.await.context("stdout writer panicked")??;
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// One message per line; blank lines are skipped
async fn read_stdin(ingress: mpsc::UnboundedSender<Inbound>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if ingress.send(Inbound::Raw(line.to_string())).is_err() {
            break;
        }
    }
    info!("stdin closed");
    Ok(())
}

async fn write_stdout(mut egress: Egress) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(msg) = egress.recv().await {
        match msg.to_json() {
            Ok(mut line) => {
                line.push('\n');
                stdout.write_all(line.as_bytes()).await?;
                stdout.flush().await?;
            }
            Err(e) => warn!(message_id = %msg.id(), error = %e, "Failed to encode outbound message"),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

//! pcmcast listening client - Main entry point
//!
//! Subscribes to a relay server and records the stream to a WAV file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pcmcast_common::protocol::DEFAULT_PORT;
use pcmcast_listen::{Error, ListenConfig, ReceiveStats, Receiver, WavSink};
use tokio::net::lookup_host;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for pcmcast-listen
#[derive(Parser, Debug)]
#[command(name = "pcmcast-listen")]
#[command(about = "Record a pcmcast relay stream to a WAV file")]
#[command(version)]
struct Args {
    /// Relay server host or IP
    host: String,

    /// Relay server UDP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Output WAV file
    #[arg(short, long, default_value = "pcmcast.wav")]
    output: PathBuf,

    /// End the stream after this long without packets, in milliseconds
    #[arg(long, default_value_t = 2000)]
    idle_timeout_ms: u64,

    /// Packets held back before a gap is filled with silence
    #[arg(long, default_value_t = 100)]
    jitter_depth: usize,

    /// Print stats as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "PCMCAST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so --json output stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let server = lookup_host((args.host.as_str(), args.port))
        .await
        .map_err(|e| Error::Resolve(format!("{}:{}: {}", args.host, args.port, e)))?
        .next()
        .ok_or_else(|| Error::Resolve(format!("{}:{}: no addresses", args.host, args.port)))?;

    let mut config = ListenConfig::new(server);
    config.idle_timeout = Duration::from_millis(args.idle_timeout_ms);
    config.jitter_depth = args.jitter_depth;

    let receiver = Receiver::bind(config).await.context("Error binding socket")?;
    let mut sink = WavSink::create(&args.output)
        .with_context(|| format!("Error creating {}", args.output.display()))?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping");
                on_signal.cancel();
            }
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    });

    let stats = receiver.run(&mut sink, shutdown).await;
    sink.finalize().context("Error finalizing WAV file")?;
    let stats = stats.context("Receive failed")?;

    info!("Saved {}", args.output.display());
    report(&stats, args.json)?;

    Ok(())
}

fn report(stats: &ReceiveStats, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
    } else {
        info!(
            "Received {} packets ({} lost, {} late, {} duplicate, {} out of range, {} malformed), {} bytes written{}",
            stats.received,
            stats.lost,
            stats.late,
            stats.duplicate,
            stats.out_of_range,
            stats.malformed,
            stats.bytes_written,
            if stats.interrupted { ", interrupted" } else { "" }
        );
    }
    Ok(())
}

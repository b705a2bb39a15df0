//! pcmcast relay server - Main entry point
//!
//! Loads one audio file, then relays it over UDP to every client that sends
//! `START`. Press Enter to enable broadcast mode: everyone connected gets the
//! stream right away and every later joiner gets its own run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pcmcast_common::config::{ConfigOverrides, ServerConfig, TomlConfig};
use pcmcast_server::{BroadcastTrigger, Session};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for pcmcast-server
#[derive(Parser, Debug)]
#[command(name = "pcmcast-server")]
#[command(about = "Relay a decoded audio file to UDP clients")]
#[command(version)]
struct Args {
    /// Audio file to relay (mp3, flac, aac/m4a, ogg, wav)
    audio_file: PathBuf,

    /// Config file (default: ~/.config/pcmcast/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host or IP to bind
    #[arg(long, env = "PCMCAST_HOST")]
    host: Option<String>,

    /// UDP port to bind
    #[arg(short, long, env = "PCMCAST_PORT")]
    port: Option<u16>,

    /// Bounded wait of each control receive, in milliseconds
    #[arg(long, env = "PCMCAST_RECV_TIMEOUT_MS")]
    recv_timeout_ms: Option<u64>,

    /// Enable broadcast mode at startup instead of waiting for Enter
    #[arg(long, env = "PCMCAST_AUTO_BROADCAST")]
    auto_broadcast: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "PCMCAST_LOG")]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind_host: self.host.clone(),
            port: self.port,
            recv_timeout_ms: self.recv_timeout_ms,
            auto_broadcast: self.auto_broadcast.then_some(true),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The log level comes from the config, so loading reports through a
    // plain stderr subscriber of its own
    let bootstrap = tracing_subscriber::fmt().with_writer(std::io::stderr).finish();
    let loaded = tracing::subscriber::with_default(bootstrap, || {
        TomlConfig::load_or_default(args.config.as_deref())
    });
    let mut toml_config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => TomlConfig::default(),
    };
    toml_config.apply_overrides(&args.overrides());

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| toml_config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    loaded.context("Failed to load configuration")?;
    let config = ServerConfig::from_toml(&toml_config).context("Invalid configuration")?;

    info!(
        "Starting pcmcast-server v{} ({} built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("PCMCAST_GIT_HASH"),
        env!("PCMCAST_BUILD_TIMESTAMP"),
        env!("PCMCAST_BUILD_PROFILE"),
    );
    debug!(?config, "Resolved configuration");

    let mut session = Session::load(&args.audio_file, config)
        .await
        .with_context(|| format!("Error loading audio file {}", args.audio_file.display()))?;

    session.start().await.context("Error binding socket")?;

    info!("Server ready. Waiting for clients to connect...");
    if !session.is_broadcast_mode() {
        info!("Press Enter to enable broadcast mode (or Ctrl+C to quit).");
        info!("After Enter is pressed, each new client will automatically receive a broadcast.");
    }

    let mut enter_presses = spawn_stdin_reader();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            pressed = enter_presses.recv() => match pressed {
                Some(()) => match session.enable_broadcast_mode().await {
                    Ok(BroadcastTrigger::InFlight) => {
                        warn!("Broadcast to all clients still running, not starting another");
                    }
                    Ok(trigger) => debug!(?trigger, "Broadcast mode trigger handled"),
                    Err(e) => error!("Failed to enable broadcast mode: {}", e),
                },
                None => {
                    // stdin closed: headless, keep serving until a signal arrives
                    debug!("Console input closed");
                    shutdown.as_mut().await;
                    break;
                }
            },
        }
    }

    if !session.shutdown().await {
        warn!("Some broadcast runs did not finish before shutdown");
    }

    Ok(())
}

/// Forward each line typed on the console as one trigger.
///
/// Reads on a detached OS thread: a blocking stdin read cannot be
/// cancelled and must not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    rx
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

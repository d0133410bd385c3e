//! autopost-send - Publishing daemon
//!
//! Runs the publishing queue and the auto-posting enforcer against the
//! configured database until it is told to stop.

use anyhow::{Context, Result};
use clap::Parser;
use libautopost::logging::{LogFormat, LoggingConfig};
use libautopost::{AutopostError, AutopostService, Config};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "autopost-send")]
#[command(version)]
#[command(about = "Publishing daemon for scheduled, quota-bound posts")]
#[command(long_about = "\
autopost-send - Publishing daemon for scheduled, quota-bound posts

DESCRIPTION:
    autopost-send admits approved posts whose target time has arrived,
    publishes them through the enabled platform adapters, retries transient
    failures with backoff and refreshes expired platform credentials.
    Quota is committed only when a platform confirms the post.

USAGE:
    # Run in foreground (logs to stderr)
    autopost-send

    # One enforcement pass, publish everything due, then exit
    autopost-send --once

    # Verbose JSON logs
    autopost-send --verbose --log-format json

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes posts in flight)

CONFIGURATION:
    Configuration file: ~/.config/autopost/config.toml
    Database location: ~/.local/share/autopost/autopost.db

    Override with environment variables:
        AUTOPOST_CONFIG      - Path to config file
        AUTOPOST_DB_PATH     - Path to database file
        AUTOPOST_LOG_FORMAT  - text, json or pretty
        AUTOPOST_LOG_LEVEL   - error, warn, info, debug or trace

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Configuration file (default: $AUTOPOST_CONFIG or the XDG config dir)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log format: text, json or pretty
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run one enforcement pass, drain the queue and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env(cli.verbose);
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    logging.init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "autopost-send stopped with an error");
            eprintln!("autopost-send: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<AutopostError>() {
        Some(AutopostError::Config(_)) => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };

    let service = AutopostService::from_config(config)
        .await
        .context("Failed to open the publishing service")?;

    if cli.once {
        let enforcement = service.enforce().await?;
        let drained = service.drain().await?;
        info!(
            admitted = enforcement.admitted,
            cancelled = enforcement.cancelled,
            published = drained.published,
            retried = drained.retried,
            failed = drained.failed,
            "autopost-send: processed due posts once, exiting"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx)?;

    info!(database = %service.config().db_path(), "autopost-send daemon starting");
    service.run(shutdown_rx).await?;
    info!("autopost-send daemon stopped");

    Ok(())
}

/// Flip the shutdown flag on the first SIGINT or SIGTERM
#[cfg(unix)]
fn spawn_signal_listener(shutdown: watch::Sender<bool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received shutdown signal, finishing posts in flight");
            // Receivers only go away once the daemon has already stopped
            let _ = shutdown.send(true);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_listener(shutdown: watch::Sender<bool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, finishing posts in flight");
            let _ = shutdown.send(true);
        }
    });
    Ok(())
}

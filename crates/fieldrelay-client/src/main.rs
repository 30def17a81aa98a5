//! FieldRelay controller client

use anyhow::Context;
use clap::Parser;
use fieldrelay_core::logging::{file_writer, parse_level, ServerLogLayer, LOG_DIR};
use fieldrelay_core::prelude::*;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "fieldrelay")]
#[command(about = "Relay between serial field devices and the FieldRelay server")]
#[command(version)]
struct Cli {
    /// Controller config file; a local.json next to it overrides entries
    #[arg(short = 'c', long = "config-file-name", default_value = "config.json")]
    config_file_name: PathBuf,

    /// Show debug messages
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config_file_name)
        .with_context(|| format!("unable to start with {}", cli.config_file_name.display()))?;

    let verbose = cli.verbose || config.get_bool("verbose", false);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let server_level = config
        .get_str("server_log_level")
        .and_then(parse_level)
        .unwrap_or(Level::INFO);
    let (server_log, server_log_handle) = ServerLogLayer::new(server_level);
    // the guard flushes the log file on exit
    let (log_file, _log_guard) =
        file_writer(&config, Path::new(LOG_DIR)).context("unable to open log file")?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log_file)
                .with_filter(EnvFilter::new("info,fieldrelay=debug,fieldrelay_core=debug")),
        )
        .with(server_log)
        .init();

    tracing::info!("loaded config: {}", cli.config_file_name.display());
    let send_logs = config.get_bool("enable_server", true);
    let controller = Controller::new(config);
    if send_logs {
        server_log_handle.attach(controller.sequences().clone());
    }

    let cancel = controller.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted; shutting down");
            cancel.cancel();
        }
    });

    controller.run().await?;
    Ok(())
}

//! smtp2signal - SMTP to Signal gateway entry point

use anyhow::Result;
use smtp2signal_common::config::{Config, LoggingConfig};
use smtp2signal_core::{CredentialStore, GatewayServer};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting smtp2signal gateway...");

    // Load or generate the shared AUTH token
    let store = CredentialStore::load_or_generate(config.smtp.token_file.as_deref())?;

    // Bind the SMTP listener and start accepting mail
    let mut gateway = GatewayServer::bind(config, store).await?;
    gateway.start();

    info!("smtp2signal started successfully");

    // Wait for shutdown signal
    wait_for_signal().await?;
    info!("Shutdown signal received");

    let report = gateway.shutdown().await;
    info!(
        "{} dispatch(es) completed, {} cancelled during shutdown",
        report.completed, report.cancelled
    );

    info!("Have a nice day!");

    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_level(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_level(true))
            .with(filter)
            .init();
    }
}

//! Feed value provider - CLI host
//!
//! Loads configuration, starts the integration service, and runs until a
//! termination signal. Exit codes: 0 clean shutdown, 1 initialization
//! failure, 2 configuration error, 3 shutdown grace exceeded.

use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feed_provider::error::FeedError;
use feed_provider::service::FeedIntegrationService;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before anything reads the environment
    let _ = dotenvy::dotenv();
    init_tracing();

    tracing::info!("Starting feed provider v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("FEED_CONFIG").ok();
    let config = match feed_provider::config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Configuration error");
            return ExitCode::from(2);
        }
    };
    tracing::info!(
        feeds = config.feeds.declared.len(),
        adapters = config.adapters.enabled.len(),
        "Configuration loaded"
    );

    let service = match FeedIntegrationService::start(config).await {
        Ok(service) => service,
        Err(FeedError::Config(e)) => {
            tracing::error!(error = %e, "Configuration error");
            return ExitCode::from(2);
        }
        Err(e) => {
            tracing::error!(error = %e, "Initialization failed");
            return ExitCode::from(1);
        }
    };

    wait_for_shutdown_signal().await;

    match service.shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Shutdown did not complete in time");
            ExitCode::from(3)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("FEED_LOG_JSON").map(|v| v == "1").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received shutdown signal");
}

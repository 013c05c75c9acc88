use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use unitgate::config::{Cli, Config};
use unitgate::gate::{self, GateExit};
use unitgate::listener::Listener;
use unitgate::supervisor::SystemdUnitControl;

/// Version information for the proxy
const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("unitgate=info".parse().expect("valid log directive")),
        )
        .init();

    let config = Config::from_cli(Cli::parse()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    // Take over the socket before talking to the service manager
    let listener = Listener::from_activation()?;
    info!(listen = %listener.local_addr(), "Took over activated socket");

    let control = SystemdUnitControl::connect(config.user).await?;

    match gate::run(&config, listener, Arc::new(control), shutdown_signal()).await? {
        GateExit::Idle => info!("Idle shutdown complete"),
        GateExit::Signal => info!("Shutdown complete"),
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy");
    info!(
        unit = %config.unit,
        user = config.user,
        "Supervised unit"
    );
    info!(
        mode = %config.mode,
        address = %config.address,
        retries = config.retries,
        retry_delay_ms = config.retry_delay.as_millis() as u64,
        "Backend settings"
    );
    info!(
        idle_timeout_ms = config.idle_timeout.as_millis() as u64,
        idle_policy = ?config.idle_policy,
        "Idle shutdown settings"
    );
}

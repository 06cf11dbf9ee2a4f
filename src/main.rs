mod command;
mod config;
mod error;
mod lifecycle;
mod security;
mod transport;

use config::AgentConfig;
use lifecycle::Agent;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    info!("deskctl agent starting");
    info!("  commands: {}", config.commands_file.display());
    if config.http_enabled {
        info!("  http: {}", config.http_addr);
    }
    if config.grpc_enabled {
        info!("  grpc: {}", config.grpc_addr);
    }
    if config.mqtt_enabled {
        info!("  mqtt: {}:{} ({})", config.mqtt_host, config.mqtt_port, config.mqtt_base_topic);
    }
    if config.pin_secret().is_none() {
        warn!("no PIN configured, PIN-protected commands will always be rejected");
    }

    let mut agent = match Agent::build(config).await {
        Ok(agent) => agent,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = agent.run(shutdown_signal()).await {
        error!(phase = %agent.phase(), "agent exited with error: {}", e);
        std::process::exit(1);
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

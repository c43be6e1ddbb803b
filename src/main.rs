//! burrow - Binary RPC tunneled through minimal HTTP
//!
//! Runs a server with the built-in echo system registered.

use burrow_server::{Config, EchoSystem, Server, ServerConfig, System, SystemRegistry};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if BURROW_CONFIG is set, then env overrides)
    let config_path = std::env::var("BURROW_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting burrow server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Content length: {}..={} bytes ({:?})",
        config.limits.min_content_length,
        config.limits.max_request_size,
        config.limits.length_check_order
    );
    match config.network.idle_timeout() {
        Some(timeout) => tracing::info!("  Idle timeout: {:?}", timeout),
        None => tracing::info!("  Idle timeout: disabled"),
    }

    let registry = SystemRegistry::builder()
        .register(Arc::new(EchoSystem::default()) as Arc<dyn System>)?
        .build();
    for (number, system) in registry.iter() {
        tracing::info!("  System {}: {}", number, system.name());
    }

    let server = Arc::new(Server::new(ServerConfig::from_config(&config), registry));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}

//! # Protogate Entry Point
//!
//! The main executable of the gateway. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Installs the log subscriber and parses command-line arguments using [`cli::Cli`].
//! 2. **Configuration**: Loads the gateway configuration file.
//! 3. **Binding**: Binds every route against its descriptor set and schema. Nothing is served
//!    unless every route binds.
//! 4. **Execution**: Either serves HTTP traffic until Ctrl-C, or reports on the configuration and exits.
mod cli;
mod config;
mod server;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use config::GatewayConfig;
use protogate_core::transport::RouteChannel;
use std::net::SocketAddr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "protogate=info,protogate_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Cli::parse();
    let config = GatewayConfig::load(&args.config)?;

    match args.command {
        Commands::Serve { listen } => serve(config, listen).await,
        Commands::Check { connect } => check(config, connect).await,
    }
}

async fn serve(config: GatewayConfig, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let routes = server::bind_routes(&config)?;
    let app = server::router(routes);

    let addr = listen.unwrap_or(config.listen);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {addr}"))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        routes = config.routes.len(),
        "protogate listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("protogate stopped");
    Ok(())
}

async fn check(config: GatewayConfig, connect: bool) -> anyhow::Result<()> {
    let routes = server::bind_routes(&config)?;

    if connect {
        let mut unreachable = 0;
        for route in &config.routes {
            if let Err(err) = RouteChannel::connect(route.target()).await {
                tracing::error!(route = %route.path, error = %err, "upstream check failed");
                unreachable += 1;
            }
        }
        if unreachable > 0 {
            anyhow::bail!("{unreachable} of {} upstreams are unreachable", routes.len());
        }
    }

    for route in &routes {
        let binding = route.transcoder.binding();
        println!("{} -> {}", route.path, binding.path());
    }
    println!("configuration OK: {} routes", routes.len());

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown requested, draining connections"),
        Err(err) => {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await
        }
    }
}

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use pulse_common::logging::log_welcome;
use pulse_common::setup_logging;
use pulse_server::{routes, Cli, PulseConfig, PulseService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = PulseConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    setup_logging(&config.logging)?;
    log_welcome(&config.logging.app_name, env!("CARGO_PKG_VERSION"));

    let bind = config.server.bind.clone();
    let service = Arc::new(PulseService::new(config)?);
    service.start().await?;

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    info!(addr = %listener.local_addr()?, "Listening");

    let served = axum::serve(listener, routes::router(service.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await;

    // The pipeline is stopped even when the server exits with an error
    if let Err(e) = service.stop().await {
        error!("Pipeline shutdown failed: {}", e);
    }
    served.context("HTTP server exited unexpectedly")?;

    info!("supportpulse stopped");
    Ok(())
}

//! The delayed echo dispatch service.

mod app;
mod config;
#[cfg(test)]
mod config_test;
mod dispatch;
mod error;
#[cfg(test)]
mod fixtures;
mod server;
mod store;
mod timer;
mod utils;
#[cfg(test)]
mod utils_test;
mod watchers;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("error installing prometheus metrics recorder")?;

    tracing::info!(
        client_port = %cfg.client_port,
        metrics_port = %cfg.metrics_port,
        redis_url = %cfg.redis_url,
        "starting delayed echo dispatch service",
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    let app_res = App::new(cfg, metrics_handle, shutdown_tx.clone())
        .await?
        .spawn()
        .await
        .context("error joining application task")
        .and_then(|res| res);
    if let Err(err) = app_res {
        tracing::error!(error = ?err);
        let _res = shutdown_tx.send(());
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}

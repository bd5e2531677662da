use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::dispatch::DispatchCtl;
use crate::server::{spawn_prom_server, AppServer};
use crate::store::RedisStore;
use crate::watchers::FreshnessWatcher;

/// The application object for when echod is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the dispatch engine.
    dispatch_handle: JoinHandle<Result<()>>,
    /// The join handle of the freshness watcher.
    freshness_handle: JoinHandle<Result<()>>,
    /// The join handle of the client HTTP server.
    client_server: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics_handle: PrometheusHandle, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        // Initialize the store client and the engine's data connection.
        let client = redis::Client::open(config.redis_url.as_str()).context("error building store client")?;
        let store = RedisStore::connect(client.clone()).await?;

        // Spawn various core tasks.
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1000);
        let (freshness_tx, freshness_rx) = mpsc::channel(100);
        let (dispatch, ready_rx) = DispatchCtl::new(config.clone(), store, dispatch_rx, freshness_rx, shutdown_tx.clone());
        let dispatch_handle = dispatch.spawn();
        let freshness_handle = FreshnessWatcher::new(client, freshness_tx, shutdown_tx.clone()).spawn();

        // Only expose the ingress once the engine has bootstrapped.
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::select! {
            res = ready_rx => res.context("dispatch engine failed to start")?,
            _ = shutdown_rx.recv() => bail!("shutdown triggered before the dispatch engine became ready"),
        }

        let client_server = AppServer::new(config.clone(), dispatch_tx, shutdown_tx.clone()).spawn();
        let metrics_server = spawn_prom_server(&config, metrics_handle, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            dispatch_handle,
            freshness_handle,
            client_server,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((signal, _)) = signals.next() => {
                    tracing::debug!(%signal, "signal received, beginning graceful shutdown");
                    let _res = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("echod is shutting down");
        if let Err(err) = self.dispatch_handle.await.context("error joining dispatch engine handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down dispatch engine");
        }
        if let Err(err) = self.freshness_handle.await.context("error joining freshness watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down freshness watcher");
        }
        if let Err(err) = self.client_server.await.context("error joining client HTTP server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down client HTTP server");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("echod shutdown complete");
        Ok(())
    }
}

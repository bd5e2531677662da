//! Client HTTP server.

mod prom;

pub use prom::spawn_prom_server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::DispatchCtlMsg;
use crate::error::AppError;

/// Application server.
pub struct AppServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
    /// A channel for communicating with the dispatch engine.
    dispatch_tx: mpsc::Sender<DispatchCtlMsg>,
}

/// Shared state for ingress request handlers.
#[derive(Clone)]
struct IngressState {
    dispatch_tx: mpsc::Sender<DispatchCtlMsg>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, dispatch_tx: mpsc::Sender<DispatchCtlMsg>, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, shutdown, dispatch_tx }
    }

    /// Spawn this controller's HTTP server.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.client_port));
        let mut shutdown_rx = self.shutdown.subscribe();
        let app = Router::new()
            .route("/enqueue", post(enqueue))
            .route("/health", get(health))
            .with_state(IngressState {
                dispatch_tx: self.dispatch_tx.clone(),
            });

        let listener = tokio::net::TcpListener::bind(addr).await.context("error binding client HTTP listener")?;
        tracing::info!("client HTTP server is listening at {}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _res = shutdown_rx.recv().await;
            })
            .await
            .context("error from client HTTP server")
    }
}

/// Handle a healthcheck probe.
///
/// The server is only spawned once the dispatch engine has signalled startup complete,
/// so reachability is readiness.
async fn health() -> StatusCode {
    StatusCode::OK
}

/// A client request to enqueue a message for delayed emission.
#[derive(Debug, Deserialize)]
struct EnqueueBody {
    /// The wall-clock instant in ms at which the message is due. Past instants are
    /// accepted and dispatched as soon as possible.
    time: i64,
    /// The message text to be emitted.
    text: String,
}

/// The response returned for an accepted submission.
#[derive(Debug, Serialize)]
struct EnqueueAccepted {
    /// The deterministic ID of the enqueued message.
    id: String,
}

/// Handle a client enqueue request.
async fn enqueue(State(state): State<IngressState>, Json(body): Json<EnqueueBody>) -> Response {
    let (tx, rx) = oneshot::channel();
    let msg = DispatchCtlMsg::Enqueue {
        time: body.time,
        text: body.text,
        tx,
    };
    if state.dispatch_tx.send(msg).await.is_err() {
        return AppError::Unavailable.into_response();
    }
    match rx.await {
        Ok(Ok(id)) => (StatusCode::ACCEPTED, Json(EnqueueAccepted { id })).into_response(),
        Ok(Err(err)) => err.into_response(),
        Err(_) => AppError::Unavailable.into_response(),
    }
}

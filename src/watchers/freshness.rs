use anyhow::{anyhow, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::store::{ConnectRetry, CHANNEL_NEXT_DUE};
use crate::utils;

const METRIC_FRESHNESS_WATCHER_ERRORS: &str = "echod_freshness_watcher_errors";

/// An event observed on the freshness channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreshnessEvent {
    /// The subscription has been (re)established; published minima will flow again, and
    /// the engine should rebootstrap from a direct query.
    Subscribed,
    /// A queue minimum was published: the new minimum due-time, or `None` for an empty
    /// queue.
    Update(Option<i64>),
    /// The subscription dropped; the engine's view of the minimum is stale until the
    /// subscription is restored.
    Lost,
}

/// A watcher holding the dedicated subscriber connection to the freshness channel.
///
/// A subscribed store connection cannot issue data commands, so this connection exists
/// apart from the engine's data connection. Every published minimum — including this
/// replica's own — flows through here into the engine.
pub struct FreshnessWatcher {
    /// The store client used to open subscriber connections.
    client: redis::Client,
    /// The channel of events bound for the dispatch engine.
    events_tx: mpsc::Sender<FreshnessEvent>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// The number of times a subscriber connection has been established.
    times_connected: u32,
}

impl FreshnessWatcher {
    /// Create a new instance.
    pub fn new(client: redis::Client, events_tx: mpsc::Sender<FreshnessEvent>, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::describe_counter!(METRIC_FRESHNESS_WATCHER_ERRORS, metrics::Unit::Count, "freshness subscription failures");
        Self {
            client,
            events_tx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            times_connected: 0,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        loop {
            let mut pubsub = match self.establish().await? {
                Some(pubsub) => pubsub,
                None => return Ok(()),
            };
            if let Err(err) = pubsub.subscribe(CHANNEL_NEXT_DUE).await {
                tracing::warn!(error = ?err, "error subscribing to the freshness channel");
                metrics::counter!(METRIC_FRESHNESS_WATCHER_ERRORS).increment(1);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
            self.times_connected += 1;
            tracing::info!("freshness subscription established");
            let _res = self.events_tx.send(FreshnessEvent::Subscribed).await;

            let dropped = {
                let mut messages = pubsub.on_message();
                loop {
                    tokio::select! {
                        msg_opt = messages.next() => match msg_opt {
                            Some(msg) => self.handle_message(msg).await,
                            None => break true,
                        },
                        _ = self.shutdown_rx.next() => break false,
                    }
                }
            };
            if !dropped {
                return Ok(());
            }

            metrics::counter!(METRIC_FRESHNESS_WATCHER_ERRORS).increment(1);
            tracing::warn!("freshness subscription lost, attempting to re-establish");
            let _res = self.events_tx.send(FreshnessEvent::Lost).await;
        }
    }

    /// Open a subscriber connection, retrying per the connection retry policy.
    ///
    /// Returns `None` when shutdown was triggered while backing off. Exhausting the
    /// retry budget is fatal for the whole replica.
    async fn establish(&mut self) -> Result<Option<redis::aio::PubSub>> {
        let mut retry = ConnectRetry::new(self.times_connected);
        loop {
            match self.client.get_async_pubsub().await {
                Ok(pubsub) => return Ok(Some(pubsub)),
                Err(err) => {
                    tracing::warn!(error = ?err, "error opening freshness subscriber connection");
                    let delay = match retry.next_delay() {
                        Some(delay) => delay,
                        None => {
                            tracing::error!("exhausted freshness subscriber connection retries");
                            let _res = self.shutdown_tx.send(());
                            return Err(anyhow!("could not establish freshness subscriber connection"));
                        }
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => (),
                        _ = self.shutdown_rx.next() => return Ok(None),
                    }
                }
            }
        }
    }

    /// Decode a freshness payload and forward it to the engine.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_message(&mut self, msg: redis::Msg) {
        match utils::buffer_to_number(msg.get_payload_bytes()) {
            Ok(value) => {
                let next_due = value.map(|value| value.round() as i64);
                let _res = self.events_tx.send(FreshnessEvent::Update(next_due)).await;
            }
            Err(err) => tracing::warn!(error = ?err, "discarding malformed payload on the freshness channel"),
        }
    }
}

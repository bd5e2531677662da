use tokio::sync::oneshot;

use crate::dispatch::{DispatchCtl, METRIC_MESSAGES_ENQUEUED};
use crate::error::AppError;
use crate::store::{MessageStore, StoreError};
use crate::utils;

impl<S: MessageStore> DispatchCtl<S> {
    #[tracing::instrument(level = "trace", skip(self, time, text, tx))]
    pub(super) async fn handle_enqueue_request(&mut self, time: i64, text: String, tx: oneshot::Sender<Result<String, AppError>>) {
        let res = self.enqueue(time, text).await;
        if let Err(err) = &res {
            tracing::error!(error = ?err, "error while enqueueing message");
        }
        let _res = tx.send(res);
    }

    /// Enqueue a message for delayed emission, returning its deterministic ID.
    ///
    /// The engine does not touch `next_due` here: when the submission lowers the queue
    /// minimum, its due-time is published inside the write transaction, and the update
    /// arrives through the freshness channel like any peer's would.
    async fn enqueue(&mut self, time: i64, text: String) -> Result<String, AppError> {
        if text.is_empty() {
            return Err(AppError::InvalidInput("message text must not be empty".into()));
        }
        if text.len() > self.config.max_message_bytes {
            return Err(AppError::InvalidInput(format!(
                "message text must not exceed {} bytes, got {}",
                self.config.max_message_bytes,
                text.len()
            )));
        }
        let now = utils::now_ms();
        if time < now {
            tracing::info!(time, now, "due-time is in the past, message will be dispatched immediately");
        }

        let id = utils::message_id(time, &text);
        let publish_min = !self.up_to_date || self.next_due.map_or(true, |due| time < due);
        match self.store.write_message(&id, &text, time, publish_min).await {
            Ok(added) => {
                if added != 1 {
                    tracing::info!(%id, added, "queue entry already present, idempotent re-submission");
                }
                metrics::counter!(METRIC_MESSAGES_ENQUEUED).increment(1);
                Ok(id)
            }
            Err(err @ StoreError::Transport(_)) => {
                // The transaction never reached the store, so there is nothing to roll
                // back; surface the failure and restore the connection for later requests.
                if let Err(err) = self.recover_store(&err).await {
                    tracing::error!(error = ?err, "store reconnect failed");
                    let _res = self.shutdown_tx.send(());
                }
                Err(AppError::Ise(err.into()))
            }
            Err(err) => {
                tracing::warn!(error = ?err, %id, "error inside enqueue transaction, rolling back");
                if let Err(err) = self.store.rollback(&id).await {
                    tracing::warn!(error = ?err, %id, "best-effort rollback failed");
                }
                Err(AppError::Ise(err.into()))
            }
        }
    }
}

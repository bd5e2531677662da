//! Dispatch engine.
//!
//! ## Coordination
//! Any replica may accept a submission and any replica may deliver it. Replicas never
//! talk to each other directly; all coordination flows through the shared store. Mutual
//! exclusion on emission is provided by a short-lived conditional claim per message, and
//! freshness of the queue minimum is provided by pub/sub — including self-delivery, so a
//! replica learns about its own submissions the same way it learns about its peers'.
//!
//! ## Reentrancy
//! The engine is one task. Submissions, timer firings and freshness updates are
//! serialized through its run loop, so none of the engine state needs a lock. While an
//! inspection pass is running, pending events are drained at each await boundary; a timer
//! firing observed mid-pass requests a resume, which abandons the pass and restarts it
//! with a freshly computed due bound.

mod enqueue;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::error::{AppError, ShutdownError};
use crate::store::{MessageStore, StoreError, PROCESSING_WINDOW_MS};
use crate::timer::DispatchTimer;
use crate::utils;
use crate::watchers::FreshnessEvent;

/// The maximum number of entries fetched per batch during an inspection pass.
const BATCH_SIZE: usize = 30;
/// The number of store round-trips typically performed before an emission; the timer is
/// armed this many latencies ahead of the next due-time.
const LATENCY_QUERY_FACTOR: i64 = 3;
/// The delay before re-inspecting a window which still held leftovers, sized so claims
/// held by peers will have expired.
const PROCESSING_RETRY_DELAY_MS: i64 = PROCESSING_WINDOW_MS + PROCESSING_WINDOW_MS / 10;

const METRIC_MESSAGES_ENQUEUED: &str = "echod_messages_enqueued";
const METRIC_MESSAGES_EMITTED: &str = "echod_messages_emitted";
const METRIC_INSPECTION_PASSES: &str = "echod_inspection_passes";
const METRIC_LEFTOVER_MESSAGES: &str = "echod_leftover_messages";

/// The engine driving delayed dispatch for this replica.
pub struct DispatchCtl<S: MessageStore> {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The gateway to the shared store's data plane.
    store: S,

    /// A channel of inbound client requests.
    requests_rx: mpsc::Receiver<DispatchCtlMsg>,
    /// A channel of events from the freshness subscriber.
    freshness_rx: mpsc::Receiver<FreshnessEvent>,
    /// The timer driving inspection passes.
    timer: DispatchTimer,
    /// The timer's firing channel.
    timer_rx: mpsc::Receiver<()>,

    /// The queue's minimum due-time in ms, as far as this replica knows.
    next_due: Option<i64>,
    /// True iff `next_due` reflects the latest value published on the freshness channel
    /// since the subscription was last established.
    up_to_date: bool,
    /// The measured round-trip cost of a store query in ms.
    latency: i64,
    /// True while an inspection pass is running.
    inspecting: bool,
    /// True when a timer firing was observed mid-pass; the pass abandons and restarts.
    resume_requested: bool,

    /// A channel used to signal startup completion, consumed on first bootstrap.
    ready_tx: Option<oneshot::Sender<()>>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl<S: MessageStore> DispatchCtl<S> {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, store: S, requests_rx: mpsc::Receiver<DispatchCtlMsg>, freshness_rx: mpsc::Receiver<FreshnessEvent>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, oneshot::Receiver<()>) {
        metrics::describe_counter!(METRIC_MESSAGES_ENQUEUED, metrics::Unit::Count, "messages accepted for delayed dispatch");
        metrics::describe_counter!(METRIC_MESSAGES_EMITTED, metrics::Unit::Count, "messages emitted by this replica");
        metrics::describe_counter!(METRIC_INSPECTION_PASSES, metrics::Unit::Count, "inspection passes started");
        metrics::describe_counter!(METRIC_LEFTOVER_MESSAGES, metrics::Unit::Count, "messages observed but not dispatchable during a pass");

        let (timer, timer_rx) = DispatchTimer::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        (
            Self {
                config,
                store,
                requests_rx,
                freshness_rx,
                timer,
                timer_rx,
                next_due: None,
                up_to_date: false,
                latency: 1,
                inspecting: false,
                resume_requested: false,
                ready_tx: Some(ready_tx),
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
                shutdown_tx,
            },
            ready_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("dispatch engine has started");

        loop {
            tokio::select! {
                Some(msg) = self.requests_rx.recv() => self.handle_request(msg).await,
                Some(event) = self.freshness_rx.recv() => self.handle_freshness_event(event).await,
                Some(_) = self.timer_rx.recv() => self.handle_timer_fired().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        self.timer.cancel();
        tracing::debug!("dispatch engine has shutdown");
        Ok(())
    }

    /// Handle a client request.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_request(&mut self, msg: DispatchCtlMsg) {
        match msg {
            DispatchCtlMsg::Enqueue { time, text, tx } => self.handle_enqueue_request(time, text, tx).await,
        }
    }

    /// Handle an event from the freshness subscriber.
    #[tracing::instrument(level = "trace", skip(self, event))]
    async fn handle_freshness_event(&mut self, event: FreshnessEvent) {
        match event {
            FreshnessEvent::Subscribed => {
                self.up_to_date = false;
                if let Err(err) = self.bootstrap().await {
                    tracing::error!(error = ?err, "error bootstrapping from the queue minimum");
                    // A failed bootstrap is fatal during setup; afterwards only a
                    // reconnect give-up is.
                    if self.ready_tx.is_some() || err.downcast_ref::<ShutdownError>().is_some() {
                        let _res = self.shutdown_tx.send(());
                    }
                }
            }
            FreshnessEvent::Update(next_due) => {
                self.up_to_date = true;
                self.next_due = next_due;
                self.arm_timer();
            }
            FreshnessEvent::Lost => {
                tracing::warn!("freshness subscription lost, queue minimum may be stale");
                self.up_to_date = false;
            }
        }
    }

    /// Query the queue minimum directly, measuring store latency along the way.
    ///
    /// Runs once the freshness subscription is (re)established. The observed minimum only
    /// replaces `next_due` while no published value has arrived in the meantime — the
    /// channel remains the single source of truth once it is flowing.
    async fn bootstrap(&mut self) -> Result<()> {
        let started = Instant::now();
        let min = match self.store.range_min().await {
            Ok(min) => min,
            Err(err) => {
                self.recover_store(&err).await?;
                self.store.range_min().await.context("error querying queue minimum after reconnect")?
            }
        };
        self.latency = (started.elapsed().as_millis() as i64).max(1);

        if !self.up_to_date {
            self.next_due = min.map(|(_, score)| score);
            self.up_to_date = true;
            self.arm_timer();
        }
        if let Some(ready) = self.ready_tx.take() {
            tracing::info!(latency = self.latency, next_due = ?self.next_due, "dispatch engine ready");
            let _res = ready.send(());
        }
        Ok(())
    }

    /// Arm the timer ahead of the known queue minimum, or disarm it for an empty queue.
    fn arm_timer(&mut self) {
        match self.next_due {
            Some(due) => self.timer.trigger(due - LATENCY_QUERY_FACTOR * self.latency),
            None => self.timer.cancel(),
        }
    }

    /// Handle a timer firing by running inspection passes until no resume is requested.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_timer_fired(&mut self) {
        self.timer.acknowledge_fire();
        if self.inspecting {
            self.resume_requested = true;
            return;
        }

        self.inspecting = true;
        let mut res = Ok(());
        loop {
            self.resume_requested = false;
            if let Err(err) = self.run_pass().await {
                res = Err(err);
                break;
            }
            if !self.resume_requested {
                break;
            }
        }
        self.inspecting = false;

        if let Err(err) = res {
            tracing::error!(error = ?err, "error during inspection pass");
            if err.downcast_ref::<ShutdownError>().is_some() {
                let _res = self.shutdown_tx.send(());
            }
        }
    }

    /// Run one inspection pass over the due window.
    ///
    /// Batches are fetched alternately from both ends of the window; when two replicas
    /// drain the same window, one tends to work from the low end while the other works
    /// from the high end, which reduces claim contention.
    async fn run_pass(&mut self) -> Result<()> {
        metrics::counter!(METRIC_INSPECTION_PASSES).increment(1);
        let cutoff = self.next_due.unwrap_or(i64::MIN).max(utils::now_ms());
        tracing::debug!(cutoff, "inspection pass starting");

        let mut reverse = false;
        let mut leftover = false;
        let mut cleanups: Vec<JoinHandle<()>> = Vec::new();
        loop {
            self.drain_pending().await;
            if self.resume_requested {
                return Ok(());
            }

            // Outstanding cleanups must land before the next range query; a re-fetch
            // racing its own cleanup would observe already-emitted entries as leftovers.
            for cleanup in cleanups.drain(..) {
                let _res = cleanup.await;
            }

            let batch = match self.store.range_due(cutoff, reverse, BATCH_SIZE).await {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(error = ?err, "error fetching due messages, rescheduling pass");
                    self.recover_store(&err).await?;
                    self.timer.trigger(utils::now_ms() + PROCESSING_RETRY_DELAY_MS);
                    return Ok(());
                }
            };

            for (id, score) in &batch {
                self.drain_pending().await;
                if self.resume_requested {
                    return Ok(());
                }
                if self.try_dispatch(id, *score, &mut cleanups).await? {
                    metrics::counter!(METRIC_LEFTOVER_MESSAGES).increment(1);
                    leftover = true;
                }
            }

            // A short batch means the window is exhausted. Leftovers are retried once the
            // claims holding them have expired; a cleanly drained window publishes the new
            // queue minimum for the whole fleet.
            if batch.len() < BATCH_SIZE {
                for cleanup in cleanups.drain(..) {
                    let _res = cleanup.await;
                }
                if leftover {
                    self.timer.trigger(utils::now_ms() + PROCESSING_RETRY_DELAY_MS);
                } else if let Err(err) = self.store.republish_min().await {
                    tracing::warn!(error = ?err, "error republishing queue minimum, rescheduling pass");
                    self.recover_store(&err).await?;
                    self.timer.trigger(utils::now_ms() + PROCESSING_RETRY_DELAY_MS);
                }
                tracing::debug!(leftover, "inspection pass complete");
                return Ok(());
            }
            reverse = !reverse;
        }
    }

    /// Attempt to claim, emit and clean up one message.
    ///
    /// Returns true when the message could not be dispatched here and may still be
    /// waiting — a peer holds its claim, or its content is already gone.
    async fn try_dispatch(&mut self, id: &str, score: i64, cleanups: &mut Vec<JoinHandle<()>>) -> Result<bool> {
        match self.store.claim(id).await {
            Ok(true) => (),
            Ok(false) => {
                tracing::debug!(id, "claim already held by a peer");
                return Ok(true);
            }
            Err(err) => {
                tracing::warn!(error = ?err, id, "error claiming message");
                self.recover_store(&err).await?;
                return Ok(true);
            }
        }

        let text = match self.store.fetch_content(id).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::warn!(id, "content missing after claim, message already dispatched by a peer");
                return Ok(true);
            }
            Err(err) => {
                tracing::warn!(error = ?err, id, "error fetching message content");
                self.recover_store(&err).await?;
                return Ok(true);
            }
        };

        // Emission must precede cleanup: a crash in between leaves the queue entry behind
        // under an expiring claim, and the content-missing check above absorbs the residue
        // once a peer finishes the cleanup.
        self.emit(score, &text);
        metrics::counter!(METRIC_MESSAGES_EMITTED).increment(1);

        let (store, id) = (self.store.clone(), id.to_string());
        cleanups.push(tokio::spawn(async move {
            if let Err(err) = store.cleanup(&id).await {
                tracing::error!(error = ?err, %id, "error cleaning up dispatched message");
            }
        }));
        Ok(false)
    }

    /// Write the emission line for a dispatched message to stdout.
    fn emit(&self, score: i64, text: &str) {
        match utils::format_emission(score, utils::now_ms(), text) {
            Ok(line) => println!("{}", line),
            Err(err) => {
                tracing::error!(error = ?err, score, "error formatting emission line");
                println!("[{}] {}", score, text);
            }
        }
    }

    /// Drain pending events without blocking.
    ///
    /// Called at every await boundary of a pass so freshness updates keep flowing,
    /// submissions are not starved by long passes, and timer firings mark the pass for
    /// resumption.
    async fn drain_pending(&mut self) {
        while let Ok(event) = self.freshness_rx.try_recv() {
            self.handle_freshness_event(event).await;
        }
        while self.timer_rx.try_recv().is_ok() {
            self.timer.acknowledge_fire();
            self.resume_requested = true;
        }
        while let Ok(msg) = self.requests_rx.try_recv() {
            self.handle_request(msg).await;
        }
    }

    /// Re-establish the data connection after a transport error.
    ///
    /// Operation errors pass through untouched. A reconnect give-up is fatal: the caller
    /// propagates the `ShutdownError` and the run loop triggers shutdown.
    async fn recover_store(&mut self, err: &StoreError) -> Result<()> {
        if !matches!(err, StoreError::Transport(_)) {
            return Ok(());
        }
        tracing::warn!("store connection lost, attempting to reconnect");
        if let Err(err) = self.store.reconnect().await {
            return Err(ShutdownError(anyhow!("store reconnect failed: {}", err)).into());
        }
        Ok(())
    }
}

/// A message bound for the dispatch engine.
pub enum DispatchCtlMsg {
    /// A client request to enqueue a message for delayed emission.
    Enqueue {
        /// The wall-clock instant in ms at which the message is due.
        time: i64,
        /// The message text to be emitted.
        text: String,
        /// The response channel.
        tx: oneshot::Sender<std::result::Result<String, AppError>>,
    },
}

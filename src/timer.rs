//! Reprogrammable single-shot dispatch timer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::utils;

/// The longest single sleep issued while waiting for a deadline.
///
/// Deadlines further out than this are awaited in chunks, with the wall clock re-read
/// after every chunk, so no platform maximum delay is ever observable and the firing
/// tracks clock adjustments made along the way.
pub(crate) const MAX_SLEEP_CHUNK_MS: i64 = 60 * 60 * 1000;

/// A single-shot timer which fires at an absolute wall-clock instant.
///
/// The timer is reprogrammable and cancelable; firings are delivered on the channel
/// returned from `new` and are consumed by the dispatch engine's run loop.
pub struct DispatchTimer {
    fire_tx: mpsc::Sender<()>,
    armed_at: Option<i64>,
    task: Option<JoinHandle<()>>,
}

impl DispatchTimer {
    /// Create a new unarmed timer along with its firing channel.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (fire_tx, fire_rx) = mpsc::channel(1);
        (
            Self {
                fire_tx,
                armed_at: None,
                task: None,
            },
            fire_rx,
        )
    }

    /// Arm the timer to fire once at the given wall-clock instant in ms.
    ///
    /// Re-arming at the already-armed instant is a no-op; any other instant replaces the
    /// pending firing. Instants at or before the current time fire on the next tick of
    /// the scheduler.
    pub fn trigger(&mut self, at: i64) {
        if self.armed_at == Some(at) {
            return;
        }
        self.cancel();
        self.armed_at = Some(at);
        let fire_tx = self.fire_tx.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(chunk) = next_sleep(utils::now_ms(), at) {
                tokio::time::sleep(chunk).await;
            }
            let _ = fire_tx.send(()).await;
        }));
    }

    /// Disarm the timer, dropping any pending firing.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.armed_at = None;
    }

    /// Clear the armed state once a firing has been received.
    ///
    /// Without this, re-arming at the instant which just fired would be swallowed by the
    /// idempotent no-op in `trigger`.
    pub fn acknowledge_fire(&mut self) {
        self.armed_at = None;
        self.task = None;
    }

    /// The instant the timer is currently armed at, if any.
    pub fn armed_at(&self) -> Option<i64> {
        self.armed_at
    }
}

/// Compute the next bounded sleep toward `at`, or `None` once the deadline is reached.
pub(crate) fn next_sleep(now: i64, at: i64) -> Option<Duration> {
    if now >= at {
        return None;
    }
    Some(Duration::from_millis((at - now).min(MAX_SLEEP_CHUNK_MS) as u64))
}

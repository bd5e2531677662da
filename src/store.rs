//! Store gateway.
//!
//! A thin wrapper around the shared Redis store exposing exactly the operations the
//! dispatch engine needs. The data plane uses a multiplexed async connection owned by the
//! engine task; the freshness subscriber holds its own dedicated connection (see
//! `watchers::freshness`) because a subscribed Redis connection cannot issue data commands.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::utils;

/// The ordered set of pending message IDs scored by due-time in ms.
pub const KEY_QUEUE: &str = "msgq";
/// The key prefix under which message content is stored.
pub const PREFIX_CONTENT: &str = "msg:";
/// The key prefix used for dispatch claims.
pub const PREFIX_LOCK: &str = "lk:";
/// The pub/sub channel carrying the queue's minimum due-time.
pub const CHANNEL_NEXT_DUE: &str = "ndt";

/// The lifetime of a dispatch claim in ms.
pub const PROCESSING_WINDOW_MS: i64 = 1000;

/// The content key for the given message ID.
pub fn content_key(id: &str) -> String {
    format!("{}{}", PREFIX_CONTENT, id)
}

/// The claim key for the given message ID.
pub fn lock_key(id: &str) -> String {
    format!("{}{}", PREFIX_LOCK, id)
}

/// An error returned from a store gateway operation.
///
/// Transport errors indicate the command may never have reached the store; operation
/// errors indicate the store processed the command and rejected it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The connection to the store failed before or during the operation.
    #[error("store connection error: {0}")]
    Transport(#[source] redis::RedisError),
    /// The store rejected the operation.
    #[error("store operation error: {0}")]
    Op(#[source] redis::RedisError),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() {
            Self::Transport(err)
        } else {
            Self::Op(err)
        }
    }
}

/// A result type for store gateway operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The operations the dispatch engine performs against the shared store.
#[async_trait]
pub trait MessageStore: Clone + Send + Sync + 'static {
    /// Fetch the first (id, score) of the queue, if any.
    async fn range_min(&self) -> StoreResult<Option<(String, i64)>>;

    /// Fetch up to `limit` (id, score) entries with score at most `due`.
    ///
    /// Entries are returned in ascending score order, or in descending order from `due`
    /// when `reverse` is set.
    async fn range_due(&self, due: i64, reverse: bool, limit: usize) -> StoreResult<Vec<(String, i64)>>;

    /// Transactionally store a message's content, add its queue entry, and optionally
    /// publish its due-time as the new queue minimum.
    ///
    /// Returns the number of queue members added: `0` indicates the entry already existed
    /// (idempotent re-submission). On an operation error the caller is responsible for
    /// invoking `rollback`.
    async fn write_message(&self, id: &str, text: &str, time: i64, publish_min: bool) -> StoreResult<i64>;

    /// Best-effort removal of the two writes performed by `write_message`.
    async fn rollback(&self, id: &str) -> StoreResult<()>;

    /// Attempt to claim the message for dispatch.
    ///
    /// The claim is a conditional set which only succeeds while no other claim exists,
    /// and expires on its own after `PROCESSING_WINDOW_MS`.
    async fn claim(&self, id: &str) -> StoreResult<bool>;

    /// Fetch the message's content, which is absent once a peer has dispatched it.
    async fn fetch_content(&self, id: &str) -> StoreResult<Option<String>>;

    /// Remove the message's queue entry, content and claim after dispatch.
    async fn cleanup(&self, id: &str) -> StoreResult<()>;

    /// Publish the queue's current minimum due-time under optimistic concurrency.
    ///
    /// If a peer modifies the queue while the minimum is being read, the publish is
    /// silently dropped; the modifying peer owns the responsibility to publish.
    async fn republish_min(&self) -> StoreResult<()>;

    /// Re-establish the data connection after a transport failure.
    async fn reconnect(&self) -> StoreResult<()>;
}

/// The retry policy applied when (re)establishing store connections.
///
/// The first delay is a flat 100 ms; afterwards the delay grows linearly with the total
/// time already spent retrying. The attempt budget widens for connections which have
/// proven themselves before.
pub struct ConnectRetry {
    attempt: u32,
    max_attempts: u32,
    total_delay_ms: u64,
}

impl ConnectRetry {
    /// Create a new policy instance for a connection which has previously been
    /// established `times_connected` times.
    pub fn new(times_connected: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: 3 + times_connected.max(5),
            total_delay_ms: 0,
        }
    }

    /// The delay to apply before the next connection attempt, or `None` once the attempt
    /// budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt > self.max_attempts {
            return None;
        }
        let delay = if self.attempt == 1 {
            100
        } else {
            (self.total_delay_ms / (self.attempt as u64 - 1)).saturating_mul(2)
        };
        self.total_delay_ms += delay;
        Some(Duration::from_millis(delay))
    }
}

/// The Redis-backed store gateway.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: Arc<Mutex<MultiplexedConnection>>,
    times_connected: Arc<AtomicU32>,
}

impl RedisStore {
    /// Establish the data connection and build the gateway.
    pub async fn connect(client: redis::Client) -> Result<Self> {
        let times_connected = Arc::new(AtomicU32::new(0));
        let conn = Self::establish(&client, &times_connected)
            .await
            .context("error establishing store data connection")?;
        Ok(Self {
            client,
            conn: Arc::new(Mutex::new(conn)),
            times_connected,
        })
    }

    /// Establish a data connection, retrying per the connection retry policy.
    async fn establish(client: &redis::Client, times_connected: &AtomicU32) -> StoreResult<MultiplexedConnection> {
        let mut retry = ConnectRetry::new(times_connected.load(Ordering::Relaxed));
        loop {
            match client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    times_connected.fetch_add(1, Ordering::Relaxed);
                    return Ok(conn);
                }
                Err(err) => match retry.next_delay() {
                    Some(delay) => {
                        tracing::warn!(error = ?err, "error connecting to store, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(StoreError::from(err)),
                },
            }
        }
    }

    /// Get a handle to the data connection.
    ///
    /// Clones of a multiplexed connection share the underlying link, so claims taken on
    /// one handle remain visible across all of them.
    async fn conn(&self) -> MultiplexedConnection {
        self.conn.lock().await.clone()
    }
}

#[async_trait]
impl MessageStore for RedisStore {
    async fn range_min(&self) -> StoreResult<Option<(String, i64)>> {
        let mut conn = self.conn().await;
        let entries: Vec<(String, f64)> = conn.zrange_withscores(KEY_QUEUE, 0, 0).await?;
        Ok(entries.into_iter().next().map(|(id, score)| (id, score.round() as i64)))
    }

    async fn range_due(&self, due: i64, reverse: bool, limit: usize) -> StoreResult<Vec<(String, i64)>> {
        let mut conn = self.conn().await;
        let entries: Vec<(String, f64)> = if reverse {
            conn.zrevrangebyscore_limit_withscores(KEY_QUEUE, due, "-inf", 0, limit as isize).await?
        } else {
            conn.zrangebyscore_limit_withscores(KEY_QUEUE, "-inf", due, 0, limit as isize).await?
        };
        Ok(entries.into_iter().map(|(id, score)| (id, score.round() as i64)).collect())
    }

    async fn write_message(&self, id: &str, text: &str, time: i64, publish_min: bool) -> StoreResult<i64> {
        let mut conn = self.conn().await;
        let mut pipe = redis::pipe();
        pipe.atomic().set(content_key(id), text).ignore().zadd(KEY_QUEUE, id, time);
        if publish_min {
            pipe.publish(CHANNEL_NEXT_DUE, utils::number_to_buffer(Some(time as f64))).ignore();
        }
        let (added,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(added)
    }

    async fn rollback(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn().await;
        let mut pipe = redis::pipe();
        pipe.zrem(KEY_QUEUE, id).ignore().del(content_key(id)).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn claim(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await;
        let res: Option<String> = redis::cmd("SET")
            .arg(lock_key(id))
            .arg(1)
            .arg("PX")
            .arg(PROCESSING_WINDOW_MS)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(res.is_some())
    }

    async fn fetch_content(&self, id: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await;
        let text: Option<String> = conn.get(content_key(id)).await?;
        Ok(text)
    }

    async fn cleanup(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn().await;
        let mut pipe = redis::pipe();
        pipe.zrem(KEY_QUEUE, id).ignore().del(content_key(id)).ignore().del(lock_key(id)).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn republish_min(&self) -> StoreResult<()> {
        let mut conn = self.conn().await;
        let _: () = redis::cmd("WATCH").arg(KEY_QUEUE).query_async(&mut conn).await?;
        let entries: Vec<(String, f64)> = match conn.zrange_withscores(KEY_QUEUE, 0, 0).await {
            Ok(entries) => entries,
            Err(err) => {
                let _res: Result<(), redis::RedisError> = redis::cmd("UNWATCH").query_async(&mut conn).await;
                return Err(err.into());
            }
        };
        let payload = utils::number_to_buffer(entries.first().map(|(_, score)| *score));
        let mut pipe = redis::pipe();
        pipe.atomic().publish(CHANNEL_NEXT_DUE, payload);
        let res: Option<(i64,)> = pipe.query_async(&mut conn).await?;
        if res.is_none() {
            tracing::debug!("republish aborted, queue was modified by a peer");
        }
        Ok(())
    }

    async fn reconnect(&self) -> StoreResult<()> {
        let conn = Self::establish(&self.client, &self.times_connected).await?;
        *self.conn.lock().await = conn;
        tracing::info!("store data connection re-established");
        Ok(())
    }
}

//! Shared test fixtures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::store::{MessageStore, StoreError, StoreResult, PROCESSING_WINDOW_MS};
use crate::utils;

/// An in-memory stand-in for the store gateway used by engine tests.
///
/// Beyond the gateway contract it records the order of cleanups and every published
/// minimum, and can be scripted to refuse claims or fail a write mid-transaction.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<MemState>>,
}

#[derive(Default)]
struct MemState {
    queue: HashMap<String, i64>,
    content: HashMap<String, String>,
    locks: HashMap<String, i64>,
    published: Vec<Option<i64>>,
    cleaned: Vec<String>,
    range_flags: Vec<bool>,
    fail_claims: HashSet<String>,
    fail_next_write: bool,
}

impl MemStore {
    /// Seed a message directly into the queue and content keyspace.
    pub fn seed(&self, id: &str, text: &str, time: i64) {
        let mut state = self.inner.lock().unwrap();
        state.queue.insert(id.to_string(), time);
        state.content.insert(id.to_string(), text.to_string());
    }

    /// Script claims for the given ID to fail, as if a peer held its lock.
    pub fn hold_claim(&self, id: &str) {
        self.inner.lock().unwrap().fail_claims.insert(id.to_string());
    }

    /// Script the next `write_message` to fail after its writes have applied.
    pub fn fail_next_write(&self) {
        self.inner.lock().unwrap().fail_next_write = true;
    }

    /// Drop a message's content while leaving its queue entry, as a peer's in-flight
    /// cleanup would.
    pub fn drop_content(&self, id: &str) {
        self.inner.lock().unwrap().content.remove(id);
    }

    /// Plant an already-expired claim, as a peer crashing mid-dispatch would leave behind.
    pub fn seed_expired_lock(&self, id: &str) {
        self.inner.lock().unwrap().locks.insert(id.to_string(), utils::now_ms() - 1);
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().queue.contains_key(id)
    }

    pub fn content_of(&self, id: &str) -> Option<String> {
        self.inner.lock().unwrap().content.get(id).cloned()
    }

    pub fn lock_exists(&self, id: &str) -> bool {
        self.inner.lock().unwrap().locks.contains_key(id)
    }

    /// Every minimum published so far, in publish order.
    pub fn published(&self) -> Vec<Option<i64>> {
        self.inner.lock().unwrap().published.clone()
    }

    /// Every cleaned-up ID so far, in cleanup order.
    pub fn cleaned(&self) -> Vec<String> {
        self.inner.lock().unwrap().cleaned.clone()
    }

    /// The `reverse` flag of every range query so far, in query order.
    pub fn range_requests(&self) -> Vec<bool> {
        self.inner.lock().unwrap().range_flags.clone()
    }

    fn min_entry(state: &MemState) -> Option<(String, i64)> {
        let mut entries: Vec<(String, i64)> = state.queue.iter().map(|(id, score)| (id.clone(), *score)).collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries.into_iter().next()
    }
}

fn op_error(msg: &'static str) -> StoreError {
    StoreError::Op(redis::RedisError::from((redis::ErrorKind::ResponseError, msg)))
}

#[async_trait]
impl MessageStore for MemStore {
    async fn range_min(&self) -> StoreResult<Option<(String, i64)>> {
        let state = self.inner.lock().unwrap();
        Ok(Self::min_entry(&state))
    }

    async fn range_due(&self, due: i64, reverse: bool, limit: usize) -> StoreResult<Vec<(String, i64)>> {
        let mut state = self.inner.lock().unwrap();
        state.range_flags.push(reverse);
        let mut entries: Vec<(String, i64)> = state
            .queue
            .iter()
            .filter(|(_, score)| **score <= due)
            .map(|(id, score)| (id.clone(), *score))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        if reverse {
            entries.reverse();
        }
        entries.truncate(limit);
        Ok(entries)
    }

    async fn write_message(&self, id: &str, text: &str, time: i64, publish_min: bool) -> StoreResult<i64> {
        let mut state = self.inner.lock().unwrap();
        state.content.insert(id.to_string(), text.to_string());
        let added = if state.queue.contains_key(id) {
            0
        } else {
            state.queue.insert(id.to_string(), time);
            1
        };
        if state.fail_next_write {
            state.fail_next_write = false;
            return Err(op_error("scripted write failure"));
        }
        if publish_min {
            state.published.push(Some(time));
        }
        Ok(added)
    }

    async fn rollback(&self, id: &str) -> StoreResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.queue.remove(id);
        state.content.remove(id);
        Ok(())
    }

    async fn claim(&self, id: &str) -> StoreResult<bool> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_claims.contains(id) {
            return Ok(false);
        }
        let now = utils::now_ms();
        if state.locks.get(id).is_some_and(|expiry| *expiry > now) {
            return Ok(false);
        }
        state.locks.insert(id.to_string(), now + PROCESSING_WINDOW_MS);
        Ok(true)
    }

    async fn fetch_content(&self, id: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().unwrap().content.get(id).cloned())
    }

    async fn cleanup(&self, id: &str) -> StoreResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.queue.remove(id);
        state.content.remove(id);
        state.locks.remove(id);
        state.cleaned.push(id.to_string());
        Ok(())
    }

    async fn republish_min(&self) -> StoreResult<()> {
        let mut state = self.inner.lock().unwrap();
        let min = Self::min_entry(&state).map(|(_, score)| score);
        state.published.push(min);
        Ok(())
    }

    async fn reconnect(&self) -> StoreResult<()> {
        Ok(())
    }
}

//! Long-lived watcher tasks feeding the dispatch engine.

mod freshness;

pub use freshness::{FreshnessEvent, FreshnessWatcher};

//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port which client network traffic is to use.
    pub client_port: u16,
    /// The port which prometheus scrape traffic is to use.
    pub metrics_port: u16,

    /// The connection URL of the shared store.
    ///
    /// Both the data connection and the dedicated freshness subscriber connection are
    /// established against this URL.
    #[serde(default = "default_store_url")]
    pub redis_url: String,
    /// The maximum accepted size of a submitted message's text in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

/// The default store connection URL.
pub fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

/// The default bound on submitted message text.
fn default_max_message_bytes() -> usize {
    64 * 1024
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            rust_log: "".into(),
            client_port: 7000,
            metrics_port: 7002,
            redis_url: default_store_url(),
            max_message_bytes: 64 * 1024,
        })
    }
}

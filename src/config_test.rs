use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CLIENT_PORT".into(), "7000".into()),
        ("METRICS_PORT".into(), "7002".into()),
        ("REDIS_URL".into(), "redis://store.internal:6379/".into()),
        ("MAX_MESSAGE_BYTES".into(), "1024".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.client_port == 7000, "unexpected value parsed for CLIENT_PORT, got {}, expected {}", config.client_port, "7000");
    assert!(config.metrics_port == 7002, "unexpected value parsed for METRICS_PORT, got {}, expected {}", config.metrics_port, "7002");
    assert!(
        config.redis_url == "redis://store.internal:6379/",
        "unexpected value parsed for REDIS_URL, got {}, expected {}",
        config.redis_url,
        "redis://store.internal:6379/"
    );
    assert!(
        config.max_message_bytes == 1024,
        "unexpected value parsed for MAX_MESSAGE_BYTES, got {}, expected {}",
        config.max_message_bytes,
        1024
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CLIENT_PORT".into(), "7000".into()),
        ("METRICS_PORT".into(), "7002".into()),
    ])?;

    assert!(
        config.redis_url == "redis://127.0.0.1:6379/",
        "unexpected default for REDIS_URL, got {}, expected {}",
        config.redis_url,
        "redis://127.0.0.1:6379/"
    );
    assert!(
        config.max_message_bytes == 64 * 1024,
        "unexpected default for MAX_MESSAGE_BYTES, got {}, expected {}",
        config.max_message_bytes,
        64 * 1024
    );

    Ok(())
}

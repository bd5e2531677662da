//! Shared helpers for clocks, identifiers and wire encoding.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha1::{Digest, Sha1};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Current wall-clock time as integer milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Derive the deterministic message ID for a `(time, text)` pair.
///
/// The ID is the base-64 encoding (padding stripped, 27 chars) of the SHA-1 of the 8-byte
/// float encoding of the due-time followed by the raw text bytes. Identical submissions
/// therefore map onto the same ID, which makes retries and duplicate submissions
/// side-effect-free.
pub fn message_id(time: i64, text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(number_to_buffer(Some(time as f64)));
    hasher.update(text.as_bytes());
    STANDARD_NO_PAD.encode(hasher.finalize())
}

/// Encode an optional due-time as a freshness channel payload.
///
/// The payload is the 8-byte host-endian encoding of the due-time as a 64-bit float, or an
/// empty buffer denoting "queue empty". Host endianness is valid only while all replicas
/// share it; a heterogeneous fleet must switch this pair of functions to a fixed encoding.
pub fn number_to_buffer(value: Option<f64>) -> Vec<u8> {
    match value {
        Some(value) => value.to_ne_bytes().to_vec(),
        None => Vec::new(),
    }
}

/// Decode a freshness channel payload.
///
/// See `number_to_buffer` for the encoding. Any length other than 0 or 8 is malformed.
pub fn buffer_to_number(buf: &[u8]) -> Result<Option<f64>> {
    match buf {
        [] => Ok(None),
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(Some(f64::from_ne_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7]))),
        _ => bail!("invalid freshness payload, expected 0 or 8 bytes got {}", buf.len()),
    }
}

/// Format the single stdout line emitted for a dispatched message.
///
/// The line carries the due-time as RFC 3339 UTC and the signed delta between emission
/// and due-time in milliseconds.
pub fn format_emission(score: i64, now: i64, text: &str) -> Result<String> {
    let due = OffsetDateTime::from_unix_timestamp_nanos(score as i128 * 1_000_000).context("due-time outside the representable range")?;
    let stamp = due.format(&Rfc3339).context("error formatting due-time")?;
    Ok(format!("[{}] ({:+} ms) {}", stamp, now - score, text))
}

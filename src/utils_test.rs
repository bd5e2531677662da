use anyhow::Result;

use crate::utils;

#[test]
fn message_id_is_deterministic_and_padless() {
    let id0 = utils::message_id(1_700_000_000_000, "hello");
    let id1 = utils::message_id(1_700_000_000_000, "hello");

    assert_eq!(id0, id1, "expected identical submissions to derive the same id, got {} and {}", id0, id1);
    assert_eq!(id0.len(), 27, "expected a 27 char id, got {} with len {}", id0, id0.len());
    assert!(!id0.contains('='), "expected base64 padding to be stripped, got {}", id0);
}

#[test]
fn message_id_varies_with_time_and_text() {
    let base = utils::message_id(1_700_000_000_000, "hello");
    let other_time = utils::message_id(1_700_000_000_001, "hello");
    let other_text = utils::message_id(1_700_000_000_000, "hello!");

    assert_ne!(base, other_time, "expected differing due-times to derive differing ids");
    assert_ne!(base, other_text, "expected differing texts to derive differing ids");
}

#[test]
fn freshness_payload_round_trips() -> Result<()> {
    let encoded = utils::number_to_buffer(Some(1_700_000_000_000.0));
    assert_eq!(encoded.len(), 8, "expected an 8 byte payload, got {}", encoded.len());
    let decoded = utils::buffer_to_number(&encoded)?;
    assert_eq!(decoded, Some(1_700_000_000_000.0), "expected payload to round-trip, got {:?}", decoded);

    let empty = utils::number_to_buffer(None);
    assert!(empty.is_empty(), "expected the empty payload to have no bytes, got {}", empty.len());
    let decoded = utils::buffer_to_number(&empty)?;
    assert_eq!(decoded, None, "expected the empty payload to decode as none, got {:?}", decoded);

    Ok(())
}

#[test]
fn freshness_payload_rejects_malformed_lengths() {
    let res = utils::buffer_to_number(&[0u8; 3]);
    assert!(res.is_err(), "expected a 3 byte payload to be rejected, got {:?}", res);
    let res = utils::buffer_to_number(&[0u8; 9]);
    assert!(res.is_err(), "expected a 9 byte payload to be rejected, got {:?}", res);
}

#[test]
fn emission_line_formats_timestamp_and_delta() -> Result<()> {
    let line = utils::format_emission(0, 12, "hello")?;
    assert_eq!(
        line, "[1970-01-01T00:00:00Z] (+12 ms) hello",
        "unexpected emission line, got {}",
        line
    );

    let line = utils::format_emission(60_000, 59_995, "early")?;
    assert_eq!(
        line, "[1970-01-01T00:01:00Z] (-5 ms) early",
        "unexpected emission line for an early dispatch, got {}",
        line
    );

    Ok(())
}

use hmi_telemetry::{hex, metrics, new_cycle_id, record_decode_error, record_frame_sent};

#[test]
fn cycle_id_non_empty() {
    let first = new_cycle_id();
    let second = new_cycle_id();
    assert!(!first.is_empty());
    assert_ne!(first, second);
}

#[test]
fn counters_are_monotonic() {
    let before = metrics().snapshot();
    record_frame_sent();
    record_decode_error();
    let after = metrics().snapshot();
    assert!(after.frames_sent > before.frames_sent);
    assert!(after.decode_errors > before.decode_errors);
}

#[test]
fn hex_formats_frames() {
    assert_eq!(hex(&[0x01, 0x03, 0xC5]), "0103C5");
    assert_eq!(hex(&[]), "");
}

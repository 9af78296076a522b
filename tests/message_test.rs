//! Envelope parsing and validation tests
//!
//! Run with: cargo test --test message_test

use parlor::net::message::{
    validate_candidate, validate_channel_name, validate_password, validate_sdp,
    validate_username, ClientMessage, OfferPayload, ServerMessage,
};
use parlor::net::types::ErrorCode;

// =============================================================================
// ENVELOPE PARSING
// =============================================================================

#[test]
fn test_parse_create() {
    let msg = ClientMessage::parse(
        r#"{"type":"create","payload":{"username":"a","channelName":"Lobby","password":"secret1"}}"#,
    )
    .expect("parse");
    match msg {
        ClientMessage::Create(p) => {
            assert_eq!(p.username, "a");
            assert_eq!(p.channel_name, "Lobby");
            assert_eq!(p.password, "secret1");
        }
        other => panic!("wrong variant: {}", other.command()),
    }
}

#[test]
fn test_parse_payloadless_types() {
    assert!(matches!(
        ClientMessage::parse(r#"{"type":"move-to-main"}"#),
        Ok(ClientMessage::MoveToMain)
    ));
    assert!(matches!(
        ClientMessage::parse(r#"{"type":"leave"}"#),
        Ok(ClientMessage::Leave)
    ));
}

#[test]
fn test_parse_candidate_with_null_mline() {
    let msg = ClientMessage::parse(
        r#"{"type":"candidate","payload":{"candidate":"candidate:1 1 udp 1 1.2.3.4 5 typ host","sdpMid":"0","sdpMLineIndex":null,"seq":2,"epoch":1}}"#,
    )
    .expect("parse");
    match msg {
        ClientMessage::Candidate(p) => {
            assert_eq!(p.sdp_mline_index, None);
            assert_eq!(p.seq, 2);
            assert_eq!(p.epoch, 1);
        }
        other => panic!("wrong variant: {}", other.command()),
    }
}

#[test]
fn test_unknown_type_is_invalid_message() {
    let err = ClientMessage::parse(r#"{"type":"bogus","payload":{}}"#).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidMessage);
}

#[test]
fn test_malformed_json_is_invalid_message() {
    let err = ClientMessage::parse("{nope").unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidMessage);
}

#[test]
fn test_answer_requires_epoch_and_seq() {
    // The epoch/seq tags are mandatory; legacy untagged answers are rejected.
    let err = ClientMessage::parse(r#"{"type":"answer","payload":{"sdp":"v=0"}}"#).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidMessage);
}

// =============================================================================
// SERVER ENVELOPE SHAPE
// =============================================================================

#[test]
fn test_server_message_envelope_shape() {
    let msg = ServerMessage::Offer(OfferPayload {
        sdp: "v=0".into(),
        reset: true,
        seq: 1,
        epoch: 3,
    });
    let value = serde_json::to_value(&msg).expect("encode");
    assert_eq!(value["type"], "offer");
    assert_eq!(value["payload"]["sdp"], "v=0");
    assert_eq!(value["payload"]["reset"], true);
    assert_eq!(value["payload"]["seq"], 1);
    assert_eq!(value["payload"]["epoch"], 3);
}

// =============================================================================
// INPUT VALIDATION
// =============================================================================

#[test]
fn test_username_bounds() {
    assert_eq!(validate_username("  ada  ").expect("trimmed"), "ada");
    assert!(validate_username("").is_err());
    assert!(validate_username("   ").is_err());
    assert!(validate_username(&"x".repeat(25)).is_err());
    assert!(validate_username(&"x".repeat(24)).is_ok());
}

#[test]
fn test_channel_name_charset() {
    assert!(validate_channel_name("War Room-1").is_ok());
    assert!(validate_channel_name("bad#name").is_err());
    assert!(validate_channel_name("ünïcode").is_err());
    assert!(validate_channel_name(&"y".repeat(31)).is_err());
}

#[test]
fn test_password_bounds() {
    assert!(validate_password("short").is_err());
    assert!(validate_password("secret1").is_ok());
    assert!(validate_password(&"p".repeat(65)).is_err());
}

#[test]
fn test_sdp_and_candidate_bounds() {
    assert!(validate_sdp(&"v".repeat(100_000)).is_ok());
    assert!(validate_sdp(&"v".repeat(100_001)).is_err());
    assert!(validate_candidate(&"c".repeat(2_000)).is_ok());
    assert!(validate_candidate(&"c".repeat(2_001)).is_err());
}

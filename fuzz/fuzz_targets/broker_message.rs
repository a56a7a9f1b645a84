//! Fuzz target for broker message decoding
//!
//! Tests that the frame decoder and the negotiation payload parsers handle
//! arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::BrokerMessage;

fuzz_target!(|data: &[u8]| {
    // The decoder should never panic, only return Ok or Err
    let Ok(msg) = BrokerMessage::from_bytes(data) else {
        return;
    };

    // Whatever decodes must encode again
    let encoded = msg.to_bytes().expect("decoded message re-encodes");
    assert_eq!(BrokerMessage::from_bytes(&encoded).ok(), Some(msg.clone()));

    if let BrokerMessage::WebRtcNegotiation(negotiation) = msg {
        let _ = negotiation.parse_session();
        let _ = negotiation.parse_candidate();
    }
});

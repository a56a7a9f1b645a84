//! Fuzz test for ICE candidate line parsing
//!
//! Tests that arbitrary candidate lines don't cause panics when inspected.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::IceCandidate;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let candidate = IceCandidate::new(s);
        let _ = candidate.candidate_type();
        let _ = candidate.port();
        let _ = candidate.related_port();

        // Reflexive candidates always carry a type
        if candidate.is_server_reflexive() {
            assert_eq!(candidate.candidate_type(), Some("srflx"));
        }
    }
});

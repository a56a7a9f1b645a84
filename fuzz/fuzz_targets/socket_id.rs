//! Fuzz test for socket id parsing
//!
//! Tests that arbitrary input doesn't cause panics when split into an alias
//! prefix, and that formatted ids always split back into their alias.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::{SOCKET_ID_SEPARATOR, alias_prefix, socket_id};

fuzz_target!(|data: (&str, u64)| {
    let (raw, counter) = data;

    let prefix = alias_prefix(raw);
    assert!(raw.starts_with(prefix));
    assert!(!prefix.contains(SOCKET_ID_SEPARATOR));

    if !raw.contains(SOCKET_ID_SEPARATOR) {
        let id = socket_id(raw, counter);
        assert_eq!(alias_prefix(&id), raw);
    }
});

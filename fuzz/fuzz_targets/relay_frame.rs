//! Fuzz target for relay frame handling
//!
//! Feeds arbitrary frames to a relay holding two connections and checks that
//! routing never panics and that nothing is delivered on behalf of an alias
//! the frame did not arrive on.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::{BrokerMessage, alias_prefix};
use parley_relay::{Relay, RelayConfig};
use std::time::Duration;

fuzz_target!(|data: &[u8]| {
    let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    else {
        return;
    };
    let _guard = runtime.enter();

    let relay = Relay::with_config(RelayConfig {
        welcome_delay: Duration::from_secs(3600),
        ..RelayConfig::default()
    });
    let (Ok(a), Ok(mut b)) = (relay.accept(), relay.accept()) else {
        return;
    };

    let _ = relay.handle_frame(&a.alias, data);

    while let Ok(frame) = b.outbound.try_recv() {
        if let Ok(BrokerMessage::WebRtcNegotiation(msg)) = BrokerMessage::from_bytes(&frame) {
            assert_eq!(alias_prefix(&msg.sender), a.alias);
        }
    }
});

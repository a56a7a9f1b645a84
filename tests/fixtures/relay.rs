//! Relay test fixture for integration testing
//!
//! Runs a relay on an ephemeral localhost port and hands out clients
//! connected to it: raw protocol clients for routing tests and full
//! [`RemoteBroker`]s sharing one loopback network for negotiation tests.
//!
//! # Example
//!
//! ```no_run
//! use parley_integration_tests::fixtures::RelayFixture;
//!
//! #[tokio::test]
//! async fn test_listing() {
//!     let fixture = RelayFixture::start().await;
//!     let host = fixture.broker().await;
//!     // ... listen, list, connect ...
//!     fixture.shutdown().await;
//! }
//! ```

use crate::test_helpers::{RawClient, ci_timeout};
use parley_broker::loopback::{LoopbackFactory, LoopbackNetwork, LoopbackOptions};
use parley_broker::{BrokerConfig, RemoteBroker};
use parley_relay::{Relay, RelayConfig, RelayServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A running relay
pub struct RelayFixture {
    addr: SocketAddr,
    relay: Arc<Relay>,
    network: Arc<LoopbackNetwork>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RelayFixture {
    /// Start a relay with a short welcome delay
    ///
    /// # Panics
    ///
    /// Panics if no localhost port can be bound.
    pub async fn start() -> Self {
        Self::start_with_config(RelayConfig {
            welcome_delay: Duration::from_millis(1),
            ..RelayConfig::default()
        })
        .await
    }

    /// Start a relay with a custom configuration
    ///
    /// # Panics
    ///
    /// Panics if no localhost port can be bound.
    pub async fn start_with_config(config: RelayConfig) -> Self {
        let server = RelayServer::bind_with_config("127.0.0.1:0".parse().unwrap(), config)
            .await
            .expect("bind relay");
        let addr = server.local_addr().expect("relay address");
        let relay = server.relay();

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = server
                .run_until(async {
                    let _ = signal.await;
                })
                .await;
        });

        Self {
            addr,
            relay,
            network: Arc::new(LoopbackNetwork::default()),
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// WebSocket URL of the relay
    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Listening address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The relay engine, for registry assertions
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// A raw protocol client, already welcomed
    pub async fn raw_client(&self) -> RawClient {
        RawClient::connect(&self.url()).await
    }

    /// An identified broker with default configuration
    pub async fn broker(&self) -> RemoteBroker {
        self.broker_with_config(BrokerConfig::default()).await
    }

    /// An identified broker whose transports join the fixture's loopback network
    ///
    /// # Panics
    ///
    /// Panics if the broker cannot connect or is not welcomed in time.
    pub async fn broker_with_config(&self, config: BrokerConfig) -> RemoteBroker {
        self.broker_with_options(config, LoopbackOptions::default())
            .await
    }

    /// Like [`Self::broker_with_config`] with custom loopback behaviour
    ///
    /// # Panics
    ///
    /// Panics if the broker cannot connect or is not welcomed in time.
    pub async fn broker_with_options(
        &self,
        config: BrokerConfig,
        options: LoopbackOptions,
    ) -> RemoteBroker {
        let factory = Arc::new(LoopbackFactory::on_network(Arc::clone(&self.network), options));
        let remote = RemoteBroker::connect(&self.url(), factory, config)
            .await
            .expect("broker connect");
        tokio::time::timeout(ci_timeout(Duration::from_secs(2)), remote.broker().wait_identified())
            .await
            .expect("welcome timed out")
            .expect("welcome");
        remote
    }

    /// Wait until the relay's registry satisfies `condition`
    ///
    /// # Panics
    ///
    /// Panics if the condition does not hold in time.
    pub async fn wait_until(&self, condition: impl Fn(&Relay) -> bool) {
        let deadline = tokio::time::Instant::now() + ci_timeout(Duration::from_secs(2));
        while !condition(&self.relay) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "relay condition not reached"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop the relay
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
    }
}

impl Drop for RelayFixture {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

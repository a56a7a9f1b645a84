//! Helpers shared by the unit tests.

use crate::broker::{Broker, BrokerConfig, ListenOptions};
use crate::link::ChannelLink;
use crate::loopback::{LoopbackFactory, LoopbackNetwork, LoopbackOptions};
use crate::socket::RtcSocket;
use crate::transport::TransportFactory;
use parley_proto::BrokerMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Broker on a channel link with a fresh loopback factory
pub(crate) fn broker_with_link(
    config: BrokerConfig,
) -> (Broker, mpsc::UnboundedReceiver<BrokerMessage>) {
    let (link, rx) = ChannelLink::new();
    (Broker::new(link, Arc::new(LoopbackFactory::new()), config), rx)
}

/// Broker already identified as `alias`
pub(crate) fn welcomed_broker(
    alias: &str,
    config: BrokerConfig,
) -> (Broker, mpsc::UnboundedReceiver<BrokerMessage>) {
    welcomed_broker_with_factory(alias, Arc::new(LoopbackFactory::new()), config)
}

pub(crate) fn welcomed_broker_with_factory(
    alias: &str,
    factory: Arc<dyn TransportFactory>,
    config: BrokerConfig,
) -> (Broker, mpsc::UnboundedReceiver<BrokerMessage>) {
    let (link, rx) = ChannelLink::new();
    let broker = Broker::new(link, factory, config);
    broker.handle_message(BrokerMessage::Welcome {
        alias: alias.to_string(),
    });
    (broker, rx)
}

/// Next outbound message; panics after a generous timeout
pub(crate) async fn recv(rx: &mut mpsc::UnboundedReceiver<BrokerMessage>) -> BrokerMessage {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a broker message")
        .expect("link closed")
}

/// Carry `from`'s outbound messages to `to`, answering relay-side requests
/// the way a relay would
async fn pump(mut rx: mpsc::UnboundedReceiver<BrokerMessage>, from: Broker, to: Broker) {
    while let Some(msg) = rx.recv().await {
        match msg {
            BrokerMessage::CreateServerRequest { alias, .. } => {
                from.handle_message(BrokerMessage::CreateServerResponse { alias });
            }
            BrokerMessage::ServerListRequest { .. } => {
                from.handle_message(BrokerMessage::ServerListResponse {
                    servers: Vec::new(),
                });
            }
            BrokerMessage::Ping => from.handle_message(BrokerMessage::Pong),
            other => to.handle_message(other),
        }
    }
}

/// Two identified brokers (`PCLIENT`, `PSERVER`) wired back to back
pub(crate) async fn direct_pair(
    client_factory: Arc<dyn TransportFactory>,
    server_factory: Arc<dyn TransportFactory>,
    client_config: BrokerConfig,
    server_config: BrokerConfig,
) -> (Broker, Broker) {
    let (client, client_rx) =
        welcomed_broker_with_factory("PCLIENT", client_factory, client_config);
    let (server, server_rx) =
        welcomed_broker_with_factory("PSERVER", server_factory, server_config);

    tokio::spawn(pump(client_rx, client.clone(), server.clone()));
    tokio::spawn(pump(server_rx, server.clone(), client.clone()));
    (client, server)
}

/// Listen on `server`, collecting every accepted socket
pub(crate) async fn accept_connections(server: &Broker) -> mpsc::UnboundedReceiver<RtcSocket> {
    let (tx, rx) = mpsc::unbounded_channel();
    server
        .listen(ListenOptions::default(), move |socket| {
            let _ = tx.send(socket);
        })
        .await
        .expect("listen");
    rx
}

/// Both ends of an open sub-connection
pub(crate) struct ConnectedPair {
    pub client: RtcSocket,
    pub server: RtcSocket,
    pub _accepted: mpsc::UnboundedReceiver<RtcSocket>,
}

pub(crate) async fn connected_pair(
    client_config: BrokerConfig,
    server_config: BrokerConfig,
) -> ConnectedPair {
    let network = Arc::new(LoopbackNetwork::default());
    let factory = |network: &Arc<LoopbackNetwork>| {
        Arc::new(LoopbackFactory::on_network(
            Arc::clone(network),
            LoopbackOptions::default(),
        ))
    };
    let (client_broker, server_broker) = direct_pair(
        factory(&network),
        factory(&network),
        client_config,
        server_config,
    )
    .await;

    let mut accepted = accept_connections(&server_broker).await;
    let client = client_broker.connect("PSERVER").await.expect("connect");
    let server = tokio::time::timeout(Duration::from_secs(10), accepted.recv())
        .await
        .expect("no connection accepted")
        .expect("listener gone");

    tokio::time::timeout(Duration::from_secs(10), async {
        client.wait_connected().await.expect("client connect");
        server.wait_connected().await.expect("server connect");
    })
    .await
    .expect("sockets did not open");

    ConnectedPair {
        client,
        server,
        _accepted: accepted,
    }
}

//! Broker connected to a relay over a WebSocket.

use crate::broker::{Broker, BrokerConfig};
use crate::error::{BrokerError, Result};
use crate::link::BrokerLink;
use crate::transport::TransportFactory;
use futures::{SinkExt, StreamExt};
use parley_proto::BrokerMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Link writing encoded frames to a WebSocket writer task
#[derive(Debug)]
struct WsLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    open: AtomicBool,
}

impl WsLink {
    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl BrokerLink for WsLink {
    fn send(&self, msg: &BrokerMessage) -> Result<()> {
        if !self.is_open() {
            return Err(BrokerError::Disconnected);
        }
        let bytes = msg.to_bytes()?;
        self.tx.send(bytes).map_err(|_| BrokerError::Disconnected)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}

/// A [`Broker`] driven by a WebSocket connection to a relay
///
/// Inbound binary frames are decoded into the broker; closing the socket
/// fails every pending request. A background probe pings the relay every
/// [`BrokerConfig::ping_interval`] and records the round-trip time.
///
/// # Examples
///
/// ```no_run
/// use parley_broker::{BrokerConfig, RemoteBroker, loopback::LoopbackFactory};
/// use std::sync::Arc;
///
/// # async fn example() -> parley_broker::Result<()> {
/// let remote = RemoteBroker::connect(
///     "ws://127.0.0.1:8080/",
///     Arc::new(LoopbackFactory::new()),
///     BrokerConfig::default(),
/// )
/// .await?;
/// let alias = remote.broker().wait_identified().await?;
/// println!("identified as {alias}");
/// # Ok(())
/// # }
/// ```
pub struct RemoteBroker {
    broker: Broker,
    link: Arc<WsLink>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RemoteBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBroker")
            .field("broker", &self.broker)
            .field("open", &self.link.is_open())
            .finish_non_exhaustive()
    }
}

impl RemoteBroker {
    /// Connect to the relay at `url`
    ///
    /// Returns once the WebSocket is established; the relay assigns an alias
    /// shortly after, see [`Broker::wait_identified`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Link`] if the WebSocket handshake fails.
    pub async fn connect(
        url: &str,
        factory: Arc<dyn TransportFactory>,
        config: BrokerConfig,
    ) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| BrokerError::Link(format!("Failed to connect to {url}: {e}").into()))?;
        let (mut sink, mut stream) = ws.split();
        tracing::info!(%url, "Connected to relay");

        let ping_interval = config.ping_interval;
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let link = Arc::new(WsLink {
            tx,
            open: AtomicBool::new(true),
        });
        let broker = Broker::new(link.clone(), factory, config);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    tracing::warn!("Relay write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn({
            let broker = broker.clone();
            let link = Arc::clone(&link);
            async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Binary(bytes)) => match BrokerMessage::from_bytes(&bytes) {
                            Ok(msg) => broker.handle_message(msg),
                            Err(e) => tracing::warn!("Dropping undecodable relay frame: {e}"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("Relay read failed: {e}");
                            break;
                        }
                    }
                }
                link.mark_closed();
                broker.link_closed();
            }
        });

        let pinger = tokio::spawn(ping_loop(broker.clone(), Arc::clone(&link), ping_interval));

        Ok(Self {
            broker,
            link,
            tasks: vec![writer, reader, pinger],
        })
    }

    /// The protocol engine
    #[must_use]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Most recent relay round-trip time
    #[must_use]
    pub fn last_rtt(&self) -> Option<Duration> {
        self.broker.last_rtt()
    }

    /// Whether the WebSocket is still open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    /// Close the WebSocket and fail pending requests
    pub fn close(&mut self) {
        self.link.mark_closed();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.broker.link_closed();
    }
}

impl Drop for RemoteBroker {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn ping_loop(broker: Broker, link: Arc<WsLink>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if !link.is_open() {
            break;
        }
        match tokio::time::timeout(period, broker.ping()).await {
            Ok(Ok(rtt)) => tracing::trace!(?rtt, "Relay ping"),
            Ok(Err(BrokerError::Disconnected)) => break,
            Ok(Err(e)) => tracing::debug!("Relay ping failed: {e}"),
            Err(_) => tracing::debug!("Relay ping timed out"),
        }
    }
}

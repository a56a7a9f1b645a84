//! Broker protocol engine.
//!
//! A [`Broker`] owns the alias the relay assigned to its connection and the
//! counter used to mint socket ids. It turns inbound relay messages into
//! state changes and completes the pending requests waiting on them.
//!
//! # State machine
//!
//! ```text
//! Unidentified ──Welcome──▶ Identified ──CreateServerResponse──▶ Listening
//! ```
//!
//! Transitions are monotonic. Every request fails with
//! [`BrokerError::NotIdentified`] until `Welcome` has arrived.

use crate::error::{BrokerError, Result};
use crate::link::BrokerLink;
use crate::policy::GatheringPolicy;
use crate::socket::RtcSocket;
use crate::transport::{RtcConfig, TransportFactory};
use parley_proto::{
    BrokerMessage, IceCandidate, ProtoError, ServerData, SessionDescription, WebRtcMessage,
    socket_id,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Default time `connect` waits for a syn-ack
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default time a negotiation waits for candidate gathering to complete
pub const DEFAULT_GATHERING_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default relay ping interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Default time an accepted socket is kept alive while it negotiates
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Application protocol tag advertised by `listen` and sent with list requests
    pub protocol: Option<String>,
    /// How long `connect` waits for the host's syn-ack
    pub connect_timeout: Duration,
    /// Bound on `listen`, `request_server_list` and `ping`. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// How long a negotiation waits for complete gathering before sending
    /// what it has and switching the shared policy to streaming
    pub gathering_timeout: Duration,
    /// Interval of the relay latency probe
    pub ping_interval: Duration,
    /// How long a socket accepted by `listen` is held open by the broker
    /// while it negotiates. It is closed if it has not connected by then.
    pub accept_timeout: Duration,
    /// Configuration handed to the transport factory
    pub rtc: RtcConfig,
    /// Shared gathering policy
    pub policy: GatheringPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            protocol: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
            gathering_timeout: DEFAULT_GATHERING_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            rtc: RtcConfig::default_stun(),
            policy: GatheringPolicy::new(),
        }
    }
}

/// Host options for [`Broker::listen`]
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Server name, defaults to `"<alias> server"`
    pub name: Option<String>,
    /// Application metadata, JSON-encoded on the wire
    pub meta: Option<serde_json::Value>,
}

/// Lifecycle of a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerState {
    /// Waiting for `Welcome`
    #[default]
    Unidentified,
    /// Alias assigned
    Identified,
    /// Registered as a host
    Listening,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Identity {
    Pending,
    Assigned(String),
    LinkClosed,
}

type ConnectionHandler = Arc<dyn Fn(RtcSocket) + Send + Sync>;

#[derive(Default)]
struct Shared {
    state: BrokerState,
    on_connection: Option<ConnectionHandler>,
    listen_waiter: Option<oneshot::Sender<()>>,
    list_waiters: VecDeque<oneshot::Sender<Vec<ServerData>>>,
    ping_waiters: VecDeque<(Instant, oneshot::Sender<Duration>)>,
    connect_waiters: HashMap<String, oneshot::Sender<String>>,
    negotiation_subs: Vec<mpsc::UnboundedSender<WebRtcMessage>>,
    last_server_list: Option<Vec<ServerData>>,
    last_rtt: Option<Duration>,
}

struct Inner {
    config: BrokerConfig,
    link: Arc<dyn BrokerLink>,
    factory: Arc<dyn TransportFactory>,
    identity: watch::Sender<Identity>,
    socket_count: AtomicU64,
    shared: Mutex<Shared>,
}

/// Client side of the relay protocol
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("alias", &self.alias())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Create a broker sending through `link` and building peer transports
    /// with `factory`
    #[must_use]
    pub fn new(
        link: Arc<dyn BrokerLink>,
        factory: Arc<dyn TransportFactory>,
        config: BrokerConfig,
    ) -> Self {
        let (identity, _) = watch::channel(Identity::Pending);
        Self {
            inner: Arc::new(Inner {
                config,
                link,
                factory,
                identity,
                socket_count: AtomicU64::new(0),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ============ Accessors ============

    /// Broker configuration
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Shared gathering policy
    #[must_use]
    pub fn policy(&self) -> &GatheringPolicy {
        &self.inner.config.policy
    }

    pub(crate) fn factory(&self) -> &Arc<dyn TransportFactory> {
        &self.inner.factory
    }

    /// Alias assigned by the relay, once identified
    #[must_use]
    pub fn alias(&self) -> Option<String> {
        match &*self.inner.identity.borrow() {
            Identity::Assigned(alias) => Some(alias.clone()),
            Identity::Pending | Identity::LinkClosed => None,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> BrokerState {
        self.lock().state
    }

    /// Whether the relay assigned an alias and the link is still open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.alias().is_some() && self.inner.link.is_open()
    }

    /// Most recent server list received
    #[must_use]
    pub fn last_server_list(&self) -> Option<Vec<ServerData>> {
        self.lock().last_server_list.clone()
    }

    /// Most recent relay round-trip time
    #[must_use]
    pub fn last_rtt(&self) -> Option<Duration> {
        self.lock().last_rtt
    }

    /// Wait until the relay assigns an alias
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Disconnected`] if the link closes first.
    pub async fn wait_identified(&self) -> Result<String> {
        let mut rx = self.inner.identity.subscribe();
        let identity = rx
            .wait_for(|identity| *identity != Identity::Pending)
            .await
            .map_err(|_| BrokerError::Disconnected)?;
        match &*identity {
            Identity::Assigned(alias) => Ok(alias.clone()),
            Identity::Pending | Identity::LinkClosed => Err(BrokerError::Disconnected),
        }
    }

    fn require_alias(&self) -> Result<String> {
        self.alias().ok_or(BrokerError::NotIdentified)
    }

    /// Mint the next socket id (`alias|counter`)
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotIdentified`] before `Welcome`.
    pub fn next_socket_id(&self) -> Result<String> {
        let alias = self.require_alias()?;
        let n = self.inner.socket_count.fetch_add(1, Ordering::Relaxed);
        Ok(socket_id(&alias, n))
    }

    // ============ Requests ============

    /// Register as a host
    ///
    /// `on_connection` is invoked with a fresh socket for every syn addressed
    /// to this broker; the syn-ack is sent right after it returns. The broker
    /// holds the socket until it connects, fails or exceeds
    /// [`BrokerConfig::accept_timeout`]; past that the handler's clone is the
    /// only one keeping it open.
    ///
    /// A listen that fails or times out leaves the broker not listening and
    /// installs no handler, even if the relay's confirmation arrives later.
    ///
    /// # Errors
    ///
    /// Fails if not identified, already listening, if the link fails or if
    /// the configured request timeout elapses.
    pub async fn listen<F>(&self, options: ListenOptions, on_connection: F) -> Result<()>
    where
        F: Fn(RtcSocket) + Send + Sync + 'static,
    {
        let alias = self.require_alias()?;
        let meta = options
            .meta
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(ProtoError::from)?;

        let rx = {
            let mut shared = self.lock();
            if shared.state == BrokerState::Listening || shared.listen_waiter.is_some() {
                return Err(BrokerError::AlreadyListening);
            }
            shared.on_connection = Some(Arc::new(on_connection));
            let (tx, rx) = oneshot::channel();
            shared.listen_waiter = Some(tx);
            rx
        };

        let server_data = ServerData {
            alias: alias.clone(),
            name: options.name.unwrap_or_else(|| format!("{alias} server")),
            protocol: self.inner.config.protocol.clone(),
            meta,
        };
        let request = BrokerMessage::CreateServerRequest {
            alias: alias.clone(),
            server_data: Some(server_data),
        };

        let outcome = match self.send(&request) {
            Ok(()) => self.await_reply(rx, "listen").await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            let mut shared = self.lock();
            shared.listen_waiter = None;
            // The confirmation may have landed between the timeout and the lock
            if shared.state != BrokerState::Listening {
                shared.on_connection = None;
                return Err(e);
            }
        }

        tracing::info!(%alias, "Listening for connections");
        Ok(())
    }

    /// Ask the relay for the registered hosts
    ///
    /// Responses are matched to requests in the order the requests were sent.
    ///
    /// # Errors
    ///
    /// Fails if not identified, if the link fails or if the configured request
    /// timeout elapses.
    pub async fn request_server_list(&self) -> Result<Vec<ServerData>> {
        self.require_alias()?;

        let request = BrokerMessage::ServerListRequest {
            protocol: self.inner.config.protocol.clone(),
        };
        let (tx, rx) = oneshot::channel();
        {
            // Queue order must match send order
            let mut shared = self.lock();
            self.send(&request)?;
            shared.list_waiters.push_back(tx);
        }

        self.await_reply(rx, "server list").await
    }

    /// Open a sub-connection to a host
    ///
    /// Resolves once the host answered the syn; the peer negotiation is then
    /// under way. Await [`RtcSocket::wait_connected`] for the channels to open.
    ///
    /// # Errors
    ///
    /// Fails if not identified, if the link fails, or with a timeout error if
    /// the host does not answer within the connect timeout.
    pub async fn connect(&self, server_alias: &str) -> Result<RtcSocket> {
        let socket = RtcSocket::new(self)?;
        let sub_id = socket.socket_id().to_string();

        let (tx, rx) = oneshot::channel();
        self.lock().connect_waiters.insert(sub_id.clone(), tx);

        let syn = BrokerMessage::ServerSyn {
            sender: sub_id.clone(),
            server_alias: server_alias.to_string(),
        };
        if let Err(e) = self.send(&syn) {
            self.lock().connect_waiters.remove(&sub_id);
            socket.close();
            return Err(e);
        }

        let remote = match tokio::time::timeout(self.inner.config.connect_timeout, rx).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(_)) => {
                socket.close();
                return Err(BrokerError::Disconnected);
            }
            Err(_) => {
                self.lock().connect_waiters.remove(&sub_id);
                socket.close();
                tracing::warn!(%server_alias, "Server did not respond");
                return Err(BrokerError::Timeout(
                    format!("Server {server_alias} did not respond").into(),
                ));
            }
        };

        tracing::debug!(socket_id = %sub_id, %remote, "Syn acknowledged");
        if let Err(e) = socket.start_connect(&remote) {
            socket.close();
            return Err(e);
        }
        Ok(socket)
    }

    /// Measure the relay round-trip time
    ///
    /// # Errors
    ///
    /// Fails if the link fails or if the configured request timeout elapses.
    pub async fn ping(&self) -> Result<Duration> {
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.lock();
            let sent_at = Instant::now();
            self.send(&BrokerMessage::Ping)?;
            shared.ping_waiters.push_back((sent_at, tx));
        }

        self.await_reply(rx, "ping").await
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>, what: &'static str) -> Result<T> {
        match self.inner.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| BrokerError::timeout(what))?
                .map_err(|_| BrokerError::Disconnected),
            None => rx.await.map_err(|_| BrokerError::Disconnected),
        }
    }

    // ============ Inbound ============

    /// Dispatch one message received from the relay
    pub fn handle_message(&self, msg: BrokerMessage) {
        tracing::trace!(kind = msg.message_type(), "Inbound broker message");

        match msg {
            BrokerMessage::Welcome { alias } => self.on_welcome(alias),
            BrokerMessage::WebRtcNegotiation(negotiation) => {
                self.lock()
                    .negotiation_subs
                    .retain(|tx| tx.send(negotiation.clone()).is_ok());
            }
            BrokerMessage::ServerSyn {
                sender,
                server_alias,
            } => self.on_syn(&sender, &server_alias),
            BrokerMessage::ServerSynAck { sender, receiver } => {
                let waiter = self.lock().connect_waiters.remove(&receiver);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(sender);
                    }
                    None => tracing::debug!(%receiver, "Syn-ack for unknown socket"),
                }
            }
            BrokerMessage::CreateServerResponse { alias } => {
                if self.alias().as_deref() != Some(alias.as_str()) {
                    tracing::debug!(%alias, "CreateServerResponse for another alias");
                    return;
                }
                let mut shared = self.lock();
                let Some(tx) = shared.listen_waiter.take() else {
                    tracing::debug!(%alias, "CreateServerResponse without a pending listen");
                    return;
                };
                shared.state = BrokerState::Listening;
                let _ = tx.send(());
            }
            BrokerMessage::ServerListResponse { servers } => {
                let mut shared = self.lock();
                shared.last_server_list = Some(servers.clone());
                // A closed waiter timed out; its response is discarded with it
                if let Some(tx) = shared.list_waiters.pop_front() {
                    let _ = tx.send(servers);
                }
            }
            BrokerMessage::Pong => {
                let mut shared = self.lock();
                if let Some((sent_at, tx)) = shared.ping_waiters.pop_front() {
                    let rtt = sent_at.elapsed();
                    shared.last_rtt = Some(rtt);
                    let _ = tx.send(rtt);
                }
            }
            BrokerMessage::Ping
            | BrokerMessage::CreateServerRequest { .. }
            | BrokerMessage::ServerListRequest { .. } => {
                tracing::debug!(kind = msg.message_type(), "Ignoring relay-side request");
            }
        }
    }

    /// Fail every pending request after the relay link closed
    pub fn link_closed(&self) {
        self.inner.identity.send_if_modified(|identity| {
            if *identity == Identity::Pending {
                *identity = Identity::LinkClosed;
                true
            } else {
                false
            }
        });

        let mut shared = self.lock();
        shared.listen_waiter = None;
        shared.list_waiters.clear();
        shared.ping_waiters.clear();
        shared.connect_waiters.clear();
        tracing::warn!(alias = ?self.alias(), "Relay link closed");
    }

    fn on_welcome(&self, alias: String) {
        let accepted = self.inner.identity.send_if_modified(|identity| {
            if *identity == Identity::Pending {
                *identity = Identity::Assigned(alias.clone());
                true
            } else {
                false
            }
        });

        if accepted {
            let mut shared = self.lock();
            if shared.state == BrokerState::Unidentified {
                shared.state = BrokerState::Identified;
            }
            tracing::info!(%alias, "Identified by relay");
        } else {
            tracing::warn!(%alias, "Ignoring repeated Welcome");
        }
    }

    fn on_syn(&self, sender: &str, server_alias: &str) {
        if self.alias().as_deref() != Some(server_alias) {
            tracing::debug!(%server_alias, "Syn for another host");
            return;
        }

        let handler = self.lock().on_connection.clone();
        let Some(handler) = handler else {
            tracing::debug!(%sender, "Syn received while not listening");
            return;
        };

        let socket = match RtcSocket::new(self) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(%sender, "Cannot accept connection: {e}");
                return;
            }
        };
        let sub_id = socket.socket_id().to_string();
        handler(socket.clone());

        let ack = BrokerMessage::ServerSynAck {
            sender: sub_id,
            receiver: sender.to_string(),
        };
        if let Err(e) = self.send(&ack) {
            tracing::warn!(%sender, "Failed to send syn-ack: {e}");
            socket.close();
            return;
        }
        tokio::spawn(hold_until_settled(socket, self.inner.config.accept_timeout));
    }

    // ============ Outbound ============

    pub(crate) fn send(&self, msg: &BrokerMessage) -> Result<()> {
        self.inner.link.send(msg)
    }

    pub(crate) fn subscribe_negotiation(&self) -> mpsc::UnboundedReceiver<WebRtcMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().negotiation_subs.push(tx);
        rx
    }

    pub(crate) fn send_candidate(
        &self,
        sender: &str,
        receiver: &str,
        candidate: Option<&IceCandidate>,
    ) -> Result<()> {
        let msg = WebRtcMessage::candidate(sender, receiver, candidate)?;
        self.send(&BrokerMessage::WebRtcNegotiation(msg))
    }

    pub(crate) fn send_session(
        &self,
        sender: &str,
        receiver: &str,
        description: &SessionDescription,
    ) -> Result<()> {
        let msg = WebRtcMessage::session(sender, receiver, description)?;
        self.send(&BrokerMessage::WebRtcNegotiation(msg))
    }
}

/// Keep an accepted socket alive until it connects, fails or runs out of time
async fn hold_until_settled(socket: RtcSocket, limit: Duration) {
    match tokio::time::timeout(limit, socket.wait_connected()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(socket_id = %socket.socket_id(), "Accepted socket did not connect: {e}");
        }
        Err(_) => {
            tracing::warn!(
                socket_id = %socket.socket_id(),
                "Accepted socket did not connect within {limit:?}"
            );
            socket.close();
        }
    }
}

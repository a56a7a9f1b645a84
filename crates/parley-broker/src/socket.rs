//! Peer socket negotiation.
//!
//! An [`RtcSocket`] is one sub-connection multiplexed over a broker. It
//! consumes the negotiation messages addressed to its socket id, drives the
//! offer/answer/candidate exchange on a [`PeerTransport`], and exposes the
//! resulting reliable and unreliable data channels.
//!
//! # States
//!
//! ```text
//! New ─▶ PeerCreated ─▶ Offering ──┐
//!                  └──▶ Answering ─┴▶ RemoteDescriptionSet ─▶ ChannelsOpening ─▶ Open
//!
//! any ─▶ Closed          any ─▶ Failed
//! ```
//!
//! # Candidate delivery
//!
//! With the shared policy cleared, a local description is sent only once
//! gathering has completed, so it carries every candidate. Once slow gathering
//! has been detected (or when the remote cannot take incremental candidates
//! the other way round) the description goes out immediately. Every gathered
//! candidate is also sent on its own regardless of policy.

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::transport::{
    ChannelEvent, ChannelHandle, ChannelOptions, ConnectionState, DataChannel, PeerTransport,
    TransportEvent, TransportHandle,
};
use parley_proto::{IceCandidate, NegotiationKind, SdpType, SessionDescription, WebRtcMessage};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Label of the reliable, ordered channel
pub const RELIABLE_CHANNEL: &str = "main";

/// Label of the unordered, zero-retransmit channel
pub const UNRELIABLE_CHANNEL: &str = "unreliable";

/// Negotiation state of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    /// No peer transport yet
    New,
    /// Peer transport created
    PeerCreated,
    /// Local offer in progress
    Offering,
    /// Answering a remote offer
    Answering,
    /// Remote description applied
    RemoteDescriptionSet,
    /// Waiting for the reliable channel to open
    ChannelsOpening,
    /// Reliable channel open
    Open,
    /// Closed
    Closed,
    /// Failed
    Failed,
}

impl NegotiationState {
    /// Whether no further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

#[derive(Debug, Clone)]
enum Connection {
    Pending,
    Open,
    Failed(BrokerError),
}

struct SocketState {
    phase: NegotiationState,
    remote_socket_id: Option<String>,
    transport: Option<Arc<dyn PeerTransport>>,
    reliable: Option<Arc<dyn DataChannel>>,
    unreliable: Option<Arc<dyn DataChannel>>,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    data_subs: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    error_subs: Vec<mpsc::UnboundedSender<BrokerError>>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
    failure: Option<BrokerError>,
}

impl SocketState {
    fn advance(&mut self, next: NegotiationState) {
        if !self.phase.is_terminal() && next > self.phase {
            self.phase = next;
        }
    }
}

struct Inner {
    socket_id: String,
    broker: Broker,
    state: Mutex<SocketState>,
    connected: watch::Sender<Connection>,
    gathered: watch::Sender<Option<SessionDescription>>,
    closed: watch::Sender<bool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in state.tasks.drain(..) {
            task.abort();
        }
        if let Some(transport) = state.transport.take() {
            transport.close();
        }
    }
}

/// One negotiable sub-connection
///
/// Cheap to clone; clones share the same connection. Dropping the last clone
/// tears the connection down.
#[derive(Clone)]
pub struct RtcSocket {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RtcSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcSocket")
            .field("socket_id", &self.inner.socket_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RtcSocket {
    /// Create a socket on `broker` with a freshly minted socket id
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotIdentified`] before the broker has an alias.
    pub fn new(broker: &Broker) -> Result<Self> {
        let socket_id = broker.next_socket_id()?;
        let signaling = broker.subscribe_negotiation();

        let (connected, _) = watch::channel(Connection::Pending);
        let (gathered, _) = watch::channel(None);
        let (closed, _) = watch::channel(false);

        let socket = Self {
            inner: Arc::new(Inner {
                socket_id,
                broker: broker.clone(),
                state: Mutex::new(SocketState {
                    phase: NegotiationState::New,
                    remote_socket_id: None,
                    transport: None,
                    reliable: None,
                    unreliable: None,
                    remote_applied: false,
                    pending_candidates: Vec::new(),
                    data_subs: Vec::new(),
                    error_subs: Vec::new(),
                    tasks: Vec::new(),
                    closed: false,
                    failure: None,
                }),
                connected,
                gathered,
                closed,
            }),
        };

        let task = tokio::spawn(signaling_loop(Arc::downgrade(&socket.inner), signaling));
        socket.lock().tasks.push(task);
        Ok(socket)
    }

    fn lock(&self) -> MutexGuard<'_, SocketState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(future);
        let mut state = self.lock();
        if state.closed {
            task.abort();
        } else {
            state.tasks.retain(|t| !t.is_finished());
            state.tasks.push(task);
        }
    }

    // ============ Accessors ============

    /// Socket id of this sub-connection
    #[must_use]
    pub fn socket_id(&self) -> &str {
        &self.inner.socket_id
    }

    /// Socket id of the remote sub-connection, once bound
    #[must_use]
    pub fn remote_socket_id(&self) -> Option<String> {
        self.lock().remote_socket_id.clone()
    }

    /// Current negotiation state
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.lock().phase
    }

    /// Broker this socket negotiates through
    #[must_use]
    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Whether the reliable channel is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock()
            .reliable
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Whether the socket was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Error that failed the socket with nobody subscribed to errors
    #[must_use]
    pub fn failure(&self) -> Option<BrokerError> {
        self.lock().failure.clone()
    }

    /// Receive every message arriving on either channel
    #[must_use]
    pub fn subscribe_data(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().data_subs.push(tx);
        rx
    }

    /// Receive negotiation errors
    ///
    /// While at least one receiver is alive, errors are delivered here and the
    /// socket stays up. Without one, the first error fails and closes it.
    #[must_use]
    pub fn subscribe_errors(&self) -> mpsc::UnboundedReceiver<BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().error_subs.push(tx);
        rx
    }

    // ============ Operations ============

    /// Start connecting to `remote` and wait for the reliable channel to open
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot be created, the connection fails, or the
    /// socket is closed first.
    pub async fn connect(&self, remote: &str) -> Result<()> {
        self.start_connect(remote)?;
        self.wait_connected().await
    }

    /// Bind `remote` and create both data channels, which starts the offer
    ///
    /// # Errors
    ///
    /// Fails if the remote id conflicts or the transport cannot be created.
    pub fn start_connect(&self, remote: &str) -> Result<()> {
        tracing::debug!(socket_id = %self.inner.socket_id, %remote, "Connecting");
        self.ensure_peer(remote)?;
        let transport = self.transport()?;

        let reliable = transport.create_data_channel(RELIABLE_CHANNEL, ChannelOptions::reliable())?;
        self.register_channel(reliable)?;
        let unreliable =
            transport.create_data_channel(UNRELIABLE_CHANNEL, ChannelOptions::unreliable())?;
        self.register_channel(unreliable)?;
        Ok(())
    }

    /// Wait for the reliable channel to open
    ///
    /// # Errors
    ///
    /// Returns the error that failed the connection, or
    /// [`BrokerError::Closed`] if the socket was closed first.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.inner.connected.subscribe();
        let status = rx
            .wait_for(|status| !matches!(status, Connection::Pending))
            .await
            .map_err(|_| BrokerError::Closed)?;
        match &*status {
            Connection::Open => Ok(()),
            Connection::Failed(e) => Err(e.clone()),
            Connection::Pending => Err(BrokerError::Closed),
        }
    }

    /// Send a message
    ///
    /// Unreliable sends use the unreliable channel if it is open and fall back
    /// to the reliable one otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelNotOpen`] if no usable channel is open.
    pub fn send(&self, data: &[u8], reliable: bool) -> Result<()> {
        let channel = {
            let state = self.lock();
            match &state.unreliable {
                Some(unreliable) if !reliable && unreliable.is_open() => Some(Arc::clone(unreliable)),
                _ => state.reliable.clone(),
            }
        };

        let Some(channel) = channel else {
            return Err(BrokerError::ChannelNotOpen("There are no data channels".into()));
        };
        if !channel.is_open() {
            return Err(BrokerError::ChannelNotOpen(
                format!("Data channel {} is not open", channel.label()).into(),
            ));
        }
        channel.send(data)?;
        Ok(())
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) {
        let (transport, reliable, unreliable, tasks) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if state.phase != NegotiationState::Failed {
                state.phase = NegotiationState::Closed;
            }
            state.data_subs.clear();
            (
                state.transport.take(),
                state.reliable.take(),
                state.unreliable.take(),
                std::mem::take(&mut state.tasks),
            )
        };

        if let Some(transport) = transport {
            transport.close();
        }
        if let Some(channel) = reliable {
            channel.close();
        }
        if let Some(channel) = unreliable {
            channel.close();
        }

        self.fail_pending(BrokerError::Closed);
        self.inner.closed.send_replace(true);
        for task in tasks {
            task.abort();
        }
        tracing::debug!(socket_id = %self.inner.socket_id, "Socket closed");
    }

    /// Wait until the socket is closed
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // ============ Negotiation ============

    fn transport(&self) -> Result<Arc<dyn PeerTransport>> {
        let state = self.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state
            .transport
            .clone()
            .ok_or(BrokerError::protocol("No peer transport"))
    }

    fn remote(&self) -> Result<String> {
        self.remote_socket_id()
            .ok_or(BrokerError::protocol("Remote socket not bound"))
    }

    fn advance(&self, next: NegotiationState) {
        self.lock().advance(next);
    }

    /// Bind the remote id (write-once) and create the transport if needed
    fn ensure_peer(&self, remote: &str) -> Result<()> {
        if remote.is_empty() {
            return Err(BrokerError::protocol("Remote socket must be a value"));
        }

        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        match &state.remote_socket_id {
            Some(bound) if bound != remote => {
                return Err(BrokerError::Protocol(
                    format!("Remote socket cannot be changed from {bound} to {remote}").into(),
                ));
            }
            Some(_) => {}
            None => state.remote_socket_id = Some(remote.to_string()),
        }
        if state.transport.is_some() {
            return Ok(());
        }

        let broker = &self.inner.broker;
        let TransportHandle { transport, events } = broker.factory().create(&broker.config().rtc)?;
        state.transport = Some(transport);
        state.advance(NegotiationState::PeerCreated);
        state
            .tasks
            .push(tokio::spawn(transport_loop(Arc::downgrade(&self.inner), events)));
        Ok(())
    }

    async fn on_negotiation(&self, msg: WebRtcMessage) -> Result<()> {
        self.ensure_peer(&msg.sender)?;

        match msg.kind {
            NegotiationKind::Candidate => {
                let Some(candidate) = msg.parse_candidate()? else {
                    return Ok(());
                };
                let transport = {
                    let mut state = self.lock();
                    if !state.remote_applied {
                        state.pending_candidates.push(candidate);
                        return Ok(());
                    }
                    state.transport.clone()
                };
                if let Some(transport) = transport {
                    transport.add_ice_candidate(&candidate).await?;
                }
            }
            NegotiationKind::Session => {
                let description = msg.parse_session().map_err(|e| {
                    BrokerError::Protocol(format!("Unknown SESSION message: {e}").into())
                })?;
                let socket = self.clone();
                match description.sdp_type {
                    SdpType::Offer => self.spawn(async move {
                        if let Err(e) = socket.process_offer(description).await {
                            socket.raise(e);
                        }
                    }),
                    SdpType::Answer => self.spawn(async move {
                        if let Err(e) = socket.process_answer(description).await {
                            socket.raise(e);
                        }
                    }),
                    other => {
                        return Err(BrokerError::Protocol(
                            format!("Unknown SESSION message type {other}").into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    async fn initialize_offer(&self) -> Result<()> {
        let transport = self.transport()?;
        self.advance(NegotiationState::Offering);

        let offer = transport.create_offer().await?;
        transport.set_local_description(&offer).await?;
        self.send_local_description(&transport, offer).await
    }

    async fn process_offer(&self, offer: SessionDescription) -> Result<()> {
        let transport = self.transport()?;
        self.advance(NegotiationState::Answering);

        transport.set_remote_description(&offer).await?;
        self.remote_description_applied(&transport).await?;

        let answer = transport.create_answer().await?;
        transport.set_local_description(&answer).await?;
        self.send_local_description(&transport, answer).await?;
        self.advance(NegotiationState::ChannelsOpening);
        Ok(())
    }

    async fn process_answer(&self, answer: SessionDescription) -> Result<()> {
        let transport = self.transport()?;

        match transport.set_remote_description(&answer).await {
            Ok(()) => {}
            Err(e) if e.is_sdp_parse_error() => {
                tracing::warn!(
                    socket_id = %self.inner.socket_id,
                    "Answer rejected ({e}), retrying with original description"
                );
                transport.set_remote_description(&answer.original()).await?;
            }
            Err(e) => return Err(e.into()),
        }

        self.remote_description_applied(&transport).await?;
        self.advance(NegotiationState::ChannelsOpening);
        Ok(())
    }

    /// Open the candidate gate and apply everything queued behind it
    async fn remote_description_applied(&self, transport: &Arc<dyn PeerTransport>) -> Result<()> {
        let pending = {
            let mut state = self.lock();
            state.remote_applied = true;
            state.advance(NegotiationState::RemoteDescriptionSet);
            std::mem::take(&mut state.pending_candidates)
        };
        for candidate in &pending {
            transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn send_local_description(
        &self,
        transport: &Arc<dyn PeerTransport>,
        generated: SessionDescription,
    ) -> Result<()> {
        let broker = &self.inner.broker;
        let policy = broker.policy();

        let mut description = generated.clone();
        if policy.should_wait_for_gathering(transport.can_trickle_ice_candidates()) {
            tracing::info!(
                socket_id = %self.inner.socket_id,
                "Waiting for candidates ({})",
                generated.sdp_type
            );
            let mut rx = self.inner.gathered.subscribe();
            let limit = broker.config().gathering_timeout;
            match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
                Ok(Ok(complete)) => {
                    if let Some(complete) = &*complete {
                        description = complete.clone();
                    }
                }
                Ok(Err(_)) => return Err(BrokerError::Closed),
                Err(_) => {
                    tracing::warn!(
                        socket_id = %self.inner.socket_id,
                        "Candidate gathering timed out after {limit:?}"
                    );
                    policy.mark_slow();
                    if let Some(partial) = transport.local_description() {
                        description = partial;
                    }
                }
            }
        }
        description.original_sdp = generated.sdp;

        broker.send_session(&self.inner.socket_id, &self.remote()?, &description)
    }

    // ============ Events ============

    fn on_transport_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::LocalCandidate(Some(candidate)) => {
                self.inner
                    .broker
                    .send_candidate(&self.inner.socket_id, &self.remote()?, Some(&candidate))?;
            }
            TransportEvent::LocalCandidate(None) => {
                let description = self.transport()?.local_description();
                if description.is_some() {
                    self.inner.gathered.send_replace(description);
                }
            }
            TransportEvent::ConnectionStateChanged(state) => {
                tracing::debug!(socket_id = %self.inner.socket_id, ?state, "Connection state changed");
                match state {
                    ConnectionState::Disconnected => self.close(),
                    ConnectionState::Failed if self.is_pending() => {
                        self.lock().advance(NegotiationState::Failed);
                        self.fail_pending(BrokerError::connection_failed("Connection failed"));
                        self.close();
                    }
                    _ => {}
                }
            }
            TransportEvent::NegotiationNeeded => {
                let socket = self.clone();
                self.spawn(async move {
                    if let Err(e) = socket.initialize_offer().await {
                        socket.raise(e);
                    }
                });
            }
            TransportEvent::IncomingChannel(handle) => self.register_channel(handle)?,
        }
        Ok(())
    }

    fn register_channel(&self, handle: ChannelHandle) -> Result<()> {
        let ChannelHandle { channel, events } = handle;
        let label = channel.label().to_string();
        {
            let mut state = self.lock();
            match label.as_str() {
                RELIABLE_CHANNEL => state.reliable = Some(Arc::clone(&channel)),
                UNRELIABLE_CHANNEL => state.unreliable = Some(Arc::clone(&channel)),
                _ => {
                    drop(state);
                    channel.close();
                    return Err(BrokerError::Protocol(
                        format!("Unknown data channel {label}").into(),
                    ));
                }
            }
        }

        self.spawn(channel_loop(Arc::downgrade(&self.inner), label, events));
        Ok(())
    }

    fn on_channel_event(&self, label: &str, event: ChannelEvent) {
        let reliable = label == RELIABLE_CHANNEL;
        match event {
            ChannelEvent::Open if reliable => {
                self.advance(NegotiationState::Open);
                self.inner.connected.send_if_modified(|status| {
                    if matches!(status, Connection::Pending) {
                        *status = Connection::Open;
                        true
                    } else {
                        false
                    }
                });
                tracing::info!(socket_id = %self.inner.socket_id, remote = ?self.remote_socket_id(), "Connected");
            }
            ChannelEvent::Open => {}
            ChannelEvent::Message(data) => {
                self.lock()
                    .data_subs
                    .retain(|tx| tx.send(data.clone()).is_ok());
            }
            ChannelEvent::Error(e) => {
                tracing::error!(socket_id = %self.inner.socket_id, %label, "Error in data channel: {e}");
                self.fail_pending(BrokerError::connection_failed("Error in data channel"));
            }
            ChannelEvent::Close if reliable => self.close(),
            ChannelEvent::Close => {}
        }
    }

    // ============ Errors ============

    fn is_pending(&self) -> bool {
        matches!(*self.inner.connected.borrow(), Connection::Pending)
    }

    fn fail_pending(&self, err: BrokerError) {
        self.inner.connected.send_if_modified(|status| {
            if matches!(status, Connection::Pending) {
                *status = Connection::Failed(err);
                true
            } else {
                false
            }
        });
    }

    /// Surface an error to subscribers, or fail the socket if there are none
    fn raise(&self, err: BrokerError) {
        self.fail_pending(err.clone());

        let delivered = {
            let mut state = self.lock();
            state.error_subs.retain(|tx| tx.send(err.clone()).is_ok());
            !state.error_subs.is_empty()
        };
        if delivered {
            tracing::debug!(socket_id = %self.inner.socket_id, "Socket error: {err}");
            return;
        }

        tracing::error!(socket_id = %self.inner.socket_id, "Unhandled socket error: {err}");
        {
            let mut state = self.lock();
            state.failure = Some(err);
            state.advance(NegotiationState::Failed);
        }
        self.close();
    }
}

async fn signaling_loop(socket: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<WebRtcMessage>) {
    while let Some(msg) = rx.recv().await {
        let Some(inner) = socket.upgrade() else {
            break;
        };
        let socket = RtcSocket { inner };
        if msg.receiver != socket.inner.socket_id {
            continue;
        }
        if let Err(e) = socket.on_negotiation(msg).await {
            socket.raise(e);
        }
        if socket.is_closed() {
            break;
        }
    }
}

async fn transport_loop(socket: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = socket.upgrade() else {
            break;
        };
        let socket = RtcSocket { inner };
        if let Err(e) = socket.on_transport_event(event) {
            socket.raise(e);
        }
        if socket.is_closed() {
            break;
        }
    }
}

async fn channel_loop(
    socket: Weak<Inner>,
    label: String,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = socket.upgrade() else {
            break;
        };
        RtcSocket { inner }.on_channel_event(&label, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::loopback::{LoopbackFactory, LoopbackOptions};
    use crate::policy::GatheringPolicy;
    use crate::testing::{connected_pair, direct_pair, recv, welcomed_broker};
    use parley_proto::BrokerMessage;
    use std::time::Duration;

    fn session(sender: &str, receiver: &str, sdp_type: SdpType) -> BrokerMessage {
        let description = SessionDescription::new(sdp_type, "v=0\r\no=loopback 999\r\n");
        BrokerMessage::WebRtcNegotiation(
            WebRtcMessage::session(sender, receiver, &description).unwrap(),
        )
    }

    // ============ Remote binding ============

    #[tokio::test]
    async fn test_remote_socket_is_write_once() {
        let (broker, _rx) = welcomed_broker("PABC", BrokerConfig::default());
        let socket = RtcSocket::new(&broker).unwrap();

        socket.ensure_peer("PXYZ|0").unwrap();
        socket.ensure_peer("PXYZ|0").unwrap();
        assert_eq!(socket.state(), NegotiationState::PeerCreated);

        let err = socket.ensure_peer("PEVIL|0").unwrap_err();
        assert!(matches!(err, BrokerError::Protocol(_)));
        assert_eq!(socket.remote_socket_id().as_deref(), Some("PXYZ|0"));
        assert!(socket.ensure_peer("").is_err());
    }

    #[tokio::test]
    async fn test_rebinding_message_fails_socket() {
        let (broker, _rx) = welcomed_broker("PABC", BrokerConfig::default());
        let socket = RtcSocket::new(&broker).unwrap();
        socket.ensure_peer("PXYZ|0").unwrap();

        let msg = WebRtcMessage::candidate("PEVIL|0", socket.socket_id(), None).unwrap();
        broker.handle_message(BrokerMessage::WebRtcNegotiation(msg));

        tokio::time::timeout(Duration::from_secs(1), socket.closed())
            .await
            .unwrap();
        assert_eq!(socket.state(), NegotiationState::Failed);
        assert!(matches!(socket.failure(), Some(BrokerError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_messages_for_other_sockets_ignored() {
        let (broker, _rx) = welcomed_broker("PABC", BrokerConfig::default());
        let socket = RtcSocket::new(&broker).unwrap();

        broker.handle_message(session("PXYZ|0", "PABC|77", SdpType::Offer));
        tokio::task::yield_now().await;

        assert_eq!(socket.state(), NegotiationState::New);
        assert_eq!(socket.remote_socket_id(), None);
    }

    // ============ Error surfacing ============

    #[tokio::test]
    async fn test_unknown_session_type_reported_to_subscriber() {
        let (broker, _rx) = welcomed_broker("PABC", BrokerConfig::default());
        let socket = RtcSocket::new(&broker).unwrap();
        let mut errors = socket.subscribe_errors();

        broker.handle_message(session("PXYZ|0", socket.socket_id(), SdpType::Pranswer));

        let err = tokio::time::timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, BrokerError::Protocol(_)));
        assert!(!socket.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_channel_is_protocol_error() {
        let (broker, _rx) = welcomed_broker("PABC", BrokerConfig::default());
        let socket = RtcSocket::new(&broker).unwrap();
        socket.ensure_peer("PXYZ|0").unwrap();

        let transport = socket.transport().unwrap();
        let handle = transport
            .create_data_channel("bogus", ChannelOptions::reliable())
            .unwrap();
        assert!(matches!(
            socket.register_channel(handle),
            Err(BrokerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_channels() {
        let (broker, _rx) = welcomed_broker("PABC", BrokerConfig::default());
        let socket = RtcSocket::new(&broker).unwrap();

        assert!(matches!(
            socket.send(b"hello", true),
            Err(BrokerError::ChannelNotOpen(_))
        ));
        assert!(!socket.is_connected());
    }

    // ============ Close ============

    #[tokio::test]
    async fn test_close_is_idempotent_and_cancels_connect() {
        let (broker, _rx) = welcomed_broker("PABC", BrokerConfig::default());
        let socket = RtcSocket::new(&broker).unwrap();

        let waiting = tokio::spawn({
            let socket = socket.clone();
            async move { socket.wait_connected().await }
        });
        tokio::task::yield_now().await;

        socket.close();
        socket.close();

        assert!(matches!(waiting.await.unwrap(), Err(BrokerError::Closed)));
        assert_eq!(socket.state(), NegotiationState::Closed);
        socket.closed().await;
        assert!(matches!(
            socket.ensure_peer("PXYZ|0"),
            Err(BrokerError::Closed)
        ));
    }

    // ============ Negotiation ============

    #[tokio::test]
    async fn test_connect_opens_both_sides() {
        let pair = connected_pair(BrokerConfig::default(), BrokerConfig::default()).await;

        assert!(pair.client.is_connected());
        assert!(pair.server.is_connected());
        assert_eq!(pair.client.state(), NegotiationState::Open);
        assert_eq!(pair.server.state(), NegotiationState::Open);
        assert_eq!(
            pair.server.remote_socket_id().as_deref(),
            Some(pair.client.socket_id())
        );
    }

    #[tokio::test]
    async fn test_data_flows_both_ways() {
        let pair = connected_pair(BrokerConfig::default(), BrokerConfig::default()).await;
        let mut server_rx = pair.server.subscribe_data();
        let mut client_rx = pair.client.subscribe_data();

        pair.client.send(b"ping", true).unwrap();
        pair.server.send(b"pong", false).unwrap();

        assert_eq!(recv_data(&mut server_rx).await, b"ping");
        assert_eq!(recv_data(&mut client_rx).await, b"pong");
    }

    #[tokio::test]
    async fn test_remote_close_propagates() {
        let pair = connected_pair(BrokerConfig::default(), BrokerConfig::default()).await;

        pair.client.close();
        tokio::time::timeout(Duration::from_secs(1), pair.server.closed())
            .await
            .unwrap();
        assert!(!pair.server.is_connected());
    }

    #[tokio::test]
    async fn test_connection_failure_rejects_connect() {
        let network = LoopbackFactory::new().network();
        let failing = LoopbackFactory::on_network(
            network.clone(),
            LoopbackOptions {
                fail_connect: true,
                ..Default::default()
            },
        );
        let (client, server) = direct_pair(
            Arc::new(failing),
            Arc::new(LoopbackFactory::on_network(network, LoopbackOptions::default())),
            BrokerConfig::default(),
            BrokerConfig::default(),
        )
        .await;
        let _accepted = crate::testing::accept_connections(&server).await;

        let socket = client.connect(&server.alias().unwrap()).await.unwrap();
        let err = socket.wait_connected().await.unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionFailed(_)));
        assert!(socket.is_closed());
        assert_eq!(socket.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_answer_retried_with_original_sdp() {
        let network = LoopbackFactory::new().network();
        let strict = LoopbackFactory::on_network(
            network.clone(),
            LoopbackOptions {
                reject_candidate_sdp: true,
                ..Default::default()
            },
        );
        let (client, server) = direct_pair(
            Arc::new(strict),
            Arc::new(LoopbackFactory::on_network(network, LoopbackOptions::default())),
            BrokerConfig::default(),
            BrokerConfig::default(),
        )
        .await;
        let _accepted = crate::testing::accept_connections(&server).await;

        let socket = client.connect(&server.alias().unwrap()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), socket.wait_connected())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_batch_policy_sends_complete_description() {
        let (broker, mut rx) = welcomed_broker("PABC", BrokerConfig::default());
        let socket = RtcSocket::new(&broker).unwrap();
        socket.start_connect("PXYZ|0").unwrap();

        let mut candidates = 0;
        let description = loop {
            match recv(&mut rx).await {
                BrokerMessage::WebRtcNegotiation(msg) if msg.kind == NegotiationKind::Candidate => {
                    assert!(msg.parse_candidate().unwrap().is_some());
                    candidates += 1;
                }
                BrokerMessage::WebRtcNegotiation(msg) => break msg.parse_session().unwrap(),
                other => panic!("unexpected {other:?}"),
            }
        };

        assert!(candidates > 0);
        assert_eq!(description.sdp_type, SdpType::Offer);
        assert!(description.sdp.contains("a=candidate"));
        assert!(!description.original_sdp.contains("a=candidate"));
    }

    #[tokio::test]
    async fn test_tickle_policy_sends_offer_first() {
        let config = BrokerConfig {
            policy: GatheringPolicy::tickle(),
            ..Default::default()
        };
        let (broker, mut rx) = welcomed_broker("PABC", config);
        let socket = RtcSocket::new(&broker).unwrap();
        socket.start_connect("PXYZ|0").unwrap();

        match recv(&mut rx).await {
            BrokerMessage::WebRtcNegotiation(msg) => {
                assert_eq!(msg.kind, NegotiationKind::Session);
                assert_eq!(msg.parse_session().unwrap().sdp_type, SdpType::Offer);
            }
            other => panic!("unexpected {other:?}"),
        }
        match recv(&mut rx).await {
            BrokerMessage::WebRtcNegotiation(msg) => {
                assert_eq!(msg.kind, NegotiationKind::Candidate);
                assert!(msg.parse_candidate().unwrap().is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_timeout_marks_policy_slow() {
        let factory = LoopbackFactory::with_options(LoopbackOptions {
            complete_gathering: false,
            ..Default::default()
        });
        let (broker, mut rx) = crate::testing::welcomed_broker_with_factory(
            "PABC",
            Arc::new(factory),
            BrokerConfig::default(),
        );
        let socket = RtcSocket::new(&broker).unwrap();
        socket.start_connect("PXYZ|0").unwrap();

        let description = loop {
            if let BrokerMessage::WebRtcNegotiation(msg) = recv(&mut rx).await {
                if msg.kind == NegotiationKind::Session {
                    break msg.parse_session().unwrap();
                }
            }
        };
        assert!(broker.policy().slow_ice_detected());
        assert_eq!(description.sdp_type, SdpType::Offer);
    }

    #[tokio::test]
    async fn test_candidates_queued_until_remote_description() {
        let (broker, _rx) = welcomed_broker("PABC", BrokerConfig::default());
        let socket = RtcSocket::new(&broker).unwrap();

        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.9 4000 typ host");
        let msg = WebRtcMessage::candidate("PXYZ|0", socket.socket_id(), Some(&candidate)).unwrap();
        broker.handle_message(BrokerMessage::WebRtcNegotiation(msg));
        let end = WebRtcMessage::candidate("PXYZ|0", socket.socket_id(), None).unwrap();
        broker.handle_message(BrokerMessage::WebRtcNegotiation(end));

        tokio::time::timeout(Duration::from_secs(1), async {
            while socket.state() != NegotiationState::PeerCreated {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::task::yield_now().await;

        // The loopback transport rejects candidates before a remote
        // description, so reaching here without failure means they were held
        assert!(!socket.is_closed());
        assert_eq!(socket.lock().pending_candidates, vec![candidate]);
    }

    async fn recv_data(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }
}

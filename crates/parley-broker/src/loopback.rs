//! In-process peer transport.
//!
//! [`LoopbackTransport`]s created by factories sharing one
//! [`LoopbackNetwork`] connect to each other without touching the network.
//! Descriptions carry the transport id in their origin line; applying an
//! answer links the two transports, mirrors the offerer's data channels on
//! the answerer and opens them.
//!
//! Backs the test suites and the `parley demo` command, and shows what a
//! [`TransportFactory`] around a real peer connection library has to provide.

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    ChannelEvent, ChannelHandle, ChannelOptions, ConnectionState, DataChannel, PeerTransport,
    RtcConfig, TransportEvent, TransportFactory, TransportHandle,
};
use async_trait::async_trait;
use parley_proto::{IceCandidate, SdpType, SessionDescription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const ORIGIN_PREFIX: &str = "o=loopback ";

/// Behaviour of loopback transports
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Candidates gathered after a local description is applied
    pub candidates: Vec<IceCandidate>,
    /// Delay before each gathered candidate
    pub gather_delay: Duration,
    /// Whether gathering signals completion
    pub complete_gathering: bool,
    /// Reported trickle support of the remote
    pub can_trickle: Option<bool>,
    /// Fail connectivity checks when linking
    pub fail_connect: bool,
    /// Reject remote descriptions that carry candidate lines with an SDP
    /// parse error
    pub reject_candidate_sdp: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            candidates: vec![IceCandidate::new(
                "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host",
            )],
            gather_delay: Duration::ZERO,
            complete_gathering: true,
            can_trickle: Some(true),
            fail_connect: false,
            reject_candidate_sdp: false,
        }
    }
}

/// Registry of loopback transports that can reach each other
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    peers: Mutex<HashMap<u64, Weak<LoopbackTransport>>>,
    next_id: AtomicU64,
}

impl LoopbackNetwork {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Weak<LoopbackTransport>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, id: u64) -> Option<Arc<LoopbackTransport>> {
        self.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Number of live transports
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().values().filter(|peer| peer.strong_count() > 0).count()
    }

    /// Whether no transport is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory of [`LoopbackTransport`]s
#[derive(Debug)]
pub struct LoopbackFactory {
    network: Arc<LoopbackNetwork>,
    options: LoopbackOptions,
    created: Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFactory {
    /// Factory with default options on a fresh network
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(LoopbackOptions::default())
    }

    /// Factory with `options` on a fresh network
    #[must_use]
    pub fn with_options(options: LoopbackOptions) -> Self {
        Self::on_network(Arc::new(LoopbackNetwork::default()), options)
    }

    /// Factory with `options` on an existing network
    #[must_use]
    pub fn on_network(network: Arc<LoopbackNetwork>, options: LoopbackOptions) -> Self {
        Self {
            network,
            options,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Network the transports join
    #[must_use]
    pub fn network(&self) -> Arc<LoopbackNetwork> {
        Arc::clone(&self.network)
    }

    /// Every transport this factory created
    #[must_use]
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, _config: &RtcConfig) -> TransportResult<TransportHandle> {
        let id = self.network.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = mpsc::unbounded_channel();

        let transport = Arc::new_cyclic(|me| LoopbackTransport {
            id,
            me: me.clone(),
            network: Arc::clone(&self.network),
            options: self.options.clone(),
            events: tx,
            state: Mutex::new(LoopState::default()),
        });
        self.network.lock().insert(id, Arc::downgrade(&transport));
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&transport));

        tracing::trace!(id, "Loopback transport created");
        Ok(TransportHandle {
            transport,
            events,
        })
    }
}

struct LoopState {
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_id: Option<u64>,
    channels: Vec<Arc<LoopbackChannel>>,
    negotiation_requested: bool,
    remote_candidates: Vec<IceCandidate>,
    gathering: Option<JoinHandle<()>>,
    closed: bool,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::New,
            local: None,
            remote: None,
            remote_id: None,
            channels: Vec::new(),
            negotiation_requested: false,
            remote_candidates: Vec::new(),
            gathering: None,
            closed: false,
        }
    }
}

/// Peer transport connected through a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    id: u64,
    me: Weak<LoopbackTransport>,
    network: Arc<LoopbackNetwork>,
    options: LoopbackOptions,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<LoopState>,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("id", &self.id)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = state.gathering.take() {
            task.abort();
        }
        self.network.lock().remove(&self.id);
    }
}

impl LoopbackTransport {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn set_connection(&self, connection: ConnectionState) {
        {
            let mut state = self.lock();
            if state.closed || state.connection == connection {
                return;
            }
            state.connection = connection;
        }
        self.emit(TransportEvent::ConnectionStateChanged(connection));
    }

    fn describe(&self, sdp_type: SdpType) -> SessionDescription {
        let sdp = format!(
            "v=0\r\n{ORIGIN_PREFIX}{} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id
        );
        SessionDescription::new(sdp_type, sdp)
    }

    fn origin(description: &SessionDescription) -> TransportResult<u64> {
        description
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix(ORIGIN_PREFIX))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|id| id.parse().ok())
            .ok_or(TransportError::SdpParse("missing loopback origin".into()))
    }

    /// Transport id within its network
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether [`PeerTransport::close`] was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Remote candidates applied so far
    #[must_use]
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.lock().remote_candidates.clone()
    }

    fn start_gathering(&self) {
        let me = self.me.clone();
        let candidates = self.options.candidates.clone();
        let delay = self.options.gather_delay;
        let complete = self.options.complete_gathering;

        let task = tokio::spawn(async move {
            for candidate in candidates {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let Some(transport) = me.upgrade() else {
                    return;
                };
                {
                    let mut state = transport.lock();
                    if let Some(local) = state.local.as_mut() {
                        local.sdp.push_str(&format!("a={}\r\n", candidate.candidate));
                    }
                }
                transport.emit(TransportEvent::LocalCandidate(Some(candidate)));
            }
            if complete {
                if let Some(transport) = me.upgrade() {
                    transport.emit(TransportEvent::LocalCandidate(None));
                }
            }
        });

        if let Some(previous) = self.lock().gathering.replace(task) {
            previous.abort();
        }
    }

    /// Link with the transport that produced the applied answer
    fn establish(&self, remote_id: u64) {
        let Some(remote) = self.network.find(remote_id) else {
            tracing::debug!(id = self.id, remote_id, "Loopback peer is gone");
            self.set_connection(ConnectionState::Failed);
            return;
        };
        remote.lock().remote_id = Some(self.id);

        self.set_connection(ConnectionState::Connecting);
        remote.set_connection(ConnectionState::Connecting);
        if self.options.fail_connect || remote.options.fail_connect {
            self.set_connection(ConnectionState::Failed);
            remote.set_connection(ConnectionState::Failed);
            return;
        }
        self.set_connection(ConnectionState::Connected);
        remote.set_connection(ConnectionState::Connected);

        let local_channels = self.lock().channels.clone();
        for local in local_channels {
            let (mirror, events) = LoopbackChannel::new(local.label());
            LoopbackChannel::pair(&local, &mirror);
            remote.lock().channels.push(Arc::clone(&mirror));
            remote.emit(TransportEvent::IncomingChannel(ChannelHandle {
                channel: Arc::clone(&mirror) as Arc<dyn DataChannel>,
                events,
            }));
            local.open();
            mirror.open();
        }
    }

    fn peer_disconnected(&self) {
        self.set_connection(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        if self.lock().closed {
            return Err(TransportError::Closed);
        }
        Ok(self.describe(SdpType::Offer))
    }

    async fn create_answer(&self) -> TransportResult<SessionDescription> {
        let state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(self.describe(SdpType::Answer))
            }
            _ => Err(TransportError::InvalidState(
                "No remote offer to answer".into(),
            )),
        }
    }

    async fn set_local_description(&self, description: &SessionDescription) -> TransportResult<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.local = Some(description.clone());
        }
        self.start_gathering();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> TransportResult<()> {
        if self.options.reject_candidate_sdp && description.sdp.contains("a=candidate") {
            return Err(TransportError::SdpParse(
                "Unexpected candidate attribute".into(),
            ));
        }
        let remote_id = Self::origin(description)?;
        {
            let mut state = self.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.remote = Some(description.clone());
            state.remote_id = Some(remote_id);
        }

        if description.sdp_type == SdpType::Answer {
            self.establish(remote_id);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> TransportResult<()> {
        let mut state = self.lock();
        if state.remote.is_none() {
            return Err(TransportError::InvalidState(
                "The remote description was null".into(),
            ));
        }
        state.remote_candidates.push(candidate.clone());
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.lock().local.clone()
    }

    fn can_trickle_ice_candidates(&self) -> Option<bool> {
        self.options.can_trickle
    }

    fn create_data_channel(
        &self,
        label: &str,
        _options: ChannelOptions,
    ) -> TransportResult<ChannelHandle> {
        let (channel, events) = LoopbackChannel::new(label);
        let negotiate = {
            let mut state = self.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.channels.push(Arc::clone(&channel));
            let negotiate = !state.negotiation_requested && state.remote.is_none();
            state.negotiation_requested = true;
            negotiate
        };

        if negotiate {
            self.emit(TransportEvent::NegotiationNeeded);
        }
        Ok(ChannelHandle { channel, events })
    }

    fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    fn close(&self) {
        let (channels, remote_id, gathering) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connection = ConnectionState::Closed;
            (
                std::mem::take(&mut state.channels),
                state.remote_id.take(),
                state.gathering.take(),
            )
        };

        if let Some(task) = gathering {
            task.abort();
        }
        for channel in channels {
            channel.close();
        }
        self.network.lock().remove(&self.id);
        if let Some(remote) = remote_id.and_then(|id| self.network.find(id)) {
            remote.peer_disconnected();
        }
        tracing::trace!(id = self.id, "Loopback transport closed");
    }
}

/// Data channel of a [`LoopbackTransport`]
#[derive(Debug)]
pub struct LoopbackChannel {
    label: String,
    peer: Mutex<Weak<LoopbackChannel>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackChannel {
    fn new(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: label.to_string(),
            peer: Mutex::new(Weak::new()),
            events,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (channel, rx)
    }

    fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(b);
        *b.peer.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(a);
    }

    fn peer(&self) -> Option<Arc<Self>> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    fn open(&self) {
        if !self.closed.load(Ordering::Acquire) && !self.open.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(ChannelEvent::Open);
        }
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, data: &[u8]) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::Channel(
                format!("{} is not open", self.label).into(),
            ));
        }
        let peer = self.peer().ok_or(TransportError::Closed)?;
        peer.events
            .send(ChannelEvent::Message(data.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.open.store(false, Ordering::Release);
        let _ = self.events.send(ChannelEvent::Close);
        if let Some(peer) = self.peer() {
            peer.close();
        }
    }
}

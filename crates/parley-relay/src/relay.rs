//! Alias assignment and message routing.
//!
//! [`Relay`] is independent of the network: a connection handler calls
//! [`Relay::accept`] once, feeds every inbound frame to
//! [`Relay::handle_frame`], drains [`PeerSession::outbound`] to the socket, and
//! calls [`Relay::disconnect`] when the socket goes away.

use crate::error::{RelayError, Result};
use crate::registry::{FrameSender, Registry};
use crate::{DEFAULT_MAX_PEERS, WELCOME_DELAY};
use parley_proto::{BrokerMessage, ServerData, WebRtcMessage, alias_prefix, generate_alias};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Delay before a new connection receives its `Welcome`
    pub welcome_delay: Duration,
    /// Maximum number of concurrent connections
    pub max_peers: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            welcome_delay: WELCOME_DELAY,
            max_peers: DEFAULT_MAX_PEERS,
        }
    }
}

/// An accepted connection
#[derive(Debug)]
pub struct PeerSession {
    /// Alias assigned to the connection
    pub alias: String,
    /// Frames to write to the connection, in order
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Relay state shared by all connection handlers
#[derive(Debug, Default)]
pub struct Relay {
    config: RelayConfig,
    registry: Registry,
    /// Connection slots taken, counted ahead of registration
    slots: AtomicUsize,
}

impl Relay {
    /// Create a relay with default configuration
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(RelayConfig::default())
    }

    /// Create a relay with custom configuration
    #[must_use]
    pub fn with_config(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            slots: AtomicUsize::new(0),
        })
    }

    /// Relay configuration
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Accept a new connection
    ///
    /// Assigns a fresh alias, registers the connection and schedules its
    /// `Welcome` after the configured delay. Must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ServerFull`] if the relay is at capacity.
    pub fn accept(&self) -> Result<PeerSession> {
        let max = self.config.max_peers;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .map_err(|_| RelayError::ServerFull(max))?;

        let (tx, outbound) = mpsc::unbounded_channel();
        let alias = loop {
            let candidate = generate_alias();
            if self.registry.insert_peer(&candidate, tx.clone()) {
                break candidate;
            }
        };

        tracing::info!(%alias, peers = self.registry.peer_count(), "Peer connected");

        let welcome = match (BrokerMessage::Welcome {
            alias: alias.clone(),
        })
        .to_bytes()
        {
            Ok(welcome) => welcome,
            Err(e) => {
                self.disconnect(&alias);
                return Err(e.into());
            }
        };
        let delay = self.config.welcome_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(welcome);
        });

        Ok(PeerSession { alias, outbound })
    }

    /// Remove a connection and any host it registered
    pub fn disconnect(&self, alias: &str) {
        let was_host = self.registry.is_host(alias);
        if self.registry.remove(alias) {
            self.slots.fetch_sub(1, Ordering::AcqRel);
            tracing::info!(%alias, was_host, "Peer disconnected");
        }
    }

    /// Handle one binary frame received on the connection `alias`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Decode`] for undecodable frames, plus every error
    /// [`Relay::handle_message`] can return.
    pub fn handle_frame(&self, alias: &str, frame: &[u8]) -> Result<()> {
        let msg = BrokerMessage::from_bytes(frame)?;
        self.handle_message(alias, msg, frame)
    }

    /// Route one decoded message received on the connection `alias`
    ///
    /// `raw` is the frame the message was decoded from; negotiation traffic is
    /// forwarded as-is.
    ///
    /// # Errors
    ///
    /// Routing errors mean the message was dropped. Errors for which
    /// [`RelayError::is_fatal`] holds mean the connection must be closed.
    pub fn handle_message(&self, alias: &str, msg: BrokerMessage, raw: &[u8]) -> Result<()> {
        tracing::trace!(%alias, kind = msg.message_type(), "Inbound message");

        match msg {
            BrokerMessage::Ping => self.reply(alias, &BrokerMessage::Pong),
            BrokerMessage::WebRtcNegotiation(negotiation) => {
                self.route_negotiation(alias, &negotiation, raw)
            }
            BrokerMessage::ServerSyn {
                sender,
                server_alias,
            } => self.route_syn(alias, sender, server_alias),
            BrokerMessage::ServerSynAck { sender, receiver } => {
                self.route_syn_ack(alias, sender, receiver)
            }
            BrokerMessage::CreateServerRequest { server_data, .. } => {
                self.register_host(alias, server_data)
            }
            BrokerMessage::ServerListRequest { protocol } => {
                tracing::debug!(%alias, ?protocol, "Server list requested");
                let servers = self.registry.hosts();
                self.reply(alias, &BrokerMessage::ServerListResponse { servers })
            }
            BrokerMessage::Welcome { .. }
            | BrokerMessage::Pong
            | BrokerMessage::CreateServerResponse { .. }
            | BrokerMessage::ServerListResponse { .. } => {
                tracing::debug!(%alias, kind = msg.message_type(), "Ignoring relay-bound reply");
                Ok(())
            }
        }
    }

    /// Advertisements of every registered host
    #[must_use]
    pub fn hosts(&self) -> Vec<ServerData> {
        self.registry.hosts()
    }

    /// Number of live connections
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    /// Number of registered hosts
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.registry.host_count()
    }

    /// Underlying registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn route_negotiation(&self, alias: &str, msg: &WebRtcMessage, raw: &[u8]) -> Result<()> {
        check_sender(alias, &msg.sender)?;
        let target = routable_prefix(&msg.receiver)?;
        let tx = self.lookup_peer(target)?;

        tracing::debug!(from = %msg.sender, to = %msg.receiver, kind = %msg.kind, "Forwarding negotiation");
        deliver(&tx, target, raw.to_vec())
    }

    fn route_syn(&self, alias: &str, sender: String, server_alias: String) -> Result<()> {
        check_sender(alias, &sender)?;
        let Some(tx) = self.registry.host_for_syn(&server_alias, &sender) else {
            tracing::warn!(%sender, %server_alias, "Dropping syn for unknown host");
            return Err(RelayError::UnknownHost(server_alias));
        };

        tracing::debug!(%sender, %server_alias, "Forwarding syn");
        let syn = BrokerMessage::ServerSyn {
            sender,
            server_alias: server_alias.clone(),
        };
        deliver(&tx, &server_alias, syn.to_bytes()?)
    }

    fn route_syn_ack(&self, alias: &str, sender: String, receiver: String) -> Result<()> {
        check_sender(alias, &sender)?;
        let target = routable_prefix(&receiver)?.to_string();
        let tx = self.lookup_peer(&target)?;

        tracing::debug!(%sender, %receiver, "Forwarding syn-ack");
        let ack = BrokerMessage::ServerSynAck { sender, receiver };
        deliver(&tx, &target, ack.to_bytes()?)
    }

    fn register_host(&self, alias: &str, server_data: Option<ServerData>) -> Result<()> {
        let Some(mut data) = server_data else {
            tracing::warn!(%alias, "CreateServerRequest without server data");
            return Err(RelayError::MissingServerData);
        };
        data.alias = alias.to_string();

        if !self.registry.insert_host(data.clone()) {
            tracing::warn!(%alias, "Rejecting duplicate host registration");
            return Err(RelayError::AlreadyListening(alias.to_string()));
        }

        tracing::info!(%alias, name = %data.name, protocol = ?data.protocol, "Host registered");
        self.reply(
            alias,
            &BrokerMessage::CreateServerResponse {
                alias: alias.to_string(),
            },
        )
    }

    fn reply(&self, alias: &str, msg: &BrokerMessage) -> Result<()> {
        let tx = self.lookup_peer(alias)?;
        deliver(&tx, alias, msg.to_bytes()?)
    }

    fn lookup_peer(&self, alias: &str) -> Result<FrameSender> {
        self.registry.peer(alias).ok_or_else(|| {
            tracing::warn!(%alias, "Dropping message for unknown peer");
            RelayError::UnknownPeer(alias.to_string())
        })
    }
}

/// Anti-spoofing: the sender's alias prefix must be the connection's alias
fn check_sender(alias: &str, sender: &str) -> Result<()> {
    let claimed = routable_prefix(sender)?;
    if claimed != alias {
        tracing::warn!(%alias, %claimed, "Dropping spoofed message");
        return Err(RelayError::SpoofedSender {
            claimed: claimed.to_string(),
            actual: alias.to_string(),
        });
    }
    Ok(())
}

fn routable_prefix(socket_id: &str) -> Result<&str> {
    match alias_prefix(socket_id) {
        "" => {
            tracing::warn!(%socket_id, "Dropping message with malformed socket id");
            Err(RelayError::MalformedSocketId(socket_id.to_string()))
        }
        prefix => Ok(prefix),
    }
}

fn deliver(tx: &FrameSender, alias: &str, frame: Vec<u8>) -> Result<()> {
    tx.send(frame)
        .map_err(|_| RelayError::UnknownPeer(alias.to_string()))
}

//! Peer transport collaborator interface.
//!
//! A peer socket never talks to a real-time transport library directly. It
//! drives a [`PeerTransport`] created by a [`TransportFactory`] and reacts to
//! the [`TransportEvent`]s and [`ChannelEvent`]s delivered alongside it.

use crate::error::TransportResult;
use async_trait::async_trait;
use parley_proto::{IceCandidate, SessionDescription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// STUN servers used when no configuration is given
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478?transport=udp",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    /// Server URLs (`stun:` or `turn:`)
    pub urls: Vec<String>,
}

/// Configuration handed to the transport factory for every peer connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcConfig {
    /// ICE servers
    pub ice_servers: Vec<IceServer>,
}

impl RtcConfig {
    /// Configuration with one STUN server entry per URL
    #[must_use]
    pub fn with_stun_servers<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ice_servers: urls
                .into_iter()
                .map(|url| IceServer {
                    urls: vec![url.into()],
                })
                .collect(),
        }
    }

    /// Configuration using [`DEFAULT_STUN_SERVERS`]
    #[must_use]
    pub fn default_stun() -> Self {
        Self::with_stun_servers(DEFAULT_STUN_SERVERS.iter().copied())
    }
}

/// Aggregate connection state of a peer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started
    New,
    /// Connectivity checks in progress
    Connecting,
    /// Connected
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Closed locally
    Closed,
}

/// Data channel reliability options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// In-order delivery
    pub ordered: bool,
    /// Retransmission limit, `None` for fully reliable
    pub max_retransmits: Option<u16>,
}

impl ChannelOptions {
    /// Ordered, fully reliable
    #[must_use]
    pub const fn reliable() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }

    /// Unordered, no retransmissions
    #[must_use]
    pub const fn unreliable() -> Self {
        Self {
            ordered: false,
            max_retransmits: Some(0),
        }
    }
}

/// Events of one data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel is ready to send
    Open,
    /// Message received
    Message(Vec<u8>),
    /// Channel reported an error
    Error(String),
    /// Channel closed
    Close,
}

/// Named data channel
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Whether the channel is open
    fn is_open(&self) -> bool;

    /// Send one message
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not open.
    fn send(&self, data: &[u8]) -> TransportResult<()>;

    /// Close the channel
    fn close(&self);
}

/// A data channel together with its event stream
pub struct ChannelHandle {
    /// The channel
    pub channel: Arc<dyn DataChannel>,
    /// Its events
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("label", &self.channel.label())
            .finish_non_exhaustive()
    }
}

/// Events of one peer transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A local candidate was gathered; `None` marks the end of gathering
    LocalCandidate(Option<IceCandidate>),
    /// Connection state changed
    ConnectionStateChanged(ConnectionState),
    /// The transport needs a (re)negotiation, typically after the first
    /// data channel was created
    NegotiationNeeded,
    /// The remote opened a data channel
    IncomingChannel(ChannelHandle),
}

/// Peer-to-peer connection primitive
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Generate an offer
    async fn create_offer(&self) -> TransportResult<SessionDescription>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> TransportResult<SessionDescription>;

    /// Apply a local description and start gathering candidates
    async fn set_local_description(&self, description: &SessionDescription) -> TransportResult<()>;

    /// Apply the remote description
    async fn set_remote_description(&self, description: &SessionDescription)
    -> TransportResult<()>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> TransportResult<()>;

    /// Current local description, including candidates gathered so far
    fn local_description(&self) -> Option<SessionDescription>;

    /// Whether the remote accepts incrementally delivered candidates.
    /// `None` when unknown.
    fn can_trickle_ice_candidates(&self) -> Option<bool>;

    /// Create a data channel
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is closed.
    fn create_data_channel(&self, label: &str, options: ChannelOptions)
    -> TransportResult<ChannelHandle>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Close the connection
    fn close(&self);
}

/// A peer transport together with its event stream
pub struct TransportHandle {
    /// The transport
    pub transport: Arc<dyn PeerTransport>,
    /// Its events
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle").finish_non_exhaustive()
    }
}

/// Creates peer transports
pub trait TransportFactory: Send + Sync {
    /// Create a new peer transport
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be created.
    fn create(&self, config: &RtcConfig) -> TransportResult<TransportHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_options() {
        assert!(ChannelOptions::reliable().ordered);
        assert_eq!(ChannelOptions::reliable().max_retransmits, None);
        assert!(!ChannelOptions::unreliable().ordered);
        assert_eq!(ChannelOptions::unreliable().max_retransmits, Some(0));
    }

    #[test]
    fn test_rtc_config_default_stun() {
        let config = RtcConfig::default_stun();
        assert_eq!(config.ice_servers.len(), DEFAULT_STUN_SERVERS.len());
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
    }

    #[test]
    fn test_rtc_config_from_urls() {
        let config = RtcConfig::with_stun_servers(["stun:a:3478", "stun:b:3478"]);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].urls, vec!["stun:b:3478".to_string()]);
    }
}

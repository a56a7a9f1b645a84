//! # Parley Broker
//!
//! Client side of the Parley relay protocol.
//!
//! A [`Broker`] holds one relay connection, learns its alias from the relay,
//! and offers three requests on top of it: advertise this peer as a host
//! ([`Broker::listen`]), list advertised hosts
//! ([`Broker::request_server_list`]) and open a sub-connection to a host
//! ([`Broker::connect`]). Every sub-connection is an [`RtcSocket`] that
//! negotiates a direct peer connection through the relay and then carries
//! application data over a reliable and an unreliable data channel.
//!
//! The peer connection itself is supplied by a [`TransportFactory`]. The
//! [`loopback`] module provides an in-process one.
//!
//! ## Example
//!
//! ```rust,no_run
//! use parley_broker::{BrokerConfig, ListenOptions, RemoteBroker, loopback::LoopbackFactory};
//! use std::sync::Arc;
//!
//! # async fn example() -> parley_broker::Result<()> {
//! let factory = Arc::new(LoopbackFactory::new());
//! let host = RemoteBroker::connect("ws://127.0.0.1:3000/", factory.clone(), BrokerConfig::default()).await?;
//! let alias = host.broker().wait_identified().await?;
//! host.broker()
//!     .listen(ListenOptions::default(), |socket| {
//!         tracing::info!(remote = ?socket.remote_socket_id(), "accepted");
//!     })
//!     .await?;
//!
//! let guest = RemoteBroker::connect("ws://127.0.0.1:3000/", factory, BrokerConfig::default()).await?;
//! guest.broker().wait_identified().await?;
//! let socket = guest.broker().connect(&alias).await?;
//! socket.wait_connected().await?;
//! socket.send(b"hello", true)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod error;
pub mod link;
pub mod loopback;
pub mod nat;
pub mod policy;
pub mod remote;
pub mod socket;
pub mod transport;

#[cfg(test)]
mod testing;

pub use broker::{Broker, BrokerConfig, BrokerState, ListenOptions};
pub use error::{BrokerError, NatError, Result, TransportError, TransportResult};
pub use link::{BrokerLink, ChannelLink};
pub use nat::{NatDetection, NatType, SLOW_ICE_TIMEOUT, detect_nat};
pub use policy::GatheringPolicy;
pub use remote::RemoteBroker;
pub use socket::{NegotiationState, RELIABLE_CHANNEL, RtcSocket, UNRELIABLE_CHANNEL};
pub use transport::{
    ChannelEvent, ChannelHandle, ChannelOptions, ConnectionState, DataChannel, IceServer,
    PeerTransport, RtcConfig, TransportEvent, TransportFactory, TransportHandle,
};

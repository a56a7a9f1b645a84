//! # Parley Protocol
//!
//! Wire protocol shared by the Parley relay and its clients.
//!
//! A single persistent duplex connection links every peer to the relay. Each
//! binary frame on that connection carries exactly one [`BrokerMessage`].
//!
//! This crate provides:
//! - The [`BrokerMessage`] sum type and its bincode codec
//! - Host advertisement records ([`ServerData`])
//! - Negotiation payloads carried opaquely by the relay
//!   ([`SessionDescription`], [`IceCandidate`])
//! - Alias and socket-id helpers used for routing
//!
//! ## Example
//!
//! ```rust
//! use parley_proto::{BrokerMessage, alias_prefix, socket_id};
//!
//! let sender = socket_id("PABC", 11);
//! assert_eq!(sender, "PABC|b");
//! assert_eq!(alias_prefix(&sender), "PABC");
//!
//! let syn = BrokerMessage::ServerSyn {
//!     sender,
//!     server_alias: "PXYZ".to_string(),
//! };
//! let bytes = syn.to_bytes().unwrap();
//! assert_eq!(BrokerMessage::from_bytes(&bytes).unwrap(), syn);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod ident;
pub mod message;
pub mod negotiation;

pub use error::{ProtoError, Result};
pub use ident::{ALIAS_PREFIX, SOCKET_ID_SEPARATOR, alias_prefix, generate_alias, socket_id};
pub use message::{BrokerMessage, NegotiationKind, ServerData, WebRtcMessage};
pub use negotiation::{IceCandidate, SdpType, SessionDescription};

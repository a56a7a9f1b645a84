//! # Parley Relay
//!
//! Rendezvous relay for peers that cannot reach each other directly.
//!
//! The relay assigns every accepted connection an alias, keeps a registry of
//! live connections and advertised hosts, and routes handshake and
//! negotiation messages by alias. It never interprets negotiation payloads
//! and never carries application data once peers are connected.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────┐
//!                    │        Relay         │
//!                    │  peers: alias → tx   │
//!                    │  hosts: alias → Host │
//!                    └──────────┬───────────┘
//!              WebSocket        │        WebSocket
//!              ┌────────────────┴────────────────┐
//!              ▼                                  ▼
//!       ┌─────────────┐                    ┌─────────────┐
//!       │   Peer X    │ ── SYN / SDP ───▶  │   Peer Y    │
//!       │  (listens)  │ ◀── SYN-ACK / ICE ─│ (connects)  │
//!       └─────────────┘                    └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use parley_relay::RelayServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = RelayServer::bind("0.0.0.0:3000".parse()?).await?;
//! println!("relay on {}", server.local_addr()?);
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod registry;
pub mod relay;
pub mod server;

pub use error::{RelayError, Result};
pub use registry::{Host, Registry};
pub use relay::{PeerSession, Relay, RelayConfig};
pub use server::RelayServer;

/// Delay between accepting a connection and pushing its `Welcome`
pub const WELCOME_DELAY: std::time::Duration = std::time::Duration::from_millis(16);

/// Default maximum number of concurrently connected peers
pub const DEFAULT_MAX_PEERS: usize = 10_000;

//! Relay links.
//!
//! A [`BrokerLink`] carries outbound messages to the relay. Inbound messages
//! are fed to [`Broker::handle_message`](crate::Broker::handle_message) by
//! whoever owns the receiving side.

use crate::error::{BrokerError, Result};
use parley_proto::BrokerMessage;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound half of a relay connection
pub trait BrokerLink: Send + Sync {
    /// Queue a message for the relay. Must not block.
    ///
    /// Called with the broker's state locked, so it must not call back into
    /// the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is closed or the message cannot be encoded.
    fn send(&self, msg: &BrokerMessage) -> Result<()>;

    /// Whether the link is still usable
    fn is_open(&self) -> bool {
        true
    }
}

/// In-process link delivering decoded messages to a channel
#[derive(Debug, Clone)]
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

impl ChannelLink {
    /// Create a link and the receiver of everything sent through it
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl BrokerLink for ChannelLink {
    fn send(&self, msg: &BrokerMessage) -> Result<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| BrokerError::Disconnected)
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

//! Connection and host registry.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_proto::ServerData;
use std::collections::HashSet;
use tokio::sync::mpsc;

/// Outbound frame queue of one relay connection
pub type FrameSender = mpsc::UnboundedSender<Vec<u8>>;

/// Registered host
#[derive(Debug)]
pub struct Host {
    /// Advertisement, with `alias` stamped by the relay
    pub data: ServerData,
    /// Queue of the host's relay connection
    pub tx: FrameSender,
    /// Socket ids that sent a syn to this host
    pub clients: HashSet<String>,
}

/// Live connections and registered hosts, keyed by alias
///
/// A host entry exists only while the connection with the same alias is live,
/// and each alias has at most one host entry.
#[derive(Debug, Default)]
pub struct Registry {
    peers: DashMap<String, FrameSender>,
    hosts: DashMap<String, Host>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns false if the alias is taken.
    pub fn insert_peer(&self, alias: &str, tx: FrameSender) -> bool {
        match self.peers.entry(alias.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(tx);
                true
            }
        }
    }

    /// Queue of a live connection
    #[must_use]
    pub fn peer(&self, alias: &str) -> Option<FrameSender> {
        self.peers.get(alias).map(|tx| tx.clone())
    }

    /// Register a host for a live connection
    ///
    /// Returns false if the connection is unknown or already hosting.
    pub fn insert_host(&self, data: ServerData) -> bool {
        let Some(tx) = self.peer(&data.alias) else {
            return false;
        };
        match self.hosts.entry(data.alias.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Host {
                    data,
                    tx,
                    clients: HashSet::new(),
                });
                true
            }
        }
    }

    /// Whether `alias` has a host entry
    #[must_use]
    pub fn is_host(&self, alias: &str) -> bool {
        self.hosts.contains_key(alias)
    }

    /// Queue of a host, recording `client` as a syn sender
    #[must_use]
    pub fn host_for_syn(&self, alias: &str, client: &str) -> Option<FrameSender> {
        let mut host = self.hosts.get_mut(alias)?;
        host.clients.insert(client.to_string());
        Some(host.tx.clone())
    }

    /// Snapshot of every host advertisement
    #[must_use]
    pub fn hosts(&self) -> Vec<ServerData> {
        self.hosts.iter().map(|host| host.data.clone()).collect()
    }

    /// Socket ids that sent a syn to the given host
    #[must_use]
    pub fn host_clients(&self, alias: &str) -> Option<HashSet<String>> {
        self.hosts.get(alias).map(|host| host.clients.clone())
    }

    /// Drop a connection and its host entry. Returns true if the peer existed.
    pub fn remove(&self, alias: &str) -> bool {
        let removed = self.peers.remove(alias).is_some();
        self.hosts.remove(alias);
        removed
    }

    /// Number of live connections
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of registered hosts
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

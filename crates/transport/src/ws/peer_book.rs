//! Two-way lookup between socket addresses and peer identities

use crate::error::{Error, Result};
use crate::peer_info::{PeerId, PeerInfo};
use std::collections::HashMap;

/// Addresses are the primary key: a socket is known by its address before
/// the peer behind it has identified itself.
#[derive(Debug, Default)]
pub struct PeerBook {
    id_to_address: HashMap<PeerId, String>,
    address_to_info: HashMap<String, PeerInfo>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer_info` at `address`, replacing stale entries for either
    pub fn add(&mut self, address: &str, peer_info: PeerInfo) {
        if let Some(previous) = self.address_to_info.remove(address) {
            self.id_to_address.remove(&previous.peer_id);
        }
        if let Some(previous_address) = self.id_to_address.remove(&peer_info.peer_id) {
            self.address_to_info.remove(&previous_address);
        }
        self.id_to_address
            .insert(peer_info.peer_id.clone(), address.to_string());
        self.address_to_info.insert(address.to_string(), peer_info);
    }

    pub fn remove_by_address(&mut self, address: &str) -> Option<PeerInfo> {
        let peer_info = self.address_to_info.remove(address)?;
        self.id_to_address.remove(&peer_info.peer_id);
        Some(peer_info)
    }

    pub fn address_of(&self, peer_id: &str) -> Result<&str> {
        self.id_to_address
            .get(peer_id)
            .map(String::as_str)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))
    }

    pub fn get_peer_info(&self, address: &str) -> Option<&PeerInfo> {
        self.address_to_info.get(address)
    }

    pub fn get_peer_id(&self, address: &str) -> Option<&str> {
        self.address_to_info
            .get(address)
            .map(|info| info.peer_id.as_str())
    }

    pub fn has_peer_id(&self, peer_id: &str) -> bool {
        self.id_to_address.contains_key(peer_id)
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.address_to_info.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.address_to_info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.address_to_info.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_both_ways() {
        let mut book = PeerBook::new();
        book.add("ws://a:1", PeerInfo::new_node("node-a"));

        assert_eq!(book.address_of("node-a").unwrap(), "ws://a:1");
        assert_eq!(book.get_peer_id("ws://a:1"), Some("node-a"));
        assert!(book.has_peer_id("node-a"));
        assert!(matches!(
            book.address_of("node-b"),
            Err(Error::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_peer_moving_address_leaves_no_stale_entry() {
        let mut book = PeerBook::new();
        book.add("ws://a:1", PeerInfo::new_node("node-a"));
        book.add("ws://a:2", PeerInfo::new_node("node-a"));

        assert_eq!(book.len(), 1);
        assert!(!book.has_address("ws://a:1"));
        assert_eq!(book.address_of("node-a").unwrap(), "ws://a:2");
    }

    #[test]
    fn test_remove_by_address() {
        let mut book = PeerBook::new();
        book.add("ws://a:1", PeerInfo::new_node("node-a"));

        let removed = book.remove_by_address("ws://a:1").unwrap();
        assert_eq!(removed.peer_id, "node-a");
        assert!(book.is_empty());
        assert!(!book.has_peer_id("node-a"));
        assert!(book.remove_by_address("ws://a:1").is_none());
    }
}

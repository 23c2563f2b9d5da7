//! Identity of the remote end of a connection

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical peer identity
pub type PeerId = String;

/// Control layer protocol versions this node speaks
pub const DEFAULT_CONTROL_LAYER_VERSIONS: &[u32] = &[2];

/// Message layer protocol versions this node speaks
pub const DEFAULT_MESSAGE_LAYER_VERSIONS: &[u32] = &[32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    Node,
    Tracker,
    Unknown,
}

impl PeerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerType::Node => "node",
            PeerType::Tracker => "tracker",
            PeerType::Unknown => "unknown",
        }
    }
}

impl From<&str> for PeerType {
    fn from(value: &str) -> Self {
        match value {
            "node" => PeerType::Node,
            "tracker" => PeerType::Tracker,
            _ => PeerType::Unknown,
        }
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the remote end of a connection.
///
/// Connections created before a handshake or signalling message arrives
/// carry an `Unknown` placeholder which is replaced by the verified value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub peer_type: PeerType,
    pub control_layer_versions: Vec<u32>,
    pub message_layer_versions: Vec<u32>,
}

impl PeerInfo {
    pub fn new(
        peer_id: impl Into<PeerId>,
        peer_type: PeerType,
        control_layer_versions: Vec<u32>,
        message_layer_versions: Vec<u32>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_type,
            control_layer_versions,
            message_layer_versions,
        }
    }

    pub fn new_node(peer_id: impl Into<PeerId>) -> Self {
        Self::new(
            peer_id,
            PeerType::Node,
            DEFAULT_CONTROL_LAYER_VERSIONS.to_vec(),
            DEFAULT_MESSAGE_LAYER_VERSIONS.to_vec(),
        )
    }

    pub fn new_tracker(peer_id: impl Into<PeerId>) -> Self {
        Self::new(
            peer_id,
            PeerType::Tracker,
            DEFAULT_CONTROL_LAYER_VERSIONS.to_vec(),
            DEFAULT_MESSAGE_LAYER_VERSIONS.to_vec(),
        )
    }

    pub fn new_unknown(peer_id: impl Into<PeerId>) -> Self {
        Self::new(peer_id, PeerType::Unknown, Vec::new(), Vec::new())
    }

    pub fn is_node(&self) -> bool {
        self.peer_type == PeerType::Node
    }

    pub fn is_tracker(&self) -> bool {
        self.peer_type == PeerType::Tracker
    }

    pub fn is_unknown(&self) -> bool {
        self.peer_type == PeerType::Unknown
    }

    /// Highest control layer version both sides support
    pub fn negotiated_control_layer_version(&self, other: &PeerInfo) -> Option<u32> {
        highest_common(&self.control_layer_versions, &other.control_layer_versions)
    }

    /// Highest message layer version both sides support
    pub fn negotiated_message_layer_version(&self, other: &PeerInfo) -> Option<u32> {
        highest_common(&self.message_layer_versions, &other.message_layer_versions)
    }

    /// True when both layers have at least one version in common
    pub fn shares_protocol_with(&self, other: &PeerInfo) -> bool {
        self.negotiated_control_layer_version(other).is_some()
            && self.negotiated_message_layer_version(other).is_some()
    }
}

fn highest_common(ours: &[u32], theirs: &[u32]) -> Option<u32> {
    ours.iter().filter(|v| theirs.contains(v)).max().copied()
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.peer_id, self.peer_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_type_parse() {
        assert_eq!(PeerType::from("node"), PeerType::Node);
        assert_eq!(PeerType::from("tracker"), PeerType::Tracker);
        assert_eq!(PeerType::from("storage"), PeerType::Unknown);
    }

    #[test]
    fn test_version_negotiation() {
        let ours = PeerInfo::new("a", PeerType::Node, vec![1, 2], vec![31, 32]);
        let theirs = PeerInfo::new("b", PeerType::Node, vec![2, 3], vec![30, 31]);
        assert_eq!(ours.negotiated_control_layer_version(&theirs), Some(2));
        assert_eq!(ours.negotiated_message_layer_version(&theirs), Some(31));
        assert!(ours.shares_protocol_with(&theirs));

        let unknown = PeerInfo::new_unknown("c");
        assert!(!ours.shares_protocol_with(&unknown));
    }

    #[test]
    fn test_display() {
        assert_eq!(PeerInfo::new_tracker("t1").to_string(), "t1<tracker>");
    }
}

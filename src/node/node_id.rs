use bincode::{Decode, Encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Identifies a node within a flock. Monikers are compared to decide "is this me",
/// the address is where packets for the node go, and the horde is an
/// administrative label learned through gossip.
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash, Encode, Decode,
)]
pub struct NodeId {
    pub moniker: String,
    pub addr: String,
    pub horde: String,
}

impl NodeId {
    pub fn new(moniker: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            moniker: moniker.into(),
            addr: addr.into(),
            horde: String::new(),
        }
    }

    /// A node known only by its address, as produced by probing.
    pub fn from_addr(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self::new(addr.clone(), addr)
    }

    pub fn with_horde(mut self, horde: impl Into<String>) -> Self {
        self.horde = horde.into();
        self
    }

    pub fn is_same(&self, other: &NodeId) -> bool {
        self.moniker == other.moniker
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.moniker)
    }
}

/// A fresh flock name: an underscore followed by 128 random bits in hex.
pub fn flock_name() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flock_names_are_unique() {
        let a = flock_name();
        let b = flock_name();
        assert_ne!(a, b);
        assert!(a.starts_with('_'));
        assert_eq!(a.len(), 33);
    }

    #[test]
    fn test_same_node_by_moniker() {
        let a = NodeId::new("alpha", "10.0.0.1");
        let b = NodeId::new("alpha", "10.0.0.9").with_horde("blue");
        assert!(a.is_same(&b));
        assert!(!a.is_same(&NodeId::from_addr("10.0.0.1")));
        assert_eq!(b.to_string(), "alpha");
    }
}

use std::net::SocketAddr;
use std::sync::RwLock;
use tracing::debug;

/// Thread-safe set of known remote endpoints, kept in connection order for broadcast
///  addressing. Read-mostly: broadcast iteration works on a snapshot, so connect and
///  disconnect churn only holds the write lock for the mutation itself.
pub struct PeerRegistry {
    peers: RwLock<Vec<SocketAddr>>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        PeerRegistry {
            peers: RwLock::new(Vec::new()),
        }
    }

    /// Adds a peer; duplicates are ignored.
    pub fn add(&self, peer: SocketAddr) {
        let mut peers = self.peers.write().unwrap();
        if !peers.contains(&peer) {
            debug!("peer {:?} joined", peer);
            peers.push(peer);
        }
    }

    pub fn remove(&self, peer: &SocketAddr) -> bool {
        let mut peers = self.peers.write().unwrap();
        if let Some(position) = peers.iter().position(|p| p == peer) {
            debug!("peer {:?} left", peer);
            peers.remove(position);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.peers.read().unwrap().contains(peer)
    }

    /// Snapshot of the peer set in connection order - never a torn read.
    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.peers.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_remove_snapshot() {
        let peers = PeerRegistry::new();
        peers.add(addr(1));
        peers.add(addr(2));
        peers.add(addr(3));

        assert_eq!(peers.snapshot(), vec![addr(1), addr(2), addr(3)]);
        assert!(peers.contains(&addr(2)));

        assert!(peers.remove(&addr(2)));
        assert!(!peers.remove(&addr(2)));
        assert_eq!(peers.snapshot(), vec![addr(1), addr(3)]);
    }

    #[test]
    fn test_duplicate_add_is_ignored() {
        let peers = PeerRegistry::new();
        peers.add(addr(1));
        peers.add(addr(1));
        assert_eq!(peers.len(), 1);
    }
}

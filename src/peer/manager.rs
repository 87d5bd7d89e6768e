//! Peer manager (§4.10): owns every connected peer across all
//! torrents, deduplicates, enforces connection caps, and fans wire
//! events into per-torrent channels.
use super::{message::Message, DisconnectReason, PeerKey};
use crate::metainfo::InfoHash;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Upward events (§4.10). `peer_bitfield`/`peer_have` carry enough to
/// update the piece manager's per-peer view without it touching the
/// wire layer directly.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    PeerConnected { key: PeerKey },
    PeerDisconnected { key: PeerKey, reason: DisconnectReason },
    PeerBitfield { key: PeerKey, bitfield: crate::peer::Bitfield },
    PeerHave { key: PeerKey, piece_index: u32 },
    PeerChoked { key: PeerKey },
    PeerUnchoked { key: PeerKey },
    PeerInterested { key: PeerKey },
    PeerNotInterested { key: PeerKey },
    PieceReceived { key: PeerKey, block: super::message::Block },
    RequestReceived { key: PeerKey, request: super::message::BlockRequest },
    PexPeers { key: PeerKey, peers: Vec<(SocketAddr, u8)> },
}

pub struct PeerHandle {
    pub outbound: mpsc::UnboundedSender<Message>,
    pub addr: SocketAddr,
}

pub struct PeerManager {
    max_connections: usize,
    max_connections_per_torrent: usize,
    peers: HashMap<PeerKey, PeerHandle>,
    per_torrent_count: HashMap<InfoHash, usize>,
    per_torrent_channels: HashMap<InfoHash, mpsc::UnboundedSender<PeerEvent>>,
}

impl PeerManager {
    pub fn new(max_connections: usize, max_connections_per_torrent: usize) -> Self {
        Self {
            max_connections,
            max_connections_per_torrent,
            peers: HashMap::new(),
            per_torrent_count: HashMap::new(),
            per_torrent_channels: HashMap::new(),
        }
    }

    pub fn register_torrent(&mut self, info_hash: InfoHash, events: mpsc::UnboundedSender<PeerEvent>) {
        self.per_torrent_channels.insert(info_hash, events);
        self.per_torrent_count.entry(info_hash).or_insert(0);
    }

    pub fn unregister_torrent(&mut self, info_hash: &InfoHash) {
        self.per_torrent_channels.remove(info_hash);
        self.per_torrent_count.remove(info_hash);
        self.peers.retain(|key, _| key.info_hash != *info_hash);
    }

    pub fn connected_keys(&self) -> HashSet<PeerKey> {
        self.peers.keys().copied().collect()
    }

    /// Admission check only — doesn't register the peer, since that
    /// happens once the handshake actually succeeds.
    pub fn can_accept(&self, key: &PeerKey) -> bool {
        if self.peers.contains_key(key) {
            return false;
        }
        if self.peers.len() >= self.max_connections {
            return false;
        }
        let per_torrent = self.per_torrent_count.get(&key.info_hash).copied().unwrap_or(0);
        per_torrent < self.max_connections_per_torrent
    }

    pub fn insert(&mut self, key: PeerKey, handle: PeerHandle) {
        *self.per_torrent_count.entry(key.info_hash).or_insert(0) += 1;
        self.peers.insert(key, handle);
        self.emit(key.info_hash, PeerEvent::PeerConnected { key });
    }

    pub fn remove(&mut self, key: &PeerKey, reason: DisconnectReason) {
        if self.peers.remove(key).is_some() {
            if let Some(count) = self.per_torrent_count.get_mut(&key.info_hash) {
                *count = count.saturating_sub(1);
            }
            self.emit(key.info_hash, PeerEvent::PeerDisconnected { key: *key, reason });
        }
    }

    pub fn handle(&self, key: &PeerKey) -> Option<&PeerHandle> {
        self.peers.get(key)
    }

    pub fn emit(&self, info_hash: InfoHash, event: PeerEvent) {
        if let Some(sender) = self.per_torrent_channels.get(&info_hash) {
            let _ = sender.send(event);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn key(info_hash: u8, port: u16) -> PeerKey {
        PeerKey { info_hash: InfoHash::from_bytes([info_hash; 20]), addr: addr(port) }
    }

    #[test]
    fn enforces_global_connection_cap() {
        let mut manager = PeerManager::new(1, 10);
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.insert(key(1, 1), PeerHandle { outbound: tx, addr: addr(1) });
        assert!(!manager.can_accept(&key(1, 2)));
    }

    #[test]
    fn enforces_per_torrent_cap_independent_of_global() {
        let mut manager = PeerManager::new(10, 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.insert(key(1, 1), PeerHandle { outbound: tx, addr: addr(1) });
        assert!(!manager.can_accept(&key(1, 2)));
        assert!(manager.can_accept(&key(2, 2)));
    }

    #[test]
    fn dedupes_by_info_hash_ip_port() {
        let manager = PeerManager::new(10, 10);
        assert_eq!(key(1, 1), key(1, 1));
        assert_ne!(key(1, 1), key(1, 2));
        let _ = manager;
    }

    #[test]
    fn remove_decrements_per_torrent_count() {
        let mut manager = PeerManager::new(10, 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.insert(key(1, 1), PeerHandle { outbound: tx, addr: addr(1) });
        manager.remove(&key(1, 1), DisconnectReason::Manual);
        assert!(manager.can_accept(&key(1, 2)));
    }
}

//! Piece manager (§4.11): rarest-first block selection, endgame,
//! verification against the piece hash, and stale-request reaping.
use crate::peer::bitfield::Bitfield;
use crate::peer::message::{Block, BlockRequest, BLOCK_SIZE};
use crate::peer::PeerKey;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub mod request;

pub use request::InFlightRequest;

/// §9 open question: below this many missing pieces, duplicate
/// requests across peers are allowed to race out the long tail.
pub const ENDGAME_THRESHOLD: usize = 20;
/// §9 open question: midpoint of BEP-3's suggested 4-16 depth range.
pub const MAX_IN_FLIGHT_PER_PEER: usize = 8;
pub const STALE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Same peer failing the same piece's hash this many times in a row
/// gets banned outright.
pub const REPEATED_FAILURE_BAN_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceEvent {
    PieceComplete { index: usize, data: Vec<u8> },
    PieceFailed { index: usize, offending_peers: Vec<PeerKey> },
    PeerBanned { peer: PeerKey },
}

struct PieceInProgress {
    buffer: Vec<u8>,
    received: HashSet<u32>,
    length: u32,
    contributors: HashMap<u32, PeerKey>,
}

impl PieceInProgress {
    fn new(length: u32) -> Self {
        Self { buffer: vec![0u8; length as usize], received: HashSet::new(), length, contributors: HashMap::new() }
    }

    fn is_full(&self) -> bool {
        let block_count = self.length.div_ceil(BLOCK_SIZE as u32);
        self.received.len() as u32 >= block_count
    }
}

pub struct PieceManager {
    piece_count: usize,
    piece_length: u32,
    total_length: u64,
    have: Bitfield,
    peer_bitfields: HashMap<PeerKey, Bitfield>,
    in_progress: HashMap<usize, PieceInProgress>,
    in_flight: Vec<InFlightRequest>,
    peer_failure_counts: HashMap<(PeerKey, usize), u32>,
    banned_peers: HashSet<PeerKey>,
}

impl PieceManager {
    pub fn new(piece_count: usize, piece_length: u32, total_length: u64, already_verified: HashSet<usize>) -> Self {
        let mut have = Bitfield::new(piece_count);
        for index in already_verified {
            have.set(index);
        }
        Self {
            piece_count,
            piece_length,
            total_length,
            have,
            peer_bitfields: HashMap::new(),
            in_progress: HashMap::new(),
            in_flight: Vec::new(),
            peer_failure_counts: HashMap::new(),
            banned_peers: HashSet::new(),
        }
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn is_complete(&self) -> bool {
        self.have.is_complete()
    }

    pub fn missing_count(&self) -> usize {
        self.piece_count - self.have.count_have()
    }

    pub fn is_endgame(&self) -> bool {
        self.missing_count() <= ENDGAME_THRESHOLD
    }

    pub fn update_peer_bitfield(&mut self, peer: PeerKey, bitfield: Bitfield) {
        self.peer_bitfields.insert(peer, bitfield);
    }

    pub fn update_peer_have(&mut self, peer: PeerKey, piece_index: usize) {
        self.peer_bitfields.entry(peer).or_insert_with(|| Bitfield::new(self.piece_count)).set(piece_index);
    }

    pub fn remove_peer(&mut self, peer: &PeerKey) {
        self.peer_bitfields.remove(peer);
        self.in_flight.retain(|r| &r.peer != peer);
    }

    fn piece_length_at(&self, index: usize) -> u32 {
        if index + 1 < self.piece_count {
            self.piece_length
        } else {
            let full = self.piece_length as u64 * (self.piece_count.saturating_sub(1)) as u64;
            (self.total_length - full) as u32
        }
    }

    /// Rarest-first selection among pieces the peer has and we're
    /// missing, bounded by the per-peer in-flight cap. Outside endgame,
    /// blocks already requested from someone else are skipped; inside
    /// endgame the same block may be requested again.
    pub fn get_block_requests(&mut self, peer: PeerKey) -> Vec<BlockRequest> {
        if self.banned_peers.contains(&peer) {
            return Vec::new();
        }
        let Some(peer_bitfield) = self.peer_bitfields.get(&peer) else { return Vec::new() };
        let already_in_flight = self.in_flight.iter().filter(|r| r.peer == peer).count();
        let mut budget = MAX_IN_FLIGHT_PER_PEER.saturating_sub(already_in_flight);
        if budget == 0 {
            return Vec::new();
        }

        let endgame = self.is_endgame();
        let candidates = self.rarest_first_candidates(peer_bitfield);

        let mut requests = Vec::new();
        for index in candidates {
            if budget == 0 {
                break;
            }
            let length = self.piece_length_at(index);
            let block_count = length.div_ceil(BLOCK_SIZE as u32);
            let received = self.in_progress.get(&index).map(|p| &p.received);
            for block_idx in 0..block_count {
                if budget == 0 {
                    break;
                }
                let begin = block_idx * BLOCK_SIZE as u32;
                if received.map(|r| r.contains(&begin)).unwrap_or(false) {
                    continue;
                }
                let already_requested_by_anyone = self.in_flight.iter().any(|r| r.index == index && r.begin == begin);
                let already_requested_by_this_peer =
                    self.in_flight.iter().any(|r| r.index == index && r.begin == begin && r.peer == peer);
                if already_requested_by_this_peer {
                    continue;
                }
                if already_requested_by_anyone && !endgame {
                    continue;
                }
                let req_length = (length - begin).min(BLOCK_SIZE as u32);
                self.in_flight.push(InFlightRequest { peer, index, begin, length: req_length, requested_at: Instant::now() });
                requests.push(BlockRequest { index: index as u32, begin, length: req_length });
                budget -= 1;
            }
        }
        requests
    }

    fn rarest_first_candidates(&self, peer_bitfield: &Bitfield) -> Vec<usize> {
        let missing: Vec<usize> = peer_bitfield.missing_from(&self.have);
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for index in &missing {
            let rarity = self.peer_bitfields.values().filter(|bf| bf.has(*index)).count();
            counts.insert(*index, rarity);
        }
        let mut ordered = missing;
        let mut rng = rand::rng();
        ordered.shuffle(&mut rng);
        ordered.sort_by_key(|index| counts.get(index).copied().unwrap_or(usize::MAX));
        ordered
    }

    /// Accumulate a received block; when a piece buffer is full, verify
    /// it against `piece_hash` and emit completion/failure. Also
    /// cancels duplicate in-flight requests to other peers for the
    /// same block (endgame losers).
    pub fn handle_block(&mut self, peer: PeerKey, block: Block, piece_hash: &[u8]) -> (Option<PieceEvent>, Vec<(PeerKey, BlockRequest)>) {
        let index = block.index as usize;
        self.in_flight.retain(|r| !(r.index == index && r.begin == block.begin && r.peer == peer));

        let mut cancels = Vec::new();
        for r in self.in_flight.iter().filter(|r| r.index == index && r.begin == block.begin) {
            cancels.push((r.peer, BlockRequest { index: block.index, begin: block.begin, length: r.length }));
        }
        self.in_flight.retain(|r| !(r.index == index && r.begin == block.begin));

        let length = self.piece_length_at(index);
        let entry = self.in_progress.entry(index).or_insert_with(|| PieceInProgress::new(length));
        let begin = block.begin as usize;
        if begin + block.data.len() <= entry.buffer.len() {
            entry.buffer[begin..begin + block.data.len()].copy_from_slice(&block.data);
        }
        entry.received.insert(block.begin);
        entry.contributors.insert(block.begin, peer);

        if !entry.is_full() {
            return (None, cancels);
        }

        let piece = self.in_progress.remove(&index).unwrap();
        let digest = Sha1::digest(&piece.buffer);
        if digest.as_slice() == piece_hash {
            self.have.set(index);
            (Some(PieceEvent::PieceComplete { index, data: piece.buffer }), cancels)
        } else {
            let offenders: Vec<PeerKey> = piece.contributors.values().copied().collect();
            for &offender in &offenders {
                let count = self.peer_failure_counts.entry((offender, index)).or_insert(0);
                *count += 1;
                if *count >= REPEATED_FAILURE_BAN_THRESHOLD {
                    self.banned_peers.insert(offender);
                }
            }
            (Some(PieceEvent::PieceFailed { index, offending_peers: offenders }), cancels)
        }
    }

    /// Reap any request older than [`STALE_REQUEST_TIMEOUT`], returning
    /// it to the pool for re-selection on the next tick.
    pub fn reap_stale_requests(&mut self) -> usize {
        let before = self.in_flight.len();
        let now = Instant::now();
        self.in_flight.retain(|r| now.duration_since(r.requested_at) < STALE_REQUEST_TIMEOUT);
        before - self.in_flight.len()
    }

    pub fn is_banned(&self, peer: &PeerKey) -> bool {
        self.banned_peers.contains(peer)
    }

    /// Whether `peer` has at least one piece we're still missing.
    pub fn is_interesting(&self, peer: &PeerKey) -> bool {
        self.peer_bitfields.get(peer).map(|bf| !bf.missing_from(&self.have).is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::InfoHash;

    fn peer(n: u8) -> PeerKey {
        let addr = std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, n)), 6881);
        PeerKey { info_hash: InfoHash::from_bytes([1; 20]), addr }
    }

    #[test]
    fn endgame_threshold_flips_at_missing_count() {
        let manager = PieceManager::new(25, 16384, 25 * 16384, HashSet::new());
        assert!(!manager.is_endgame());
        let mut with_5_missing = HashSet::new();
        for i in 0..20 {
            with_5_missing.insert(i);
        }
        let manager = PieceManager::new(25, 16384, 25 * 16384, with_5_missing);
        assert!(manager.is_endgame());
    }

    #[test]
    fn single_block_piece_completes_on_hash_match() {
        let data = vec![7u8; 16384];
        let hash = Sha1::digest(&data);
        let mut manager = PieceManager::new(1, 16384, 16384, HashSet::new());
        let p = peer(1);
        let (event, cancels) = manager.handle_block(p, Block { index: 0, begin: 0, data: data.clone() }, &hash);
        assert!(cancels.is_empty());
        assert_eq!(event, Some(PieceEvent::PieceComplete { index: 0, data }));
        assert!(manager.have.has(0));
    }

    #[test]
    fn mismatched_hash_emits_failure_and_tracks_offender() {
        let data = vec![7u8; 16384];
        let wrong_hash = [0u8; 20];
        let mut manager = PieceManager::new(1, 16384, 16384, HashSet::new());
        let p = peer(1);
        let (event, _) = manager.handle_block(p, Block { index: 0, begin: 0, data }, &wrong_hash);
        assert!(matches!(event, Some(PieceEvent::PieceFailed { offending_peers, .. }) if offending_peers == vec![p]));
    }
}

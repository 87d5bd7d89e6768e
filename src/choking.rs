//! Choking algorithm (§4.12, BEP-3): regular rounds every 10 s pick the
//! top 4 peers by rate, optimistic rounds every 3rd regular tick
//! unchoke one extra random interested peer, and anti-snubbing drops a
//! peer from consideration once it goes 60 s without sending anything.
use crate::peer::PeerKey;
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub const REGULAR_ROUND_INTERVAL: Duration = Duration::from_secs(10);
pub const OPTIMISTIC_EVERY_N_ROUNDS: u32 = 3;
pub const UNCHOKE_SLOTS: usize = 4;
pub const SNUB_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Downloading,
    Seeding,
}

#[derive(Default, Clone)]
struct PeerState {
    interested: bool,
    rate: f64,
    last_activity: Option<Instant>,
}

pub struct ChokingAlgorithm {
    mode: Mode,
    round_count: u32,
    peers: HashMap<PeerKey, PeerState>,
    unchoked: HashSet<PeerKey>,
    snubbed: HashSet<PeerKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChokingDecision {
    pub newly_unchoked: Vec<PeerKey>,
    pub newly_choked: Vec<PeerKey>,
}

impl ChokingAlgorithm {
    pub fn new(mode: Mode) -> Self {
        Self { mode, round_count: 0, peers: HashMap::new(), unchoked: HashSet::new(), snubbed: HashSet::new() }
    }

    /// Switch rate-interpretation mode in place (download-rate-to-us vs
    /// upload-rate-from-us) without discarding per-peer interest,
    /// unchoke, or snub state — used when a session transitions from
    /// `Downloading` to `Seeding` mid-flight (§4.14).
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn set_interested(&mut self, peer: PeerKey, interested: bool) {
        self.peers.entry(peer).or_default().interested = interested;
    }

    /// `rate` is rolling download-rate-to-us (downloading) or
    /// upload-rate-from-us (seeding), bytes/sec.
    pub fn update_rate(&mut self, peer: PeerKey, rate: f64) {
        self.peers.entry(peer).or_default().rate = rate;
    }

    /// Call whenever any data arrives from this peer, to reset its
    /// snub clock.
    pub fn record_activity(&mut self, peer: PeerKey) {
        let state = self.peers.entry(peer).or_default();
        state.last_activity = Some(Instant::now());
        self.snubbed.remove(&peer);
    }

    pub fn remove_peer(&mut self, peer: &PeerKey) {
        self.peers.remove(peer);
        self.unchoked.remove(peer);
        self.snubbed.remove(peer);
    }

    /// Mark peers unchoked since the last tick as snubbed if they've
    /// sent nothing for [`SNUB_TIMEOUT`].
    fn refresh_snubbed(&mut self) {
        let now = Instant::now();
        for peer in &self.unchoked {
            if let Some(state) = self.peers.get(peer) {
                let idle = state.last_activity.map(|t| now.duration_since(t)).unwrap_or(Duration::MAX);
                if idle >= SNUB_TIMEOUT {
                    self.snubbed.insert(*peer);
                }
            }
        }
    }

    /// Run one round (called every [`REGULAR_ROUND_INTERVAL`]).
    /// Returns the unchoke/choke delta to apply on the wire.
    pub fn run_round(&mut self) -> ChokingDecision {
        self.refresh_snubbed();
        self.round_count += 1;

        let mut eligible: Vec<PeerKey> = self
            .peers
            .iter()
            .filter(|(key, state)| state.interested && !self.snubbed.contains(*key))
            .map(|(key, _)| *key)
            .collect();
        eligible.sort_by(|a, b| {
            let ra = self.peers[a].rate;
            let rb = self.peers[b].rate;
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut chosen: HashSet<PeerKey> = eligible.into_iter().take(UNCHOKE_SLOTS).collect();

        if self.round_count % OPTIMISTIC_EVERY_N_ROUNDS == 0 {
            let candidates: Vec<PeerKey> = self
                .peers
                .iter()
                .filter(|(key, state)| state.interested && !chosen.contains(*key) && !self.snubbed.contains(*key))
                .map(|(key, _)| *key)
                .collect();
            let mut rng = rand::rng();
            if let Some(lucky) = candidates.into_iter().choose(&mut rng) {
                chosen.insert(lucky);
            }
        }

        let newly_unchoked: Vec<PeerKey> = chosen.difference(&self.unchoked).copied().collect();
        let newly_choked: Vec<PeerKey> = self.unchoked.difference(&chosen).copied().collect();
        self.unchoked = chosen;

        ChokingDecision { newly_unchoked, newly_choked }
    }

    pub fn is_unchoked(&self, peer: &PeerKey) -> bool {
        self.unchoked.contains(peer)
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
    fn regular_round_picks_top_four_by_rate() {
        let mut algo = ChokingAlgorithm::new(Mode::Downloading);
        for i in 1..=6u8 {
            algo.set_interested(peer(i), true);
            algo.update_rate(peer(i), i as f64 * 100.0);
        }
        let decision = algo.run_round();
        assert_eq!(decision.newly_unchoked.len(), 4);
        for i in 3..=6u8 {
            assert!(algo.is_unchoked(&peer(i)));
        }
    }

    #[test]
    fn uninterested_peers_are_never_chosen() {
        let mut algo = ChokingAlgorithm::new(Mode::Downloading);
        algo.set_interested(peer(1), false);
        algo.update_rate(peer(1), 1000.0);
        let decision = algo.run_round();
        assert!(decision.newly_unchoked.is_empty());
    }

    #[test]
    fn third_round_adds_one_optimistic_unchoke() {
        let mut algo = ChokingAlgorithm::new(Mode::Downloading);
        for i in 1..=5u8 {
            algo.set_interested(peer(i), true);
            algo.update_rate(peer(i), (6 - i) as f64);
        }
        algo.run_round();
        algo.run_round();
        let decision = algo.run_round();
        assert_eq!(algo.unchoked.len(), UNCHOKE_SLOTS + 1);
        assert_eq!(decision.newly_unchoked.len(), 1);
    }

    #[test]
    fn snubbed_peer_excluded_until_activity_resumes() {
        let mut algo = ChokingAlgorithm::new(Mode::Downloading);
        algo.set_interested(peer(1), true);
        algo.update_rate(peer(1), 500.0);
        algo.snubbed.insert(peer(1));
        let decision = algo.run_round();
        assert!(decision.newly_unchoked.is_empty());
        algo.record_activity(peer(1));
        let decision = algo.run_round();
        assert!(decision.newly_unchoked.contains(&peer(1)));
    }

    #[test]
    fn set_mode_preserves_existing_unchoke_state() {
        let mut algo = ChokingAlgorithm::new(Mode::Downloading);
        algo.set_interested(peer(1), true);
        algo.update_rate(peer(1), 500.0);
        let decision = algo.run_round();
        assert!(decision.newly_unchoked.contains(&peer(1)));

        algo.set_mode(Mode::Seeding);
        assert!(algo.is_unchoked(&peer(1)));
        let decision = algo.run_round();
        assert!(!decision.newly_unchoked.contains(&peer(1)));
        assert!(algo.is_unchoked(&peer(1)));
    }
}

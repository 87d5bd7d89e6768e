//! Session manager (§4.15): holds every session, enforces
//! `max_active_torrents` with a FIFO queue, starts the next queued
//! torrent whenever an active one leaves the active states.
use super::{SessionState, TorrentSession};
use crate::metainfo::InfoHash;
use std::collections::{HashMap, VecDeque};

pub struct SessionManager {
    max_active_torrents: usize,
    sessions: HashMap<InfoHash, TorrentSession>,
    queue: VecDeque<InfoHash>,
}

impl SessionManager {
    pub fn new(max_active_torrents: usize) -> Self {
        Self { max_active_torrents, sessions: HashMap::new(), queue: VecDeque::new() }
    }

    fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    pub fn add_torrent(&mut self, session: TorrentSession) {
        let info_hash = session.info_hash;
        self.sessions.insert(info_hash, session);
        self.queue.push_back(info_hash);
    }

    pub fn remove_torrent(&mut self, info_hash: &InfoHash) {
        self.sessions.remove(info_hash);
        self.queue.retain(|id| id != info_hash);
    }

    /// §4.15: `start` is admission-controlled — if we're already at
    /// `max_active_torrents`, the request just stays queued.
    pub fn start(&mut self, info_hash: &InfoHash) -> bool {
        self.start_with(info_hash, |tiers| {
            let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
            crate::tracker::coordinator::Coordinator::new(tiers, tx)
        })
    }

    /// Same admission control as [`start`](Self::start), but lets the
    /// caller supply the tracker coordinator (e.g. one wired to an
    /// engine-wide tagged event forwarder instead of a throwaway
    /// channel).
    pub fn start_with<F>(&mut self, info_hash: &InfoHash, build_coordinator: F) -> bool
    where
        F: FnOnce(Vec<Vec<String>>) -> crate::tracker::coordinator::Coordinator,
    {
        if self.active_count() >= self.max_active_torrents {
            return false;
        }
        if let Some(session) = self.sessions.get_mut(info_hash) {
            match session.state {
                SessionState::Queued | SessionState::Checking => {
                    let coordinator = build_coordinator(session.metainfo.tiers());
                    session.start(coordinator);
                }
                SessionState::Paused => {
                    session.state =
                        if session.piece_manager.is_complete() { SessionState::Seeding } else { SessionState::Downloading };
                }
                _ => {}
            }
            self.queue.retain(|id| id != info_hash);
            true
        } else {
            false
        }
    }

    pub fn pause(&mut self, info_hash: &InfoHash) {
        if let Some(session) = self.sessions.get_mut(info_hash) {
            session.pause();
        }
    }

    /// Pop the next queued torrent with a free active slot, without
    /// starting it — the caller (the engine actor) finishes the
    /// promotion through its own `start_torrent`, which is what wires a
    /// freshly built `Coordinator` to the tagged tracker-event forwarder.
    /// Starting it here instead (as an earlier version did, via a private
    /// `start` that built its own throwaway, unforwarded event channel)
    /// would leave the promoted torrent's tracker announces going nowhere
    /// — it would never discover peers until manually started again.
    /// Called in a loop by the caller since more than one active slot can
    /// free up at once (§4.15).
    pub fn next_promotable(&mut self) -> Option<InfoHash> {
        while self.active_count() < self.max_active_torrents {
            let next = self.queue.pop_front()?;
            if self.sessions.contains_key(&next) {
                return Some(next);
            }
        }
        None
    }

    pub fn get_stats(&self, info_hash: &InfoHash) -> Option<(SessionState, u64, u64)> {
        self.sessions.get(info_hash).map(|s| (s.state, s.metrics.downloaded, s.metrics.uploaded))
    }

    pub fn get_all(&self) -> impl Iterator<Item = &TorrentSession> {
        self.sessions.values()
    }

    pub fn get_mut(&mut self, info_hash: &InfoHash) -> Option<&mut TorrentSession> {
        self.sessions.get_mut(info_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use crate::metainfo::Metainfo;
    use sha1::{Digest, Sha1};
    use std::collections::BTreeMap;

    fn sample_session(name: &str) -> TorrentSession {
        let data = vec![0u8; 16384];
        let hash = Sha1::digest(&data);
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::string(name));
        info.insert(b"piece length".to_vec(), Value::integer(16384));
        info.insert(b"pieces".to_vec(), Value::ByteString(hash.to_vec()));
        info.insert(b"length".to_vec(), Value::integer(16384));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dictionary(info));
        let bytes = bencode::encode(&Value::Dictionary(root));
        TorrentSession::new(Metainfo::parse(&bytes).unwrap(), std::collections::HashSet::new())
    }

    #[test]
    fn starting_beyond_cap_leaves_torrent_queued() {
        let mut manager = SessionManager::new(1);
        let a = sample_session("a");
        let b = sample_session("b");
        let a_hash = a.info_hash;
        let b_hash = b.info_hash;
        manager.add_torrent(a);
        manager.add_torrent(b);

        assert!(manager.start(&a_hash));
        assert!(!manager.start(&b_hash));
        assert_eq!(manager.get_stats(&b_hash).unwrap().0, SessionState::Queued);
    }

    #[test]
    fn removing_active_torrent_frees_a_slot_for_the_next_queued() {
        let mut manager = SessionManager::new(1);
        let a = sample_session("a");
        let b = sample_session("b");
        let a_hash = a.info_hash;
        let b_hash = b.info_hash;
        manager.add_torrent(a);
        manager.add_torrent(b);
        manager.start(&a_hash);

        manager.remove_torrent(&a_hash);
        assert_eq!(manager.get_stats(&b_hash).unwrap().0, SessionState::Queued);
        assert_eq!(manager.next_promotable(), Some(b_hash));
        manager.start(&b_hash);
        assert_eq!(manager.get_stats(&b_hash).unwrap().0, SessionState::Downloading);
    }
}

//! Top-level event sink payloads (§6): what the engine surfaces to
//! whatever external layer owns persistence/UI. Tagged, language-neutral
//! shape — a plain enum is the Rust rendering of that tag.
use crate::metainfo::InfoHash;
use crate::peer::{manager::PeerEvent, PeerKey};
use crate::tracker::coordinator::TrackerEvent;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    EngineStarted,
    EngineStopped,
    EngineError(String),

    TorrentAdded { info_hash: InfoHash },
    TorrentRemoved { info_hash: InfoHash },
    TorrentStarted { info_hash: InfoHash },
    TorrentPaused { info_hash: InfoHash },
    TorrentResumed { info_hash: InfoHash },
    TorrentCompleted { info_hash: InfoHash },
    TorrentProgress { info_hash: InfoHash, downloaded: u64, uploaded: u64, have_pieces: usize },

    Peer { info_hash: InfoHash, event: PeerEvent },
    Tracker { info_hash: InfoHash, event: TrackerEvent },
}

impl EngineEvent {
    pub fn peer_key(&self) -> Option<PeerKey> {
        match self {
            EngineEvent::Peer { event, .. } => match event {
                PeerEvent::PeerConnected { key }
                | PeerEvent::PeerDisconnected { key, .. }
                | PeerEvent::PeerBitfield { key, .. }
                | PeerEvent::PeerHave { key, .. }
                | PeerEvent::PeerChoked { key }
                | PeerEvent::PeerUnchoked { key }
                | PeerEvent::PeerInterested { key }
                | PeerEvent::PeerNotInterested { key }
                | PeerEvent::PieceReceived { key, .. }
                | PeerEvent::RequestReceived { key, .. }
                | PeerEvent::PexPeers { key, .. } => Some(*key),
            },
            _ => None,
        }
    }
}

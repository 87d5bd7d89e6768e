//! Torrent session (§4.14): wires the tracker coordinator, peer
//! manager, piece manager, choking algorithm and bandwidth limiter into
//! one per-torrent lifecycle state machine.
use crate::bandwidth::{BandwidthLimiter, Direction};
use crate::choking::{ChokingAlgorithm, Mode as ChokingMode};
use crate::metainfo::{InfoHash, Metainfo};
use crate::peer::manager::PeerManager;
use crate::piece::PieceManager;
use crate::tracker::coordinator::Coordinator;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub mod disk;
pub mod manager;

pub use manager::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Queued,
    Checking,
    Downloading,
    Seeding,
    Paused,
    Stopped,
    Error,
}

/// Sliding window of byte samples used to derive `download_speed` /
/// `upload_speed` / `eta` (§3 supplement: not pinned down by spec.md,
/// resolved here as a ring buffer of `(Instant, u64)` samples).
pub struct RateWindow {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self { window, samples: VecDeque::new() }
    }

    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes/sec averaged over whatever of the window has actually
    /// elapsed so far (never divides by more than `self.window`).
    pub fn rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        let elapsed = self.samples.back().unwrap().0.duration_since(self.samples.front().unwrap().0).as_secs_f64();
        if elapsed <= 0.0 {
            total as f64
        } else {
            total as f64 / elapsed.min(self.window.as_secs_f64())
        }
    }
}

pub struct SessionMetrics {
    pub downloaded: u64,
    pub uploaded: u64,
    download_window: RateWindow,
    upload_window: RateWindow,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            downloaded: 0,
            uploaded: 0,
            download_window: RateWindow::new(Duration::from_secs(5)),
            upload_window: RateWindow::new(Duration::from_secs(5)),
        }
    }

    pub fn record_download(&mut self, bytes: u64) {
        self.downloaded += bytes;
        self.download_window.record(bytes);
    }

    pub fn record_upload(&mut self, bytes: u64) {
        self.uploaded += bytes;
        self.upload_window.record(bytes);
    }

    pub fn download_speed(&self) -> f64 {
        self.download_window.rate()
    }

    pub fn upload_speed(&self) -> f64 {
        self.upload_window.rate()
    }

    /// Seconds remaining at the current download rate, `None` if the
    /// rate is zero (would otherwise divide by zero / never finish).
    pub fn eta(&self, remaining_bytes: u64) -> Option<f64> {
        let speed = self.download_speed();
        if speed <= 0.0 {
            None
        } else {
            Some(remaining_bytes as f64 / speed)
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TorrentSession {
    pub info_hash: InfoHash,
    pub metainfo: Metainfo,
    pub state: SessionState,
    pub piece_manager: PieceManager,
    pub choking: ChokingAlgorithm,
    pub metrics: SessionMetrics,
    pub coordinator: Option<Coordinator>,
}

impl TorrentSession {
    pub fn new(metainfo: Metainfo, already_verified: std::collections::HashSet<usize>) -> Self {
        let info_hash = metainfo.info_hash;
        let piece_manager = PieceManager::new(metainfo.piece_count, metainfo.piece_length, metainfo.total_length, already_verified);
        Self {
            info_hash,
            metainfo,
            state: SessionState::Queued,
            piece_manager,
            choking: ChokingAlgorithm::new(ChokingMode::Downloading),
            metrics: SessionMetrics::new(),
            coordinator: None,
        }
    }

    /// §4.14 `start`: if disk verification reports every piece
    /// present, go straight to `Seeding`, else `Downloading`.
    pub fn start(&mut self, coordinator: Coordinator) {
        self.coordinator = Some(coordinator);
        self.state = if self.piece_manager.is_complete() { SessionState::Seeding } else { SessionState::Downloading };
    }

    /// On piece completion: flip to `Seeding` once every piece is
    /// verified (§4.14's "transition to Seeding if complete").
    pub fn on_piece_complete(&mut self) {
        if self.piece_manager.is_complete() && self.state == SessionState::Downloading {
            self.state = SessionState::Seeding;
            self.choking.set_mode(ChokingMode::Seeding);
        }
    }

    /// `pause`: stop timers, keep peers disconnected on a clean cycle,
    /// no announce.
    pub fn pause(&mut self) {
        self.state = SessionState::Paused;
    }

    pub fn stop(&mut self) {
        self.state = SessionState::Stopped;
        self.coordinator = None;
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Downloading | SessionState::Seeding | SessionState::Checking)
    }

    pub fn bandwidth_direction_for(&self, sending: bool) -> Direction {
        if sending {
            Direction::Upload
        } else {
            Direction::Download
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use sha1::{Digest, Sha1};
    use std::collections::BTreeMap;

    fn sample_metainfo() -> Metainfo {
        let data = vec![0u8; 16384];
        let hash = Sha1::digest(&data);
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::string("x"));
        info.insert(b"piece length".to_vec(), Value::integer(16384));
        info.insert(b"pieces".to_vec(), Value::ByteString(hash.to_vec()));
        info.insert(b"length".to_vec(), Value::integer(16384));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dictionary(info));
        let bytes = bencode::encode(&Value::Dictionary(root));
        Metainfo::parse(&bytes).unwrap()
    }

    #[test]
    fn start_goes_to_seeding_when_already_complete() {
        let metainfo = sample_metainfo();
        let mut already = std::collections::HashSet::new();
        already.insert(0);
        let mut session = TorrentSession::new(metainfo, already);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        session.start(Coordinator::new(vec![], tx));
        assert_eq!(session.state, SessionState::Seeding);
    }

    #[test]
    fn start_goes_to_downloading_when_incomplete() {
        let metainfo = sample_metainfo();
        let mut session = TorrentSession::new(metainfo, std::collections::HashSet::new());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        session.start(Coordinator::new(vec![], tx));
        assert_eq!(session.state, SessionState::Downloading);
    }

    #[test]
    fn eta_is_none_at_zero_speed() {
        let metrics = SessionMetrics::new();
        assert_eq!(metrics.eta(1000), None);
    }

    #[test]
    fn rate_window_averages_recorded_bytes() {
        let mut window = RateWindow::new(Duration::from_secs(5));
        window.record(1000);
        assert!(window.rate() > 0.0);
    }
}

//! Tracker communication: HTTP (§4.3), UDP/BEP-15 (§4.4), and the
//! tiered coordinator that fans announces out across both (§4.5).
use crate::metainfo::InfoHash;
use std::net::SocketAddr;
use thiserror::Error;

pub mod coordinator;
pub mod http;
pub mod udp;

pub use coordinator::{Coordinator, TrackerEvent};

/// `started` on first activation, `completed` on the incomplete→complete
/// transition, `stopped` on shutdown. A plain announce carries none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::None => "",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: Option<u32>,
    pub key: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub tracker_id: Option<Vec<u8>>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Udp,
    Unknown,
}

pub fn protocol_of(url: &str) -> Protocol {
    if url.starts_with("http://") || url.starts_with("https://") {
        Protocol::Http
    } else if url.starts_with("udp://") {
        Protocol::Udp
    } else {
        Protocol::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerStatus {
    Idle,
    Announcing,
    Working,
    Error,
}

/// Per-tracker state tracked by the coordinator (§3).
#[derive(Debug, Clone)]
pub struct TrackerState {
    pub url: String,
    pub protocol: Protocol,
    pub status: TrackerStatus,
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub tracker_id: Option<Vec<u8>>,
    pub connection_id: Option<(u64, std::time::Instant)>,
    pub failure_count: u32,
    pub next_announce_at: std::time::Instant,
}

impl TrackerState {
    pub fn new(url: String) -> Self {
        let protocol = protocol_of(&url);
        Self {
            url,
            protocol,
            status: TrackerStatus::Idle,
            interval: DEFAULT_INTERVAL_SECS,
            min_interval: None,
            tracker_id: None,
            connection_id: None,
            failure_count: 0,
            next_announce_at: std::time::Instant::now(),
        }
    }
}

pub const DEFAULT_INTERVAL_SECS: u32 = 1800;
pub const MAX_BACKOFF_SECS: u32 = 3600;

/// Exponential backoff capped at `MAX_BACKOFF_SECS`, base taken from the
/// last known interval or `DEFAULT_INTERVAL_SECS` (§4.5).
pub fn backoff_secs(base: u32, failures: u32) -> u32 {
    let shift = failures.min(16);
    let multiplier = 1u64 << shift;
    let scaled = (base as u64).saturating_mul(multiplier);
    scaled.min(MAX_BACKOFF_SECS as u64) as u32
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("tracker reported failure: {0}")]
    FailureReason(String),

    #[error("malformed tracker response: {0}")]
    BadResponse(String),

    #[error(transparent)]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("unsupported or unrecognized tracker protocol for url: {0}")]
    UnsupportedProtocol(String),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Percent-encode raw bytes per RFC 3986's unreserved set — used for
/// the binary `info_hash`/`peer_id` fields (§4.3). Every other
/// announce parameter is a literal ASCII integer or event string and
/// does not need this.
pub fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push('%');
                encoded.push_str(&format!("{:02X}", byte));
            }
        }
    }
    encoded
}

/// Derive the scrape URL by replacing the last `announce` path segment
/// with `scrape` (§4.3). `None` if `announce` does not appear in the path.
pub fn scrape_url(announce_url: &str) -> Option<String> {
    let idx = announce_url.rfind("announce")?;
    let mut scrape = String::with_capacity(announce_url.len());
    scrape.push_str(&announce_url[..idx]);
    scrape.push_str("scrape");
    scrape.push_str(&announce_url[idx + "announce".len()..]);
    Some(scrape)
}

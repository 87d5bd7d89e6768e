//! Crate-wide error type (§7): one variant per component error kind,
//! wired at the session and public API boundaries. Per-peer and
//! per-tracker errors are handled locally and never reach here — they
//! surface as events instead.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error(transparent)]
    Metadata(#[from] crate::metainfo::MetadataError),

    #[error(transparent)]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error(transparent)]
    Protocol(#[from] crate::peer::PeerError),

    #[error(transparent)]
    Network(#[from] std::io::Error),

    #[error(transparent)]
    Disk(#[from] crate::session::disk::DiskError),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, Error>;

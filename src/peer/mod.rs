//! Peer wire subsystem: handshake, message framing, bitfields, MSE/PE
//! encryption, the connection socket layer, the wire FSM, and the
//! manager that owns every connected peer across all torrents.
use std::net::SocketAddr;
use thiserror::Error;

pub mod bitfield;
pub mod connect;
pub mod connection;
pub mod encryption;
pub mod handshake;
pub mod manager;
pub mod message;
pub mod wire;

pub use bitfield::Bitfield;
pub use handshake::Handshake;
pub use manager::PeerManager;
pub use message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub info_hash: crate::metainfo::InfoHash,
    pub addr: SocketAddr,
}

/// Why a peer connection ended, surfaced upward by the manager (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Timeout,
    ProtocolError,
    Choked,
    Completed,
    Manual,
    PeerClosed,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("idle timeout")]
    IdleTimeout,

    #[error("message exceeds maximum length: {0} bytes")]
    MessageTooLarge(usize),

    #[error(transparent)]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("encryption negotiation failed: {0}")]
    Encryption(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        PeerError::Io(e.to_string())
    }
}

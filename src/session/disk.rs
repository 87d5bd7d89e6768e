//! `DiskManager` collaborator trait (§6). Production disk layout below
//! this boundary is out of scope; this crate only defines the trait
//! and a minimal in-memory double for exercising the session against.
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("io error: {0}")]
    Io(String),

    #[error("piece {0} out of range")]
    PieceOutOfRange(usize),

    #[error("read range out of bounds: piece {index} begin {begin} len {len}")]
    ReadOutOfBounds { index: usize, begin: u32, len: u32 },
}

#[async_trait]
pub trait DiskManager: Send + Sync {
    async fn start(&mut self) -> Result<HashSet<usize>, DiskError>;
    async fn write_piece(&mut self, index: usize, bytes: Vec<u8>) -> Result<(), DiskError>;
    async fn read_block(&self, index: usize, begin: u32, len: u32) -> Result<Vec<u8>, DiskError>;
    async fn verify_existing_pieces(&mut self) -> Result<(), DiskError>;
    async fn delete_files(&mut self) -> Result<(), DiskError>;
    async fn has_piece(&self, index: usize) -> bool;
}

/// In-memory double used by the session's own test suite. Not suitable
/// for production use — it holds every piece in a `HashMap` with no
/// persistence.
pub struct InMemoryDisk {
    piece_length: u32,
    pieces: HashMap<usize, Vec<u8>>,
    piece_hashes: Vec<[u8; 20]>,
}

impl InMemoryDisk {
    pub fn new(piece_length: u32, piece_hashes: Vec<[u8; 20]>) -> Self {
        Self { piece_length, pieces: HashMap::new(), piece_hashes }
    }
}

#[async_trait]
impl DiskManager for InMemoryDisk {
    async fn start(&mut self) -> Result<HashSet<usize>, DiskError> {
        Ok(self.pieces.keys().copied().collect())
    }

    async fn write_piece(&mut self, index: usize, bytes: Vec<u8>) -> Result<(), DiskError> {
        if index >= self.piece_hashes.len() {
            return Err(DiskError::PieceOutOfRange(index));
        }
        self.pieces.insert(index, bytes);
        Ok(())
    }

    async fn read_block(&self, index: usize, begin: u32, len: u32) -> Result<Vec<u8>, DiskError> {
        let piece = self.pieces.get(&index).ok_or(DiskError::PieceOutOfRange(index))?;
        let begin = begin as usize;
        let end = begin + len as usize;
        piece
            .get(begin..end)
            .map(|b| b.to_vec())
            .ok_or(DiskError::ReadOutOfBounds { index, begin: begin as u32, len })
    }

    async fn verify_existing_pieces(&mut self) -> Result<(), DiskError> {
        use sha1::{Digest, Sha1};
        self.pieces.retain(|index, bytes| {
            self.piece_hashes.get(*index).map(|hash| Sha1::digest(&bytes[..]).as_slice() == hash).unwrap_or(false)
        });
        let _ = self.piece_length;
        Ok(())
    }

    async fn delete_files(&mut self) -> Result<(), DiskError> {
        self.pieces.clear();
        Ok(())
    }

    async fn has_piece(&self, index: usize) -> bool {
        self.pieces.contains_key(&index)
    }
}

//! A single outstanding block request tracked by the piece manager.
use crate::peer::PeerKey;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct InFlightRequest {
    pub peer: PeerKey,
    pub index: usize,
    pub begin: u32,
    pub length: u32,
    pub requested_at: Instant,
}

//! The 68-byte BitTorrent handshake (§4.6).
use super::PeerError;
use crate::metainfo::InfoHash;

pub const HANDSHAKE_LEN: usize = 68;
const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Reserved byte 5, bit `0x10`: BEP-10 extension protocol support.
pub const RESERVED_EXTENSION_PROTOCOL: u8 = 0x10;
/// Reserved byte 7, bit `0x04`: Fast extension (BEP-6).
pub const RESERVED_FAST: u8 = 0x04;
/// Reserved byte 7, bit `0x01`: DHT port (BEP-5).
pub const RESERVED_DHT: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        Self { reserved: [0u8; 8], info_hash, peer_id }
    }

    pub fn with_reserved(mut self, reserved: [u8; 8]) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & RESERVED_EXTENSION_PROTOCOL != 0
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = 19;
        out[1..20].copy_from_slice(PROTOCOL);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(self.info_hash.as_bytes());
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    /// Parse exactly `HANDSHAKE_LEN` bytes. §4.8: protocol length must be
    /// 19 and the string must equal `"BitTorrent protocol"`, else this is
    /// a peer protocol error and the connection must close.
    pub fn parse(bytes: &[u8]) -> Result<Self, PeerError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(PeerError::Protocol(format!("handshake length {} != {HANDSHAKE_LEN}", bytes.len())));
        }
        if bytes[0] != 19 {
            return Err(PeerError::Protocol(format!("pstrlen {} != 19", bytes[0])));
        }
        if &bytes[1..20] != PROTOCOL {
            return Err(PeerError::Protocol("pstr is not \"BitTorrent protocol\"".into()));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Self { reserved, info_hash: InfoHash::from_bytes(info_hash), peer_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize_and_parse() {
        let handshake = Handshake::new(InfoHash::from_bytes([1u8; 20]), [2u8; 20])
            .with_reserved([0, 0, 0, 0, 0, RESERVED_EXTENSION_PROTOCOL, 0, RESERVED_DHT]);
        let bytes = handshake.serialize();
        let parsed = Handshake::parse(&bytes).unwrap();
        assert_eq!(parsed, handshake);
        assert!(parsed.supports_extension_protocol());
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new(InfoHash::from_bytes([0u8; 20]), [0u8; 20]).serialize();
        bytes[1] = b'X';
        assert!(matches!(Handshake::parse(&bytes), Err(PeerError::Protocol(_))));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(Handshake::parse(&[0u8; 10]), Err(PeerError::Protocol(_))));
    }
}

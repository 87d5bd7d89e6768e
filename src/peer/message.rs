//! Regular wire messages (§4.6) and BEP-10 extended-message payloads.
use super::bitfield::Bitfield;
use super::PeerError;
use crate::bencode::{self, Value};
use std::collections::BTreeMap;

pub const BLOCK_SIZE: usize = 16 * 1024;
/// §4.6: the message length cap is `16 KiB + 13` (id + three 32-bit
/// fields + a full block).
pub const MAX_MESSAGE_LEN: u32 = 16 * 1024 + 13;

pub const ID_CHOKE: u8 = 0;
pub const ID_UNCHOKE: u8 = 1;
pub const ID_INTERESTED: u8 = 2;
pub const ID_NOT_INTERESTED: u8 = 3;
pub const ID_HAVE: u8 = 4;
pub const ID_BITFIELD: u8 = 5;
pub const ID_REQUEST: u8 = 6;
pub const ID_PIECE: u8 = 7;
pub const ID_CANCEL: u8 = 8;
pub const ID_EXTENDED: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

/// BEP-10 extended-message payload, before the inner `m`-table dispatch
/// assigns it a meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedMessage {
    pub ext_id: u8,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockRequest),
    Piece(Block),
    Cancel(BlockRequest),
    Extended(ExtendedMessage),
}

impl Message {
    /// Encode as `[4: length][1: id][payload]`, or 4 zero bytes for keep-alive.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => 0u32.to_be_bytes().to_vec(),
            Message::Choke => frame(ID_CHOKE, &[]),
            Message::Unchoke => frame(ID_UNCHOKE, &[]),
            Message::Interested => frame(ID_INTERESTED, &[]),
            Message::NotInterested => frame(ID_NOT_INTERESTED, &[]),
            Message::Have(index) => frame(ID_HAVE, &index.to_be_bytes()),
            Message::Bitfield(bf) => frame(ID_BITFIELD, bf.as_bytes()),
            Message::Request(r) => frame(ID_REQUEST, &encode_request(r)),
            Message::Cancel(r) => frame(ID_CANCEL, &encode_request(r)),
            Message::Piece(b) => {
                let mut payload = Vec::with_capacity(8 + b.data.len());
                payload.extend_from_slice(&b.index.to_be_bytes());
                payload.extend_from_slice(&b.begin.to_be_bytes());
                payload.extend_from_slice(&b.data);
                frame(ID_PIECE, &payload)
            }
            Message::Extended(ext) => {
                let mut payload = vec![ext.ext_id];
                payload.extend_from_slice(&bencode::encode(&ext.payload));
                frame(ID_EXTENDED, &payload)
            }
        }
    }

    /// Parse a complete `id + payload` slice (the 4-byte length prefix
    /// has already been consumed and validated by the caller, which is
    /// the wire FSM per §4.8).
    pub fn parse(id: u8, payload: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        match id {
            ID_CHOKE => require_empty(payload, "choke").map(|_| Message::Choke),
            ID_UNCHOKE => require_empty(payload, "unchoke").map(|_| Message::Unchoke),
            ID_INTERESTED => require_empty(payload, "interested").map(|_| Message::Interested),
            ID_NOT_INTERESTED => require_empty(payload, "not_interested").map(|_| Message::NotInterested),
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(PeerError::Protocol(format!("have payload length {} != 4", payload.len())));
                }
                Ok(Message::Have(u32::from_be_bytes(payload.try_into().unwrap())))
            }
            ID_BITFIELD => {
                let expected_len = piece_count.div_ceil(8);
                if payload.len() != expected_len {
                    return Err(PeerError::Protocol(format!(
                        "bitfield payload length {} != expected {expected_len} for {piece_count} pieces",
                        payload.len()
                    )));
                }
                Ok(Message::Bitfield(Bitfield::from_bytes(payload.to_vec(), piece_count)))
            }
            ID_REQUEST => decode_request(payload).and_then(|r| validate_block_request(r, piece_count)).map(Message::Request),
            ID_CANCEL => decode_request(payload).and_then(|r| validate_block_request(r, piece_count)).map(Message::Cancel),
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(PeerError::Protocol(format!("piece payload length {} < 8", payload.len())));
                }
                let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                Ok(Message::Piece(Block { index, begin, data: payload[8..].to_vec() }))
            }
            ID_EXTENDED => {
                if payload.is_empty() {
                    return Err(PeerError::Protocol("extended message has no ext_id byte".into()));
                }
                let value = bencode::decode(&payload[1..])?;
                Ok(Message::Extended(ExtendedMessage { ext_id: payload[0], payload: value }))
            }
            other => Err(PeerError::Protocol(format!("unknown message id {other}"))),
        }
    }
}

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u32;
    let mut out = Vec::with_capacity(4 + payload.len() + 1);
    out.extend_from_slice(&len.to_be_bytes());
    out.push(id);
    out.extend_from_slice(payload);
    out
}

fn require_empty(payload: &[u8], name: &str) -> Result<(), PeerError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(PeerError::Protocol(format!("{name} must have an empty payload, got {} bytes", payload.len())))
    }
}

fn encode_request(r: &BlockRequest) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&r.index.to_be_bytes());
    out[4..8].copy_from_slice(&r.begin.to_be_bytes());
    out[8..12].copy_from_slice(&r.length.to_be_bytes());
    out
}

fn decode_request(payload: &[u8]) -> Result<BlockRequest, PeerError> {
    if payload.len() != 12 {
        return Err(PeerError::Protocol(format!("request/cancel payload length {} != 12", payload.len())));
    }
    Ok(BlockRequest {
        index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
        begin: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
        length: u32::from_be_bytes(payload[8..12].try_into().unwrap()),
    })
}

/// §4.8/§8: `length` must be a nonzero block no larger than
/// [`BLOCK_SIZE`], and `index` must name a real piece, or the request is
/// a protocol error rather than something that reaches the disk layer.
fn validate_block_request(r: BlockRequest, piece_count: usize) -> Result<BlockRequest, PeerError> {
    if r.length == 0 || r.length as usize > BLOCK_SIZE {
        return Err(PeerError::Protocol(format!("request length {} outside 1..={BLOCK_SIZE}", r.length)));
    }
    if r.index as usize >= piece_count {
        return Err(PeerError::Protocol(format!("request index {} >= piece count {piece_count}", r.index)));
    }
    Ok(r)
}

/// BEP-10 extension handshake dictionary: `m` maps extension names to
/// per-peer ids, `p` is the listen port, `v` the client string, `reqq`
/// the max outstanding request count this peer will accept.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtensionHandshake {
    pub extensions: BTreeMap<String, u8>,
    pub listen_port: Option<u16>,
    pub client_version: Option<String>,
    pub max_pending_requests: Option<u32>,
}

impl ExtensionHandshake {
    pub fn to_value(&self) -> Value {
        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(name.as_bytes().to_vec(), Value::integer(*id as i64));
        }
        let mut root = BTreeMap::new();
        root.insert(b"m".to_vec(), Value::Dictionary(m));
        if let Some(port) = self.listen_port {
            root.insert(b"p".to_vec(), Value::integer(port as i64));
        }
        if let Some(v) = &self.client_version {
            root.insert(b"v".to_vec(), Value::string(v));
        }
        if let Some(reqq) = self.max_pending_requests {
            root.insert(b"reqq".to_vec(), Value::integer(reqq as i64));
        }
        Value::Dictionary(root)
    }

    pub fn from_value(value: &Value) -> Result<Self, PeerError> {
        let dict = value.as_dict().ok_or_else(|| PeerError::Protocol("extension handshake is not a dict".into()))?;
        let mut extensions = BTreeMap::new();
        if let Some(Value::Dictionary(m)) = dict.get(b"m".as_slice()) {
            for (name, id_value) in m {
                let id = id_value.as_i64().ok_or_else(|| PeerError::Protocol("extension id is not an integer".into()))?;
                let name = String::from_utf8(name.clone()).map_err(|_| PeerError::Protocol("extension name not utf8".into()))?;
                extensions.insert(name, id as u8);
            }
        }
        let listen_port = dict.get(b"p".as_slice()).and_then(Value::as_i64).map(|v| v as u16);
        let client_version = dict
            .get(b"v".as_slice())
            .and_then(Value::as_bytes)
            .map(|b| String::from_utf8_lossy(b).into_owned());
        let max_pending_requests = dict.get(b"reqq".as_slice()).and_then(Value::as_i64).map(|v| v as u32);
        Ok(Self { extensions, listen_port, client_version, max_pending_requests })
    }
}

/// BEP-11 PEX payload: `added` is a compact peer list, `added.f` one
/// flags byte per peer in the same order (dropped peers are ignored —
/// this engine only grows its candidate pool from PEX, never shrinks
/// it early, since a `dropped` entry just means "they disconnected",
/// which our own connection attempt will discover on its own).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PexPeers {
    pub added: Vec<(std::net::SocketAddr, u8)>,
}

impl PexPeers {
    pub fn from_value(value: &Value) -> Result<Self, PeerError> {
        let dict = value.as_dict().ok_or_else(|| PeerError::Protocol("pex payload is not a dict".into()))?;
        let added_bytes = dict.get(b"added".as_slice()).and_then(Value::as_bytes).unwrap_or(&[]);
        let flags = dict.get(b"added.f".as_slice()).and_then(Value::as_bytes).unwrap_or(&[]);
        if added_bytes.len() % 6 != 0 {
            return Err(PeerError::Protocol(format!("pex added length {} not a multiple of 6", added_bytes.len())));
        }
        let mut added = Vec::with_capacity(added_bytes.len() / 6);
        for (i, chunk) in added_bytes.chunks_exact(6).enumerate() {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            let flag = flags.get(i).copied().unwrap_or(0);
            added.push((std::net::SocketAddr::new(std::net::IpAddr::V4(ip), port), flag));
        }
        Ok(Self { added })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_have_with_correct_length_prefix() {
        let bytes = Message::Have(7).encode();
        assert_eq!(&bytes[0..4], &5u32.to_be_bytes());
        assert_eq!(bytes[4], ID_HAVE);
        assert_eq!(&bytes[5..9], &7u32.to_be_bytes());
    }

    #[test]
    fn rejects_nonempty_choke_payload() {
        assert!(matches!(Message::parse(ID_CHOKE, &[1], 0), Err(PeerError::Protocol(_))));
    }

    #[test]
    fn rejects_wrong_length_request_payload() {
        assert!(matches!(Message::parse(ID_REQUEST, &[0; 11], 10), Err(PeerError::Protocol(_))));
    }

    #[test]
    fn round_trips_request_message() {
        let req = BlockRequest { index: 3, begin: 16384, length: 16384 };
        let encoded = Message::Request(req.clone()).encode();
        let parsed = Message::parse(encoded[4], &encoded[5..], 10).unwrap();
        assert_eq!(parsed, Message::Request(req));
    }

    #[test]
    fn rejects_request_with_zero_length() {
        let req = BlockRequest { index: 0, begin: 0, length: 0 };
        let encoded = Message::Request(req).encode();
        assert!(matches!(Message::parse(encoded[4], &encoded[5..], 10), Err(PeerError::Protocol(_))));
    }

    #[test]
    fn rejects_request_with_oversize_length() {
        let req = BlockRequest { index: 0, begin: 0, length: (BLOCK_SIZE + 1) as u32 };
        let encoded = Message::Request(req).encode();
        assert!(matches!(Message::parse(encoded[4], &encoded[5..], 10), Err(PeerError::Protocol(_))));
    }

    #[test]
    fn rejects_request_with_out_of_range_index() {
        let req = BlockRequest { index: 10, begin: 0, length: 16384 };
        let encoded = Message::Request(req).encode();
        assert!(matches!(Message::parse(encoded[4], &encoded[5..], 10), Err(PeerError::Protocol(_))));
    }

    #[test]
    fn rejects_bitfield_with_wrong_payload_length() {
        // 10 pieces needs ceil(10/8) = 2 bytes; send 1.
        assert!(matches!(Message::parse(ID_BITFIELD, &[0xFF], 10), Err(PeerError::Protocol(_))));
    }

    #[test]
    fn extension_handshake_round_trips() {
        let mut handshake = ExtensionHandshake { listen_port: Some(6881), ..Default::default() };
        handshake.extensions.insert("ut_pex".to_string(), 1);
        let value = handshake.to_value();
        let parsed = ExtensionHandshake::from_value(&value).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn pex_payload_pairs_flags_with_peers() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"added".to_vec(), Value::ByteString(vec![10, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2]));
        dict.insert(b"added.f".to_vec(), Value::ByteString(vec![0x02, 0x00]));
        let pex = PexPeers::from_value(&Value::Dictionary(dict)).unwrap();
        assert_eq!(pex.added.len(), 2);
        assert_eq!(pex.added[0].1, 0x02);
        assert_eq!(pex.added[0].0.to_string(), "10.0.0.1:6881");
    }
}

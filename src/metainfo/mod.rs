//! Torrent metainfo: parses a `.torrent` buffer (via the bencode codec)
//! into a typed, immutable model, and derives the info hash.
use crate::bencode::{self, Value};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub mod magnet;

pub use magnet::{Magnet, MagnetError};

/// SHA-1 of the canonical bencoded `info` dictionary. Equality is
/// bytewise; hex is only a display/transport convenience (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let decoded = hex::decode(hex_str).ok()?;
        let array: [u8; 20] = decoded.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
    /// Byte offset of this file's first byte within the concatenated
    /// torrent data (§3: `files` is `{path, length, offset}`).
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub name: String,
    pub piece_length: u32,
    pub piece_count: usize,
    pub pieces: Vec<u8>,
    pub files: Vec<FileEntry>,
    pub total_length: u64,
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub is_private: bool,
    pub info_hash: InfoHash,
    /// The exact bytes of the `info` dictionary, kept so the hash can
    /// be recomputed (e.g. when re-verifying a magnet-fetched torrent).
    pub raw_info: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error(transparent)]
    Bencode(#[from] bencode::BencodeError),

    #[error("root value is not a dictionary")]
    RootNotDict,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),

    #[error("piece_length must be a power of two and at least 16384, got {0}")]
    InvalidPieceLength(i64),

    #[error("pieces length {len} is not a multiple of 20")]
    InvalidPiecesLength { len: usize },

    #[error("field `{0}` is not valid UTF-8")]
    NotUtf8(&'static str),

    #[error("torrent declares neither `length` nor `files`")]
    NoFiles(),
}

type Result<T> = std::result::Result<T, MetadataError>;

fn get<'a>(dict: &'a BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<&'a Value> {
    dict.get(key.as_bytes()).ok_or(MetadataError::MissingField(key))
}

fn get_str(dict: &BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<String> {
    let bytes = get(dict, key)?.as_bytes().ok_or(MetadataError::WrongType(key))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| MetadataError::NotUtf8(key))
}

fn get_i64(dict: &BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<i64> {
    get(dict, key)?.as_i64().ok_or(MetadataError::WrongType(key))
}

impl Metainfo {
    /// Parse a `.torrent` file's raw bytes.
    #[tracing::instrument(skip(bytes), level = "debug")]
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value = bencode::decode(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let root = match &value {
            Value::Dictionary(d) => d,
            _ => return Err(MetadataError::RootNotDict),
        };

        let announce = match root.get(b"announce".as_slice()) {
            Some(v) => Some(String::from_utf8(v.as_bytes().ok_or(MetadataError::WrongType("announce"))?.to_vec())
                .map_err(|_| MetadataError::NotUtf8("announce"))?),
            None => None,
        };

        let announce_list = match root.get(b"announce-list".as_slice()) {
            Some(Value::List(tiers)) => parse_announce_list(tiers)?,
            Some(_) => return Err(MetadataError::WrongType("announce-list")),
            None => Vec::new(),
        };

        let info_value = get(root, "info")?;
        let info_dict = match info_value {
            Value::Dictionary(d) => d,
            _ => return Err(MetadataError::WrongType("info")),
        };

        let raw_info = bencode::encode(info_value);
        let info_hash = InfoHash(Sha1::digest(&raw_info).into());

        let name = get_str(info_dict, "name")?;

        let piece_length_i64 = get_i64(info_dict, "piece length")?;
        if piece_length_i64 < 16384 || !is_power_of_two(piece_length_i64) {
            return Err(MetadataError::InvalidPieceLength(piece_length_i64));
        }
        let piece_length = piece_length_i64 as u32;

        let pieces = get(info_dict, "pieces")?.as_bytes().ok_or(MetadataError::WrongType("pieces"))?.to_vec();
        if pieces.len() % 20 != 0 {
            return Err(MetadataError::InvalidPiecesLength { len: pieces.len() });
        }
        let piece_count = pieces.len() / 20;

        let is_private = matches!(info_dict.get(b"private".as_slice()).and_then(Value::as_i64), Some(1));

        let (files, total_length) = parse_files(info_dict, &name)?;

        Ok(Metainfo {
            name,
            piece_length,
            piece_count,
            pieces,
            files,
            total_length,
            announce,
            announce_list,
            is_private,
            info_hash,
            raw_info,
        })
    }

    /// Length of `index`, accounting for a possibly-short final piece (§3).
    pub fn piece_length_at(&self, index: usize) -> u32 {
        if index + 1 < self.piece_count {
            self.piece_length
        } else {
            let full = self.piece_length as u64 * (self.piece_count.saturating_sub(1)) as u64;
            (self.total_length - full) as u32
        }
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(20)?;
        self.pieces.get(start..start + 20)
    }

    /// All tracker tiers, with the primary `announce` folded in as tier 0
    /// when no `announce-list` tiering was given (BEP-12).
    pub fn tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            self.announce_list.clone()
        } else if let Some(url) = &self.announce {
            vec![vec![url.clone()]]
        } else {
            Vec::new()
        }
    }
}

fn is_power_of_two(v: i64) -> bool {
    v > 0 && (v & (v - 1)) == 0
}

fn parse_announce_list(tiers: &[Value]) -> Result<Vec<Vec<String>>> {
    let mut out = Vec::with_capacity(tiers.len());
    for tier in tiers {
        let urls = tier.as_list().ok_or(MetadataError::WrongType("announce-list"))?;
        let mut tier_urls = Vec::with_capacity(urls.len());
        for url in urls {
            let bytes = url.as_bytes().ok_or(MetadataError::WrongType("announce-list"))?;
            tier_urls.push(String::from_utf8(bytes.to_vec()).map_err(|_| MetadataError::NotUtf8("announce-list"))?);
        }
        out.push(tier_urls);
    }
    Ok(out)
}

fn parse_files(info: &BTreeMap<Vec<u8>, Value>, name: &str) -> Result<(Vec<FileEntry>, u64)> {
    if let Some(Value::List(list)) = info.get(b"files".as_slice()) {
        let mut files = Vec::with_capacity(list.len());
        let mut offset = 0u64;
        for entry in list {
            let dict = entry.as_dict().ok_or(MetadataError::WrongType("files"))?;
            let length = get_i64(dict, "length")? as u64;
            let path_list = dict.get(b"path".as_slice()).and_then(Value::as_list).ok_or(MetadataError::WrongType("path"))?;
            let mut path = Vec::with_capacity(path_list.len());
            for component in path_list {
                let bytes = component.as_bytes().ok_or(MetadataError::WrongType("path"))?;
                path.push(String::from_utf8(bytes.to_vec()).map_err(|_| MetadataError::NotUtf8("path"))?);
            }
            files.push(FileEntry { path, length, offset });
            offset += length;
        }
        Ok((files, offset))
    } else if let Some(length_value) = info.get(b"length".as_slice()) {
        let length = length_value.as_i64().ok_or(MetadataError::WrongType("length"))? as u64;
        Ok((vec![FileEntry { path: vec![name.to_string()], length, offset: 0 }], length))
    } else {
        Err(MetadataError::NoFiles())
    }
}

pub fn unix_time(secs: i64) -> Option<SystemTime> {
    u64::try_from(secs).ok().map(|s| UNIX_EPOCH + Duration::from_secs(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_torrent_bytes() -> Vec<u8> {
        // A minimal single-file torrent: one 16 KiB piece.
        let piece_data = vec![0u8; 16384];
        let piece_hash = Sha1::digest(&piece_data);
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::string("file.bin"));
        info.insert(b"piece length".to_vec(), Value::integer(16384));
        info.insert(b"pieces".to_vec(), Value::ByteString(piece_hash.to_vec()));
        info.insert(b"length".to_vec(), Value::integer(16384));
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), Value::string("http://tracker.example/announce"));
        root.insert(b"info".to_vec(), Value::Dictionary(info));
        bencode::encode(&Value::Dictionary(root))
    }

    #[test]
    fn parses_single_file_torrent() {
        let metainfo = Metainfo::parse(&sample_torrent_bytes()).unwrap();
        assert_eq!(metainfo.name, "file.bin");
        assert_eq!(metainfo.piece_count, 1);
        assert_eq!(metainfo.total_length, 16384);
        assert_eq!(metainfo.files[0].length, 16384);
        assert_eq!(metainfo.piece_length_at(0), 16384);
    }

    #[test]
    fn rejects_non_power_of_two_piece_length() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::string("x"));
        info.insert(b"piece length".to_vec(), Value::integer(16385));
        info.insert(b"pieces".to_vec(), Value::ByteString(vec![0u8; 20]));
        info.insert(b"length".to_vec(), Value::integer(1));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dictionary(info));
        let bytes = bencode::encode(&Value::Dictionary(root));
        assert!(matches!(Metainfo::parse(&bytes), Err(MetadataError::InvalidPieceLength(16385))));
    }

    #[test]
    fn last_piece_is_short_when_not_a_multiple() {
        let total = 16384 * 2 + 100;
        let piece_hashes = vec![0u8; 20 * 3];
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::string("x"));
        info.insert(b"piece length".to_vec(), Value::integer(16384));
        info.insert(b"pieces".to_vec(), Value::ByteString(piece_hashes));
        info.insert(b"length".to_vec(), Value::integer(total));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dictionary(info));
        let bytes = bencode::encode(&Value::Dictionary(root));
        let metainfo = Metainfo::parse(&bytes).unwrap();
        assert_eq!(metainfo.piece_length_at(2), 100);
    }
}

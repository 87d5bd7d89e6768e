//! Magnet URI parsing (`magnet:?xt=urn:btih:...`).
//!
//! Resolving missing metadata (no `xs`, no BEP-9 peer exchange) is a
//! surfaced error, not a core responsibility — §4.2.
use super::InfoHash;
use data_encoding::BASE32;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magnet {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    /// Exact-source URL: if present, the engine may fetch a `.torrent`
    /// over HTTP(S) from it and re-verify its info hash against this one.
    pub exact_source: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MagnetError {
    #[error("not a magnet URI (missing `magnet:?` scheme)")]
    NotAMagnetUri,

    #[error("no `xt=urn:btih:` parameter present")]
    MissingExactTopic,

    #[error("info hash in `xt` is neither 40 hex chars nor 32 base32 chars")]
    InvalidInfoHashEncoding,
}

impl Magnet {
    pub fn parse(uri: &str) -> Result<Self, MagnetError> {
        let rest = uri.strip_prefix("magnet:?").ok_or(MagnetError::NotAMagnetUri)?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut exact_source = None;

        for pair in rest.split('&') {
            let Some((key, value)) = pair.split_once('=') else { continue };
            let decoded = percent_decode(value);
            match key {
                "xt" => {
                    if let Some(btih) = decoded.strip_prefix("urn:btih:") {
                        info_hash = Some(parse_btih(btih)?);
                    }
                }
                "dn" => display_name = Some(decoded),
                "tr" => trackers.push(decoded),
                "xs" => exact_source = Some(decoded),
                _ => {}
            }
        }

        Ok(Magnet {
            info_hash: info_hash.ok_or(MagnetError::MissingExactTopic)?,
            display_name,
            trackers,
            exact_source,
        })
    }
}

fn parse_btih(btih: &str) -> Result<InfoHash, MagnetError> {
    if btih.len() == 40 {
        InfoHash::from_hex(btih).ok_or(MagnetError::InvalidInfoHashEncoding)
    } else if btih.len() == 32 {
        let bytes = BASE32.decode(btih.to_ascii_uppercase().as_bytes()).map_err(|_| MagnetError::InvalidInfoHashEncoding)?;
        let array: [u8; 20] = bytes.try_into().map_err(|_| MagnetError::InvalidInfoHashEncoding)?;
        Ok(InfoHash::from_bytes(array))
    } else {
        Err(MagnetError::InvalidInfoHashEncoding)
    }
}

fn percent_decode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                    if let Ok(byte) = u8::from_str_radix(hex, 16) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

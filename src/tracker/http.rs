//! HTTP/HTTPS tracker announce client (§4.3).
use super::{percent_encode_bytes, scrape_url, AnnounceRequest, AnnounceResponse, TrackerError};
use crate::bencode::{self, Value};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// §5: tracker HTTP timeout is pinned at 30 s.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpTracker {
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("tls backend initializes"),
        }
    }

    #[tracing::instrument(skip(self, req), fields(url = %url))]
    pub async fn announce(&self, url: &str, req: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let full_url = build_announce_url(url, req)?;
        let response = self
            .client
            .get(full_url)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { TrackerError::Timeout } else { TrackerError::Network(e.to_string()) })?;
        let body = response.bytes().await.map_err(|e| TrackerError::Network(e.to_string()))?;
        parse_announce_response(&body)
    }

    #[tracing::instrument(skip(self), fields(url = %announce_url))]
    pub async fn scrape(&self, announce_url: &str, info_hashes: &[crate::metainfo::InfoHash]) -> Result<Value, TrackerError> {
        let base = scrape_url(announce_url).ok_or_else(|| TrackerError::UnsupportedProtocol(announce_url.to_string()))?;
        let mut url = base;
        for (i, hash) in info_hashes.iter().enumerate() {
            url.push(if i == 0 && !url.contains('?') { '?' } else { '&' });
            url.push_str("info_hash=");
            url.push_str(&percent_encode_bytes(hash.as_bytes()));
        }
        let response = self.client.get(url).send().await.map_err(|e| TrackerError::Network(e.to_string()))?;
        let body = response.bytes().await.map_err(|e| TrackerError::Network(e.to_string()))?;
        Ok(bencode::decode(&body)?)
    }
}

impl Default for HttpTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the announce URL by hand: `info_hash` and `peer_id` are raw 20
/// bytes that must be percent-encoded exactly (not UTF-8-decoded first),
/// which rules out using a form-encoding helper that assumes strings (§4.3).
fn build_announce_url(base: &str, req: &AnnounceRequest) -> Result<String, TrackerError> {
    // Validate the base first; url::Url is only used for that, since its
    // query setter would re-encode the already-percent-encoded binary
    // fields if we routed them through it.
    let parsed = url::Url::parse(base)?;

    let mut params = String::new();
    params.push_str("info_hash=");
    params.push_str(&percent_encode_bytes(req.info_hash.as_bytes()));
    params.push_str("&peer_id=");
    params.push_str(&percent_encode_bytes(&req.peer_id));
    params.push_str(&format!("&port={}", req.port));
    params.push_str(&format!("&uploaded={}", req.uploaded));
    params.push_str(&format!("&downloaded={}", req.downloaded));
    params.push_str(&format!("&left={}", req.left));
    params.push_str("&compact=1");
    if !req.event.as_str().is_empty() {
        params.push_str("&event=");
        params.push_str(req.event.as_str());
    }
    if let Some(numwant) = req.numwant {
        params.push_str(&format!("&numwant={}", numwant));
    }
    params.push_str(&format!("&key={:08x}", req.key));

    let separator = if parsed.query().is_some() { '&' } else { '?' };
    Ok(format!("{base}{separator}{params}"))
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = bencode::decode(body)?;
    let dict = value.as_dict().ok_or_else(|| TrackerError::BadResponse("root is not a dictionary".into()))?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()) {
        let text = reason.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
        return Err(TrackerError::FailureReason(text));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(Value::as_i64)
        .ok_or_else(|| TrackerError::BadResponse("missing interval".into()))? as u32;
    let min_interval = dict.get(b"min interval".as_slice()).and_then(Value::as_i64).map(|v| v as u32);
    let tracker_id = dict.get(b"tracker id".as_slice()).and_then(Value::as_bytes).map(|b| b.to_vec());
    let complete = dict.get(b"complete".as_slice()).and_then(Value::as_i64).map(|v| v as u32);
    let incomplete = dict.get(b"incomplete".as_slice()).and_then(Value::as_i64).map(|v| v as u32);

    let peers = match dict.get(b"peers".as_slice()) {
        Some(Value::ByteString(compact)) => parse_compact_peers(compact)?,
        Some(Value::List(list)) => parse_dictionary_peers(list)?,
        _ => Vec::new(),
    };

    Ok(AnnounceResponse { interval, min_interval, tracker_id, complete, incomplete, peers })
}

/// Compact peer list: 6 bytes each, 4-byte big-endian IPv4 + 2-byte
/// big-endian port (§4.3).
fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::BadResponse(format!("compact peers length {} not a multiple of 6", bytes.len())));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

fn parse_dictionary_peers(list: &[Value]) -> Result<Vec<SocketAddr>, TrackerError> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let dict = entry.as_dict().ok_or_else(|| TrackerError::BadResponse("peer entry not a dict".into()))?;
        let ip_bytes = dict
            .get(b"ip".as_slice())
            .and_then(Value::as_bytes)
            .ok_or_else(|| TrackerError::BadResponse("peer missing ip".into()))?;
        let ip_str = String::from_utf8_lossy(ip_bytes);
        let ip: IpAddr = ip_str
            .parse()
            .or_else(|_| ip_str.parse::<Ipv6Addr>().map(IpAddr::V6))
            .map_err(|_| TrackerError::BadResponse(format!("unparseable peer ip: {ip_str}")))?;
        let port = dict
            .get(b"port".as_slice())
            .and_then(Value::as_i64)
            .ok_or_else(|| TrackerError::BadResponse("peer missing port".into()))? as u16;
        peers.push(SocketAddr::new(ip, port));
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::InfoHash;
    use crate::tracker::AnnounceEvent;
    use std::collections::BTreeMap;

    fn sample_request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::from_bytes([0x11; 20]),
            peer_id: [0x22; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: AnnounceEvent::Started,
            numwant: Some(50),
            key: 0xdeadbeef,
        }
    }

    #[test]
    fn builds_url_with_percent_encoded_binary_fields() {
        let url = build_announce_url("http://tracker.example/announce", &sample_request()).unwrap();
        assert!(url.contains("info_hash=%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11"));
        assert!(url.contains("peer_id=%22%22%22%22%22%22%22%22%22%22%22%22%22%22%22%22%22%22%22%22"));
        assert!(url.contains("event=started"));
        assert!(url.contains("numwant=50"));
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut dict = BTreeMap::new();
        dict.insert(b"interval".to_vec(), Value::integer(1800));
        dict.insert(b"peers".to_vec(), Value::ByteString(vec![127, 0, 0, 1, 0x1A, 0xE1]));
        let body = bencode::encode(&Value::Dictionary(dict));
        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn parses_literal_two_peer_compact_response() {
        // Literal bytes: d8:intervali1800e5:peers12:<6 bytes>
        // <6 bytes>e, decoding to 127.0.0.1:6881 and 192.168.1.1:6881.
        let body = b"d8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\xc0\xa8\x01\x01\x1a\xe1e";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap(), "192.168.1.1:6881".parse().unwrap()]);
    }

    #[test]
    fn surfaces_failure_reason_as_error() {
        let mut dict = BTreeMap::new();
        dict.insert(b"failure reason".to_vec(), Value::string("banned client"));
        let body = bencode::encode(&Value::Dictionary(dict));
        let err = parse_announce_response(&body).unwrap_err();
        assert!(matches!(err, TrackerError::FailureReason(ref msg) if msg == "banned client"));
    }

    #[test]
    fn rejects_malformed_compact_peers_length() {
        let mut dict = BTreeMap::new();
        dict.insert(b"interval".to_vec(), Value::integer(1800));
        dict.insert(b"peers".to_vec(), Value::ByteString(vec![1, 2, 3]));
        let body = bencode::encode(&Value::Dictionary(dict));
        assert!(matches!(parse_announce_response(&body), Err(TrackerError::BadResponse(_))));
    }
}

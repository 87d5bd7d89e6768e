//! UDP tracker protocol, BEP-15: connect/announce two-step with a
//! connection id cached for 60 seconds, retry with timeout doubling.
use super::{AnnounceRequest, AnnounceResponse, TrackerError};
use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);
/// One attempt at 5s, one retry at 10s, then fail this tracker for the
/// announce cycle — the coordinator's fan-out/backoff across cycles is
/// what provides resilience, not a long single-tracker retry ladder.
const TIMEOUTS: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(10)];

pub struct UdpTracker {
    socket: UdpSocket,
    cached_connection_id: Option<(u64, Instant)>,
}

impl UdpTracker {
    pub async fn connect(remote: SocketAddr) -> Result<Self, TrackerError> {
        let local_bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local_bind).await.map_err(|e| TrackerError::Network(e.to_string()))?;
        socket.connect(remote).await.map_err(|e| TrackerError::Network(e.to_string()))?;
        Ok(Self { socket, cached_connection_id: None })
    }

    /// Resolve `udp://host:port[/...]` to a socket address for [`connect`](Self::connect).
    pub async fn resolve(url: &str) -> Result<SocketAddr, TrackerError> {
        let without_scheme = url.strip_prefix("udp://").ok_or_else(|| TrackerError::UnsupportedProtocol(url.to_string()))?;
        let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
        tokio::net::lookup_host(host_port)
            .await
            .map_err(|e| TrackerError::Network(e.to_string()))?
            .next()
            .ok_or_else(|| TrackerError::Network(format!("no address resolved for {host_port}")))
    }

    #[tracing::instrument(skip(self, req))]
    pub async fn announce(&mut self, req: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self.connection_id().await?;

        let transaction_id = rand::rng().next_u32();
        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(req.info_hash.as_bytes());
        packet.extend_from_slice(&req.peer_id);
        packet.extend_from_slice(&req.downloaded.to_be_bytes());
        packet.extend_from_slice(&req.left.to_be_bytes());
        packet.extend_from_slice(&req.uploaded.to_be_bytes());
        packet.extend_from_slice(&event_code(req.event).to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // IP address: 0 = use sender's
        packet.extend_from_slice(&req.key.to_be_bytes());
        packet.extend_from_slice(&(req.numwant.map(|n| n as i32).unwrap_or(-1)).to_be_bytes());
        packet.extend_from_slice(&req.port.to_be_bytes());

        let reply = self.send_with_retry(&packet, transaction_id).await?;
        parse_announce_reply(&reply)
    }

    async fn connection_id(&mut self) -> Result<u64, TrackerError> {
        if let Some((id, obtained_at)) = self.cached_connection_id {
            if obtained_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }
        let transaction_id = rand::rng().next_u32();
        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());

        let reply = self.send_with_retry(&packet, transaction_id).await?;
        if reply.len() < 16 {
            return Err(TrackerError::BadResponse("connect reply shorter than 16 bytes".into()));
        }
        let action = BigEndian::read_u32(&reply[0..4]);
        if action != ACTION_CONNECT {
            return Err(TrackerError::BadResponse(format!("unexpected action {action} in connect reply")));
        }
        let connection_id = BigEndian::read_u64(&reply[8..16]);
        self.cached_connection_id = Some((connection_id, Instant::now()));
        Ok(connection_id)
    }

    async fn send_with_retry(&self, packet: &[u8], transaction_id: u32) -> Result<Vec<u8>, TrackerError> {
        for &wait in &TIMEOUTS {
            self.socket.send(packet).await.map_err(|e| TrackerError::Network(e.to_string()))?;
            let mut buf = vec![0u8; 4096];
            loop {
                match timeout(wait, self.socket.recv(&mut buf)).await {
                    Ok(Ok(n)) => {
                        let received = buf[..n].to_vec();
                        if received.len() >= 8 && BigEndian::read_u32(&received[4..8]) == transaction_id {
                            if BigEndian::read_u32(&received[0..4]) == ACTION_ERROR {
                                let message = String::from_utf8_lossy(&received[8..]).into_owned();
                                return Err(TrackerError::FailureReason(message));
                            }
                            return Ok(received);
                        }
                        // Stale/mismatched reply: keep waiting within this attempt's budget.
                    }
                    Ok(Err(e)) => return Err(TrackerError::Network(e.to_string())),
                    Err(_) => break,
                }
            }
        }
        Err(TrackerError::Timeout)
    }
}

fn event_code(event: super::AnnounceEvent) -> u32 {
    match event {
        super::AnnounceEvent::None => 0,
        super::AnnounceEvent::Completed => 1,
        super::AnnounceEvent::Started => 2,
        super::AnnounceEvent::Stopped => 3,
    }
}

fn parse_announce_reply(reply: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    if reply.len() < 20 {
        return Err(TrackerError::BadResponse("announce reply shorter than 20 bytes".into()));
    }
    let action = BigEndian::read_u32(&reply[0..4]);
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::BadResponse(format!("unexpected action {action} in announce reply")));
    }
    let interval = BigEndian::read_u32(&reply[8..12]);
    let incomplete = BigEndian::read_u32(&reply[12..16]);
    let complete = BigEndian::read_u32(&reply[16..20]);

    let peer_bytes = &reply[20..];
    if peer_bytes.len() % 6 != 0 {
        return Err(TrackerError::BadResponse(format!("peer block length {} not a multiple of 6", peer_bytes.len())));
    }
    let peers = peer_bytes
        .chunks_exact(6)
        .filter_map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = BigEndian::read_u16(&chunk[4..6]);
            // §4.4: invalid ports (0) are dropped from peer lists.
            if port == 0 {
                None
            } else {
                Some(SocketAddr::new(IpAddr::V4(ip), port))
            }
        })
        .collect();

    Ok(AnnounceResponse {
        interval,
        min_interval: None,
        tracker_id: None,
        complete: Some(complete),
        incomplete: Some(incomplete),
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_announce_reply_peer_block() {
        let mut reply = vec![0u8; 20];
        BigEndian::write_u32(&mut reply[0..4], ACTION_ANNOUNCE);
        BigEndian::write_u32(&mut reply[8..12], 1800);
        BigEndian::write_u32(&mut reply[12..16], 3);
        BigEndian::write_u32(&mut reply[16..20], 7);
        reply.extend_from_slice(&[10, 0, 0, 1, 0x1A, 0xE1]);
        let response = parse_announce_reply(&reply).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.incomplete, Some(3));
        assert_eq!(response.complete, Some(7));
        assert_eq!(response.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn drops_peers_with_invalid_zero_port() {
        let mut reply = vec![0u8; 20];
        BigEndian::write_u32(&mut reply[0..4], ACTION_ANNOUNCE);
        BigEndian::write_u32(&mut reply[8..12], 1800);
        BigEndian::write_u32(&mut reply[12..16], 1);
        BigEndian::write_u32(&mut reply[16..20], 1);
        reply.extend_from_slice(&[10, 0, 0, 1, 0x00, 0x00]); // port 0: dropped
        reply.extend_from_slice(&[10, 0, 0, 2, 0x1A, 0xE1]); // valid port: kept
        let response = parse_announce_reply(&reply).unwrap();
        assert_eq!(response.peers, vec!["10.0.0.2:6881".parse().unwrap()]);
    }

    #[test]
    fn rejects_short_announce_reply() {
        assert!(matches!(parse_announce_reply(&[0u8; 10]), Err(TrackerError::BadResponse(_))));
    }

    #[test]
    fn event_codes_match_bep15() {
        assert_eq!(event_code(super::super::AnnounceEvent::None), 0);
        assert_eq!(event_code(super::super::AnnounceEvent::Completed), 1);
        assert_eq!(event_code(super::super::AnnounceEvent::Started), 2);
        assert_eq!(event_code(super::super::AnnounceEvent::Stopped), 3);
    }
}

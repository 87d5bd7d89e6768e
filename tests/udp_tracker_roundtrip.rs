//! §8 scenario 3: connect/announce against a real UDP socket, against a
//! tiny fake tracker server driven by this test, mirroring the literal
//! magic number, action and connection-id fields BEP-15 pins down.
use bittorrent_engine::metainfo::InfoHash;
use bittorrent_engine::tracker::udp::UdpTracker;
use bittorrent_engine::tracker::{AnnounceEvent, AnnounceRequest};
use byteorder::{BigEndian, ByteOrder};
use tokio::net::UdpSocket;

const PROTOCOL_ID: u64 = 0x41727101980;
const FAKE_CONNECTION_ID: u64 = 0x0123_4567_89AB_CDEF;

/// Answers exactly one connect request and exactly one announce
/// request, then exits — enough to drive a single `announce()` call.
async fn run_fake_tracker(socket: UdpSocket) {
    let mut buf = [0u8; 1024];

    let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
    let request = &buf[..n];
    assert_eq!(request.len(), 16, "connect request must be 16 bytes");
    assert_eq!(BigEndian::read_u64(&request[0..8]), PROTOCOL_ID);
    assert_eq!(BigEndian::read_u32(&request[8..12]), 0, "action must be connect(0)");
    let transaction_id = BigEndian::read_u32(&request[12..16]);

    let mut reply = vec![0u8; 16];
    BigEndian::write_u32(&mut reply[0..4], 0);
    BigEndian::write_u32(&mut reply[4..8], transaction_id);
    BigEndian::write_u64(&mut reply[8..16], FAKE_CONNECTION_ID);
    socket.send_to(&reply, peer).await.unwrap();

    let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
    let request = &buf[..n];
    assert_eq!(request.len(), 98, "announce request must be 98 bytes");
    assert_eq!(BigEndian::read_u64(&request[0..8]), FAKE_CONNECTION_ID);
    assert_eq!(BigEndian::read_u32(&request[8..12]), 1, "action must be announce(1)");
    let transaction_id = BigEndian::read_u32(&request[12..16]);
    assert_eq!(&request[16..36], InfoHash::from_bytes([3u8; 20]).as_bytes().as_slice());

    let mut reply = vec![0u8; 20];
    BigEndian::write_u32(&mut reply[0..4], 1);
    BigEndian::write_u32(&mut reply[4..8], transaction_id);
    BigEndian::write_u32(&mut reply[8..12], 1800);
    BigEndian::write_u32(&mut reply[12..16], 3);
    BigEndian::write_u32(&mut reply[16..20], 7);
    reply.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
    reply.extend_from_slice(&[192, 168, 1, 1, 0x1A, 0xE1]);
    socket.send_to(&reply, peer).await.unwrap();
}

#[tokio::test]
async fn connect_then_announce_round_trips_peers() {
    let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let server = tokio::spawn(run_fake_tracker(server_socket));

    let mut client = UdpTracker::connect(server_addr).await.unwrap();
    let request = AnnounceRequest {
        info_hash: InfoHash::from_bytes([3u8; 20]),
        peer_id: [4u8; 20],
        port: 6881,
        uploaded: 0,
        downloaded: 0,
        left: 1_000_000,
        event: AnnounceEvent::Started,
        numwant: Some(50),
        key: 0xAABBCCDD,
    };

    let response = client.announce(&request).await.unwrap();
    assert_eq!(response.interval, 1800);
    assert_eq!(response.incomplete, Some(3));
    assert_eq!(response.complete, Some(7));
    assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap(), "192.168.1.1:6881".parse().unwrap()]);

    server.await.unwrap();
}

//! §8 scenario 4: a handshake delivered across three arbitrary TCP
//! chunks must still produce exactly one parsed handshake and flip the
//! wire FSM to `Active`, over a real loopback socket (not an in-memory
//! buffer), since framing-across-reads is exactly what `read_exact`
//! over a `TcpStream` has to get right.
use bittorrent_engine::metainfo::InfoHash;
use bittorrent_engine::peer::connection::Connection;
use bittorrent_engine::peer::wire::{Wire, WireState};
use bittorrent_engine::peer::Handshake;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn handshake_split_across_three_chunks_yields_one_event() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handshake = Handshake::new(InfoHash::from_bytes([7u8; 20]), [9u8; 20]);
    let bytes = handshake.serialize();

    let writer = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Three arbitrary, uneven chunks with a yield between each so
        // the reader genuinely observes separate TCP segments rather
        // than one buffered write.
        let chunks = [&bytes[0..1], &bytes[1..30], &bytes[30..68]];
        for chunk in chunks {
            stream.write_all(chunk).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    });

    let (stream, _) = listener.accept().await.unwrap();
    let connection = Connection::from_stream(stream, CancellationToken::new());
    let mut wire = Wire::new(connection, 10);

    assert_eq!(wire.state(), WireState::WaitingHandshake);
    let received = wire.receive_handshake().await.unwrap();
    assert_eq!(received, handshake);
    assert_eq!(wire.state(), WireState::Active);

    writer.await.unwrap();
}

#[tokio::test]
async fn malformed_protocol_string_closes_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut bytes = Handshake::new(InfoHash::from_bytes([1u8; 20]), [2u8; 20]).serialize();
    bytes[1] = b'X';

    tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&bytes).await.unwrap();
    });

    let (stream, _) = listener.accept().await.unwrap();
    let connection = Connection::from_stream(stream, CancellationToken::new());
    let mut wire = Wire::new(connection, 10);

    let result = wire.receive_handshake().await;
    assert!(result.is_err());
    assert_eq!(wire.state(), WireState::Closed);
}

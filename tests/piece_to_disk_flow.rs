//! §8 scenario 5: a piece whose accumulated blocks hash-match is handed
//! to the disk layer and marked `have`; a piece whose blocks hash-
//! mismatch is left off disk and not marked `have`, crossing the
//! `PieceManager` / `DiskManager` boundary the way the session does.
use bittorrent_engine::metainfo::InfoHash;
use bittorrent_engine::peer::message::Block;
use bittorrent_engine::peer::PeerKey;
use bittorrent_engine::piece::{PieceEvent, PieceManager};
use bittorrent_engine::session::disk::{DiskManager, InMemoryDisk};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fn peer(n: u8) -> PeerKey {
    PeerKey { info_hash: InfoHash::from_bytes([5u8; 20]), addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, n)), 6881) }
}

#[tokio::test]
async fn verified_piece_is_written_and_marked_have() {
    let piece_len = 32 * 1024u32; // two 16 KiB blocks
    let data: Vec<u8> = (0..piece_len).map(|i| (i % 251) as u8).collect();
    let hash: [u8; 20] = Sha1::digest(&data).into();

    let mut manager = PieceManager::new(1, piece_len, piece_len as u64, HashSet::new());
    let mut disk = InMemoryDisk::new(piece_len, vec![hash]);
    disk.start().await.unwrap();

    let p = peer(1);
    let (first, cancels) = manager.handle_block(p, Block { index: 0, begin: 0, data: data[0..16384].to_vec() }, &hash);
    assert!(first.is_none());
    assert!(cancels.is_empty());

    let (second, _) = manager.handle_block(p, Block { index: 0, begin: 16384, data: data[16384..].to_vec() }, &hash);
    match second {
        Some(PieceEvent::PieceComplete { index, data: written }) => {
            assert_eq!(index, 0);
            disk.write_piece(index, written).await.unwrap();
        }
        other => panic!("expected PieceComplete, got {other:?}"),
    }

    assert!(manager.have().has(0));
    assert!(disk.has_piece(0).await);
    let block = disk.read_block(0, 0, 100).await.unwrap();
    assert_eq!(block, data[0..100]);
}

#[tokio::test]
async fn corrupted_piece_is_neither_written_nor_marked_have() {
    let piece_len = 16384u32;
    let data = vec![9u8; piece_len as usize];
    let wrong_hash = [0u8; 20];

    let mut manager = PieceManager::new(1, piece_len, piece_len as u64, HashSet::new());
    let disk = InMemoryDisk::new(piece_len, vec![wrong_hash]);

    let p = peer(2);
    let (event, _) = manager.handle_block(p, Block { index: 0, begin: 0, data }, &wrong_hash);
    assert!(matches!(event, Some(PieceEvent::PieceFailed { index: 0, ref offending_peers }) if offending_peers == &vec![p]));

    assert!(!manager.have().has(0));
    assert!(!disk.has_piece(0).await);
}

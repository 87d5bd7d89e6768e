//! Outbound connection establishment (§4.9 "smart connect"): combines
//! the socket layer, the MSE/PE handshake, and the plain BitTorrent
//! handshake into the three policies a caller can ask for.
use super::connection::{Connection, RcFour};
use super::encryption::{
    self, derive_rc4, hash as mse_hash, random_pad, synchronize_vc, DiffieHellman, EncryptionMode, CRYPTO_PLAINTEXT,
    CRYPTO_RC4, DH_KEY_LENGTH,
};
use super::handshake::Handshake;
use super::wire::Wire;
use super::PeerError;
use rc4::StreamCipher;
use std::net::SocketAddr;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const MAX_SYNC_SEARCH: usize = 64 * 1024;

/// Outcome of establishing a connection: the framed wire ready for
/// handshake exchange, plus whether MSE/PE was actually negotiated.
pub struct Established {
    pub wire: Wire,
    pub encrypted: bool,
}

/// §4.9 smart connect: dispatch to the right policy and drive the
/// plain BitTorrent handshake once the transport (plaintext or
/// MSE/PE) is ready.
pub async fn smart_connect(
    addr: SocketAddr,
    mode: EncryptionMode,
    handshake: &Handshake,
    piece_count: usize,
    cancel: CancellationToken,
) -> Result<(Established, Handshake), PeerError> {
    match mode {
        EncryptionMode::Disabled => connect_plaintext(addr, handshake, piece_count, cancel).await,
        EncryptionMode::Require => connect_encrypted(addr, handshake, piece_count, cancel).await,
        EncryptionMode::Prefer => {
            let attempt = timeout(
                EncryptionMode::PREFER_TIMEOUT,
                connect_encrypted(addr, handshake, piece_count, cancel.clone()),
            )
            .await;
            match attempt {
                Ok(Ok(result)) => Ok(result),
                _ => connect_plaintext(addr, handshake, piece_count, cancel).await,
            }
        }
    }
}

async fn connect_plaintext(
    addr: SocketAddr,
    handshake: &Handshake,
    piece_count: usize,
    cancel: CancellationToken,
) -> Result<(Established, Handshake), PeerError> {
    let connection = Connection::connect(addr, cancel).await?;
    let mut wire = Wire::new(connection, piece_count);
    wire.send_handshake(handshake).await?;
    let peer_handshake = wire.receive_handshake().await?;
    Ok((Established { wire, encrypted: false }, peer_handshake))
}

/// Drives the four-step initiator MSE handshake (§4.9) over a fresh
/// TCP connection, then layers the plain BitTorrent handshake on top
/// of the negotiated (possibly RC4) stream.
async fn connect_encrypted(
    addr: SocketAddr,
    handshake: &Handshake,
    piece_count: usize,
    cancel: CancellationToken,
) -> Result<(Established, Handshake), PeerError> {
    let mut connection = Connection::connect(addr, cancel).await?;
    let skey = handshake.info_hash.as_bytes().to_vec();

    // Step 1: A -> B: Ya || PadA
    let dh = DiffieHellman::generate();
    let pad_a = random_pad(512);
    let mut step1 = Vec::with_capacity(DH_KEY_LENGTH + pad_a.len());
    step1.extend_from_slice(&dh.public_key_bytes());
    step1.extend_from_slice(&pad_a);
    connection.write_all_raw(&step1).await?;

    // Step 2: B -> A: Yb || PadB. A leading 0x13 means the peer replied
    // with a plaintext BitTorrent handshake instead of MSE.
    let mut yb = [0u8; DH_KEY_LENGTH];
    connection.read_exact_raw(&mut yb).await?;
    if yb[0] == 0x13 {
        return Err(PeerError::Encryption("peer replied with a plaintext handshake, not MSE".into()));
    }
    let shared_secret = dh.shared_secret(&yb);

    // Step 3: A -> B: HASH('req1', S) || (HASH('req2', SKEY) XOR HASH('req3', S)) || ENCRYPT(...)
    let req1 = mse_hash(b"req1", &[&shared_secret]);
    let req2 = mse_hash(b"req2", &[&skey]);
    let req3 = mse_hash(b"req3", &[&shared_secret]);
    let mut req23 = [0u8; 20];
    for i in 0..20 {
        req23[i] = req2[i] ^ req3[i];
    }

    let mut key_a = derive_rc4(b"keyA", &shared_secret, &skey);
    let initial_payload = handshake.serialize();
    let mut step3_cipher = encryption::build_step3_payload(CRYPTO_PLAINTEXT | CRYPTO_RC4, &initial_payload);
    key_a.apply_keystream(&mut step3_cipher);

    let mut outgoing = Vec::with_capacity(20 + 20 + step3_cipher.len());
    outgoing.extend_from_slice(&req1);
    outgoing.extend_from_slice(&req23);
    outgoing.extend_from_slice(&step3_cipher);
    connection.write_all_raw(&outgoing).await?;

    // Step 4: B -> A: PadB (unencrypted, unknown length) followed by
    // ENCRYPT(VC || crypto_select || len(PadD) || PadD). PadB's length
    // isn't known up front, so the real VC offset is found by
    // trial-decrypting each candidate 8-byte window with its own
    // freshly-keyed keyB cipher, not by continuing one keystream from
    // buffer offset 0.
    let mut search_buf = Vec::new();
    let mut chunk = [0u8; 64];
    let (offset, mut cipher) = loop {
        let n = connection.read_some_raw(&mut chunk).await?;
        if n == 0 {
            return Err(PeerError::Encryption("connection closed during VC search".into()));
        }
        search_buf.extend_from_slice(&chunk[..n]);
        if search_buf.len() > MAX_SYNC_SEARCH {
            return Err(PeerError::Encryption("VC not found within 64 KiB search buffer".into()));
        }
        if let Ok(found) = synchronize_vc(&search_buf, &shared_secret, &skey) {
            break found;
        }
    };

    // `synchronize_vc` returns a cipher freshly positioned right after
    // the VC window it found, so what follows in `search_buf` is the
    // still-encrypted crypto_select/len(PadD)/PadD header.
    let mut remaining = search_buf.split_off(offset);
    while remaining.len() < 6 {
        let n = connection.read_some_raw(&mut chunk).await?;
        if n == 0 {
            return Err(PeerError::Encryption("connection closed while reading crypto_select header".into()));
        }
        remaining.extend_from_slice(&chunk[..n]);
    }
    let mut header = remaining.split_off(6);
    std::mem::swap(&mut header, &mut remaining);
    cipher.apply_keystream(&mut header);
    let crypto_select = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let pad_d_len = u16::from_be_bytes([header[4], header[5]]) as usize;

    let mut tail = remaining;
    while tail.len() < pad_d_len {
        let n = connection.read_some_raw(&mut chunk).await?;
        if n == 0 {
            return Err(PeerError::Encryption("connection closed while reading PadD".into()));
        }
        tail.extend_from_slice(&chunk[..n]);
    }
    let mut leftover = tail.split_off(pad_d_len);
    cipher.apply_keystream(&mut tail); // discard decrypted PadD

    if crypto_select & (CRYPTO_PLAINTEXT as u32 | CRYPTO_RC4 as u32) == 0 {
        return Err(PeerError::Encryption("crypto_select advertises no recognized cipher".into()));
    }
    let selected_rc4 = crypto_select & CRYPTO_RC4 as u32 != 0;

    // Only the remainder beyond PadD is optionally RC4-protected,
    // depending on what crypto_select actually picked (§4.9).
    if selected_rc4 {
        cipher.apply_keystream(&mut leftover);
    }

    if selected_rc4 {
        connection.install_cipher(RcFour { encrypt: key_a, decrypt: cipher });
    }
    if !leftover.is_empty() {
        connection.inject_plaintext(leftover);
    }
    let mut wire = Wire::new(connection, piece_count);

    // The initiator already sent its handshake as part of step 3's IA;
    // any reply handshake is read the normal way, transparently
    // decrypted if RC4 was selected, with any already-buffered
    // remainder bytes consumed first.
    let peer_handshake = wire.receive_handshake().await?;

    Ok((Established { wire, encrypted: selected_rc4 }, peer_handshake))
}

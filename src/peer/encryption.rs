//! Message Stream Encryption / Protocol Encryption (§4.9): a
//! Diffie-Hellman key exchange followed by RC4-encrypted stream setup,
//! used to disguise BitTorrent traffic from naive protocol filters.
use super::PeerError;
use num_bigint::BigUint;
use num_traits::Num;
use rand::RngCore;
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};
use std::time::Duration;

/// The standardized 768-bit MSE prime.
const P_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";
const G: u64 = 2;
/// DH public keys are fixed-size at 96 bytes for this prime (768 bits).
pub const DH_KEY_LENGTH: usize = 96;
const MAX_PAD_LENGTH: usize = 512;
/// §5: MSE synchronization search buffer is bounded at 64 KiB.
const MAX_SYNC_BUFFER: usize = 64 * 1024;
pub const VC: [u8; 8] = [0u8; 8];

pub const CRYPTO_PLAINTEXT: u8 = 0x01;
pub const CRYPTO_RC4: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    Disabled,
    Require,
    Prefer,
}

impl EncryptionMode {
    /// §4.9: `prefer` gives an encrypted attempt this much time before
    /// falling back to a fresh plaintext connection.
    pub const PREFER_TIMEOUT: Duration = Duration::from_secs(5);
}

pub struct DiffieHellman {
    prime: BigUint,
    private: BigUint,
    public: BigUint,
}

impl DiffieHellman {
    pub fn generate() -> Self {
        let prime = BigUint::from_str_radix(P_HEX, 16).expect("fixed MSE prime parses");
        let mut rng = rand::rng();
        let mut private_bytes = [0u8; DH_KEY_LENGTH];
        rng.fill_bytes(&mut private_bytes);
        let private = BigUint::from_bytes_be(&private_bytes);
        let public = BigUint::from(G).modpow(&private, &prime);
        Self { prime, private, public }
    }

    pub fn public_key_bytes(&self) -> [u8; DH_KEY_LENGTH] {
        to_fixed_width(&self.public)
    }

    pub fn shared_secret(&self, peer_public: &[u8]) -> [u8; DH_KEY_LENGTH] {
        let peer_public = BigUint::from_bytes_be(peer_public);
        let secret = peer_public.modpow(&self.private, &self.prime);
        to_fixed_width(&secret)
    }
}

fn to_fixed_width(value: &BigUint) -> [u8; DH_KEY_LENGTH] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; DH_KEY_LENGTH];
    let start = DH_KEY_LENGTH.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(DH_KEY_LENGTH)..]);
    out
}

/// `HASH(label, data...)` as used throughout §4.9: SHA-1 over the
/// concatenation of a literal label and one or more byte strings.
pub fn hash(label: &[u8], parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(label);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// RC4 keyed by `HASH(label, S, SKEY)` with the first 1024 keystream
/// bytes discarded before any real data is processed.
pub fn derive_rc4(label: &[u8], shared_secret: &[u8], skey: &[u8]) -> Rc4<rc4::consts::U20> {
    let key = hash(label, &[shared_secret, skey]);
    let mut cipher = Rc4::new((&key).into());
    let mut discard = [0u8; 1024];
    cipher.apply_keystream(&mut discard);
    cipher
}

pub fn random_pad(max_len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    let len = (rng.next_u32() as usize) % (max_len + 1);
    let mut pad = vec![0u8; len];
    rng.fill_bytes(&mut pad);
    pad
}

/// Initiator-side step 3 payload: `VC || crypto_provide || len(PadC) ||
/// PadC || len(IA) || IA`, to be RC4-encrypted by the caller with the
/// `keyA` cipher before sending.
pub fn build_step3_payload(crypto_provide: u8, initial_payload: &[u8]) -> Vec<u8> {
    let pad_c = random_pad(MAX_PAD_LENGTH);
    let mut out = Vec::with_capacity(8 + 4 + 2 + pad_c.len() + 2 + initial_payload.len());
    out.extend_from_slice(&VC);
    out.extend_from_slice(&(crypto_provide as u32).to_be_bytes());
    out.extend_from_slice(&(pad_c.len() as u16).to_be_bytes());
    out.extend_from_slice(&pad_c);
    out.extend_from_slice(&(initial_payload.len() as u16).to_be_bytes());
    out.extend_from_slice(initial_payload);
    out
}

/// Find the offset of an 8-byte window whose RC4-decryption equals
/// [`VC`]. PadB (0..512 random bytes) sits unencrypted ahead of the
/// encrypted VC in the wire buffer, and its length is unknown to the
/// receiver, so there is no single keystream position to decrypt from:
/// each candidate offset is trial-decrypted with its own freshly-keyed
/// `keyB` cipher (§4.9 step 4), not a keystream continued from offset
/// 0. On a match, a fresh cipher positioned right after the VC window
/// is returned so the caller can continue decrypting `crypto_select`
/// onward from `offset + 8`.
pub fn synchronize_vc(buf: &[u8], shared_secret: &[u8], skey: &[u8]) -> Result<(usize, Rc4<rc4::consts::U20>), PeerError> {
    if buf.len() > MAX_SYNC_BUFFER {
        return Err(PeerError::Encryption("VC synchronization search exceeded 64 KiB".into()));
    }
    if buf.len() < 8 {
        return Err(PeerError::Encryption("VC not found within search buffer".into()));
    }
    for offset in 0..=buf.len() - 8 {
        let mut candidate = derive_rc4(b"keyB", shared_secret, skey);
        let mut window = [0u8; 8];
        window.copy_from_slice(&buf[offset..offset + 8]);
        candidate.apply_keystream(&mut window);
        if window == VC {
            return Ok((offset + 8, candidate));
        }
    }
    Err(PeerError::Encryption("VC not found within search buffer".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diffie_hellman_parties_agree_on_shared_secret() {
        let alice = DiffieHellman::generate();
        let bob = DiffieHellman::generate();
        let alice_secret = alice.shared_secret(&bob.public_key_bytes());
        let bob_secret = bob.shared_secret(&alice.public_key_bytes());
        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn public_key_is_fixed_width() {
        let dh = DiffieHellman::generate();
        assert_eq!(dh.public_key_bytes().len(), DH_KEY_LENGTH);
    }

    #[test]
    fn hash_is_deterministic_and_label_sensitive() {
        let a = hash(b"req1", &[b"secret"]);
        let b = hash(b"req2", &[b"secret"]);
        assert_ne!(a, b);
        assert_eq!(hash(b"req1", &[b"secret"]), a);
    }

    #[test]
    fn synchronize_vc_finds_the_sender_side_window() {
        let secret = [7u8; 20];
        let skey = [9u8; 20];

        // PadB: unencrypted random bytes, never touched by keyB.
        let pad_b = vec![0xAAu8; 3];
        // The encrypted blob starts fresh at its own keyB keystream
        // position 0, independent of PadB's length.
        let mut encrypted = VC.to_vec();
        encrypted.extend_from_slice(&[0xCDu8; 2]); // stand-in for crypto_select bytes
        let mut sender_cipher = derive_rc4(b"keyB", &secret, &skey);
        sender_cipher.apply_keystream(&mut encrypted);

        let mut wire = pad_b.clone();
        wire.extend_from_slice(&encrypted);

        let (offset, mut cipher) = synchronize_vc(&wire, &secret, &skey).unwrap();
        assert_eq!(offset, pad_b.len() + 8);

        // The returned cipher must be positioned to decrypt whatever
        // follows the VC window, not just have found it.
        let mut remainder = wire[offset..].to_vec();
        cipher.apply_keystream(&mut remainder);
        assert_eq!(remainder, [0xCDu8; 2]);
    }

    #[test]
    fn synchronize_vc_fails_when_vc_absent() {
        let noise = vec![0x55u8; 40];
        assert!(synchronize_vc(&noise, &[1u8; 20], &[2u8; 20]).is_err());
    }

    #[test]
    fn synchronize_vc_is_insensitive_to_padb_length() {
        // The reviewer's core complaint: PadB of varying, unknown
        // length must not throw off alignment. Try several lengths.
        let secret = [3u8; 20];
        let skey = [4u8; 20];
        for pad_len in [0usize, 1, 17, 200] {
            let pad_b = vec![0x11u8; pad_len];
            let mut encrypted = VC.to_vec();
            let mut sender_cipher = derive_rc4(b"keyB", &secret, &skey);
            sender_cipher.apply_keystream(&mut encrypted);
            let mut wire = pad_b.clone();
            wire.extend_from_slice(&encrypted);

            let (offset, _cipher) = synchronize_vc(&wire, &secret, &skey).unwrap();
            assert_eq!(offset, pad_len + 8, "failed for pad_len={pad_len}");
        }
    }
}

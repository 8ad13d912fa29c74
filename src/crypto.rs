//! CryptoCore: identity keys, per-peer session keys, AEAD with replay
//! protection.
//!
//! Grounded on the teacher's `CryptoManager` (X25519 ECDH + a
//! `RwLock<HashMap<PeerId, SessionKey>>` session table) generalized to the
//! spec's binding/replay/zeroization requirements: HKDF-SHA256 with a
//! domain-separated, sorted-pubkey `info` instead of a bare SHA-256 of the
//! shared secret, ChaCha20-Poly1305 instead of AES-256-GCM, and an explicit
//! 96-bit big-endian send counter / highest-seen receive counter per peer
//! instead of random nonces (needed for replay detection).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;
const DOMAIN_TAG: &[u8] = b"zajel_session";

/// A 32-byte symmetric key, overwritten with zeros when it goes out of scope.
#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyMaterial([u8; 32]);

struct PeerSession {
    cipher: ChaCha20Poly1305,
    #[allow(dead_code)]
    key: KeyMaterial,
    send_counter: u64,
    highest_seen_counter: Option<u64>,
}

/// The X25519 pair is CryptoCore's pairwise-session identity; the Ed25519
/// pair is the publish identity `ChannelEngine::publish` signs chunks with.
/// Both are generated/persisted together so a daemon has exactly one
/// identity file, not two.
struct Identity {
    secret: StaticSecret,
    public: PublicKey,
    signing_key: SigningKey,
}

/// Process-wide identity plus the live session-key table. One instance per
/// daemon, owned by `Supervisor` and shared by reference with every engine
/// that needs to encrypt/decrypt — CryptoCore is the only component that
/// touches key material.
pub struct CryptoCore {
    identity: RwLock<Option<Identity>>,
    sessions: RwLock<HashMap<String, PeerSession>>,
}

/// Wire format for an encrypted payload: base64(nonce || ciphertext).
pub fn encode_ciphertext(nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> String {
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(ciphertext);
    URL_SAFE_NO_PAD.encode(out)
}

fn decode_ciphertext(wire: &str) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let raw = URL_SAFE_NO_PAD
        .decode(wire)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    if raw.len() < NONCE_LEN {
        return Err(CryptoError::InvalidKey(
            "ciphertext shorter than nonce".into(),
        ));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&raw[..NONCE_LEN]);
    Ok((nonce, raw[NONCE_LEN..].to_vec()))
}

fn counter_to_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    // top 4 bytes stay zero, low 8 bytes carry the big-endian counter.
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn nonce_to_counter(nonce: &[u8; NONCE_LEN]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&nonce[4..]);
    u64::from_be_bytes(buf)
}

/// HKDF `info` = domain tag ‖ lexicographically-sorted(local_pub, peer_pub).
/// Sorting rather than role-tagging means both sides derive the same key
/// without a round-trip to agree on who goes first.
fn session_info(local_pub: &PublicKey, peer_pub: &PublicKey) -> Vec<u8> {
    let a = local_pub.as_bytes();
    let b = peer_pub.as_bytes();
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut info = Vec::with_capacity(DOMAIN_TAG.len() + 64);
    info.extend_from_slice(DOMAIN_TAG);
    info.extend_from_slice(first);
    info.extend_from_slice(second);
    info
}

impl CryptoCore {
    pub fn new() -> Self {
        CryptoCore {
            identity: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Generate a fresh X25519 + Ed25519 identity, replacing any existing
    /// one. Returns the X25519 public key, URL-safe-base64 encoded.
    pub fn generate_identity(&self) -> String {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let signing_key = SigningKey::generate(&mut OsRng);
        let encoded = URL_SAFE_NO_PAD.encode(public.as_bytes());
        *self.identity.write().unwrap() = Some(Identity { secret, public, signing_key });
        encoded
    }

    /// Load an identity previously persisted to the identity file: 32 bytes
    /// of X25519 secret followed by 32 bytes of Ed25519 seed.
    pub fn load_identity(&self, combined: [u8; 64]) -> String {
        let mut x25519_bytes = [0u8; 32];
        x25519_bytes.copy_from_slice(&combined[..32]);
        let mut ed25519_seed = [0u8; 32];
        ed25519_seed.copy_from_slice(&combined[32..]);

        let secret = StaticSecret::from(x25519_bytes);
        let public = PublicKey::from(&secret);
        let signing_key = SigningKey::from_bytes(&ed25519_seed);
        let encoded = URL_SAFE_NO_PAD.encode(public.as_bytes());
        *self.identity.write().unwrap() = Some(Identity { secret, public, signing_key });
        encoded
    }

    /// Raw secret bytes, for persistence only: 32-byte X25519 secret ‖
    /// 32-byte Ed25519 seed. Callers must handle the result with the same
    /// care `PeerStore` gives the identity file.
    pub fn export_secret(&self) -> Result<[u8; 64], CryptoError> {
        let id = self.identity.read().unwrap();
        let id = id.as_ref().ok_or(CryptoError::NoIdentity)?;
        let mut combined = [0u8; 64];
        combined[..32].copy_from_slice(&id.secret.to_bytes());
        combined[32..].copy_from_slice(&id.signing_key.to_bytes());
        Ok(combined)
    }

    pub fn public_key(&self) -> Result<String, CryptoError> {
        let id = self.identity.read().unwrap();
        let id = id.as_ref().ok_or(CryptoError::NoIdentity)?;
        Ok(URL_SAFE_NO_PAD.encode(id.public.as_bytes()))
    }

    /// The Ed25519 signing key `ChannelEngine::publish` needs to sign
    /// chunks with this daemon's identity.
    pub fn channel_signing_key(&self) -> Result<SigningKey, CryptoError> {
        let id = self.identity.read().unwrap();
        let id = id.as_ref().ok_or(CryptoError::NoIdentity)?;
        Ok(id.signing_key.clone())
    }

    /// The Ed25519 verifying key, URL-safe-base64 encoded — what a channel
    /// manifest's `owner_pubkey`/`admin_pubkeys` entries hold.
    pub fn channel_public_key(&self) -> Result<String, CryptoError> {
        let id = self.identity.read().unwrap();
        let id = id.as_ref().ok_or(CryptoError::NoIdentity)?;
        Ok(URL_SAFE_NO_PAD.encode(id.signing_key.verifying_key().to_bytes()))
    }

    /// Derive and install a session key for `peer_id` from their public key.
    /// Idempotent: re-deriving replaces the prior session, used when a peer
    /// reconnects with a fresh handshake.
    pub fn derive_session(&self, peer_id: &str, peer_public_b64: &str) -> Result<(), CryptoError> {
        let peer_bytes: [u8; 32] = URL_SAFE_NO_PAD
            .decode(peer_public_b64)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?;
        let peer_public = PublicKey::from(peer_bytes);

        let id = self.identity.read().unwrap();
        let id = id.as_ref().ok_or(CryptoError::NoIdentity)?;

        let shared = id.secret.diffie_hellman(&peer_public);
        let info = session_info(&id.public, &peer_public);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm)
            .map_err(|_| CryptoError::InvalidKey("HKDF expand failed".into()))?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm));
        let session = PeerSession {
            cipher,
            key: KeyMaterial(okm),
            send_counter: 0,
            highest_seen_counter: None,
        };

        self.sessions
            .write()
            .unwrap()
            .insert(peer_id.to_string(), session);
        Ok(())
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.read().unwrap().contains_key(peer_id)
    }

    /// Encrypt `plaintext` for `peer_id`, advancing that peer's send
    /// counter. Wire format: base64(12-byte big-endian counter ‖ AEAD out).
    pub fn encrypt(&self, peer_id: &str, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.get_mut(peer_id).ok_or(CryptoError::NoSession)?;

        let nonce_bytes = counter_to_nonce(session.send_counter);
        session.send_counter = session
            .send_counter
            .checked_add(1)
            .expect("send counter exhausted — session must be rotated");

        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = session
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::AuthFailed)?;

        Ok(encode_ciphertext(&nonce_bytes, &ciphertext))
    }

    pub fn encrypt_str(&self, peer_id: &str, message: &str) -> Result<String, CryptoError> {
        self.encrypt(peer_id, message.as_bytes())
    }

    /// Decrypt a wire envelope from `peer_id`. Replay defense: the decoded
    /// counter must exceed the highest counter ever accepted from this peer;
    /// the watermark only advances after AEAD verification succeeds.
    pub fn decrypt(&self, peer_id: &str, wire: &str) -> Result<Vec<u8>, CryptoError> {
        let (nonce_bytes, ciphertext) = decode_ciphertext(wire)?;
        let counter = nonce_to_counter(&nonce_bytes);

        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.get_mut(peer_id).ok_or(CryptoError::NoSession)?;

        if let Some(highest) = session.highest_seen_counter {
            if counter <= highest {
                return Err(CryptoError::ReplayDetected);
            }
        }

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = session
            .cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| CryptoError::AuthFailed)?;

        session.highest_seen_counter = Some(counter);
        Ok(plaintext)
    }

    pub fn decrypt_str(&self, peer_id: &str, wire: &str) -> Result<String, CryptoError> {
        let plaintext = self.decrypt(peer_id, wire)?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Drop a session, zeroizing its key material.
    pub fn drop_session(&self, peer_id: &str) {
        self.sessions.write().unwrap().remove(peer_id);
    }

    pub fn clear_sessions(&self) {
        self.sessions.write().unwrap().clear();
    }
}

impl Default for CryptoCore {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 hex digest, used for file integrity and channel chunk ids.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Random 16-byte id, used for device/transfer identifiers that are not
/// meant to be user-memorable.
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_binding_is_symmetric_and_sensitive_to_both_keys() {
        let a = CryptoCore::new();
        let b = CryptoCore::new();
        let c = CryptoCore::new();

        let pub_a = a.generate_identity();
        let pub_b = b.generate_identity();
        let _pub_c = c.generate_identity();

        a.derive_session("b", &pub_b).unwrap();
        b.derive_session("a", &pub_a).unwrap();

        let msg = "hello, peer";
        let wire = a.encrypt_str("b", msg).unwrap();
        let decrypted = b.decrypt_str("a", &wire).unwrap();
        assert_eq!(decrypted, msg);

        // Swapping either public key must change the derived key: decrypting
        // under C's (wrong) session must fail.
        c.derive_session("a", &pub_a).unwrap();
        assert!(c.decrypt_str("a", &wire).is_err());
    }

    #[test]
    fn replay_is_rejected_without_tearing_down_the_session() {
        let a = CryptoCore::new();
        let b = CryptoCore::new();
        let pub_a = a.generate_identity();
        let pub_b = b.generate_identity();
        a.derive_session("b", &pub_b).unwrap();
        b.derive_session("a", &pub_a).unwrap();

        let wire = a.encrypt_str("b", "one").unwrap();
        assert_eq!(b.decrypt_str("a", &wire).unwrap(), "one");

        // Replaying the same ciphertext must fail, and a fresh message from
        // the same peer must still succeed afterward — session stays intact.
        assert!(matches!(
            b.decrypt("a", &wire).unwrap_err(),
            CryptoError::ReplayDetected
        ));

        let wire2 = a.encrypt_str("b", "two").unwrap();
        assert_eq!(b.decrypt_str("a", &wire2).unwrap(), "two");
    }

    #[test]
    fn decrypt_without_session_is_no_session_error() {
        let b = CryptoCore::new();
        b.generate_identity();
        assert!(matches!(
            b.decrypt("unknown", "AAAA").unwrap_err(),
            CryptoError::NoSession
        ));
    }
}

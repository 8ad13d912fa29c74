//! ChannelEngine: single-publisher, many-subscriber signed content feeds.
//!
//! Unlike pairwise sessions and group sender keys, channel chunks are
//! authenticated rather than merely confidential: the owner (and optionally
//! admins) sign each chunk with an Ed25519 identity key, and subscribers
//! verify against the manifest's key set before ever looking at sequence or
//! storage. Grounded on the teacher's chunked `FileChunk`/`ChunkAck` shape in
//! `file_transfer.rs`, generalized from a two-party transfer to a
//! many-subscriber feed with a trust boundary (signatures) the file-transfer
//! protocol does not need.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::ChannelError;

pub const CHANNEL_CHUNK_SIZE: usize = 64 * 1024;
const INVITE_PREFIX: &str = "zajel://channel/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelManifest {
    pub name: String,
    pub description: String,
    pub owner_pubkey: String,
    pub admin_pubkeys: Vec<String>,
    pub current_encrypt_key: String,
}

impl ChannelManifest {
    fn trusted_signers(&self) -> Vec<String> {
        let mut signers = vec![self.owner_pubkey.clone()];
        signers.extend(self.admin_pubkeys.iter().cloned());
        signers
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub routing_hash: String,
    pub sequence: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub size: usize,
    pub signature: String,
    pub author_pubkey: String,
    pub encrypted_payload: String,
}

impl Chunk {
    /// Canonical bytes the signature covers: every header field plus the
    /// (already-encrypted) payload, in a fixed order.
    fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.chunk_id.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.routing_hash.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.chunk_index.to_be_bytes());
        buf.extend_from_slice(&self.total_chunks.to_be_bytes());
        buf.extend_from_slice(&(self.size as u64).to_be_bytes());
        buf.extend_from_slice(self.encrypted_payload.as_bytes());
        buf
    }
}

struct ChannelState {
    manifest: ChannelManifest,
    watermark: u64,
    /// sequence → chunk ids stored at that sequence, for oldest-first eviction.
    by_sequence: BTreeMap<u64, Vec<String>>,
    chunks: HashMap<String, Chunk>,
}

pub struct ChannelEngine {
    channels: RwLock<HashMap<String, ChannelState>>,
    max_chunks_per_channel: usize,
}

fn decode_key(b64: &str) -> Result<[u8; 32], ChannelError> {
    URL_SAFE_NO_PAD
        .decode(b64)
        .map_err(|_| ChannelError::Invalid("bad base64 key".into()))?
        .try_into()
        .map_err(|_| ChannelError::Invalid("key must be 32 bytes".into()))
}

impl ChannelEngine {
    pub fn new(max_chunks_per_channel: usize) -> Self {
        ChannelEngine {
            channels: RwLock::new(HashMap::new()),
            max_chunks_per_channel,
        }
    }

    pub fn create_channel(&self, channel_id: &str, manifest: ChannelManifest) {
        self.channels.write().unwrap().insert(
            channel_id.to_string(),
            ChannelState {
                manifest,
                watermark: 0,
                by_sequence: BTreeMap::new(),
                chunks: HashMap::new(),
            },
        );
    }

    pub fn subscribe(&self, channel_id: &str, manifest: ChannelManifest) {
        self.create_channel(channel_id, manifest);
    }

    pub fn manifest(&self, channel_id: &str) -> Result<ChannelManifest, ChannelError> {
        self.channels
            .read()
            .unwrap()
            .get(channel_id)
            .map(|c| c.manifest.clone())
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))
    }

    pub fn list_channels(&self) -> Vec<String> {
        self.channels.read().unwrap().keys().cloned().collect()
    }

    /// Split `content` into signed, encrypted chunks sharing one sequence
    /// number, ready to fan out to subscribers.
    pub fn publish(
        &self,
        channel_id: &str,
        content: &[u8],
        signing_key: &SigningKey,
    ) -> Result<Vec<Chunk>, ChannelError> {
        let mut channels = self.channels.write().unwrap();
        let state = channels
            .get_mut(channel_id)
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))?;

        state.watermark += 1;
        let sequence = state.watermark;

        let key = decode_key(&state.manifest.current_encrypt_key)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let author_pubkey = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

        let total_chunks = content.chunks(CHANNEL_CHUNK_SIZE).count().max(1) as u32;
        let mut chunks = Vec::with_capacity(total_chunks as usize);

        for (index, piece) in content.chunks(CHANNEL_CHUNK_SIZE).enumerate() {
            let mut nonce_bytes = [0u8; 12];
            OsRng.fill_bytes(&mut nonce_bytes);
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce_bytes), piece)
                .map_err(|_| ChannelError::Invalid("encryption failed".into()))?;
            let mut wire = nonce_bytes.to_vec();
            wire.extend_from_slice(&ciphertext);
            let encrypted_payload = URL_SAFE_NO_PAD.encode(wire);

            let chunk_id = crate::crypto::sha256_hex(
                format!("{channel_id}:{sequence}:{index}").as_bytes(),
            );

            let mut chunk = Chunk {
                chunk_id: chunk_id.clone(),
                routing_hash: crate::crypto::sha256_hex(channel_id.as_bytes()),
                sequence,
                chunk_index: index as u32,
                total_chunks,
                size: piece.len(),
                signature: String::new(),
                author_pubkey: author_pubkey.clone(),
                encrypted_payload,
            };
            let signature: Signature = signing_key.sign(&chunk.signing_bytes());
            chunk.signature = URL_SAFE_NO_PAD.encode(signature.to_bytes());
            chunks.push(chunk);
        }

        for chunk in &chunks {
            state.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
            state
                .by_sequence
                .entry(chunk.sequence)
                .or_default()
                .push(chunk.chunk_id.clone());
        }
        evict(state, self.max_chunks_per_channel);

        Ok(chunks)
    }

    /// Validate and store an inbound chunk.
    pub fn receive(&self, channel_id: &str, chunk: Chunk) -> Result<(), ChannelError> {
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(ChannelError::Invalid("chunk_index >= total_chunks".into()));
        }

        let mut channels = self.channels.write().unwrap();
        let state = channels
            .get_mut(channel_id)
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))?;

        let signers = state.manifest.trusted_signers();
        if !signers.contains(&chunk.author_pubkey) {
            return Err(ChannelError::BadSignature);
        }
        verify_signature(&chunk)?;

        if chunk.sequence < state.watermark {
            return Err(ChannelError::Replay);
        }
        if chunk.sequence > state.watermark + 1 {
            tracing::warn!(
                channel_id,
                sequence = chunk.sequence,
                watermark = state.watermark,
                "channel chunk sequence gap, accepting with reorder tolerance"
            );
        }
        if chunk.sequence == state.watermark + 1 {
            state.watermark = chunk.sequence;
        }

        if let Some(existing) = state.chunks.get(&chunk.chunk_id) {
            if existing.encrypted_payload != chunk.encrypted_payload {
                return Err(ChannelError::ContentSubstitution(chunk.chunk_id.clone()));
            }
            return Ok(()); // idempotent re-delivery of the same payload
        }

        state.by_sequence.entry(chunk.sequence).or_default().push(chunk.chunk_id.clone());
        state.chunks.insert(chunk.chunk_id.clone(), chunk);
        evict(state, self.max_chunks_per_channel);
        Ok(())
    }

    pub fn chunk_count(&self, channel_id: &str) -> usize {
        self.channels
            .read()
            .unwrap()
            .get(channel_id)
            .map(|c| c.chunks.len())
            .unwrap_or(0)
    }

    /// Decrypt a stored chunk's payload using the channel's current key.
    pub fn decrypt_chunk(&self, channel_id: &str, chunk_id: &str) -> Result<Vec<u8>, ChannelError> {
        let channels = self.channels.read().unwrap();
        let state = channels
            .get(channel_id)
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))?;
        let chunk = state
            .chunks
            .get(chunk_id)
            .ok_or_else(|| ChannelError::Invalid("unknown chunk".into()))?;
        let key = decode_key(&state.manifest.current_encrypt_key)?;
        let raw = URL_SAFE_NO_PAD
            .decode(&chunk.encrypted_payload)
            .map_err(|_| ChannelError::Invalid("bad payload encoding".into()))?;
        if raw.len() < 12 {
            return Err(ChannelError::Invalid("payload shorter than nonce".into()));
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&raw[..12]), &raw[12..])
            .map_err(|_| ChannelError::Invalid("decryption failed".into()))
    }
}

fn verify_signature(chunk: &Chunk) -> Result<(), ChannelError> {
    let pubkey_bytes = decode_key(&chunk.author_pubkey)?;
    let verifying_key = VerifyingKey::from_bytes(&pubkey_bytes)
        .map_err(|_| ChannelError::BadSignature)?;
    let sig_bytes: [u8; 64] = URL_SAFE_NO_PAD
        .decode(&chunk.signature)
        .map_err(|_| ChannelError::BadSignature)?
        .try_into()
        .map_err(|_| ChannelError::BadSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(&chunk.signing_bytes(), &signature)
        .map_err(|_| ChannelError::BadSignature)
}

fn evict(state: &mut ChannelState, max_chunks: usize) {
    while state.chunks.len() > max_chunks {
        let Some((&oldest_seq, ids)) = state.by_sequence.iter().next().map(|(k, v)| (k, v.clone())) else {
            break;
        };
        for id in ids {
            state.chunks.remove(&id);
        }
        state.by_sequence.remove(&oldest_seq);
    }
}

/// Encode a channel invite link: `zajel://channel/<base64url(JSON{m,k})>`.
pub fn encode_invite_link(manifest: &ChannelManifest) -> String {
    #[derive(Serialize)]
    struct InvitePayload<'a> {
        m: &'a ChannelManifest,
        k: &'a str,
    }
    let payload = InvitePayload {
        m: manifest,
        k: &manifest.current_encrypt_key,
    };
    let json = serde_json::to_vec(&payload).expect("manifest serializes");
    format!("{INVITE_PREFIX}{}", URL_SAFE_NO_PAD.encode(json))
}

/// Decode a channel invite link. The literal prefix is required; raw
/// base64 without it is rejected outright.
pub fn decode_invite_link(link: &str) -> Result<ChannelManifest, ChannelError> {
    let encoded = link
        .strip_prefix(INVITE_PREFIX)
        .ok_or(ChannelError::BadInviteLink)?;
    let json = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| ChannelError::BadInviteLink)?;

    #[derive(Deserialize)]
    struct InvitePayload {
        m: ChannelManifest,
        #[allow(dead_code)]
        k: String,
    }
    let payload: InvitePayload =
        serde_json::from_slice(&json).map_err(|_| ChannelError::BadInviteLink)?;
    Ok(payload.m)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manifest(signing_key: &SigningKey) -> ChannelManifest {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        ChannelManifest {
            name: "news".into(),
            description: "test channel".into(),
            owner_pubkey: URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes()),
            admin_pubkeys: vec![],
            current_encrypt_key: URL_SAFE_NO_PAD.encode(key),
        }
    }

    #[test]
    fn publish_then_receive_round_trip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let manifest = test_manifest(&signing_key);

        let publisher = ChannelEngine::new(100);
        publisher.create_channel("c1", manifest.clone());

        let subscriber = ChannelEngine::new(100);
        subscriber.subscribe("c1", manifest);

        let chunks = publisher.publish("c1", b"hello subscribers", &signing_key).unwrap();
        assert_eq!(chunks.len(), 1);

        for chunk in chunks {
            subscriber.receive("c1", chunk).unwrap();
        }
        assert_eq!(subscriber.chunk_count("c1"), 1);
    }

    #[test]
    fn content_substitution_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let attacker_key = SigningKey::generate(&mut OsRng);
        let mut manifest = test_manifest(&signing_key);
        manifest.admin_pubkeys.push(URL_SAFE_NO_PAD.encode(attacker_key.verifying_key().to_bytes()));

        let publisher = ChannelEngine::new(100);
        publisher.create_channel("c1", manifest.clone());
        let subscriber = ChannelEngine::new(100);
        subscriber.subscribe("c1", manifest);

        let mut original = publisher.publish("c1", b"X", &signing_key).unwrap();
        subscriber.receive("c1", original.remove(0).clone()).unwrap();

        // Attacker crafts a chunk with the same id, different payload, signed
        // by a trusted admin key.
        let mut forged = publisher.publish("c1", b"Y", &signing_key).unwrap().remove(0);
        forged.chunk_id = crate::crypto::sha256_hex("c1:1:0".as_bytes());
        forged.sequence = 1;
        let sig: Signature = attacker_key.sign(&forged.signing_bytes());
        forged.signature = URL_SAFE_NO_PAD.encode(sig.to_bytes());
        forged.author_pubkey = URL_SAFE_NO_PAD.encode(attacker_key.verifying_key().to_bytes());

        assert!(matches!(
            subscriber.receive("c1", forged).unwrap_err(),
            ChannelError::ContentSubstitution(_)
        ));
    }

    #[test]
    fn invite_link_requires_prefix() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let manifest = test_manifest(&signing_key);
        let link = encode_invite_link(&manifest);
        assert!(link.starts_with(INVITE_PREFIX));

        let decoded = decode_invite_link(&link).unwrap();
        assert_eq!(decoded.name, manifest.name);

        let without_prefix = link.trim_start_matches(INVITE_PREFIX);
        assert!(matches!(
            decode_invite_link(without_prefix).unwrap_err(),
            ChannelError::BadInviteLink
        ));
    }
}

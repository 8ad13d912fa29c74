//! GroupEngine: sender-key group messaging.
//!
//! Each member encrypts their own outgoing messages with a symmetric
//! "sender key" distributed at invitation time (spec.md §4.7); this is
//! deliberately simpler than the pairwise CryptoCore sessions (no per-pair
//! HKDF, no replay nonce scheme) so it gets its own small AEAD helper here
//! rather than reusing `CryptoCore`. The teacher's `GroupMessage`/`Group`
//! tables in `db.rs` are the grounding for the record shapes; the sequence
//! discipline and bounded retention are new, since the teacher has no
//! analogous replay/ordering logic.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::GroupError;

#[derive(Zeroize, ZeroizeOnDrop)]
struct SenderKey([u8; 32]);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessage {
    pub group_id: String,
    pub author_device_id: String,
    pub sequence_number: u64,
    pub content: String,
    pub timestamp: String,
    pub message_id: String,
}

impl GroupMessage {
    pub fn message_id_for(author_device_id: &str, sequence_number: u64) -> String {
        format!("{author_device_id}:{sequence_number}")
    }
}

struct GroupState {
    name: String,
    members: HashSet<String>,
    #[allow(dead_code)]
    my_device_id: String,
    #[allow(dead_code)]
    created_at: String,
    sender_keys: HashMap<String, SenderKey>,
    my_send_seq: u64,
    watermarks: HashMap<String, u64>,
    seen_message_ids: HashSet<String>,
    messages: VecDeque<GroupMessage>,
}

pub struct GroupEngine {
    groups: RwLock<HashMap<String, GroupState>>,
    max_messages_per_group: usize,
    max_seq_gap: u64,
}

fn cipher_for(key: &[u8; 32]) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key))
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> (Vec<u8>, [u8; 12]) {
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher_for(key)
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .expect("chacha20poly1305 encryption is infallible for valid key/nonce length");
    (ciphertext, nonce_bytes)
}

fn open(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, GroupError> {
    cipher_for(key)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| GroupError::Crypto(crate::error::CryptoError::AuthFailed))
}

impl GroupEngine {
    pub fn new(max_messages_per_group: usize, max_seq_gap: u64) -> Self {
        GroupEngine {
            groups: RwLock::new(HashMap::new()),
            max_messages_per_group,
            max_seq_gap,
        }
    }

    /// Create a group and generate our own sender key for it.
    pub fn create_group(
        &self,
        group_id: &str,
        name: &str,
        members: HashSet<String>,
        my_device_id: &str,
        created_at: &str,
    ) {
        let mut my_key = [0u8; 32];
        OsRng.fill_bytes(&mut my_key);

        let mut sender_keys = HashMap::new();
        sender_keys.insert(my_device_id.to_string(), SenderKey(my_key));

        let state = GroupState {
            name: name.to_string(),
            members,
            my_device_id: my_device_id.to_string(),
            created_at: created_at.to_string(),
            sender_keys,
            my_send_seq: 0,
            watermarks: HashMap::new(),
            seen_message_ids: HashSet::new(),
            messages: VecDeque::new(),
        };
        self.groups.write().unwrap().insert(group_id.to_string(), state);
    }

    /// Install a member's sender key, received via a trusted invitation.
    pub fn install_sender_key(
        &self,
        group_id: &str,
        device_id: &str,
        key: [u8; 32],
    ) -> Result<(), GroupError> {
        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        group.members.insert(device_id.to_string());
        group.sender_keys.insert(device_id.to_string(), SenderKey(key));
        Ok(())
    }

    pub fn my_sender_key(&self, group_id: &str, my_device_id: &str) -> Result<[u8; 32], GroupError> {
        let groups = self.groups.read().unwrap();
        let group = groups
            .get(group_id)
            .ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        let key = group
            .sender_keys
            .get(my_device_id)
            .ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        Ok(key.0)
    }

    pub fn members(&self, group_id: &str) -> Result<HashSet<String>, GroupError> {
        let groups = self.groups.read().unwrap();
        let group = groups
            .get(group_id)
            .ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        Ok(group.members.clone())
    }

    pub fn list_groups(&self) -> Vec<(String, String)> {
        self.groups
            .read()
            .unwrap()
            .iter()
            .map(|(id, g)| (id.clone(), g.name.clone()))
            .collect()
    }

    /// Encrypt `content` under our own sender key, advancing our sequence.
    /// Returns the plaintext `GroupMessage` record plus the wire ciphertext
    /// (nonce ‖ AEAD output, base64) the caller fans out to connected
    /// members.
    pub fn send(
        &self,
        group_id: &str,
        my_device_id: &str,
        content: &str,
        timestamp: &str,
    ) -> Result<(GroupMessage, String), GroupError> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;

        group.my_send_seq += 1;
        let seq = group.my_send_seq;
        let message_id = GroupMessage::message_id_for(my_device_id, seq);

        let key = group
            .sender_keys
            .get(my_device_id)
            .ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?
            .0;
        let (ciphertext, nonce) = seal(&key, content.as_bytes());
        let mut wire = nonce.to_vec();
        wire.extend_from_slice(&ciphertext);
        let encoded = URL_SAFE_NO_PAD.encode(wire);

        let message = GroupMessage {
            group_id: group_id.to_string(),
            author_device_id: my_device_id.to_string(),
            sequence_number: seq,
            content: content.to_string(),
            timestamp: timestamp.to_string(),
            message_id,
        };
        group.seen_message_ids.insert(message.message_id.clone());
        group.messages.push_back(message.clone());
        evict(group, self.max_messages_per_group);

        Ok((message, encoded))
    }

    /// Process an inbound group-encrypted frame.
    pub fn receive(
        &self,
        group_id: &str,
        author_device_id: &str,
        sequence_number: u64,
        wire: &str,
        timestamp: &str,
    ) -> Result<GroupMessage, GroupError> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

        let message_id = GroupMessage::message_id_for(author_device_id, sequence_number);

        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;

        if group.seen_message_ids.contains(&message_id) {
            return Err(GroupError::Duplicate);
        }

        let last_seen = group.watermarks.get(author_device_id).copied().unwrap_or(0);
        if sequence_number > last_seen + self.max_seq_gap {
            return Err(GroupError::SequenceGap);
        }
        if sequence_number == 0 {
            return Err(GroupError::BadSequence);
        }

        let key = group
            .sender_keys
            .get(author_device_id)
            .ok_or_else(|| GroupError::UnknownGroup(author_device_id.to_string()))?
            .0;

        let raw = URL_SAFE_NO_PAD
            .decode(wire)
            .map_err(|_| GroupError::BadSequence)?;
        if raw.len() < 12 {
            return Err(GroupError::BadSequence);
        }
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&raw[..12]);
        let plaintext = open(&key, &nonce, &raw[12..])?;
        let content = String::from_utf8(plaintext)
            .map_err(|_| GroupError::Crypto(crate::error::CryptoError::AuthFailed))?;

        if sequence_number > last_seen {
            group.watermarks.insert(author_device_id.to_string(), sequence_number);
        }
        group.seen_message_ids.insert(message_id.clone());

        let message = GroupMessage {
            group_id: group_id.to_string(),
            author_device_id: author_device_id.to_string(),
            sequence_number,
            content,
            timestamp: timestamp.to_string(),
            message_id,
        };
        group.messages.push_back(message.clone());
        evict(group, self.max_messages_per_group);

        Ok(message)
    }

    pub fn messages(&self, group_id: &str) -> Vec<GroupMessage> {
        self.groups
            .read()
            .unwrap()
            .get(group_id)
            .map(|g| g.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove our own membership/sender key, zeroizing it on drop.
    pub fn leave(&self, group_id: &str, my_device_id: &str) {
        if let Some(group) = self.groups.write().unwrap().get_mut(group_id) {
            group.members.remove(my_device_id);
            group.sender_keys.remove(my_device_id);
        }
    }

    pub fn remove_member(&self, group_id: &str, device_id: &str) {
        if let Some(group) = self.groups.write().unwrap().get_mut(group_id) {
            group.members.remove(device_id);
            group.sender_keys.remove(device_id);
        }
    }
}

fn evict(group: &mut GroupState, max_messages: usize) {
    while group.messages.len() > max_messages {
        if let Some(oldest) = group.messages.pop_front() {
            group.seen_message_ids.remove(&oldest.message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_member_group() -> (GroupEngine, [u8; 32]) {
        let engine = GroupEngine::new(10, 100);
        let mut members = HashSet::new();
        members.insert("m1".to_string());
        members.insert("m2".to_string());
        engine.create_group("g1", "Test Group", members, "m1", "2026-01-01T00:00:00Z");
        let sender_key = engine.my_sender_key("g1", "m1").unwrap();
        (engine, sender_key)
    }

    #[test]
    fn send_then_receive_out_of_order_all_accepted() {
        let (engine_m1, key) = two_member_group();
        let engine_m2 = GroupEngine::new(10, 100);
        let mut members = HashSet::new();
        members.insert("m1".to_string());
        members.insert("m2".to_string());
        engine_m2.create_group("g1", "Test Group", members, "m2", "2026-01-01T00:00:00Z");
        engine_m2.install_sender_key("g1", "m1", key).unwrap();

        let (_msg1, wire1) = engine_m1.send("g1", "m1", "one", "t1").unwrap();
        let (_msg2, wire2) = engine_m1.send("g1", "m1", "two", "t2").unwrap();
        let (_msg3, wire3) = engine_m1.send("g1", "m1", "three", "t3").unwrap();

        // Reordered delivery: 1, 3, 2.
        engine_m2.receive("g1", "m1", 1, &wire1, "t1").unwrap();
        engine_m2.receive("g1", "m1", 3, &wire3, "t3").unwrap();
        engine_m2.receive("g1", "m1", 2, &wire2, "t2").unwrap();

        assert_eq!(engine_m2.messages("g1").len(), 3);

        // Replaying seq=2 is now rejected as a duplicate message id.
        assert!(matches!(
            engine_m2.receive("g1", "m1", 2, &wire2, "t2").unwrap_err(),
            GroupError::Duplicate
        ));
    }

    #[test]
    fn sequence_gap_beyond_limit_rejected() {
        let engine = GroupEngine::new(10, 2);
        let mut members = HashSet::new();
        members.insert("m1".to_string());
        members.insert("m2".to_string());
        engine.create_group("g1", "Test Group", members, "m2", "2026-01-01T00:00:00Z");
        let key = [7u8; 32];
        engine.install_sender_key("g1", "m1", key).unwrap();

        let (ciphertext, nonce) = seal(&key, b"hi");
        let mut wire = nonce.to_vec();
        wire.extend_from_slice(&ciphertext);
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
        let encoded = URL_SAFE_NO_PAD.encode(wire);

        assert!(matches!(
            engine.receive("g1", "m1", 10, &encoded, "t").unwrap_err(),
            GroupError::SequenceGap
        ));
    }

    #[test]
    fn bounded_storage_keeps_most_recent() {
        let engine = GroupEngine::new(3, 1000);
        let mut members = HashSet::new();
        members.insert("m1".to_string());
        engine.create_group("g1", "Test Group", members, "m1", "t");

        for i in 1..=5u64 {
            engine.send("g1", "m1", &format!("msg{i}"), "t").unwrap();
        }
        let stored = engine.messages("g1");
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].sequence_number, 3);
        assert_eq!(stored[2].sequence_number, 5);
    }
}

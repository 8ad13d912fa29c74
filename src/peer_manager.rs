//! PeerManager: the pending → handshaking → established lifecycle, and the
//! single source of truth binding a transport connection to exactly one
//! cryptographic identity.
//!
//! The teacher has no direct equivalent (its `CryptoManager::establish_session`
//! is called straight from a Tauri command with no pending/handshake
//! bookkeeping); this module is grounded on spec.md §4.5's establishment
//! algorithm, generalizing the teacher's "keypair exists, sessions are a
//! flat map" model into the pending/connected state machine the spec
//! requires, plus the security-critical rule that a handshake frame's peer
//! id comes from the bound transport, never from an in-frame field.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::crypto::CryptoCore;
use crate::error::PeerManagerError;
use crate::event_bus::EventBus;
use crate::group::GroupEngine;
use crate::peer_store::{PeerRecord, PeerStore};
use crate::transport::{ChannelKind, InboundFrame, TransportChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Pending,
    Handshaking,
    Established,
}

#[derive(Debug, Clone)]
pub struct ConnectedPeer {
    pub peer_id: String,
    pub peer_public_key: String,
    pub is_initiator: bool,
    pub display_name: Option<String>,
    pub established_at: Option<String>,
    pub state: PeerState,
}

pub struct PeerManager {
    crypto: Arc<CryptoCore>,
    peer_store: Arc<PeerStore>,
    event_bus: Arc<EventBus>,
    auto_accept_group_invitations: bool,
    allow_handshake_key_mismatch: bool,

    pending: RwLock<HashMap<String, ConnectedPeer>>,
    connected: RwLock<HashMap<String, ConnectedPeer>>,
    transport_peer_id: RwLock<Option<String>>,
    active_transport: RwLock<Option<Arc<dyn TransportChannel>>>,
    my_display_name: RwLock<Option<String>>,
    seen_group_invitations: RwLock<HashSet<(String, String)>>,
}

#[derive(Debug, Clone)]
pub struct GroupInvitation {
    pub group_id: String,
    pub inviter_device_id: String,
    pub members: HashSet<String>,
    pub sender_keys: HashMap<String, [u8; 32]>,
}

/// spec.md §3: a PeerId is 1-128 characters of `[A-Za-z0-9_-]+`, validated
/// at every boundary and never constructed from unvalidated input.
fn validate_peer_id(peer_id: &str) -> Result<(), PeerManagerError> {
    let ok = !peer_id.is_empty()
        && peer_id.len() <= 128
        && peer_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(PeerManagerError::InvalidPeerId(peer_id.to_string()))
    }
}

impl PeerManager {
    pub fn new(
        crypto: Arc<CryptoCore>,
        peer_store: Arc<PeerStore>,
        event_bus: Arc<EventBus>,
        auto_accept_group_invitations: bool,
    ) -> Self {
        PeerManager {
            crypto,
            peer_store,
            event_bus,
            auto_accept_group_invitations,
            allow_handshake_key_mismatch: false,
            pending: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashMap::new()),
            transport_peer_id: RwLock::new(None),
            active_transport: RwLock::new(None),
            my_display_name: RwLock::new(None),
            seen_group_invitations: RwLock::new(HashSet::new()),
        }
    }

    /// Step 1 of the establishment algorithm: allocate a pending entry and
    /// bind the transport to this peer id before any I/O happens.
    pub fn begin_pending(
        &self,
        peer_id: &str,
        peer_public_key: &str,
        is_initiator: bool,
    ) -> Result<(), PeerManagerError> {
        validate_peer_id(peer_id)?;
        if self.pending.read().unwrap().contains_key(peer_id)
            || self.connected.read().unwrap().contains_key(peer_id)
        {
            return Err(PeerManagerError::AlreadyActive(peer_id.to_string()));
        }

        self.pending.write().unwrap().insert(
            peer_id.to_string(),
            ConnectedPeer {
                peer_id: peer_id.to_string(),
                peer_public_key: peer_public_key.to_string(),
                is_initiator,
                display_name: None,
                established_at: None,
                state: PeerState::Pending,
            },
        );
        *self.transport_peer_id.write().unwrap() = Some(peer_id.to_string());
        Ok(())
    }

    /// Step 4: the message channel opened; move Pending → Handshaking.
    pub fn mark_handshaking(&self, peer_id: &str) -> Result<(), PeerManagerError> {
        let mut pending = self.pending.write().unwrap();
        let entry = pending
            .get_mut(peer_id)
            .ok_or_else(|| PeerManagerError::UnknownPeer(peer_id.to_string()))?;
        entry.state = PeerState::Handshaking;
        Ok(())
    }

    /// Steps 2-8 end to end: given a transport already opened for `peer_id`
    /// (by the caller — `Supervisor` constructs a `RelayTransport` and
    /// registers it with `RelayRouter`), wait for the message channel, swap
    /// handshake frames, and bind the session. On any failure the pending
    /// entry is aborted and the transport is closed; nothing half-open
    /// survives.
    pub async fn establish(
        &self,
        transport: Arc<dyn TransportChannel>,
        inbound: &mut mpsc::Receiver<InboundFrame>,
        peer_id: &str,
        my_public_key: &str,
        handshake_timeout: Duration,
    ) -> Result<(), PeerManagerError> {
        match self
            .establish_inner(&transport, inbound, peer_id, my_public_key, handshake_timeout)
            .await
        {
            Ok(()) => {
                *self.active_transport.write().unwrap() = Some(transport);
                Ok(())
            }
            Err(e) => {
                self.abort_pending(peer_id);
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn establish_inner(
        &self,
        transport: &Arc<dyn TransportChannel>,
        inbound: &mut mpsc::Receiver<InboundFrame>,
        peer_id: &str,
        my_public_key: &str,
        handshake_timeout: Duration,
    ) -> Result<(), PeerManagerError> {
        transport.await_message_channel(handshake_timeout).await?;
        self.mark_handshaking(peer_id)?;

        let handshake = serde_json::json!({
            "type": "handshake",
            "publicKey": my_public_key,
        })
        .to_string();
        transport.send_message(handshake.into_bytes()).await?;

        let remote_public_key = recv_handshake(inbound, handshake_timeout).await?;
        self.complete_handshake(peer_id, &remote_public_key)?;
        Ok(())
    }

    /// Steps 5-7: process the remote peer's `handshake` frame. `peer_id` is
    /// the currently bound transport identity, never a field read out of the
    /// frame itself — this is the binding spec.md Property 6 requires.
    pub fn complete_handshake(
        &self,
        peer_id: &str,
        remote_public_key: &str,
    ) -> Result<(), PeerManagerError> {
        if self.transport_peer_id.read().unwrap().as_deref() != Some(peer_id) {
            return Err(PeerManagerError::IdentityMismatch);
        }

        let mut pending = self.pending.write().unwrap();
        let mut entry = pending
            .remove(peer_id)
            .ok_or_else(|| PeerManagerError::UnknownPeer(peer_id.to_string()))?;

        if entry.peer_public_key != remote_public_key {
            tracing::warn!(peer_id, "handshake public key differs from signaling-pairing key");
            if !self.allow_handshake_key_mismatch {
                // Abort: drop the pending entry and the transport binding.
                *self.transport_peer_id.write().unwrap() = None;
                return Err(PeerManagerError::IdentityMismatch);
            }
            entry.peer_public_key = remote_public_key.to_string();
        }

        self.crypto
            .derive_session(peer_id, &entry.peer_public_key)
            .map_err(PeerManagerError::Crypto)?;

        entry.state = PeerState::Established;
        entry.established_at = Some(Utc::now().to_rfc3339());

        self.peer_store
            .put(PeerRecord {
                peer_id: peer_id.to_string(),
                display_name: entry.display_name.clone(),
                public_key: entry.peer_public_key.clone(),
                trusted_at: entry.established_at.clone().unwrap_or_default(),
                last_seen: entry.established_at.clone().unwrap_or_default(),
                session_key: None,
            })
            .map_err(|e| PeerManagerError::UnknownPeer(e.to_string()))?;

        self.connected.write().unwrap().insert(peer_id.to_string(), entry);
        self.event_bus
            .emit("peer_connected", &serde_json::json!({ "peer_id": peer_id }));
        Ok(())
    }

    /// Step 8: any failure during establishment tears everything down —
    /// no half-open peers survive.
    pub fn abort_pending(&self, peer_id: &str) {
        self.pending.write().unwrap().remove(peer_id);
        self.crypto.drop_session(peer_id);
        let mut transport_peer = self.transport_peer_id.write().unwrap();
        if transport_peer.as_deref() == Some(peer_id) {
            *transport_peer = None;
            *self.active_transport.write().unwrap() = None;
        }
    }

    pub fn disconnect(&self, peer_id: &str) {
        self.connected.write().unwrap().remove(peer_id);
        self.crypto.drop_session(peer_id);
        let mut transport_peer = self.transport_peer_id.write().unwrap();
        if transport_peer.as_deref() == Some(peer_id) {
            *transport_peer = None;
            *self.active_transport.write().unwrap() = None;
        }
        self.event_bus
            .emit("peer_disconnected", &serde_json::json!({ "peer_id": peer_id }));
    }

    pub fn set_my_display_name(&self, name: &str) {
        *self.my_display_name.write().unwrap() = Some(name.to_string());
    }

    pub fn my_display_name(&self) -> Option<String> {
        self.my_display_name.read().unwrap().clone()
    }

    /// Encrypt `plaintext` for `peer_id` and send it as an `encrypted` frame
    /// over the currently bound transport. `peer_id` must match the one
    /// transport this daemon has active — spec.md's single-active-transport
    /// model, not a per-peer-concurrent one.
    pub async fn send_encrypted(&self, peer_id: &str, plaintext: &[u8]) -> Result<(), PeerManagerError> {
        if self.transport_peer_id.read().unwrap().as_deref() != Some(peer_id) {
            return Err(PeerManagerError::UnknownPeer(peer_id.to_string()));
        }
        let wire = self.crypto.encrypt(peer_id, plaintext)?;
        let frame = serde_json::json!({
            "type": "encrypted",
            "ciphertext": wire,
        })
        .to_string();
        let transport = self
            .active_transport
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| PeerManagerError::UnknownPeer(peer_id.to_string()))?;
        transport.send_message(frame.into_bytes()).await?;
        Ok(())
    }

    /// Broadcast this daemon's display name to the connected peer as a
    /// `profile` frame over the encrypted message channel. A no-op if no
    /// peer is currently connected — there's nobody to tell.
    pub async fn broadcast_profile(&self, name: &str) -> Result<(), PeerManagerError> {
        let peer_id = match self.transport_peer_id.read().unwrap().clone() {
            Some(p) => p,
            None => return Ok(()),
        };
        let payload = serde_json::json!({ "type": "profile", "name": name }).to_string();
        self.send_encrypted(&peer_id, payload.as_bytes()).await
    }

    /// Drain inbound transport frames forever, decrypting `encrypted` ones
    /// and dispatching the result. Runs for the lifetime of one established
    /// peer's connection; returns once the channel closes.
    pub async fn run_inbound_loop(&self, mut inbound: mpsc::Receiver<InboundFrame>) {
        while let Some(frame) = inbound.recv().await {
            if frame.channel != ChannelKind::Message {
                continue;
            }
            let value: serde_json::Value = match serde_json::from_slice(&frame.bytes) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if value.get("type").and_then(|t| t.as_str()) != Some("encrypted") {
                continue;
            }
            let Some(wire) = value.get("ciphertext").and_then(|c| c.as_str()) else {
                continue;
            };
            match self.demux_encrypted(wire) {
                Ok((peer_id, plaintext)) => self.apply_decrypted(&peer_id, &plaintext),
                Err(e) => tracing::warn!(error = %e, "failed to decrypt inbound frame"),
            }
        }
    }

    /// A successfully decrypted plaintext is either a `profile` update or a
    /// chat message; either way decryption succeeding is itself the
    /// `delivered` acknowledgement spec.md's ack design calls for.
    fn apply_decrypted(&self, peer_id: &str, plaintext: &[u8]) {
        self.event_bus.emit(
            "delivered",
            &serde_json::json!({ "peer_id": peer_id, "bytes": plaintext.len() }),
        );

        let value: Option<serde_json::Value> = serde_json::from_slice(plaintext).ok();
        if let Some(v) = &value {
            if v.get("type").and_then(|t| t.as_str()) == Some("profile") {
                if let Some(name) = v.get("name").and_then(|n| n.as_str()) {
                    self.set_display_name(peer_id, name);
                    return;
                }
            }
        }

        let content = String::from_utf8_lossy(plaintext).to_string();
        self.event_bus.emit(
            "message",
            &serde_json::json!({ "peer_id": peer_id, "content": content }),
        );
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.connected.read().unwrap().contains_key(peer_id)
    }

    pub fn list_connected(&self) -> Vec<ConnectedPeer> {
        self.connected.read().unwrap().values().cloned().collect()
    }

    pub fn set_display_name(&self, peer_id: &str, name: &str) {
        if let Some(peer) = self.connected.write().unwrap().get_mut(peer_id) {
            peer.display_name = Some(name.to_string());
        }
    }

    /// Demux an inbound `encrypted` frame to the transport's bound peer id
    /// — never by trying every peer's session key.
    pub fn demux_encrypted(&self, wire: &str) -> Result<(String, Vec<u8>), PeerManagerError> {
        let peer_id = self
            .transport_peer_id
            .read()
            .unwrap()
            .clone()
            .ok_or(PeerManagerError::UnknownPeer("no bound transport".into()))?;
        let plaintext = self
            .crypto
            .decrypt(&peer_id, wire)
            .map_err(PeerManagerError::Crypto)?;
        Ok((peer_id, plaintext))
    }

    /// Validate and, if policy permits, apply an inbound `group_invitation`
    /// frame. Returns `Ok(true)` if applied, `Ok(false)` if deferred for
    /// caller approval.
    pub fn handle_group_invitation(
        &self,
        invitation: GroupInvitation,
        group_engine: &GroupEngine,
        created_at: &str,
        group_name: &str,
    ) -> Result<bool, PeerManagerError> {
        let bound_peer = self
            .transport_peer_id
            .read()
            .unwrap()
            .clone()
            .ok_or(PeerManagerError::UnknownPeer("no bound transport".into()))?;

        if invitation.inviter_device_id != bound_peer {
            return Err(PeerManagerError::IdentityMismatch);
        }
        if !invitation.members.contains(&invitation.inviter_device_id)
            || !invitation.sender_keys.contains_key(&invitation.inviter_device_id)
        {
            return Err(PeerManagerError::UnknownPeer(
                "inviter missing from member list or sender keys".into(),
            ));
        }

        let dedup_key = (invitation.group_id.clone(), invitation.inviter_device_id.clone());
        if !self.seen_group_invitations.write().unwrap().insert(dedup_key) {
            return Ok(false); // already processed this (group, inviter) pair
        }

        if !self.auto_accept_group_invitations {
            return Ok(false);
        }

        group_engine.create_group(
            &invitation.group_id,
            group_name,
            invitation.members.clone(),
            &bound_peer,
            created_at,
        );
        for (device_id, key) in &invitation.sender_keys {
            group_engine
                .install_sender_key(&invitation.group_id, device_id, *key)
                .ok();
        }
        Ok(true)
    }
}

/// Scan inbound frames for the first well-formed `handshake` frame,
/// ignoring anything else (file-channel chunks, malformed JSON) until the
/// deadline passes.
async fn recv_handshake(
    inbound: &mut mpsc::Receiver<InboundFrame>,
    wait: Duration,
) -> Result<String, PeerManagerError> {
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PeerManagerError::HandshakeTimeout);
        }
        let frame = tokio::time::timeout(remaining, inbound.recv())
            .await
            .map_err(|_| PeerManagerError::HandshakeTimeout)?
            .ok_or(PeerManagerError::HandshakeTimeout)?;
        if frame.channel != ChannelKind::Message {
            continue;
        }
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&frame.bytes) else {
            continue;
        };
        if value.get("type").and_then(|t| t.as_str()) != Some("handshake") {
            continue;
        }
        if let Some(key) = value.get("publicKey").and_then(|k| k.as_str()) {
            return Ok(key.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PeerManager {
        let crypto = Arc::new(CryptoCore::new());
        crypto.generate_identity();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PeerStore::open(dir.path().join("peers.json")).unwrap());
        PeerManager::new(crypto, store, Arc::new(EventBus::new()), true)
    }

    #[test]
    fn handshake_identity_binds_to_transport_not_frame() {
        let mgr = manager();
        let peer_crypto = CryptoCore::new();
        let peer_pub = peer_crypto.generate_identity();

        mgr.begin_pending("peer-a", &peer_pub, true).unwrap();
        mgr.mark_handshaking("peer-a").unwrap();
        mgr.complete_handshake("peer-a", &peer_pub).unwrap();

        assert!(mgr.is_connected("peer-a"));
        // A handshake claiming to be a different, unbound peer id is rejected
        // even with a perfectly valid key, because the transport is bound to
        // "peer-a", not whatever id a frame might claim.
        assert!(matches!(
            mgr.complete_handshake("peer-b", &peer_pub).unwrap_err(),
            PeerManagerError::IdentityMismatch
        ));
    }

    #[test]
    fn mismatched_handshake_key_aborts_by_default() {
        let mgr = manager();
        let peer_crypto = CryptoCore::new();
        let peer_pub = peer_crypto.generate_identity();
        let other_crypto = CryptoCore::new();
        let other_pub = other_crypto.generate_identity();

        mgr.begin_pending("peer-a", &peer_pub, true).unwrap();
        assert!(matches!(
            mgr.complete_handshake("peer-a", &other_pub).unwrap_err(),
            PeerManagerError::IdentityMismatch
        ));
        assert!(!mgr.is_connected("peer-a"));
    }

    #[test]
    fn begin_pending_rejects_malformed_peer_id() {
        let mgr = manager();
        let peer_crypto = CryptoCore::new();
        let peer_pub = peer_crypto.generate_identity();

        assert!(matches!(
            mgr.begin_pending("../escape", &peer_pub, true).unwrap_err(),
            PeerManagerError::InvalidPeerId(_)
        ));
        assert!(matches!(
            mgr.begin_pending("", &peer_pub, true).unwrap_err(),
            PeerManagerError::InvalidPeerId(_)
        ));
        assert!(matches!(
            mgr.begin_pending(&"a".repeat(129), &peer_pub, true).unwrap_err(),
            PeerManagerError::InvalidPeerId(_)
        ));
    }

    #[test]
    fn group_invitation_inviter_must_match_bound_peer() {
        let mgr = manager();
        let peer_crypto = CryptoCore::new();
        let peer_pub = peer_crypto.generate_identity();
        mgr.begin_pending("peer-a", &peer_pub, true).unwrap();
        mgr.complete_handshake("peer-a", &peer_pub).unwrap();

        let group_engine = GroupEngine::new(100, 100);
        let mut members = HashSet::new();
        members.insert("peer-a".to_string());
        let mut sender_keys = HashMap::new();
        sender_keys.insert("peer-a".to_string(), [1u8; 32]);

        let spoofed = GroupInvitation {
            group_id: "g1".into(),
            inviter_device_id: "someone-else".into(),
            members,
            sender_keys,
        };
        assert!(matches!(
            mgr.handle_group_invitation(spoofed, &group_engine, "t", "G").unwrap_err(),
            PeerManagerError::IdentityMismatch
        ));
    }

    #[tokio::test]
    async fn establish_drives_handshake_to_completion_over_duplex_transport() {
        use crate::transport::DuplexTransport;

        let mgr_a = manager();
        let peer_a_pub = mgr_a.crypto.public_key().unwrap();
        let mgr_b = manager();
        let peer_b_pub = mgr_b.crypto.public_key().unwrap();

        let (transport_a, inbound_a, transport_b, inbound_b) = DuplexTransport::pair(true);
        let mut inbound_a = inbound_a;
        let mut inbound_b = inbound_b;

        mgr_a.begin_pending("peer-b", &peer_b_pub, true).unwrap();
        mgr_b.begin_pending("peer-a", &peer_a_pub, false).unwrap();

        let a_transport: Arc<dyn TransportChannel> = transport_a;
        let b_transport: Arc<dyn TransportChannel> = transport_b;

        let (a_result, b_result) = tokio::join!(
            mgr_a.establish(a_transport, &mut inbound_a, "peer-b", &peer_a_pub, Duration::from_secs(1)),
            mgr_b.establish(b_transport, &mut inbound_b, "peer-a", &peer_b_pub, Duration::from_secs(1)),
        );
        a_result.unwrap();
        b_result.unwrap();

        assert!(mgr_a.is_connected("peer-b"));
        assert!(mgr_b.is_connected("peer-a"));
    }

    #[tokio::test]
    async fn send_encrypted_delivers_and_fires_message_event() {
        use crate::transport::DuplexTransport;
        use std::sync::atomic::{AtomicBool, Ordering};

        let mgr_a = manager();
        let peer_a_pub = mgr_a.crypto.public_key().unwrap();
        let mgr_b = manager();
        let peer_b_pub = mgr_b.crypto.public_key().unwrap();

        let (transport_a, inbound_a, transport_b, inbound_b) = DuplexTransport::pair(true);
        let mut inbound_a = inbound_a;

        mgr_a.begin_pending("peer-b", &peer_b_pub, true).unwrap();
        mgr_b.begin_pending("peer-a", &peer_a_pub, false).unwrap();

        let a_transport: Arc<dyn TransportChannel> = transport_a;
        let b_transport: Arc<dyn TransportChannel> = transport_b;
        let mut inbound_b = inbound_b;

        let (a_result, b_result) = tokio::join!(
            mgr_a.establish(a_transport, &mut inbound_a, "peer-b", &peer_a_pub, Duration::from_secs(1)),
            mgr_b.establish(b_transport, &mut inbound_b, "peer-a", &peer_b_pub, Duration::from_secs(1)),
        );
        a_result.unwrap();
        b_result.unwrap();

        let got_message = Arc::new(AtomicBool::new(false));
        let flag = got_message.clone();
        mgr_b.event_bus.on(
            "message",
            Box::new(move |payload| {
                assert_eq!(payload["content"], "hello");
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );

        mgr_a.send_encrypted("peer-b", b"hello").await.unwrap();
        let frame = inbound_b.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame.bytes).unwrap();
        let wire = value["ciphertext"].as_str().unwrap();
        let (peer_id, plaintext) = mgr_b.demux_encrypted(wire).unwrap();
        mgr_b.apply_decrypted(&peer_id, &plaintext);
        assert!(got_message.load(Ordering::SeqCst));
    }
}

//! SignalingLink: the single outbound connection to the signaling
//! coordinator — pairing, reconnection, heartbeats, and per-type frame
//! validation.
//!
//! The teacher's `SignalingServer` (`signaling.rs`) is a synchronous,
//! UDP-broadcast LAN rendezvous built on `crossbeam_channel`; this module
//! keeps its tagged-union frame shape and callback-driven dispatch but
//! replaces the transport with a `tokio-tungstenite` WebSocket client to a
//! coordinator (spec.md's SignalingLink is explicitly pairing-code-based,
//! not LAN-broadcast) and replaces the thread/channel plumbing with an
//! async reconnect loop, matching the rest of the pack's (`sven`, `aura`)
//! tokio-first async conventions.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;

use crate::error::SignalingError;
use crate::transport::ChannelKind;

/// Alphabet deliberately excludes visually ambiguous characters (0/O, 1/I).
const PAIRING_CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
const PAIRING_CODE_LEN: usize = 6;

fn generate_pairing_code() -> String {
    let mut bytes = [0u8; PAIRING_CODE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| PAIRING_CODE_ALPHABET[*b as usize % PAIRING_CODE_ALPHABET.len()] as char)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Registered,
    Degraded,
}

/// Frames the daemon can receive from the coordinator, already validated
/// against the per-type required-field floor of spec.md §4.3.
#[derive(Debug, Clone)]
pub enum InboundSignal {
    PairIncoming { from_code: String, from_public_key: String },
    PairMatched { peer_code: String, peer_public_key: String, is_initiator: bool },
    WebrtcSignal { from: String, payload: Value },
    CallSignal { from: String, payload: Value },
    ChunkData { from: String, payload: Value },
    /// A `TransportChannel` frame relayed through the coordinator rather
    /// than a direct data channel — see `transport::RelayTransport`.
    RelayMessage { from: String, channel: ChannelKind, payload: Vec<u8> },
    Pong,
}

/// Receiver side of the link: handed to the Supervisor's event loop to pull
/// validated frames off as they arrive.
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundSignal>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_HEARTBEATS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

struct Shared {
    state: RwLock<LinkState>,
    pairing_code: RwLock<Option<String>>,
    public_key: RwLock<Option<String>>,
    missed_heartbeats: AtomicU32,
    generation: AtomicU64,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    intentional_disconnect: std::sync::atomic::AtomicBool,
}

/// A single outbound bidirectional framed connection to the coordinator.
pub struct SignalingLink {
    coordinator_url: String,
    shared: Arc<Shared>,
}

fn required_string(value: &Value, key: &str) -> Option<String> {
    value.get(key)?.as_str().map(str::to_string)
}

fn required_bool(value: &Value, key: &str) -> Option<bool> {
    value.get(key)?.as_bool()
}

/// Validate an inbound JSON frame against the per-type schema. Unknown
/// types and missing required fields are logged and dropped — never fatal.
fn validate(raw: &Value) -> Option<InboundSignal> {
    let frame_type = raw.get("type")?.as_str()?;
    match frame_type {
        "pair_incoming" => {
            let from_code = required_string(raw, "fromCode")?;
            let from_public_key = required_string(raw, "fromPublicKey")?;
            Some(InboundSignal::PairIncoming { from_code, from_public_key })
        }
        "pair_matched" => {
            let peer_code = required_string(raw, "peerCode")?;
            let peer_public_key = required_string(raw, "peerPublicKey")?;
            let is_initiator = required_bool(raw, "isInitiator")?;
            Some(InboundSignal::PairMatched { peer_code, peer_public_key, is_initiator })
        }
        "webrtc_signal" => {
            let from = required_string(raw, "from")?;
            let payload = raw.get("payload")?.clone();
            Some(InboundSignal::WebrtcSignal { from, payload })
        }
        "call_signal" => {
            let from = required_string(raw, "from")?;
            let payload = raw.get("payload")?.clone();
            Some(InboundSignal::CallSignal { from, payload })
        }
        "chunk_data" => {
            let from = required_string(raw, "from")?;
            let payload = raw.get("payload")?.clone();
            Some(InboundSignal::ChunkData { from, payload })
        }
        "relay_message" => {
            let from = required_string(raw, "from")?;
            let channel = match required_string(raw, "channel")?.as_str() {
                "message" => ChannelKind::Message,
                "file" => ChannelKind::File,
                _ => return None,
            };
            let payload_b64 = required_string(raw, "payload")?;
            let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
            Some(InboundSignal::RelayMessage { from, channel, payload })
        }
        "pong" => Some(InboundSignal::Pong),
        other => {
            tracing::warn!(frame_type = other, "dropping unknown signaling frame type");
            None
        }
    }
}

impl SignalingLink {
    pub fn new(coordinator_url: String) -> Self {
        SignalingLink {
            coordinator_url,
            shared: Arc::new(Shared {
                state: RwLock::new(LinkState::Disconnected),
                pairing_code: RwLock::new(None),
                public_key: RwLock::new(None),
                missed_heartbeats: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                outbound: RwLock::new(None),
                intentional_disconnect: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.read().unwrap()
    }

    /// Assign this session a pairing code, then register with the
    /// coordinator and drive reconnection with exponential backoff in the
    /// background for as long as `disconnect()` has not been called. The
    /// same code is resent on every registration this connection makes —
    /// including reconnects — so a transient coordinator drop does not
    /// force the user through pairing again. Returns the assigned code and
    /// the inbound frame receiver immediately; the connection itself
    /// happens on the spawned task.
    pub fn connect(&self, public_key: String) -> (String, InboundReceiver) {
        *self.shared.public_key.write().unwrap() = Some(public_key);
        let pairing_code = generate_pairing_code();
        *self.shared.pairing_code.write().unwrap() = Some(pairing_code.clone());
        self.shared.intentional_disconnect.store(false, Ordering::SeqCst);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = self.shared.clone();
        let url = self.coordinator_url.clone();
        tokio::spawn(async move {
            reconnect_loop(url, shared, tx, generation).await;
        });
        (pairing_code, rx)
    }

    /// The pairing code assigned by the most recent `connect()` call, if any.
    pub fn pairing_code(&self) -> Option<String> {
        self.shared.pairing_code.read().unwrap().clone()
    }

    /// Send a frame to the coordinator, if currently connected.
    pub fn send(&self, frame: &impl Serialize) -> Result<(), SignalingError> {
        let outbound = self.shared.outbound.read().unwrap();
        let sender = outbound.as_ref().ok_or(SignalingError::NotConnected)?;
        let text = serde_json::to_string(frame)
            .map_err(|e| SignalingError::Invalid(e.to_string()))?;
        sender
            .send(Message::Text(text))
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }

    /// Request pairing with a remote peer's pairing code (spec.md §8
    /// Scenario S1: "A issues `pair_with XYZ12A`").
    pub fn pair_with(&self, code: &str) -> Result<(), SignalingError> {
        self.send(&json!({"type": "pair_with", "code": code}))
    }

    /// Accept or reject an inbound `pair_incoming` request.
    pub fn respond_to_pair(&self, from_code: &str, accept: bool) -> Result<(), SignalingError> {
        self.send(&json!({"type": "pair_response", "fromCode": from_code, "accept": accept}))
    }

    /// Relay a `TransportChannel` frame to `to` through the coordinator —
    /// see `transport::RelayTransport`.
    pub fn send_relay(&self, to: &str, channel: ChannelKind, bytes: &[u8]) -> Result<(), SignalingError> {
        let channel_str = match channel {
            ChannelKind::Message => "message",
            ChannelKind::File => "file",
        };
        self.send(&json!({
            "type": "relay_message",
            "to": to,
            "channel": channel_str,
            "payload": URL_SAFE_NO_PAD.encode(bytes),
        }))
    }

    pub fn disconnect(&self) {
        self.shared.intentional_disconnect.store(true, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        *self.shared.outbound.write().unwrap() = None;
        *self.shared.state.write().unwrap() = LinkState::Disconnected;
    }
}

async fn reconnect_loop(
    url: String,
    shared: Arc<Shared>,
    inbound_tx: mpsc::UnboundedSender<InboundSignal>,
    generation: u64,
) {
    let mut backoff = BACKOFF_BASE;
    loop {
        if shared.generation.load(Ordering::SeqCst) != generation {
            return; // superseded by a newer connect() or disconnect()
        }

        *shared.state.write().unwrap() = LinkState::Connecting;
        match run_connection(&url, &shared, &inbound_tx, generation).await {
            Ok(()) => {
                // Clean close (disconnect() was called); stop reconnecting.
                if shared.intentional_disconnect.load(Ordering::SeqCst) {
                    return;
                }
                backoff = BACKOFF_BASE;
            }
            Err(e) => {
                tracing::warn!(error = %e, "signaling connection failed");
            }
        }

        if shared.intentional_disconnect.load(Ordering::SeqCst) {
            return;
        }
        *shared.state.write().unwrap() = LinkState::Disconnected;
        sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

async fn run_connection(
    url: &str,
    shared: &Arc<Shared>,
    inbound_tx: &mpsc::UnboundedSender<InboundSignal>,
    generation: u64,
) -> Result<(), SignalingError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SignalingError::Transport(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    *shared.outbound.write().unwrap() = Some(out_tx.clone());

    let public_key = shared.public_key.read().unwrap().clone().unwrap_or_default();
    let pairing_code = shared.pairing_code.read().unwrap().clone();
    let register = json!({
        "type": "register",
        "publicKey": public_key,
        "pairingCode": pairing_code,
    });
    out_tx
        .send(Message::Text(register.to_string()))
        .map_err(|e| SignalingError::Transport(e.to_string()))?;
    *shared.state.write().unwrap() = LinkState::Registered;
    shared.missed_heartbeats.store(0, Ordering::SeqCst);

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let heartbeat_shared = shared.clone();
    let heartbeat_tx = out_tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        loop {
            sleep(HEARTBEAT_INTERVAL).await;
            if heartbeat_shared.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let missed = heartbeat_shared.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
            if missed >= MAX_MISSED_HEARTBEATS {
                *heartbeat_shared.state.write().unwrap() = LinkState::Degraded;
            }
            if heartbeat_tx.send(Message::Text(json!({"type": "ping"}).to_string())).is_err() {
                return;
            }
        }
    });

    let result = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                shared.missed_heartbeats.store(0, Ordering::SeqCst);
                if *shared.state.read().unwrap() == LinkState::Degraded {
                    *shared.state.write().unwrap() = LinkState::Registered;
                }
                match serde_json::from_str::<Value>(&text) {
                    Ok(value) => {
                        if let Some(frame) = validate(&value) {
                            let _ = inbound_tx.send(frame);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping malformed signaling frame"),
                }
            }
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => {} // binary/ping/pong frames carry no protocol meaning here
            Some(Err(e)) => break Err(SignalingError::Transport(e.to_string())),
        }
    };

    heartbeat_task.abort();
    writer_task.abort();
    *shared.outbound.write().unwrap() = None;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_incoming_requires_both_fields() {
        let ok = json!({"type": "pair_incoming", "fromCode": "XYZ12A", "fromPublicKey": "abc"});
        assert!(validate(&ok).is_some());

        let missing = json!({"type": "pair_incoming", "fromCode": "XYZ12A"});
        assert!(validate(&missing).is_none());
    }

    #[test]
    fn pair_matched_requires_initiator_flag() {
        let ok = json!({
            "type": "pair_matched",
            "peerCode": "XYZ12A",
            "peerPublicKey": "abc",
            "isInitiator": true
        });
        assert!(matches!(validate(&ok), Some(InboundSignal::PairMatched { is_initiator: true, .. })));

        let missing = json!({"type": "pair_matched", "peerCode": "XYZ12A", "peerPublicKey": "abc"});
        assert!(validate(&missing).is_none());
    }

    #[test]
    fn unknown_type_is_dropped_not_fatal() {
        let unknown = json!({"type": "screen_share_invite", "from": "a", "to": "b"});
        assert!(validate(&unknown).is_none());
    }

    #[test]
    fn pairing_codes_are_fixed_length_and_unambiguous() {
        for _ in 0..50 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), PAIRING_CODE_LEN);
            assert!(code.chars().all(|c| PAIRING_CODE_ALPHABET.contains(&(c as u8))));
        }
    }

    #[test]
    fn signaling_frames_require_from_and_payload() {
        let ok = json!({"type": "webrtc_signal", "from": "peer-a", "payload": {"sdp": "..."}});
        assert!(validate(&ok).is_some());

        let missing_payload = json!({"type": "webrtc_signal", "from": "peer-a"});
        assert!(validate(&missing_payload).is_none());
    }

    #[test]
    fn relay_message_decodes_payload_and_channel() {
        let ok = json!({
            "type": "relay_message",
            "from": "peer-a",
            "channel": "file",
            "payload": URL_SAFE_NO_PAD.encode(b"chunk-bytes"),
        });
        match validate(&ok) {
            Some(InboundSignal::RelayMessage { from, channel, payload }) => {
                assert_eq!(from, "peer-a");
                assert_eq!(channel, ChannelKind::File);
                assert_eq!(payload, b"chunk-bytes");
            }
            other => panic!("expected RelayMessage, got {other:?}"),
        }

        let bad_channel = json!({
            "type": "relay_message", "from": "peer-a", "channel": "video", "payload": "AA",
        });
        assert!(validate(&bad_channel).is_none());
    }
}

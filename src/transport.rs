//! TransportChannel: the reliable, ordered, message-oriented channel pair
//! abstraction that `PeerManager` drives and `FileTransfer`/group/channel
//! engines send frames over.
//!
//! spec.md treats the actual data-channel implementation (WebRTC or
//! equivalent) as an external collaborator, negotiated through SignalingLink's
//! `webrtc_signal`/ICE relay. No crate in this pack provides a WebRTC
//! stack, so the production implementation here (`RelayTransport`) instead
//! routes both logical channels through the coordinator connection itself —
//! a `relay_message` signaling frame wraps each outbound chunk, and
//! `RelayRouter` demuxes inbound ones back to the establishing peer. This
//! gives the daemon a real, working transport without fabricating a
//! dependency; swapping in a true peer-to-peer data channel later is a
//! drop-in `TransportChannel` implementation, no orchestration changes.
//! `DuplexTransport`, an in-process double, remains for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::TransportError;
use crate::signaling::SignalingLink;

/// Which logical channel a frame arrived on or should be sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Message,
    File,
}

/// An inbound frame delivered by the transport, tagged with its channel.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub channel: ChannelKind,
    pub bytes: Vec<u8>,
}

/// A pair of reliable, ordered, message-oriented logical channels between
/// two peers. Implementations MUST NOT silently drop or reorder; any
/// unavailability is surfaced as `TransportError`.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn send_message(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
    async fn send_file_chunk(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Block until the message channel is open, or the timeout elapses.
    async fn await_message_channel(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Best-effort close; subsequent sends fail with `Closed`.
    async fn close(&self);

    fn is_initiator(&self) -> bool;
}

/// In-process transport double built on `tokio::sync::mpsc`, standing in
/// for a real WebRTC data channel in tests and loopback scenarios. Two
/// `DuplexTransport`s are linked so that one side's `send_*` delivers onto
/// the other side's inbound stream.
pub struct DuplexTransport {
    outbound: mpsc::Sender<InboundFrame>,
    message_channel_open: tokio::sync::watch::Receiver<bool>,
    is_initiator: bool,
    closed: std::sync::atomic::AtomicBool,
}

impl DuplexTransport {
    /// Build a connected pair. `inbound_a`/`inbound_b` are the channels each
    /// side's caller should read from to receive `InboundFrame`s.
    pub fn pair(
        is_initiator_a: bool,
    ) -> (
        Arc<DuplexTransport>,
        mpsc::Receiver<InboundFrame>,
        Arc<DuplexTransport>,
        mpsc::Receiver<InboundFrame>,
    ) {
        let (tx_to_b, rx_b) = mpsc::channel(256);
        let (tx_to_a, rx_a) = mpsc::channel(256);
        let (open_tx, open_rx) = tokio::sync::watch::channel(true);
        // open_tx is held by neither side deliberately dropped; both start open.
        drop(open_tx);

        let a = Arc::new(DuplexTransport {
            outbound: tx_to_b,
            message_channel_open: open_rx.clone(),
            is_initiator: is_initiator_a,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let b = Arc::new(DuplexTransport {
            outbound: tx_to_a,
            message_channel_open: open_rx,
            is_initiator: !is_initiator_a,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        (a, rx_a, b, rx_b)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TransportChannel for DuplexTransport {
    async fn send_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.outbound
            .send(InboundFrame {
                channel: ChannelKind::Message,
                bytes,
            })
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_file_chunk(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.outbound
            .send(InboundFrame {
                channel: ChannelKind::File,
                bytes,
            })
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn await_message_channel(&self, wait: Duration) -> Result<(), TransportError> {
        if *self.message_channel_open.borrow() {
            return Ok(());
        }
        let mut rx = self.message_channel_open.clone();
        timeout(wait, rx.changed())
            .await
            .map_err(|_| TransportError::TimedOut("message channel open".into()))?
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_initiator(&self) -> bool {
        self.is_initiator
    }
}

/// `TransportChannel` backed by the coordinator relay: every send becomes a
/// `relay_message` signaling frame addressed to `peer_id`, and every receive
/// comes from `RelayRouter` demuxing the coordinator's inbound stream back to
/// this peer. The "channel" is open as soon as the signaling link itself is
/// registered — there is no separate per-peer negotiation to wait for.
pub struct RelayTransport {
    signaling: Arc<SignalingLink>,
    peer_id: String,
    is_initiator: bool,
    closed: AtomicBool,
}

impl RelayTransport {
    pub fn new(signaling: Arc<SignalingLink>, peer_id: String, is_initiator: bool) -> Self {
        RelayTransport {
            signaling,
            peer_id,
            is_initiator,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TransportChannel for RelayTransport {
    async fn send_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.signaling
            .send_relay(&self.peer_id, ChannelKind::Message, &bytes)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_file_chunk(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.signaling
            .send_relay(&self.peer_id, ChannelKind::File, &bytes)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn await_message_channel(&self, wait: Duration) -> Result<(), TransportError> {
        self.ensure_open()?;
        timeout(wait, async {
            while self.signaling.state() != crate::signaling::LinkState::Registered {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .map_err(|_| TransportError::TimedOut("signaling registered".into()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_initiator(&self) -> bool {
        self.is_initiator
    }
}

/// Demuxes inbound `relay_message` signaling frames to whichever peer
/// registered for them. A peer is registered the moment its `pair_matched`
/// establishment begins and unregistered when establishment finishes or
/// fails — frames for an unregistered peer have nowhere to go and are
/// dropped with a warning.
#[derive(Default)]
pub struct RelayRouter {
    routes: RwLock<HashMap<String, mpsc::Sender<InboundFrame>>>,
}

impl RelayRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer_id`, returning the receiver half the caller should
    /// drive. Replaces any prior registration for the same peer id.
    pub fn register(&self, peer_id: &str) -> mpsc::Receiver<InboundFrame> {
        let (tx, rx) = mpsc::channel(256);
        self.routes.write().unwrap().insert(peer_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, peer_id: &str) {
        self.routes.write().unwrap().remove(peer_id);
    }

    pub fn route(&self, from: &str, channel: ChannelKind, bytes: Vec<u8>) {
        let routes = self.routes.read().unwrap();
        match routes.get(from) {
            Some(tx) if tx.try_send(InboundFrame { channel, bytes }).is_ok() => {}
            Some(_) => tracing::warn!(peer_id = from, "relay inbound queue full, dropping frame"),
            None => tracing::warn!(peer_id = from, "dropping relay frame for unregistered peer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_pair_delivers_in_order() {
        let (a, _rx_a, b, mut rx_b) = DuplexTransport::pair(true);
        assert!(a.is_initiator());
        assert!(!b.is_initiator());

        a.send_message(b"one".to_vec()).await.unwrap();
        a.send_message(b"two".to_vec()).await.unwrap();

        let first = rx_b.recv().await.unwrap();
        let second = rx_b.recv().await.unwrap();
        assert_eq!(first.bytes, b"one");
        assert_eq!(second.bytes, b"two");
        assert_eq!(first.channel, ChannelKind::Message);
    }

    #[tokio::test]
    async fn closed_transport_rejects_sends() {
        let (a, _rx_a, _b, _rx_b) = DuplexTransport::pair(true);
        a.close().await;
        assert!(matches!(
            a.send_message(b"x".to_vec()).await.unwrap_err(),
            TransportError::Closed
        ));
    }

    #[tokio::test]
    async fn relay_router_routes_only_to_registered_peers() {
        let router = RelayRouter::new();
        let mut rx = router.register("peer-a");

        router.route("peer-a", ChannelKind::Message, b"hi".to_vec());
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.bytes, b"hi");

        // No registration for "peer-b": dropped, not delivered to peer-a's queue.
        router.route("peer-b", ChannelKind::Message, b"stray".to_vec());
        router.unregister("peer-a");
        router.route("peer-a", ChannelKind::Message, b"too-late".to_vec());
        assert!(rx.try_recv().is_err());
    }
}

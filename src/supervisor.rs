//! Supervisor: owns every subsystem's lifetime, wires signaling frames to
//! the peer lifecycle, and runs the daemon's periodic maintenance.
//!
//! The teacher's closest analogue is `AppState` (`commands.rs`) — one struct
//! holding every manager, built once at startup. Supervisor keeps that
//! shape but adds the explicit `start`/`shutdown` pair a headless daemon
//! needs and no Tauri runtime provides for free: background tasks must be
//! tracked and awaited, not left to die with the process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::channel::ChannelEngine;
use crate::config::Config;
use crate::crypto::CryptoCore;
use crate::event_bus::EventBus;
use crate::file_transfer::FileTransferEngine;
use crate::group::GroupEngine;
use crate::ipc::{socket_path, IpcDaemon, IpcState};
use crate::peer_manager::PeerManager;
use crate::peer_store::PeerStore;
use crate::signaling::{InboundSignal, SignalingLink};
use crate::transport::{RelayRouter, RelayTransport, TransportChannel};

const STALE_TRANSFER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Supervisor {
    config: Config,
    socket_path: PathBuf,
    crypto: Arc<CryptoCore>,
    peer_store: Arc<PeerStore>,
    peer_manager: Arc<PeerManager>,
    group_engine: Arc<GroupEngine>,
    channel_engine: Arc<ChannelEngine>,
    file_transfer: Arc<FileTransferEngine>,
    event_bus: Arc<EventBus>,
    signaling: Arc<SignalingLink>,
    relay_router: Arc<RelayRouter>,
    ipc: Arc<IpcDaemon>,
    tasks: Vec<JoinHandle<()>>,
    handshake_timeout: Duration,
}

impl Supervisor {
    /// Build every subsystem from `config`, loading or generating the local
    /// identity. Does not start any background task yet — call `start()`.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let state_dir = config.resolve_state_dir();
        let media_dir = config.resolve_media_dir();
        let receive_dir = config.resolve_receive_dir();
        let runtime_dir = config.resolve_runtime_dir();

        let crypto = Arc::new(CryptoCore::new());
        let identity_path = state_dir.join("identity.key");
        if identity_path.exists() {
            let bytes = std::fs::read(&identity_path)?;
            let secret: [u8; 64] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("corrupt identity file at {identity_path:?}"))?;
            crypto.load_identity(secret);
        } else {
            crypto.generate_identity();
            let secret = crypto.export_secret()?;
            write_identity_file(&identity_path, &secret)?;
        }

        let peer_store = Arc::new(PeerStore::open(state_dir.join("peers.json"))?);
        let event_bus = Arc::new(EventBus::new());
        let peer_manager = Arc::new(PeerManager::new(
            crypto.clone(),
            peer_store.clone(),
            event_bus.clone(),
            config.auto_accept_group_invitations,
        ));
        let group_engine = Arc::new(GroupEngine::new(
            config.limits.max_messages_per_group,
            config.limits.max_seq_gap,
        ));
        let channel_engine = Arc::new(ChannelEngine::new(config.limits.max_chunks_per_channel));
        let file_transfer = Arc::new(FileTransferEngine::new(
            media_dir,
            receive_dir,
            config.limits.max_file_size,
            config.limits.max_chunks,
            config.limits.max_concurrent_transfers,
            Duration::from_secs(config.limits.file_transfer_timeout_secs),
        ));
        let signaling = Arc::new(SignalingLink::new(config.coordinator_url.clone()));
        let relay_router = Arc::new(RelayRouter::new());
        let handshake_timeout = Duration::from_secs(config.limits.handshake_timeout_secs);

        let socket_path = socket_path(&runtime_dir, &config.name)?;
        let ipc_state = IpcState {
            crypto: crypto.clone(),
            peer_store: peer_store.clone(),
            peer_manager: peer_manager.clone(),
            group_engine: group_engine.clone(),
            channel_engine: channel_engine.clone(),
            file_transfer: file_transfer.clone(),
            event_bus: event_bus.clone(),
            signaling: signaling.clone(),
        };
        let ipc = Arc::new(IpcDaemon::new(socket_path.clone(), ipc_state));

        Ok(Supervisor {
            config,
            socket_path,
            crypto,
            peer_store,
            peer_manager,
            group_engine,
            channel_engine,
            file_transfer,
            event_bus,
            signaling,
            relay_router,
            ipc,
            tasks: Vec::new(),
            handshake_timeout,
        })
    }

    pub fn public_key(&self) -> anyhow::Result<String> {
        Ok(self.crypto.public_key()?)
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// Start the signaling link, the IPC daemon, and periodic maintenance.
    /// Each is a tracked background task; `shutdown()` aborts and awaits all
    /// of them before returning.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let public_key = self.public_key()?;
        let my_public_key = public_key.clone();
        let (pairing_code, mut inbound) = self.signaling.connect(public_key);
        tracing::info!(pairing_code = %pairing_code, "assigned pairing code");

        let peer_manager = self.peer_manager.clone();
        let group_engine = self.group_engine.clone();
        let event_bus = self.event_bus.clone();
        let signaling = self.signaling.clone();
        let relay_router = self.relay_router.clone();
        let handshake_timeout = self.handshake_timeout;
        self.tasks.push(tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                handle_signal(
                    frame,
                    &peer_manager,
                    &group_engine,
                    &event_bus,
                    &signaling,
                    &relay_router,
                    &my_public_key,
                    handshake_timeout,
                );
            }
        }));

        let ipc = self.ipc.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = ipc.run().await {
                tracing::error!(error = %e, "ipc daemon exited");
            }
        }));

        let file_transfer = self.file_transfer.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STALE_TRANSFER_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let purged = file_transfer.purge_stale();
                if !purged.is_empty() {
                    tracing::info!(count = purged.len(), "purged stale inbound transfers");
                }
            }
        }));

        tracing::info!(
            name = %self.config.name,
            coordinator = %self.config.coordinator_url,
            socket = %self.socket_path.display(),
            "zajel-headlessd started"
        );
        Ok(())
    }

    /// Cancel every background task, await their completion, close the
    /// signaling link, and unlink the IPC socket.
    pub async fn shutdown(mut self) {
        self.signaling.disconnect();
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        self.ipc.unlink();
        tracing::info!("zajel-headlessd shut down cleanly");
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_signal(
    frame: InboundSignal,
    peer_manager: &Arc<PeerManager>,
    _group_engine: &Arc<GroupEngine>,
    event_bus: &Arc<EventBus>,
    signaling: &Arc<SignalingLink>,
    relay_router: &Arc<RelayRouter>,
    my_public_key: &str,
    handshake_timeout: Duration,
) {
    match frame {
        InboundSignal::PairIncoming { from_code, from_public_key } => {
            event_bus.emit(
                "peer_connected",
                &serde_json::json!({"stage": "pair_incoming", "from_code": from_code, "from_public_key": from_public_key}),
            );
        }
        InboundSignal::PairMatched { peer_code, peer_public_key, is_initiator } => {
            if let Err(e) = peer_manager.begin_pending(&peer_code, &peer_public_key, is_initiator) {
                tracing::warn!(error = %e, "could not begin pending peer from pair_matched");
                return;
            }

            // Steps 2-3: open the transport. No data-channel negotiation is
            // needed for a relay transport — it's "open" once registered
            // with the router, so establish() moves straight to step 4.
            let inbound = relay_router.register(&peer_code);
            let transport: Arc<dyn TransportChannel> =
                Arc::new(RelayTransport::new(signaling.clone(), peer_code.clone(), is_initiator));

            let peer_manager = peer_manager.clone();
            let relay_router = relay_router.clone();
            let my_public_key = my_public_key.to_string();
            tokio::spawn(async move {
                let mut inbound = inbound;
                let result = peer_manager
                    .establish(transport, &mut inbound, &peer_code, &my_public_key, handshake_timeout)
                    .await;
                match result {
                    Ok(()) => {
                        tracing::info!(peer_id = %peer_code, "peer established");
                        peer_manager.run_inbound_loop(inbound).await;
                        relay_router.unregister(&peer_code);
                    }
                    Err(e) => {
                        tracing::warn!(peer_id = %peer_code, error = %e, "peer establishment failed");
                        relay_router.unregister(&peer_code);
                    }
                }
            });
        }
        InboundSignal::WebrtcSignal { from, payload } => {
            event_bus.emit("peer_connected", &serde_json::json!({"stage": "webrtc_signal", "from": from, "payload": payload}));
        }
        InboundSignal::CallSignal { from, payload } => {
            event_bus.emit("call_incoming", &serde_json::json!({"from": from, "payload": payload}));
        }
        InboundSignal::ChunkData { from, payload } => {
            event_bus.emit("channel_content", &serde_json::json!({"from": from, "payload": payload}));
        }
        InboundSignal::RelayMessage { from, channel, payload } => {
            relay_router.route(&from, channel, payload);
        }
        InboundSignal::Pong => {}
    }
}

fn write_identity_file(path: &std::path::Path, secret: &[u8; 64]) -> anyhow::Result<()> {
    use std::io::Write;
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(secret)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

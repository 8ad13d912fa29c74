//! IpcDaemon: the local control surface — a Unix domain socket speaking
//! newline-delimited JSON, one request/response pair per line.
//!
//! The teacher exposes its API as Tauri `#[command]` functions dispatched by
//! the webview (`commands.rs`); headless has no webview, so this module
//! keeps the same "one `AppState`, a flat table of named operations, every
//! operation returns `Result<Value, IpcError>`" shape but dispatches over a
//! socket instead of Tauri's IPC bridge.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};

use crate::channel::{ChannelEngine, ChannelManifest};
use crate::crypto::CryptoCore;
use crate::error::{Classify, ErrorKind, IpcError};
use crate::event_bus::EventBus;
use crate::file_transfer::FileTransferEngine;
use crate::group::GroupEngine;
use crate::peer_manager::PeerManager;
use crate::peer_store::PeerStore;
use crate::signaling::SignalingLink;

pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Validate an instance name before it becomes part of a filesystem path.
pub fn validate_name(name: &str) -> Result<(), IpcError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(IpcError::BadArgument(format!(
            "instance name {name:?} must match ^[A-Za-z0-9_-]+$"
        )))
    }
}

pub fn socket_path(runtime_dir: &Path, name: &str) -> Result<PathBuf, IpcError> {
    validate_name(name)?;
    Ok(runtime_dir.join(format!("zajel-headless-{name}.sock")))
}

#[derive(Debug, Deserialize)]
struct Request {
    id: Value,
    #[serde(rename = "cmd")]
    command: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "ref")]
    reference: Option<String>,
}

fn kind_code(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "validation",
        ErrorKind::Permission => "permission",
        ErrorKind::Transient => "transient",
        ErrorKind::Cryptographic => "cryptographic",
        ErrorKind::Resource => "resource",
        ErrorKind::Fatal => "internal_error",
    }
}

/// Render an `IpcError` verbatim: these only ever describe the caller's own
/// malformed request, using the literal wire codes spec.md §4.9 names.
fn ipc_error_response(id: Value, err: IpcError) -> Value {
    match &err {
        IpcError::MissingArgument(_) => json!({"id": id, "error": ErrorBody {
            code: "missing_argument", message: err.to_string(), reference: None,
        }}),
        IpcError::BadArgument(_) | IpcError::UnknownCommand(_) | IpcError::MessageTooLarge => {
            json!({"id": id, "error": ErrorBody {
                code: "bad_argument", message: err.to_string(), reference: None,
            }})
        }
        IpcError::Internal(_) => {
            let reference = crate::error::new_reference_id();
            tracing::error!(reference, error = %err, "internal ipc error");
            json!({"id": id, "error": ErrorBody {
                code: "internal_error", message: "internal error".to_string(), reference: Some(reference),
            }})
        }
    }
}

/// Collapse any other subsystem error onto the taxonomy: validation-shaped
/// errors are echoed, everything else becomes an opaque `internal_error`
/// with a server-logged reference id.
fn classified_error_response<E: Classify + std::fmt::Display>(id: Value, err: E) -> Value {
    let kind = err.kind();
    let code = kind_code(kind);
    match kind {
        ErrorKind::Validation | ErrorKind::Permission | ErrorKind::Resource => {
            json!({"id": id, "error": ErrorBody { code, message: err.to_string(), reference: None }})
        }
        _ => {
            let reference = crate::error::new_reference_id();
            tracing::error!(reference, error = %err, "internal error surfaced to ipc client");
            json!({"id": id, "error": ErrorBody {
                code: "internal_error",
                message: "internal error".to_string(),
                reference: Some(reference),
            }})
        }
    }
}

fn ok_response(id: Value, result: Value) -> Value {
    json!({"id": id, "result": result})
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, IpcError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| IpcError::MissingArgument(key.to_string()))
}

/// Shared handles every dispatched command may need. One instance per
/// daemon, constructed by `Supervisor` and cloned (cheaply, via `Arc`) into
/// each accepted connection's task.
#[derive(Clone)]
pub struct IpcState {
    pub crypto: Arc<CryptoCore>,
    pub peer_store: Arc<PeerStore>,
    pub peer_manager: Arc<PeerManager>,
    pub group_engine: Arc<GroupEngine>,
    pub channel_engine: Arc<ChannelEngine>,
    pub file_transfer: Arc<FileTransferEngine>,
    pub event_bus: Arc<EventBus>,
    pub signaling: Arc<SignalingLink>,
}

async fn dispatch(state: &IpcState, command: &str, args: &Value) -> Result<Value, Value> {
    match command {
        "status" => Ok(json!({
            "public_key": state.crypto.public_key().ok(),
            "connected_peers": state.peer_manager.list_connected().len(),
            "signaling_state": format!("{:?}", state.signaling.state()),
            "pairing_code": state.signaling.pairing_code(),
        })),

        "list_peers" => {
            let peers: Vec<Value> = state
                .peer_store
                .list()
                .into_iter()
                .map(|p| {
                    json!({
                        "peer_id": p.peer_id,
                        "display_name": p.display_name,
                        "trusted_at": p.trusted_at,
                        "last_seen": p.last_seen,
                        "connected": state.peer_manager.is_connected(&p.peer_id),
                    })
                })
                .collect();
            Ok(json!({"peers": peers}))
        }

        "block_peer" => {
            let peer_id = require_str(args, "peer_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            state.peer_manager.disconnect(peer_id);
            state
                .peer_store
                .remove(peer_id)
                .map_err(|e| classified_error_response(Value::Null, PeerStoreWrap(e)))?;
            Ok(json!({"blocked": peer_id}))
        }

        "send_text" => {
            let peer_id = require_str(args, "peer_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let text = require_str(args, "text").map_err(|e| ipc_error_response(Value::Null, e))?;
            let wire = state
                .crypto
                .encrypt_str(peer_id, text)
                .map_err(|e| classified_error_response(Value::Null, e))?;
            Ok(json!({"sent": true, "wire": wire}))
        }

        "send_file" => {
            let peer_id = require_str(args, "peer_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let path = require_str(args, "path").map_err(|e| ipc_error_response(Value::Null, e))?;
            let plan = state
                .file_transfer
                .prepare_outbound(Path::new(path))
                .map_err(|e| classified_error_response(Value::Null, e))?;
            Ok(json!({
                "peer_id": peer_id,
                "file_id": plan.file_id,
                "file_name": plan.file_name,
                "total_size": plan.total_size,
                "total_chunks": plan.total_chunks,
                "sha256": plan.sha256,
            }))
        }

        "list_transfers" => Ok(json!({"active": state.file_transfer.active_transfer_count()})),

        "get_transfer_progress" => {
            // Per-transfer byte progress is only meaningful while a transfer
            // is active; completed/aborted transfers are already gone.
            let file_id = require_str(args, "file_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            Ok(json!({"file_id": file_id, "active": state.file_transfer.active_transfer_count() > 0}))
        }

        "create_group" => {
            let group_id = require_str(args, "group_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let name = require_str(args, "name").map_err(|e| ipc_error_response(Value::Null, e))?;
            let my_device_id = require_str(args, "my_device_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let members = args
                .get("members")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
                .unwrap_or_default();
            let created_at = chrono::Utc::now().to_rfc3339();
            state
                .group_engine
                .create_group(group_id, name, members, my_device_id, &created_at);
            Ok(json!({"group_id": group_id}))
        }

        "invite_to_group" => {
            let group_id = require_str(args, "group_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let device_id = require_str(args, "device_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let key = state
                .group_engine
                .my_sender_key(group_id, device_id)
                .map_err(|e| classified_error_response(Value::Null, e))?;
            use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
            Ok(json!({"group_id": group_id, "sender_key": URL_SAFE_NO_PAD.encode(key)}))
        }

        "leave_group" => {
            let group_id = require_str(args, "group_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let my_device_id = require_str(args, "my_device_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            state.group_engine.leave(group_id, my_device_id);
            Ok(json!({"left": group_id}))
        }

        "list_groups" => {
            let groups: Vec<Value> = state
                .group_engine
                .list_groups()
                .into_iter()
                .map(|(id, name)| json!({"group_id": id, "name": name}))
                .collect();
            Ok(json!({"groups": groups}))
        }

        "get_group_messages" => {
            let group_id = require_str(args, "group_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let messages = state.group_engine.messages(group_id);
            Ok(json!({"group_id": group_id, "messages": messages}))
        }

        "subscribe_channel" => {
            let link = require_str(args, "invite_link").map_err(|e| ipc_error_response(Value::Null, e))?;
            let channel_id = require_str(args, "channel_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let manifest: ChannelManifest = crate::channel::decode_invite_link(link)
                .map_err(|e| classified_error_response(Value::Null, e))?;
            state.channel_engine.subscribe(channel_id, manifest);
            Ok(json!({"subscribed": channel_id}))
        }

        "publish_channel_message" => {
            let channel_id = require_str(args, "channel_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let content = require_str(args, "content").map_err(|e| ipc_error_response(Value::Null, e))?;
            let signing_key = state
                .crypto
                .channel_signing_key()
                .map_err(|e| classified_error_response(Value::Null, e))?;
            let chunks = state
                .channel_engine
                .publish(channel_id, content.as_bytes(), &signing_key)
                .map_err(|e| classified_error_response(Value::Null, e))?;
            Ok(json!({"channel_id": channel_id, "chunks": chunks}))
        }

        "list_channels" => Ok(json!({"channels": state.channel_engine.list_channels()})),

        "get_channel_manifest" => {
            let channel_id = require_str(args, "channel_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            let manifest = state
                .channel_engine
                .manifest(channel_id)
                .map_err(|e| classified_error_response(Value::Null, e))?;
            Ok(json!({"channel_id": channel_id, "manifest": manifest}))
        }

        "connect" => {
            let code = require_str(args, "code").map_err(|e| ipc_error_response(Value::Null, e))?;
            state
                .signaling
                .pair_with(code)
                .map_err(|e| classified_error_response(Value::Null, e))?;
            Ok(json!({"requested": code}))
        }

        "disconnect" => {
            let peer_id = require_str(args, "peer_id").map_err(|e| ipc_error_response(Value::Null, e))?;
            state.peer_manager.disconnect(peer_id);
            Ok(json!({"disconnected": peer_id}))
        }

        "accept_pair" => {
            let code = require_str(args, "code").map_err(|e| ipc_error_response(Value::Null, e))?;
            state
                .signaling
                .respond_to_pair(code, true)
                .map_err(|e| classified_error_response(Value::Null, e))?;
            Ok(json!({"accepted": code}))
        }

        "reject_pair" => {
            let code = require_str(args, "code").map_err(|e| ipc_error_response(Value::Null, e))?;
            state
                .signaling
                .respond_to_pair(code, false)
                .map_err(|e| classified_error_response(Value::Null, e))?;
            Ok(json!({"rejected": code}))
        }

        "set_display_name" => {
            let name = require_str(args, "name").map_err(|e| ipc_error_response(Value::Null, e))?;
            state.peer_manager.set_my_display_name(name);
            state
                .peer_manager
                .broadcast_profile(name)
                .await
                .map_err(|e| classified_error_response(Value::Null, e))?;
            Ok(json!({"display_name": name}))
        }

        other => Err(ipc_error_response(Value::Null, IpcError::UnknownCommand(other.to_string()))),
    }
}

/// Wraps `PeerStoreError` so it can be classified without a blanket impl
/// clashing with the crate's other `Classify` implementations.
struct PeerStoreWrap(crate::error::PeerStoreError);

impl std::fmt::Display for PeerStoreWrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Classify for PeerStoreWrap {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

pub struct IpcDaemon {
    path: PathBuf,
    state: IpcState,
}

impl IpcDaemon {
    pub fn new(path: PathBuf, state: IpcState) -> Self {
        IpcDaemon { path, state }
    }

    /// Bind the socket, tighten permissions, and serve connections until the
    /// returned future is dropped/cancelled by the caller.
    pub async fn run(&self) -> std::io::Result<()> {
        if is_stale_socket(&self.path) {
            let _ = std::fs::remove_file(&self.path);
        }

        let listener = UnixListener::bind(&self.path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        loop {
            let (stream, _) = listener.accept().await?;
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, state).await {
                    tracing::warn!(error = %e, "ipc connection ended with error");
                }
            });
        }
    }

    pub fn unlink(&self) {
        if is_stale_socket(&self.path) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Only remove a pre-existing path at the socket location if it is, in
/// fact, a socket — never blindly clobber an unrelated file.
fn is_stale_socket(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileTypeExt;
                meta.file_type().is_socket()
            }
            #[cfg(not(unix))]
            {
                let _ = meta;
                false
            }
        })
        .unwrap_or(false)
}

#[cfg(unix)]
fn authorize_peer(stream: &UnixStream) -> bool {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        tracing::warn!("SO_PEERCRED unsupported on this platform; skipping peer-uid check");
        return true;
    }
    let our_uid = unsafe { libc::getuid() };
    cred.uid == our_uid
}

#[cfg(not(unix))]
fn authorize_peer(_stream: &UnixStream) -> bool {
    true
}

/// Bridge every known `EventBus` event to this connection as an unsolicited
/// `{"event": ..., "payload": ...}` line, interleaved with ordinary
/// request/response traffic on the same socket. The subscription lives for
/// the process's lifetime — `EventBus` has no handler-removal path, so a
/// closed connection's handler just starts failing its sends silently.
fn subscribe_connection(event_bus: &Arc<EventBus>, writer: Arc<Mutex<OwnedWriteHalf>>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    for name in crate::event_bus::KNOWN_EVENTS {
        let tx = tx.clone();
        let name = *name;
        event_bus.on(
            name,
            Box::new(move |payload| {
                tx.send(json!({"event": name, "payload": payload}))
                    .map_err(|e| e.to_string())
            }),
        );
    }
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut out = serde_json::to_vec(&frame).unwrap_or_default();
            out.push(b'\n');
            if writer.lock().await.write_all(&out).await.is_err() {
                break;
            }
        }
    });
}

async fn handle_connection(stream: UnixStream, state: IpcState) -> std::io::Result<()> {
    if !authorize_peer(&stream) {
        tracing::warn!("rejecting ipc connection from foreign uid");
        return Ok(());
    }

    let (reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.len() > MAX_MESSAGE_SIZE {
            tracing::warn!(len = line.len(), "ipc message exceeds max size, closing connection");
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) if req.command == "subscribe" => {
                subscribe_connection(&state.event_bus, writer.clone());
                ok_response(req.id, json!({"subscribed": true}))
            }
            Ok(req) => {
                let id = req.id.clone();
                match dispatch(&state, &req.command, &req.args).await {
                    Ok(result) => ok_response(id, result),
                    Err(mut error_value) => {
                        error_value["id"] = id;
                        error_value
                    }
                }
            }
            Err(e) => ipc_error_response(Value::Null, IpcError::BadArgument(format!("malformed request: {e}"))),
        };

        let mut out = serde_json::to_vec(&response).unwrap_or_default();
        out.push(b'\n');
        writer.lock().await.write_all(&out).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_rejects_path_separators() {
        assert!(validate_name("my-daemon_01").is_ok());
        assert!(validate_name("../evil").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn socket_path_is_namespaced_by_name() {
        let dir = PathBuf::from("/run/user/1000");
        let path = socket_path(&dir, "work").unwrap();
        assert_eq!(path, dir.join("zajel-headless-work.sock"));
    }

    #[tokio::test]
    async fn unknown_command_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = Arc::new(CryptoCore::new());
        crypto.generate_identity();
        let peer_store = Arc::new(PeerStore::open(dir.path().join("peers.json")).unwrap());
        let event_bus = Arc::new(EventBus::new());
        let peer_manager = Arc::new(PeerManager::new(crypto.clone(), peer_store.clone(), event_bus.clone(), true));
        let state = IpcState {
            crypto,
            peer_store,
            peer_manager,
            group_engine: Arc::new(GroupEngine::new(100, 100)),
            channel_engine: Arc::new(ChannelEngine::new(100)),
            file_transfer: Arc::new(FileTransferEngine::new(
                dir.path().join("media"),
                dir.path().join("received"),
                1024 * 1024,
                100,
                5,
                std::time::Duration::from_secs(60),
            )),
            event_bus,
            signaling: Arc::new(SignalingLink::new("ws://127.0.0.1:0".to_string())),
        };

        let result = dispatch(&state, "nonexistent_command", &json!({})).await;
        assert!(result.is_err());
    }
}

//! Crate-wide error taxonomy.
//!
//! Every subsystem returns a typed error. `Classify` maps any of them onto
//! the six-way taxonomy of spec.md §7, which the IPC dispatcher (`ipc.rs`)
//! uses to decide whether a message is safe to echo to a client or must be
//! collapsed into an opaque `internal_error` with a logged reference id.

use thiserror::Error;

/// The six error kinds a caller-visible response collapses onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Permission,
    Transient,
    Cryptographic,
    Resource,
    Fatal,
}

pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no session established with peer")]
    NoSession,
    #[error("replay detected")]
    ReplayDetected,
    #[error("authentication failed")]
    AuthFailed,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("no identity generated")]
    NoIdentity,
}

impl Classify for CryptoError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Cryptographic
    }
}

#[derive(Debug, Error)]
pub enum PeerStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt peer store: {0}")]
    Corrupt(String),
}

impl Classify for PeerStoreError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("frame failed validation: {0}")]
    Invalid(String),
}

impl Classify for SignalingError {
    fn kind(&self) -> ErrorKind {
        match self {
            SignalingError::Invalid(_) => ErrorKind::Validation,
            _ => ErrorKind::Transient,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("timed out waiting for {0}")]
    TimedOut(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl Classify for TransportError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

#[derive(Debug, Error)]
pub enum PeerManagerError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("peer already pending or connected: {0}")]
    AlreadyActive(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("handshake identity mismatch")]
    IdentityMismatch,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}

impl Classify for PeerManagerError {
    fn kind(&self) -> ErrorKind {
        match self {
            PeerManagerError::UnknownPeer(_) => ErrorKind::Validation,
            PeerManagerError::AlreadyActive(_) => ErrorKind::Validation,
            PeerManagerError::IdentityMismatch => ErrorKind::Cryptographic,
            PeerManagerError::HandshakeTimeout => ErrorKind::Transient,
            PeerManagerError::InvalidPeerId(_) => ErrorKind::Validation,
            PeerManagerError::Transport(e) => e.kind(),
            PeerManagerError::Crypto(e) => e.kind(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FileTransferError {
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("path escapes allow-listed directory")]
    PathConfinement,
    #[error("resource limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("transfer not found: {0}")]
    NotFound(String),
    #[error("integrity check failed")]
    IntegrityFailed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for FileTransferError {
    fn kind(&self) -> ErrorKind {
        match self {
            FileTransferError::BadArgument(_) => ErrorKind::Validation,
            FileTransferError::PathConfinement => ErrorKind::Permission,
            FileTransferError::LimitExceeded(_) => ErrorKind::Resource,
            FileTransferError::NotFound(_) => ErrorKind::Validation,
            FileTransferError::IntegrityFailed => ErrorKind::Cryptographic,
            FileTransferError::Io(_) => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("duplicate message")]
    Duplicate,
    #[error("sequence gap too large")]
    SequenceGap,
    #[error("negative or non-monotonic sequence")]
    BadSequence,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl Classify for GroupError {
    fn kind(&self) -> ErrorKind {
        match self {
            GroupError::UnknownGroup(_) => ErrorKind::Validation,
            GroupError::Duplicate => ErrorKind::Resource,
            GroupError::SequenceGap => ErrorKind::Resource,
            GroupError::BadSequence => ErrorKind::Validation,
            GroupError::Crypto(e) => e.kind(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("schema validation failed: {0}")]
    Invalid(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("replay: sequence below watermark")]
    Replay,
    #[error("content-substitution attempt on chunk {0}")]
    ContentSubstitution(String),
    #[error("invite link missing required prefix")]
    BadInviteLink,
}

impl Classify for ChannelError {
    fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::UnknownChannel(_) => ErrorKind::Validation,
            ChannelError::Invalid(_) => ErrorKind::Validation,
            ChannelError::BadSignature => ErrorKind::Cryptographic,
            ChannelError::Replay => ErrorKind::Resource,
            ChannelError::ContentSubstitution(_) => ErrorKind::Resource,
            ChannelError::BadInviteLink => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("missing required argument: {0}")]
    MissingArgument(String),
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("message too large")]
    MessageTooLarge,
    #[error("internal error (ref {0})")]
    Internal(String),
}

impl Classify for IpcError {
    fn kind(&self) -> ErrorKind {
        match self {
            IpcError::MissingArgument(_) => ErrorKind::Validation,
            IpcError::BadArgument(_) => ErrorKind::Validation,
            IpcError::UnknownCommand(_) => ErrorKind::Validation,
            IpcError::MessageTooLarge => ErrorKind::Resource,
            IpcError::Internal(_) => ErrorKind::Fatal,
        }
    }
}

/// Generate a short reference id for an internal error, logged server-side
/// alongside the full reason and returned to the client in its place.
pub fn new_reference_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

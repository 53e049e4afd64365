//! Session store
//!
//! Durable key/value persistence of upload sessions, keyed by file
//! fingerprint. One JSON file per fingerprint under a spool directory,
//! written atomically (tempfile + rename) so a crash mid-write never
//! leaves a truncated record. Survives process restart by construction.
//!
//! Single-writer assumption: the coordinator is the sole mutator of a
//! session during its active lifetime. Two independent processes writing
//! the same fingerprint are not coordinated.

use crate::session::UploadSession;
use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Session store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to decode session record: {0}")]
    DecodeError(#[from] serde_json::Error),
}

/// File-backed session table
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{fingerprint}.json"))
    }

    /// Persist a session, replacing any previous record for its fingerprint
    pub fn put(&self, session: &UploadSession) -> Result<(), StoreError> {
        let path = self.entry_path(&session.fingerprint);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(session)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Look up a session by fingerprint
    pub fn get(&self, fingerprint: &str) -> Result<Option<UploadSession>, StoreError> {
        let path = self.entry_path(fingerprint);
        match std::fs::read(&path) {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a session record. Removing a missing record is not an error.
    pub fn delete(&self, fingerprint: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.entry_path(fingerprint)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All persisted sessions, in no particular order.
    ///
    /// Undecodable records are skipped with a warning rather than failing
    /// the listing; they are reaped by [`Self::prune_older_than`] or
    /// replaced on the next transfer for that fingerprint.
    pub fn list_all(&self) -> Result<Vec<UploadSession>, StoreError> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).map_err(StoreError::from).and_then(|b| {
                serde_json::from_slice::<UploadSession>(&b).map_err(StoreError::from)
            }) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session record");
                }
            }
        }
        Ok(sessions)
    }

    /// Delete sessions untouched for longer than `max_age` (abandoned
    /// uploads). Returns the number of records removed.
    pub fn prune_older_than(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - max_age;
        let mut removed = 0;
        for session in self.list_all()? {
            if session.last_updated < cutoff {
                self.delete(&session.fingerprint)?;
                removed += 1;
                tracing::info!(
                    fingerprint = %session.fingerprint,
                    file_name = %session.file_name,
                    last_updated = %session.last_updated,
                    "Pruned abandoned upload session"
                );
            }
        }
        Ok(removed)
    }
}

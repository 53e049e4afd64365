//! Upload session model
//!
//! An [`UploadSession`] is the unit of resumable work: the durable record
//! of one file's multipart transfer progress, keyed by a metadata
//! fingerprint so a restarted process can pick up where it left off.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

/// Structural validation errors for persisted sessions.
///
/// Any of these means the stored record can no longer be trusted for
/// resume; the coordinator discards it and initiates a fresh session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Part number {part_number} out of range 1..={total_parts}")]
    PartOutOfRange { part_number: u32, total_parts: u32 },

    #[error("Duplicate completed part {part_number}")]
    DuplicatePart { part_number: u32 },

    #[error("Recorded total_parts {recorded} does not match plan {expected}")]
    TotalPartsMismatch { recorded: u32, expected: u32 },

    #[error("Session has zero chunk size")]
    ZeroChunkSize,

    #[error("Completed part {part_number} has empty ETag")]
    EmptyEtag { part_number: u32 },

    #[error("Unreadable session record: {0}")]
    Unreadable(String),
}

/// File metadata used to derive the session fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_name: String,
    pub file_size: u64,
    /// Last-modified time, milliseconds since the Unix epoch
    pub modified_ms: i64,
}

impl FileMeta {
    /// Read name, size and mtime from a file on disk
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified_ms = metadata
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Ok(Self {
            file_name,
            file_size: metadata.len(),
            modified_ms,
        })
    }

    /// Derive the session fingerprint for this file.
    ///
    /// SHA-256 over `name\nsize\nmtime`, hex-encoded. Content is not
    /// hashed: two different files sharing name, size and mtime are
    /// indistinguishable. Known limitation of the metadata-based key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.file_name.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.file_size.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.modified_ms.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A part acknowledged by the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Persisted record of one file's multipart transfer progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Derived from file name + size + mtime; one live session per fingerprint
    pub fingerprint: String,
    /// Opaque identifier issued by the remote service at initiation
    pub session_id: String,
    /// Logical identifier of the object being assembled
    pub asset_id: String,
    /// Opaque target location from the remote service
    pub storage_key: String,
    pub file_name: String,
    pub file_size: u64,
    /// Bytes per part, fixed at session creation
    pub chunk_size: u64,
    /// `ceil(file_size / chunk_size)`, fixed at creation
    pub total_parts: u32,
    /// Append-only while a transfer is active; unique by part_number
    pub completed_parts: Vec<CompletedPart>,
    /// Refreshed on every mutation
    pub last_updated: DateTime<Utc>,
}

impl UploadSession {
    /// Record a transport-acknowledged part.
    ///
    /// A part already recorded under the same number is left untouched;
    /// `completed_parts` never shrinks and never holds duplicates.
    pub fn record_part(&mut self, part: CompletedPart) {
        if !self
            .completed_parts
            .iter()
            .any(|p| p.part_number == part.part_number)
        {
            self.completed_parts.push(part);
        }
        self.last_updated = Utc::now();
    }

    /// Part numbers already acknowledged
    pub fn completed_part_numbers(&self) -> Vec<u32> {
        self.completed_parts.iter().map(|p| p.part_number).collect()
    }

    /// Completed parts sorted ascending by part number.
    ///
    /// Arrival order across workers is not meaningful; the finalize call
    /// always receives this sorted form.
    pub fn sorted_parts(&self) -> Vec<CompletedPart> {
        let mut parts = self.completed_parts.clone();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    pub fn is_complete(&self) -> bool {
        self.completed_parts.len() as u32 == self.total_parts
    }

    /// Structural validation against the plan recorded at creation.
    ///
    /// `expected_total_parts` comes from re-planning the file with the
    /// session's own recorded chunk size.
    pub fn validate(&self, expected_total_parts: u32) -> Result<(), SessionError> {
        if self.chunk_size == 0 {
            return Err(SessionError::ZeroChunkSize);
        }
        if self.total_parts != expected_total_parts {
            return Err(SessionError::TotalPartsMismatch {
                recorded: self.total_parts,
                expected: expected_total_parts,
            });
        }

        let mut seen = std::collections::HashSet::new();
        for part in &self.completed_parts {
            if part.part_number < 1 || part.part_number > self.total_parts {
                return Err(SessionError::PartOutOfRange {
                    part_number: part.part_number,
                    total_parts: self.total_parts,
                });
            }
            if !seen.insert(part.part_number) {
                return Err(SessionError::DuplicatePart {
                    part_number: part.part_number,
                });
            }
            if part.etag.is_empty() {
                return Err(SessionError::EmptyEtag {
                    part_number: part.part_number,
                });
            }
        }

        Ok(())
    }
}

//! Transfer coordinator
//!
//! The resumable upload state machine. `start()` resolves or creates a
//! durable session for the file, drains the pending parts with a bounded
//! pool of concurrent workers, persists progress after every acknowledged
//! part, and finalizes the multipart session exactly once. A transfer
//! interrupted by a crash, a network drop or a pause resumes from the
//! last persisted part on the next `start()` for the same fingerprint.
//!
//! States: `Idle -> Initiating -> Transferring -> Completing -> Completed`,
//! with `Failed` and `Cancelled` reachable from the three active states.

use crate::config::{RetryConfig, TransferConfig};
use crate::plan::ChunkPlan;
use crate::service::{ServiceError, UploadService};
use crate::session::{CompletedPart, FileMeta, SessionError, UploadSession};
use crate::store::{SessionStore, StoreError};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

/// Cancellation intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Stop the transfer but keep the session for a later resume
    Pause,
    /// Stop the transfer and delete the session
    Discard,
}

impl std::fmt::Display for CancelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelMode::Pause => write!(f, "pause"),
            CancelMode::Discard => write!(f, "discard"),
        }
    }
}

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("File size {size} exceeds configured maximum {max}")]
    SizeLimitExceeded { size: u64, max: u64 },

    #[error("Nothing to transfer: file is empty")]
    EmptyFile,

    #[error("Failed to initiate upload session: {0}")]
    InitiationFailed(#[source] ServiceError),

    #[error("Part {part_number} failed after {attempts} attempt(s): {source}")]
    PartTransferFailed {
        part_number: u32,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    #[error("Part {part_number} transmission returned no acknowledgment")]
    MissingAcknowledgment { part_number: u32 },

    #[error("Failed to finalize upload session: {0}")]
    CompletionFailed(#[source] ServiceError),

    #[error("Transfer cancelled ({0})")]
    Cancelled(CancelMode),

    #[error("Persisted session is corrupt: {0}")]
    CorruptSession(#[from] SessionError),

    #[error("An upload for this file is already in progress")]
    SessionBusy,

    #[error("Session store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TransferError {
    /// Whether calling `start()` again for the same file is a sensible
    /// recovery. The session (when one exists) is preserved for every
    /// variant except `Cancelled(Discard)` and `CorruptSession`; a
    /// corrupt record is dropped so the retry begins a fresh session.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::SizeLimitExceeded { .. }
            | TransferError::EmptyFile
            | TransferError::Cancelled(_)
            | TransferError::SessionBusy
            | TransferError::MissingAcknowledgment { .. } => false,
            TransferError::InitiationFailed(e) | TransferError::CompletionFailed(e) => {
                e.is_retryable()
            }
            TransferError::PartTransferFailed { source, .. } => source.is_retryable(),
            TransferError::CorruptSession(_) => true,
            TransferError::StoreError(_) | TransferError::IoError(_) => false,
        }
    }
}

/// Coordinator state, observable through [`TransferProgress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Initiating,
    Transferring,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

/// Snapshot of aggregate progress, published after every persisted part
#[derive(Debug, Clone, Copy)]
pub struct TransferProgress {
    pub state: TransferState,
    pub completed_parts: u32,
    pub total_parts: u32,
}

impl TransferProgress {
    pub fn idle() -> Self {
        Self {
            state: TransferState::Idle,
            completed_parts: 0,
            total_parts: 0,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total_parts == 0 {
            0.0
        } else {
            self.completed_parts as f64 / self.total_parts as f64 * 100.0
        }
    }
}

/// Removes the fingerprint from the in-flight registry when the transfer
/// ends, however it ends.
struct InFlightGuard<'a> {
    registry: &'a DashMap<String, ()>,
    fingerprint: String,
}

impl<'a> InFlightGuard<'a> {
    fn claim(registry: &'a DashMap<String, ()>, fingerprint: &str) -> Result<Self, TransferError> {
        match registry.entry(fingerprint.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransferError::SessionBusy),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(Self {
                    registry,
                    fingerprint: fingerprint.to_string(),
                })
            }
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.fingerprint);
    }
}

/// State shared by the worker pool during one transfer
struct TransferShared {
    /// Pending part numbers; each claim pops exactly one entry
    queue: Mutex<VecDeque<u32>>,
    session: tokio::sync::Mutex<UploadSession>,
}

/// Wait until a cancellation intent is published.
///
/// Pends forever if the sender is gone; the coordinator outlives its
/// workers, so that only happens while the whole transfer is being
/// dropped anyway.
async fn wait_cancel(rx: &mut watch::Receiver<Option<CancelMode>>) -> CancelMode {
    loop {
        if let Some(mode) = *rx.borrow() {
            return mode;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Read one part's byte range from the source file
async fn read_part(path: &Path, range: Range<u64>) -> std::io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// The resumable upload coordinator
pub struct TransferCoordinator {
    service: Arc<dyn UploadService>,
    store: SessionStore,
    config: TransferConfig,
    /// Fingerprints with an active transfer; makes session resolution
    /// single-flight per fingerprint within this process
    in_flight: DashMap<String, ()>,
    cancel_tx: watch::Sender<Option<CancelMode>>,
    progress_tx: watch::Sender<TransferProgress>,
}

impl TransferCoordinator {
    pub fn new(service: Arc<dyn UploadService>, store: SessionStore, config: TransferConfig) -> Self {
        let (cancel_tx, _) = watch::channel(None);
        let (progress_tx, _) = watch::channel(TransferProgress::idle());
        Self {
            service,
            store,
            config,
            in_flight: DashMap::new(),
            cancel_tx,
            progress_tx,
        }
    }

    /// Observe progress and state transitions of the current transfer
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress_tx.subscribe()
    }

    /// Request cooperative cancellation of the current transfer.
    ///
    /// Workers stop claiming new parts and abort in-flight network calls.
    /// `Pause` preserves the session for resume; `Discard` deletes it.
    pub fn cancel(&self, mode: CancelMode) {
        self.cancel_tx.send_replace(Some(mode));
    }

    fn publish(&self, state: TransferState, completed_parts: u32, total_parts: u32) {
        self.progress_tx.send_replace(TransferProgress {
            state,
            completed_parts,
            total_parts,
        });
    }

    /// Upload a file, resuming any persisted session for its fingerprint.
    ///
    /// Returns the logical asset id on success. On failure the session is
    /// preserved for resume, except for validation-class errors that
    /// never created one, corrupt records (dropped) and discards.
    #[tracing::instrument(name = "transfer.start", skip(self), fields(file = %path.display()), err)]
    pub async fn start(&self, path: &Path) -> Result<String, TransferError> {
        let meta = FileMeta::from_path(path)?;
        if meta.file_size > self.config.max_file_size {
            return Err(TransferError::SizeLimitExceeded {
                size: meta.file_size,
                max: self.config.max_file_size,
            });
        }
        if meta.file_size == 0 {
            return Err(TransferError::EmptyFile);
        }

        let fingerprint = meta.fingerprint();
        let _guard = InFlightGuard::claim(&self.in_flight, &fingerprint)?;

        // Clear any cancellation left over from a previous transfer
        self.cancel_tx.send_replace(None);
        self.publish(TransferState::Initiating, 0, 0);

        let result = self.run(path, &meta, &fingerprint).await;
        match &result {
            Ok(asset_id) => {
                tracing::info!(asset_id = %asset_id, "Transfer completed");
            }
            Err(TransferError::Cancelled(mode)) => {
                tracing::info!(mode = %mode, "Transfer cancelled");
                let progress = *self.progress_tx.borrow();
                self.publish(
                    TransferState::Cancelled,
                    progress.completed_parts,
                    progress.total_parts,
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Transfer failed");
                let progress = *self.progress_tx.borrow();
                self.publish(
                    TransferState::Failed,
                    progress.completed_parts,
                    progress.total_parts,
                );
            }
        }
        result
    }

    async fn run(
        &self,
        path: &Path,
        meta: &FileMeta,
        fingerprint: &str,
    ) -> Result<String, TransferError> {
        let session = self.resolve_session(meta, fingerprint).await?;
        let plan = ChunkPlan::new(meta.file_size, session.chunk_size);
        let asset_id = session.asset_id.clone();

        let outcome = self.transfer_and_complete(path, session, plan).await;

        if let Err(TransferError::Cancelled(CancelMode::Discard)) = &outcome {
            self.store.delete(fingerprint)?;
            // Server-side cleanup is best effort; the client state machine
            // is already consistent without it.
            if let Err(e) = self.service.abort(&asset_id).await {
                tracing::warn!(asset_id = %asset_id, error = %e, "Remote abort failed");
            }
        }

        outcome
    }

    /// Resolve the session for a fingerprint: reuse the persisted one if
    /// it passes structural validation, otherwise initiate a new one.
    async fn resolve_session(
        &self,
        meta: &FileMeta,
        fingerprint: &str,
    ) -> Result<UploadSession, TransferError> {
        let existing = match self.store.get(fingerprint) {
            Ok(existing) => existing,
            Err(StoreError::DecodeError(e)) => {
                // Unreadable record: unrecoverable for this fingerprint
                tracing::warn!(fingerprint = %fingerprint, error = %e, "Dropping undecodable session record");
                self.store.delete(fingerprint)?;
                return Err(TransferError::CorruptSession(SessionError::Unreadable(
                    e.to_string(),
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(session) = existing {
            let expected = if session.chunk_size > 0 {
                ChunkPlan::new(meta.file_size, session.chunk_size).total_parts()
            } else {
                0
            };
            return match session.validate(expected) {
                Ok(()) => {
                    tracing::info!(
                        fingerprint = %fingerprint,
                        session_id = %session.session_id,
                        completed = session.completed_parts.len(),
                        total = session.total_parts,
                        "Resuming persisted session"
                    );
                    Ok(session)
                }
                Err(e) => {
                    tracing::warn!(fingerprint = %fingerprint, error = %e, "Dropping corrupt session record");
                    self.store.delete(fingerprint)?;
                    Err(TransferError::CorruptSession(e))
                }
            };
        }

        let content_type = guess_content_type(&meta.file_name);
        let initiated = self
            .service
            .initiate(&meta.file_name, content_type)
            .await
            .map_err(TransferError::InitiationFailed)?;

        let session = UploadSession {
            fingerprint: fingerprint.to_string(),
            session_id: initiated.session_id,
            asset_id: initiated.asset_id,
            storage_key: initiated.storage_key,
            file_name: meta.file_name.clone(),
            file_size: meta.file_size,
            chunk_size: self.config.chunk_size,
            total_parts: ChunkPlan::new(meta.file_size, self.config.chunk_size).total_parts(),
            completed_parts: Vec::new(),
            last_updated: Utc::now(),
        };
        self.store.put(&session)?;
        Ok(session)
    }

    async fn transfer_and_complete(
        &self,
        path: &Path,
        session: UploadSession,
        plan: ChunkPlan,
    ) -> Result<String, TransferError> {
        let fingerprint = session.fingerprint.clone();
        let total_parts = plan.total_parts();
        let pending = plan.pending(&session.completed_part_numbers());
        self.publish(
            TransferState::Transferring,
            session.completed_parts.len() as u32,
            total_parts,
        );

        let shared = TransferShared {
            queue: Mutex::new(pending.iter().copied().collect()),
            session: tokio::sync::Mutex::new(session),
        };

        let workers = self.config.concurrent_parts.min(pending.len().max(1));
        let pool = (0..workers).map(|_| self.run_worker(&shared, path, plan));
        futures::future::try_join_all(pool).await?;

        let session = shared.session.into_inner();
        debug_assert!(session.is_complete());

        // Race finalize against cancellation like any other network call
        self.publish(TransferState::Completing, total_parts, total_parts);
        let mut cancel_rx = self.cancel_tx.subscribe();
        if let Some(mode) = *cancel_rx.borrow() {
            return Err(TransferError::Cancelled(mode));
        }
        let sorted = session.sorted_parts();
        tokio::select! {
            result = self.service.complete(&session.asset_id, &session.session_id, &sorted) => {
                result.map_err(TransferError::CompletionFailed)?;
            }
            mode = wait_cancel(&mut cancel_rx) => {
                return Err(TransferError::Cancelled(mode));
            }
        }

        self.store.delete(&fingerprint)?;
        self.publish(TransferState::Completed, total_parts, total_parts);
        Ok(session.asset_id)
    }

    /// One pool worker: claim, read, transmit, persist, repeat
    async fn run_worker(
        &self,
        shared: &TransferShared,
        path: &Path,
        plan: ChunkPlan,
    ) -> Result<(), TransferError> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        loop {
            if let Some(mode) = *cancel_rx.borrow() {
                return Err(TransferError::Cancelled(mode));
            }

            let part_number = {
                let mut queue = shared.queue.lock();
                queue.pop_front()
            };
            let Some(part_number) = part_number else {
                return Ok(());
            };

            let body = read_part(path, plan.range_of(part_number)).await?;
            let etag = self
                .upload_part_with_retry(shared, part_number, body, &mut cancel_rx)
                .await?;

            let mut session = shared.session.lock().await;
            session.record_part(CompletedPart { part_number, etag });
            self.store.put(&session)?;
            self.publish(
                TransferState::Transferring,
                session.completed_parts.len() as u32,
                session.total_parts,
            );
            tracing::debug!(
                part_number = part_number,
                completed = session.completed_parts.len(),
                total = session.total_parts,
                "Part acknowledged"
            );
        }
    }

    /// Mint a URL and transmit one part, with bounded retry and backoff
    /// for transient transport failures. Every suspension point is raced
    /// against the cancellation signal.
    async fn upload_part_with_retry(
        &self,
        shared: &TransferShared,
        part_number: u32,
        body: Bytes,
        cancel_rx: &mut watch::Receiver<Option<CancelMode>>,
    ) -> Result<String, TransferError> {
        let RetryConfig {
            max_attempts,
            backoff_ms,
        } = self.config.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let (asset_id, session_id) = {
                let session = shared.session.lock().await;
                (session.asset_id.clone(), session.session_id.clone())
            };
            let transmit = async {
                let url = self
                    .service
                    .part_upload_url(&asset_id, &session_id, part_number)
                    .await?;
                self.service.put_part(&url, body.clone()).await
            };

            let error = tokio::select! {
                result = transmit => match result {
                    Ok(etag) => return Ok(etag),
                    Err(e) => e,
                },
                mode = wait_cancel(cancel_rx) => {
                    return Err(TransferError::Cancelled(mode));
                }
            };

            if let ServiceError::MissingEtag = error {
                return Err(TransferError::MissingAcknowledgment { part_number });
            }
            if !error.is_retryable() || attempt >= max_attempts {
                return Err(TransferError::PartTransferFailed {
                    part_number,
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = Duration::from_millis(backoff_ms << (attempt - 1));
            tracing::warn!(
                part_number = part_number,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Part transfer failed, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                mode = wait_cancel(cancel_rx) => {
                    return Err(TransferError::Cancelled(mode));
                }
            }
        }
    }

    /// Drop any persisted session for a file and release server-side
    /// resources. Used by the explicit user discard action.
    pub async fn discard_file(&self, path: &Path) -> Result<(), TransferError> {
        let meta = FileMeta::from_path(path)?;
        let fingerprint = meta.fingerprint();
        if let Some(session) = self.store.get(&fingerprint)? {
            self.store.delete(&fingerprint)?;
            if let Err(e) = self.service.abort(&session.asset_id).await {
                tracing::warn!(asset_id = %session.asset_id, error = %e, "Remote abort failed");
            }
        }
        Ok(())
    }
}

fn guess_content_type(file_name: &str) -> &'static str {
    match file_name.rsplit('.').next() {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

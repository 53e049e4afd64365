//! Mizuchi Transfr Library
//!
//! Resumable chunked multipart upload client with durable session
//! persistence.
//!
//! # Features
//!
//! - **Resumable**: progress survives restarts, crashes and network drops
//! - **Chunked**: deterministic partition of the file into numbered parts
//! - **Concurrent**: bounded worker pool with exactly-once part dispatch
//! - **Durable**: per-part persistence keyed by a file fingerprint
//! - **Cancellable**: cooperative pause (keep session) or discard (drop it)
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_transfr::config::Config;
//! use mizuchi_transfr::service::HttpUploadService;
//! use mizuchi_transfr::store::SessionStore;
//! use mizuchi_transfr::transfer::TransferCoordinator;
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let service = HttpUploadService::new(
//!         &config.service.endpoint,
//!         Duration::from_secs(config.service.timeout_seconds),
//!     )?;
//!     let store = SessionStore::open(config.store.path_buf())?;
//!     let coordinator = TransferCoordinator::new(Arc::new(service), store, config.transfer);
//!     let asset_id = coordinator.start(Path::new("video.mp4")).await?;
//!     println!("uploaded as {asset_id}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod plan;
pub mod service;
pub mod session;
pub mod store;
pub mod transfer;

// Re-export commonly used types
pub use config::Config;
pub use transfer::TransferCoordinator;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

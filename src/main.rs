//! Mizuchi Transfr - Resumable chunked multipart upload client
//!
//! Uploads large media files through a remote multipart session service,
//! persisting progress so interrupted transfers resume where they left off.

use clap::{Parser, Subcommand};
use mizuchi_transfr::config::Config;
use mizuchi_transfr::service::HttpUploadService;
use mizuchi_transfr::store::SessionStore;
use mizuchi_transfr::transfer::{CancelMode, TransferCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Mizuchi Transfr - Resumable multipart upload client
#[derive(Parser, Debug)]
#[command(name = "mizuchi-transfr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file, resuming a previous attempt if one is persisted
    Upload {
        /// File to upload
        file: PathBuf,
    },
    /// Inspect and maintain persisted upload sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsCommand {
    /// List persisted sessions
    List,
    /// Remove sessions untouched beyond the retention window
    Prune,
    /// Drop the persisted session for a file and abort it remotely
    Discard {
        /// File whose session should be discarded
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Mizuchi Transfr v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load(&args.config)?;
    info!("Loaded configuration from {:?}", args.config);

    let store = SessionStore::open(config.store.path_buf())?;

    match args.command {
        Command::Upload { file } => {
            let coordinator = Arc::new(coordinator(&config, store)?);

            // Ctrl-C pauses: the session stays on disk for a later resume
            let canceller = coordinator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, pausing transfer");
                    canceller.cancel(CancelMode::Pause);
                }
            });

            let mut progress = coordinator.progress();
            let reporter = tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let snapshot = *progress.borrow();
                    info!(
                        state = ?snapshot.state,
                        completed = snapshot.completed_parts,
                        total = snapshot.total_parts,
                        percent = format!("{:.0}", snapshot.percent()),
                        "Progress"
                    );
                }
            });

            let asset_id = coordinator.start(&file).await?;
            reporter.abort();
            println!("{asset_id}");
        }
        Command::Sessions { command } => match command {
            SessionsCommand::List => {
                for session in store.list_all()? {
                    println!(
                        "{}  {}  {}/{} parts  updated {}",
                        session.fingerprint,
                        session.file_name,
                        session.completed_parts.len(),
                        session.total_parts,
                        session.last_updated
                    );
                }
            }
            SessionsCommand::Prune => {
                let removed =
                    store.prune_older_than(chrono::Duration::days(config.store.retention_days))?;
                println!("Pruned {removed} session(s)");
            }
            SessionsCommand::Discard { file } => {
                let coordinator = coordinator(&config, store)?;
                coordinator.discard_file(&file).await?;
                println!("Discarded session for {}", file.display());
            }
        },
    }

    Ok(())
}

fn coordinator(config: &Config, store: SessionStore) -> anyhow::Result<TransferCoordinator> {
    let service = HttpUploadService::new(
        &config.service.endpoint,
        Duration::from_secs(config.service.timeout_seconds),
    )?;
    Ok(TransferCoordinator::new(
        Arc::new(service),
        store,
        config.transfer.clone(),
    ))
}

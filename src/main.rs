use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use receipt_queue::history::{self, FileHistoryStore};
use receipt_queue::{
    AppConfig,
    HttpBackend,
    QueueEvent,
    QueueProcessor,
    StaticSession,
    UploadFile,
    UploadStatus,
    UploadStore,
};

/// Submit receipt images for analysis and wait for the results.
#[derive(Parser, Debug)]
#[command(author, version, about = "Receipt upload queue")]
struct Args {
    /// Config file, missing file means defaults
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Analysis API base url (overrides `endpoint`)
    #[arg(long)]
    endpoint: Option<String>,

    /// Bearer token (overrides `token`)
    #[arg(long)]
    token: Option<String>,

    /// Signed in user, scopes the local history (overrides `user_email`)
    #[arg(long)]
    email: Option<String>,

    /// Concurrent uploads, clamped to 1..=10
    #[arg(long)]
    concurrency: Option<usize>,

    /// Fetch and print the upload history before submitting
    #[arg(long)]
    history: bool,

    /// Images to submit
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // --- CLI overrides ---
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if args.token.is_some() {
        config.token = args.token;
    }
    if args.email.is_some() {
        config.user_email = args.email;
    }
    if let Some(concurrency) = args.concurrency {
        config.queue.concurrency = concurrency;
    }
    let queue_config = config.queue.clone().normalized();

    let session = Arc::new(StaticSession::new(config.token.clone(), config.user_email.clone()));
    let history_store = Arc::new(FileHistoryStore::new(&config.history_dir));
    if let Some(email) = &config.user_email {
        history::migrate_legacy_history(&*history_store, email)
            .await
            .context("migrating legacy history")?;
    }

    let backend = Arc::new(HttpBackend::new(&config.endpoint, session.clone()).context("building the http client")?);
    let store = Arc::new(
        UploadStore::open(backend.clone(), history_store, session, queue_config.history_page_size).await,
    );

    if args.history {
        let uploads = store.fetch_history().await;
        if let Some(err) = store.snapshot().history_error {
            println!("history unavailable ({}), showing cached entries", err);
        }
        for upload in &uploads {
            println!(
                "#{} {} {}/{} receipts, completed {}",
                upload.backend_job_id,
                upload.file_name,
                upload.statistics.successful,
                upload.statistics.total_detected,
                upload.completed_at.to_rfc3339(),
            );
        }
    }

    if args.files.is_empty() {
        return Ok(());
    }

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let file = UploadFile::from_path(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        files.push(file);
    }

    let mut events = store.subscribe();
    store.enqueue_many(files);

    let processor = QueueProcessor::new(store.clone(), backend, queue_config);
    processor.start();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(QueueEvent::StateChanged { upload_id, old_state, new_state }) if old_state != new_state => {
                    if let Some(entry) = store.entry(upload_id) {
                        match new_state {
                            UploadStatus::Error => println!(
                                "{}: {} ({})",
                                entry.file_name(),
                                new_state,
                                entry.error_message.as_deref().unwrap_or_default(),
                            ),
                            _ => println!("{}: {} -> {}", entry.file_name(), old_state, new_state),
                        }
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::debug!("Skipped {} queue events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted");
                break;
            }
        }

        let state = store.snapshot();
        if state.uploads.iter().all(|entry| entry.is_terminal()) {
            let succeeded = state.count_by_status(UploadStatus::Success);
            println!("{} of {} uploads succeeded", succeeded, state.uploads.len());
            break;
        }
    }

    processor.stop().await;
    Ok(())
}

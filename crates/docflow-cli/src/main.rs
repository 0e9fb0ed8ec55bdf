//! Docflow CLI: drive the ingestion core from the command line.
//!
//! Reads configuration from the environment (and `.env`). Output is one JSON
//! object per line on stdout; logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use docflow_cli::{json_line, source_file};
use docflow_core::models::{Destination, SyncScope, TaskStatus, WebhookConfig};
use docflow_core::Config;
use docflow_db::{InMemoryRecordStore, InMemoryWebhookResolver};
use docflow_processing::DocumentValidator;
use docflow_services::{init_telemetry, Collaborators, Orchestrator, SyncEvent};
use docflow_storage::create_storage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "docflow", about = "Document ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files, record them and hand them to the processing endpoint
    Submit {
        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Tenant that owns the files
        #[arg(long, env = "DOCFLOW_TENANT_ID")]
        tenant: Uuid,
        /// Target collection
        #[arg(long)]
        collection: Uuid,
        /// Processing feature to dispatch to (defaults to DISPATCH_FEATURE)
        #[arg(long)]
        feature: Option<String>,
        /// Processing endpoint; without it files are stored but not processed
        #[arg(long)]
        webhook_url: Option<String>,
        /// Secret used to sign dispatch requests
        #[arg(long, env = "DOCFLOW_WEBHOOK_SECRET")]
        signing_secret: Option<String>,
    },
    /// Print a time-limited retrieval URL for a stored object
    SignUrl {
        /// Storage key, e.g. documents/{tenant}/{collection}/{file}/{name}
        key: String,
        /// Lifetime of the URL in seconds
        #[arg(long, default_value = "3600")]
        ttl_secs: u64,
    },
    /// Check files against the upload rules without uploading them
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn emit(kind: &str, value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", json_line(kind, value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry("docflow=info")?;

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Submit {
            files,
            tenant,
            collection,
            feature,
            webhook_url,
            signing_secret,
        } => {
            let feature = feature.unwrap_or_else(|| config.dispatch.feature.clone());
            let destination = Destination::new(tenant, collection, feature);
            submit(&config, files, destination, webhook_url, signing_secret).await
        }
        Commands::SignUrl { key, ttl_secs } => sign_url(&config, &key, ttl_secs).await,
        Commands::Validate { files } => validate(&config, files).await,
    }
}

async fn submit(
    config: &Config,
    paths: Vec<PathBuf>,
    destination: Destination,
    webhook_url: Option<String>,
    signing_secret: Option<String>,
) -> anyhow::Result<()> {
    let storage = create_storage(&config.storage)
        .await
        .context("Failed to initialize storage")?;
    let records = Arc::new(InMemoryRecordStore::new());
    let webhooks = Arc::new(InMemoryWebhookResolver::new());
    if let Some(url) = webhook_url {
        let mut endpoint = WebhookConfig::new(destination.tenant_id, destination.feature.clone(), url);
        endpoint.signing_secret = signing_secret;
        webhooks.upsert(endpoint);
    }

    let orchestrator = Orchestrator::build(
        config,
        Collaborators {
            storage,
            records: records.clone(),
            feed: records,
            resolver: webhooks,
        },
    )?;

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        files.push(source_file(path).await?);
    }

    let mut sync = orchestrator.subscribe(SyncScope::collection(
        destination.tenant_id,
        destination.collection_id,
    ));
    let mut progress = orchestrator.progress_events();
    let handles = orchestrator.submit_batch(files, destination)?;
    for handle in &handles {
        emit("task", handle)?;
    }

    let idle = orchestrator.wait_idle();
    tokio::pin!(idle);
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = &mut idle => break,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::warn!("Interrupted, cancelling remaining tasks");
                for handle in &handles {
                    if let Err(e) = orchestrator.cancel_task(handle.id) {
                        tracing::debug!(task_id = %handle.id, error = %e, "Task not cancelled");
                    }
                }
            }
            event = progress.recv() => match event {
                Ok(event) => emit("progress", &event)?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Progress output fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            Some(event) = sync.next_event() => match event {
                SyncEvent::Update(update) => emit("record", &update)?,
                SyncEvent::Connectivity(event) => emit("connectivity", &event)?,
            },
        }
    }

    while let Ok(event) = progress.try_recv() {
        emit("progress", &event)?;
    }
    // Let the last record changes reach the synchronizer.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Some(update) = sync.try_next_update() {
        emit("record", &update)?;
    }

    let state = orchestrator.current_state();
    for task in &state {
        emit("result", task)?;
    }
    orchestrator.discard_finished();
    orchestrator.unsubscribe(sync).await;
    orchestrator.shutdown().await;

    let failed = state
        .iter()
        .filter(|task| task.status != TaskStatus::Succeeded)
        .count();
    if failed > 0 {
        anyhow::bail!("{} of {} file(s) did not complete", failed, state.len());
    }
    Ok(())
}

async fn sign_url(config: &Config, key: &str, ttl_secs: u64) -> anyhow::Result<()> {
    let storage = create_storage(&config.storage)
        .await
        .context("Failed to initialize storage")?;
    let signed = storage
        .signed_url(key, Duration::from_secs(ttl_secs))
        .await
        .with_context(|| format!("Failed to sign URL for {}", key))?;
    emit(
        "signed_url",
        &serde_json::json!({ "url": signed.url, "expires_at": signed.expires_at }),
    )
}

async fn validate(config: &Config, paths: Vec<PathBuf>) -> anyhow::Result<()> {
    let validator = DocumentValidator::from_config(&config.upload);
    let mut rejected = 0;
    for path in &paths {
        let file = source_file(path).await?;
        match validator.validate_source(&file) {
            Ok(accepted) => emit("accepted", &accepted)?,
            Err(e) => {
                rejected += 1;
                emit(
                    "rejected",
                    &serde_json::json!({ "file": path.display().to_string(), "reason": e.to_string() }),
                )?;
            }
        }
    }
    if rejected > 0 {
        anyhow::bail!("{} of {} file(s) rejected", rejected, paths.len());
    }
    Ok(())
}

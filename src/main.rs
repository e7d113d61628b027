use anyhow::{Context, Result, bail};
use axum::Router;
use document_cleanser::{
    config::{AppConfig, Command, LogFormat, StoreBackend},
    handlers::AppState,
    routes,
    services::{
        poller::{Poller, SqsDeadLetterQueue, SqsQueue},
        processor::Processor,
        s3_store::{S3Store, load_sdk_config},
        storage_service::{LocalStore, ObjectStore},
    },
};
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    // Logs go to stderr; stdout carries command output such as `policy`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cfg.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }

    cfg.policy
        .validate()
        .context("invalid delivery policy settings")?;
    tracing::info!(?command, "Starting document-cleanser with config: {:?}", cfg);

    match command {
        Command::Policy => {
            println!("{}", cfg.policy_document()?);
            Ok(())
        }
        Command::Migrate => {
            let store = open_local_store(&cfg).await?;
            store.migrate().await?;
            tracing::info!("Database migration complete.");
            Ok(())
        }
        Command::Serve => serve(&cfg).await,
        Command::Poll => poll(&cfg).await,
    }
}

async fn serve(cfg: &AppConfig) -> Result<()> {
    let processor = Arc::new(build_processor(cfg).await?);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState::new(processor));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn poll(cfg: &AppConfig) -> Result<()> {
    let Some(queue_url) = cfg.queue_url.clone() else {
        bail!("the poll command needs DOCUMENT_CLEANSER_QUEUE_URL (or --queue-url)");
    };

    let sdk_config = load_sdk_config(cfg.region.as_deref(), cfg.endpoint_url.as_deref()).await;
    let queue = Arc::new(SqsQueue::new(&sdk_config, queue_url));
    let processor = Arc::new(build_processor(cfg).await?);

    Poller::new(queue, processor).run(shutdown_signal()).await;
    Ok(())
}

async fn build_processor(cfg: &AppConfig) -> Result<Processor> {
    let processor = Processor::new(build_store(cfg).await?, cfg.processor_config());
    let Some(dead_letter_url) = cfg.dead_letter_url.clone() else {
        tracing::warn!("No dead-letter queue configured; rejected messages will be dropped");
        return Ok(processor);
    };

    let sdk_config = load_sdk_config(cfg.region.as_deref(), cfg.endpoint_url.as_deref()).await;
    tracing::info!(%dead_letter_url, "Forwarding rejected messages to the dead-letter queue");
    Ok(processor.with_dead_letter_queue(Arc::new(SqsDeadLetterQueue::new(
        &sdk_config,
        dead_letter_url,
    ))))
}

async fn build_store(cfg: &AppConfig) -> Result<Arc<dyn ObjectStore>> {
    match cfg.store {
        StoreBackend::S3 => {
            let sdk_config =
                load_sdk_config(cfg.region.as_deref(), cfg.endpoint_url.as_deref()).await;
            tracing::info!(
                region = ?sdk_config.region(),
                sse_kms = cfg.kms_key_id.is_some(),
                "Using S3 object store"
            );
            Ok(Arc::new(S3Store::new(
                &sdk_config,
                cfg.kms_key_id.clone(),
                cfg.bucket.clone(),
            )))
        }
        StoreBackend::Local => {
            let store = open_local_store(cfg).await?;
            store.migrate().await?;
            if let Some(bucket) = cfg.bucket.as_deref() {
                store.ensure_bucket(bucket).await?;
            }
            tracing::info!(storage_dir = %cfg.storage_dir, "Using local object store");
            Ok(Arc::new(store))
        }
    }
}

async fn open_local_store(cfg: &AppConfig) -> Result<LocalStore> {
    // Extract the local file path SQLx will use
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    LocalStore::open(&cfg.storage_dir, &cfg.database_url)
        .await
        .with_context(|| format!("opening local store at {}", cfg.database_url))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

//! Server binary for vision-epub.
//!
//! A thin shim over the library crate: parse flags, load `VPPE_*` settings,
//! restore persisted jobs, start the cleanup task, and serve the API.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vision_epub::{
    cleanup, router, AppState, EventHub, JobRegistry, OllamaClient, PdfiumRenderer, Pipeline,
    Settings,
};

#[derive(Parser, Debug)]
#[command(name = "vision-epub", about = "Scanned-PDF to EPUB conversion service")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// Override VPPE_DATA_DIR.
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_env();
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }
    let settings = Arc::new(settings);

    tokio::fs::create_dir_all(settings.data_dir.join("jobs"))
        .await
        .with_context(|| format!("Cannot create data dir {}", settings.data_dir.display()))?;

    let registry = Arc::new(JobRegistry::new(settings.data_dir.clone()));
    let loaded = registry.load_from_disk().await;
    info!("Restored {loaded} jobs from {}", settings.data_dir.display());

    let hub = Arc::new(EventHub::new(settings.sse_ring_buffer_size));
    let shutdown = CancellationToken::new();

    let pipeline = Arc::new(Pipeline {
        settings: Arc::clone(&settings),
        registry: Arc::clone(&registry),
        renderer: Arc::new(PdfiumRenderer::new()),
        ocr: Arc::new(OllamaClient::new(&settings).context("Cannot build OCR client")?),
        cancel: shutdown.clone(),
    });

    tokio::spawn(cleanup::cleanup_loop(
        Arc::clone(&settings),
        Arc::clone(&registry),
        Arc::clone(&hub),
        shutdown.clone(),
    ));

    let app = router(Arc::new(AppState { pipeline, hub }));
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Cannot bind {}", args.bind))?;
    info!(
        "vision-epub listening on {} (model {} at {})",
        args.bind, settings.ollama_model, settings.ollama_base_url
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    shutdown.cancel();
    Ok(())
}

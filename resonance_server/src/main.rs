use anyhow::Context;
use brain_core::config::{parameters_path_from_env, PipelineOptions};
use brain_core::param_registry::ParamRegistry;
use brain_core::pipeline::PatchPipeline;
use brain_core::providers::ProviderSet;
use brain_core::render::ConverterRenderer;
use brain_core::storage::{FsPresetStore, HttpPresetStore};
use clap::Parser;
use resonance_server::{router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "resonance_server", version)]
struct Args {
    #[arg(long, env = "RESONANCE_BIND", default_value = "127.0.0.1:8000")]
    bind: String,

    /// Serve presets from a local directory instead of STORAGE_URL.
    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// Parameter list file (overrides RESONANCE_PARAMETERS_PATH and the built-in list).
    #[arg(long, value_name = "PATH")]
    parameters: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let params_path = args.parameters.clone().or_else(parameters_path_from_env);
    let registry = ParamRegistry::load(params_path.as_deref())
        .context("failed to load parameter registry")?;
    info!(parameters = registry.len(), "parameter registry loaded");

    let options = PipelineOptions::from_env()?;
    let providers = ProviderSet::from_env()?;
    info!(default_provider = providers.default_name(), "LLM providers configured");

    let mut pipeline = PatchPipeline::new(Arc::new(registry), providers).with_options(options);

    if let Some(dir) = args.store_dir.clone() {
        info!("preset store: {}", dir.display());
        pipeline = pipeline.with_store(Arc::new(FsPresetStore::new(dir)));
    } else if let Some(store) = HttpPresetStore::from_env()? {
        info!("preset store: object storage");
        pipeline = pipeline.with_store(Arc::new(store));
    } else {
        info!("no preset store configured; preset_id requests will be rejected");
    }

    match ConverterRenderer::from_env()? {
        Some(renderer) => {
            info!("preview rendering via converter service");
            pipeline = pipeline.with_renderer(Arc::new(renderer));
        }
        None => info!("RENDER_URL unset; previews disabled"),
    }

    let app = router(AppState::new(pipeline));

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind to {}", args.bind))?;
    info!("listening on http://{}", args.bind);
    info!("   POST /api/generate");
    info!("   POST /api/generate/stream (SSE)");
    info!("   GET  /api/llm/health?provider=");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = terminate() => {
            info!("received SIGTERM, shutting down");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

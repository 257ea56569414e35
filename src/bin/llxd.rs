//! llxd - the resident model daemon behind `llx`.

use anyhow::{Context, Result};
use clap::Parser;
use llx::client::fetch::{HttpFetcher, ModelFetcher, ModelSpec};
use llx::config::{Config, EngineConfig, Paths, SOCKET_PATH};
use llx::daemon::engine::{ContextParams, ModelEngine};
use llx::daemon::prompts::HostContext;
use llx::daemon::{Daemon, DaemonConfig};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llxd")]
#[command(version, about = "Resident model daemon for llx")]
struct Args {
    /// Model file to load (default: the configured model in the cache)
    #[arg(short = 'm', long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'd', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("llx={level},llxd={level},reqwest=warn"))
        }))
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    info!("Starting llxd {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("Failed to load configuration")?;
    let model_path = match args.model {
        Some(path) => path,
        None => cached_model(&config).await?,
    };
    if !model_path.exists() {
        anyhow::bail!("Model file not found: {}", model_path.display());
    }

    let engine = load_engine(&model_path, &config.engine)?;
    info!("Loaded {}", engine.describe());

    let host = HostContext::gather();
    info!(os = %host.os, shell = %host.shell, "Host context");

    let daemon_config = DaemonConfig::new(SOCKET_PATH)
        .with_context(ContextParams::from(&config.engine))
        .with_system_prompt(host.system_prompt());
    let mut handle = Daemon::start(daemon_config, engine)?;

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let signalled = tokio::select! {
        _ = handle.wait() => None,
        _ = tokio::signal::ctrl_c() => Some("SIGINT"),
        _ = sigterm.recv() => Some("SIGTERM"),
    };

    if let Some(name) = signalled {
        info!("Received {}, shutting down", name);
        handle.shutdown();
        handle.wait().await;
    }

    info!("Cleanup complete, exiting");
    Ok(())
}

/// The configured model in the cache, downloaded first if it is missing.
async fn cached_model(config: &Config) -> Result<PathBuf> {
    let paths = Paths::discover();
    let spec = ModelSpec::resolve(&config.model.id);
    let path = spec.path_in(paths.cache_dir());
    if !path.exists() {
        HttpFetcher::new()
            .fetch(&spec, &path)
            .await
            .with_context(|| format!("Failed to fetch model '{}'", spec.id))?;
    }
    Ok(path)
}

#[cfg(feature = "llama")]
fn load_engine(path: &Path, config: &EngineConfig) -> Result<Box<dyn ModelEngine>> {
    let engine = llx::daemon::engine::llama::LlamaEngine::load(path, config.gpu_layers)
        .with_context(|| format!("Failed to load model {}", path.display()))?;
    Ok(Box::new(engine))
}

#[cfg(not(feature = "llama"))]
fn load_engine(path: &Path, _config: &EngineConfig) -> Result<Box<dyn ModelEngine>> {
    anyhow::bail!(
        "Cannot load {}: no model engine compiled in (rebuild with --features llama)",
        path.display()
    )
}

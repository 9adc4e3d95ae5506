use anyhow::{Context, Result};
use clap::Parser;
use orchestrator::api::{router, ServerState};
use orchestrator::cache::ModelCache;
use orchestrator::config::{OrchestratorConfig, TransportKind};
use orchestrator::core::{DeviceDiscovery, NvidiaSmiDiscovery};
use orchestrator::metrics::{LiveMetricsSource, MetricsSource};
use orchestrator::pool::{HttpTransportFactory, StdioTransportFactory, WorkerPoolManager, WorkerTransportFactory};
use orchestrator::session::SessionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "orchestratord", about = "GPU worker pool orchestrator")]
struct Cli {
    /// Bind address override, e.g. 0.0.0.0:8080
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = OrchestratorConfig::load().unwrap_or_else(|e| {
        eprintln!("warning: failed to load config, falling back to defaults: {e}");
        OrchestratorConfig::default()
    });

    orchestrator::init_tracing(&config.log_level, &config.log_format)
        .context("failed to initialize tracing subscriber")?;
    info!("starting orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let cache = Arc::new(ModelCache::new(
        config.cache.budget_bytes,
        config.cache.idle_eviction_secs,
    ));
    let pool = Arc::new(WorkerPoolManager::new(
        cache.clone(),
        config.session.default_concurrency_per_worker,
    ));

    let discovery = NvidiaSmiDiscovery;
    let factory: Box<dyn WorkerTransportFactory> = match config.worker.transport {
        TransportKind::Stdio => Box::new(StdioTransportFactory {
            interpreter_path: config.worker.interpreter_path.clone(),
            script_path: config.worker.script_path.clone(),
        }),
        TransportKind::Http => Box::new(HttpTransportFactory {
            base_url: config
                .worker
                .http_base_url
                .clone()
                .expect("validated at config load: http transport requires http_base_url"),
        }),
    };

    if let Err(e) = pool.initialize(&discovery, factory.as_ref()).await {
        warn!("pool initialization failed, starting with an empty worker map: {e}");
    }

    let sessions = Arc::new(SessionManager::new(pool.clone(), cache.clone(), config.ipc.clone()));
    let metrics: Arc<dyn MetricsSource> = Arc::new(LiveMetricsSource::new());

    spawn_cache_janitor(cache.clone());

    let state = Arc::new(ServerState { pool, cache, sessions, metrics });
    let app = router(state);

    let bind = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.bind_address, config.server.port).parse().unwrap());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("listening on http://{bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shut down gracefully");
    Ok(())
}

/// Runs the cache's idle-eviction sweep on a fixed interval for the life of
/// the process (spec §4.2 cleanup).
fn spawn_cache_janitor(cache: Arc<ModelCache>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            let evicted = cache.cleanup().await;
            if !evicted.is_empty() {
                info!("idle cache sweep evicted {} entries", evicted.len());
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

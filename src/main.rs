use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use windgate::config::{LogFormat, StoreBackend, WindgateConfig};
use windgate::http::HttpServer;
use windgate::ratelimit::{InMemoryStore, MonotonicClock, RateLimiter, RedisStore, WindowStore};

/// Rate limited HTTP demo server.
#[derive(Debug, Parser)]
#[command(name = "windgate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_parser = ["text", "json"])]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = WindgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.listen {
        config.server.http_addr = addr;
    }
    match args.log_format.as_deref() {
        Some("json") => config.server.log_format = LogFormat::Json,
        Some("text") => config.server.log_format = LogFormat::Text,
        _ => {}
    }

    init_tracing(config.server.log_format);

    info!("Starting Windgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        max_requests = config.rate_limiting.max_requests,
        window_secs = config.rate_limiting.window_secs,
        failure_policy = %config.rate_limiting.failure_policy,
        algorithm = %config.rate_limiting.algorithm,
        "Configuration loaded"
    );

    let clock = Arc::new(MonotonicClock::new());
    let store: Arc<dyn WindowStore> = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(InMemoryStore::with_grace(config.store.grace()));
            let _sweeper = store
                .clone()
                .spawn_sweeper(clock.clone(), config.store.sweep_interval());
            store
        }
        StoreBackend::Redis => {
            let url = config.store.redis_url.as_deref().unwrap_or_default();
            let prefix = config.store.key_prefix.clone();
            let grace = config.store.grace();
            let store = match RedisStore::connect(url, prefix.clone(), grace).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(error = %e, "Redis unreachable at startup, will connect on first use");
                    RedisStore::lazy(url, prefix, grace)?
                }
            };
            Arc::new(store)
        }
    };
    info!(store = store.name(), "Window store initialized");

    let limiter = Arc::new(RateLimiter::with_clock(config.limiter_config()?, store, clock));
    let server = HttpServer::new(config.server.http_addr, limiter, config.key_extractor())
        .with_exempt_paths(config.rate_limiting.exempt_paths.clone());

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Windgate stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

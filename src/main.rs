use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use formguard::config::FormguardConfig;
use formguard::http::{AppState, HttpServer};
use formguard::identity::StaticDirectory;
use formguard::ratelimit::{
    FallbackStore, LocalWindowStore, RateLimiter, Reclaimer, RedisWindowStore, WindowStore,
};

/// Tiered rate limiting for form submissions and the API.
#[derive(Debug, Parser)]
#[command(name = "formguard", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// HTTP listen address, overriding the configuration
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Redis URL for shared counters, overriding the configuration
    #[arg(long, value_name = "URL")]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Formguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FormguardConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(redis_url) = cli.redis_url {
        config.rate_limiting.redis_url = Some(redis_url);
    }
    info!(
        listen_addr = %config.server.listen_addr,
        instance_id = %config.server.instance_id,
        "Configuration loaded"
    );

    // A missing quota row stops startup here, never at request time
    let rl = &config.rate_limiting;
    let quotas = rl.quota_table()?;

    let local = Arc::new(LocalWindowStore::with_max_entries(rl.local_max_entries));
    let store: Arc<dyn WindowStore> = match rl.redis_url.as_deref() {
        Some(url) => {
            let redis = RedisWindowStore::with_options(url, &rl.redis_key_prefix, rl.redis_timeout())?;
            info!(prefix = %rl.redis_key_prefix, "Counting in redis with local fallback");
            Arc::new(FallbackStore::with_retry_after(
                Arc::new(redis),
                local.clone(),
                rl.redis_retry_after(),
            ))
        }
        None => {
            warn!("No redis URL configured, limits are enforced per process");
            local.clone()
        }
    };

    let reclaimer = Reclaimer::new(local, store.clone(), rl.sweep_probability);
    let sweeper = reclaimer.spawn_periodic(rl.sweep_interval());

    let rate_limiter = Arc::new(RateLimiter::new(quotas, store, reclaimer));
    info!("Rate limiter initialized");

    let state = AppState {
        limiter: rate_limiter,
        directory: Arc::new(StaticDirectory::new(&config.accounts)),
        admin_token: config.server.admin_token.clone(),
    };
    let server = HttpServer::new(config.server.listen_addr, state);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.abort();
    info!("Formguard stopped");
    Ok(())
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

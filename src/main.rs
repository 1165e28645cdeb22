use loadgate::config::{Config, LogConfig};
use loadgate::dispatcher::Dispatcher;
use loadgate::forwarder::{Forwarder, ForwarderConfig};
use loadgate::healthcheck::{HealthCheckConfig, HealthChecker};
use loadgate::hybrid::{HybridConfig, HybridRateLimiter};
use loadgate::pool::BackendPool;
use loadgate::proxy::ProxyServer;
use loadgate::ratelimit::{MemoryRateLimiter, RateLimitService, RateLimiter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Hard ceiling on the whole shutdown sequence
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);
/// Sub-deadline for the health checker to finish its outstanding probes
const HEALTH_STOP_DEADLINE: Duration = Duration::from_secs(4);
/// Sub-deadline for the listener to drain in-flight requests
const LISTENER_STOP_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let config = Config::load(&config_path)?;

    init_tracing(&config.log);
    info!(path = %config_path.display(), "configuration loaded");

    let strategy = config.strategy()?;
    let pool = Arc::new(BackendPool::new(&config.backends, strategy)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The memory limiter always backs the admin API; the hybrid variant
    // replaces it when rate limiting is on and STORAGE_TYPE selects it
    let storage_type = std::env::var("STORAGE_TYPE").unwrap_or_default();
    let limiter: Arc<dyn RateLimiter> = if config.rate_limit.enabled && storage_type == "hybrid" {
        let hybrid_config = HybridConfig::from_env()?;
        Arc::new(HybridRateLimiter::connect(&hybrid_config).await?)
    } else {
        Arc::new(MemoryRateLimiter::new())
    };
    let ratelimit_service = Arc::new(RateLimitService::new(Arc::clone(&limiter)));

    let forwarder = Forwarder::new(ForwarderConfig::default());
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&pool), forwarder));

    // Start the health checker (if enabled)
    let health_handle = if config.health_check.enabled {
        let checker = HealthChecker::new(
            Arc::clone(&pool),
            HealthCheckConfig {
                interval: config.health_check.interval,
                timeout: config.health_check.timeout,
                path: config.health_check.path.clone(),
            },
            shutdown_rx.clone(),
        );
        Some(tokio::spawn(checker.run()))
    } else {
        info!("health checking disabled");
        None
    };

    // Start the proxy server
    let listen_addr = config.listen_addr()?;
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", listen_addr, e))?;

    let enforce_rate_limit = config.rate_limit.enabled && config.rate_limit.middleware;
    info!(
        addr = %listen_addr,
        strategy = strategy.as_str(),
        backend_count = config.backends.len(),
        rate_limit = enforce_rate_limit,
        "starting load balancer"
    );

    let server = ProxyServer::new(
        listen_addr,
        dispatcher,
        Arc::clone(&limiter),
        Arc::clone(&ratelimit_service),
        enforce_rate_limit,
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = server.run(listener).await {
            error!(error = %e, "proxy server error");
        }
    });

    // Wait for a termination signal
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down");
    }

    // Signal every component, then wait with nested deadlines: each
    // component gets its own budget inside the overall ceiling
    let _ = shutdown_tx.send(true);

    let shutdown_result = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        let stop_health = async {
            if let Some(handle) = health_handle {
                if tokio::time::timeout(HEALTH_STOP_DEADLINE, handle).await.is_err() {
                    warn!("timed out waiting for health checker to stop");
                }
            }
        };

        let stop_listener = async {
            if tokio::time::timeout(LISTENER_STOP_DEADLINE, proxy_handle)
                .await
                .is_err()
            {
                warn!("timed out draining in-flight requests, closing forcibly");
            }
        };

        let stop_limiter = limiter.stop();

        tokio::join!(stop_health, stop_listener, stop_limiter);
    })
    .await;

    match shutdown_result {
        Ok(()) => info!("all components stopped"),
        Err(_) => error!("shutdown deadline exceeded"),
    }

    info!("application stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("loadgate={}", log.level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

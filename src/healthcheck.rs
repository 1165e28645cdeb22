//! Active health checking for pool backends
//!
//! Periodically probes every backend with an HTTP GET and updates the pool's
//! liveness flags. A round fans out one probe per backend, joins them all,
//! and never overlaps with the next round.

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header::USER_AGENT;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::pool::{Backend, BackendPool};

const HEALTH_CHECK_USER_AGENT: &str = "LoadBalancer-HealthChecker/1.0";

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between check rounds
    pub interval: Duration,
    /// Timeout for each individual probe
    pub timeout: Duration,
    /// Path probed on each backend, appended to the backend URL
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(3),
            path: String::new(),
        }
    }
}

/// Health checker that monitors the backend pool
pub struct HealthChecker {
    pool: Arc<BackendPool>,
    client: Client<HttpConnector, Empty<Bytes>>,
    config: HealthCheckConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthChecker {
    pub fn new(
        pool: Arc<BackendPool>,
        config: HealthCheckConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        // Probes are short-lived and infrequent; no keep-alive
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(HttpConnector::new());

        Self {
            pool,
            client,
            config,
            shutdown_rx,
        }
    }

    /// Run the health checker until shutdown is signalled.
    /// The first round runs immediately; each later round starts one
    /// interval after the previous round completed.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "health checker started"
        );

        self.check_all().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    self.check_all().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every backend concurrently and mark the results.
    /// All probes of a round complete before the round ends.
    async fn check_all(&self) {
        let backends = self.pool.list();
        debug!(backend_count = backends.len(), "starting health check round");

        let probes = backends.iter().map(|backend| self.probe(backend));
        let results = futures::future::join_all(probes).await;

        for (backend, alive) in backends.iter().zip(results) {
            self.pool.mark(backend.url_str(), alive);
        }

        debug!("health check round complete");
    }

    /// Probe one backend. Any error, timeout or non-2xx status is dead.
    async fn probe(&self, backend: &Backend) -> bool {
        let url = format!(
            "{}{}",
            backend.url_str().trim_end_matches('/'),
            self.config.path
        );

        let request = match Request::builder()
            .method("GET")
            .uri(&url)
            .header(USER_AGENT, HEALTH_CHECK_USER_AGENT)
            .body(Empty::<Bytes>::new())
        {
            Ok(request) => request,
            Err(e) => {
                warn!(url, error = %e, "failed to build health check request");
                return false;
            }
        };

        match tokio::time::timeout(self.config.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let healthy = response.status().is_success();
                if healthy {
                    debug!(url, "health check passed");
                } else {
                    debug!(url, status = response.status().as_u16(), "health check failed (status)");
                }
                healthy
            }
            Ok(Err(e)) => {
                debug!(url, error = %e, "health check failed (connection error)");
                false
            }
            Err(_) => {
                debug!(url, "health check failed (timeout)");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.interval, Duration::from_secs(15));
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.path, "");
    }
}

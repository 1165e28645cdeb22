//! Backend pool: registration, liveness and selection
//!
//! The pool owns a fixed set of backends created at startup. Liveness is an
//! atomic flag on each backend so selection never contends with the health
//! checker; only the strategy tag and the connection counters sit behind
//! locks.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hyper::Uri;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, info, warn};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Round-robin: distribute requests evenly in order
    #[default]
    RoundRobin,
    /// Least connections: select the backend with fewest active connections
    LeastConnections,
    /// Random: pick a healthy backend uniformly
    Random,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastConnections => "least-connections",
            Strategy::Random => "random",
        }
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Strategy::RoundRobin),
            "least-connections" => Ok(Strategy::LeastConnections),
            "random" => Ok(Strategy::Random),
            other => Err(anyhow::anyhow!("unsupported strategy: {}", other)),
        }
    }
}

/// A single upstream backend.
///
/// The URL is immutable for the lifetime of the process; only the liveness
/// flag mutates, and it does so atomically.
#[derive(Debug)]
pub struct Backend {
    url: Uri,
    url_str: String,
    alive: AtomicBool,
}

impl Backend {
    fn new(url: Uri) -> Self {
        // Canonical form: scheme://authority/path, so "http://host" and
        // "http://host/" key the same backend
        let path = match url.path() {
            "" => "/",
            p => p,
        };
        let url_str = format!(
            "{}://{}{}",
            url.scheme_str().unwrap_or("http"),
            url.authority().map(|a| a.as_str()).unwrap_or(""),
            path
        );
        Self {
            url,
            url_str,
            alive: AtomicBool::new(true),
        }
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// Canonical URL string, used as the key for marking and counters
    pub fn url_str(&self) -> &str {
        &self.url_str
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }
}

/// Pool of upstream backends with strategy-driven selection
pub struct BackendPool {
    /// Fixed after construction; order is the configured order
    backends: Vec<Arc<Backend>>,
    /// Round-robin cursor, increments without a lock
    cursor: AtomicU64,
    strategy: RwLock<Strategy>,
    /// Active connections per backend URL
    connections: Mutex<HashMap<String, usize>>,
}

impl BackendPool {
    /// Build a pool from configured backend URLs.
    /// URLs must be absolute http/https and unique.
    pub fn new(backend_urls: &[String], strategy: Strategy) -> anyhow::Result<Self> {
        if backend_urls.is_empty() {
            anyhow::bail!("backend list is empty");
        }

        let mut backends: Vec<Arc<Backend>> = Vec::with_capacity(backend_urls.len());
        for raw in backend_urls {
            let url: Uri = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid backend URL '{}': {}", raw, e))?;

            match url.scheme_str() {
                Some("http") | Some("https") => {}
                _ => anyhow::bail!("backend URL '{}' must use http or https", raw),
            }
            if url.authority().is_none() {
                anyhow::bail!("backend URL '{}' has no host", raw);
            }

            let backend = Arc::new(Backend::new(url));
            if backends.iter().any(|b| b.url_str() == backend.url_str()) {
                anyhow::bail!("duplicate backend URL: {}", raw);
            }
            debug!(url = %backend.url_str(), "added backend to pool");
            backends.push(backend);
        }

        info!(
            backend_count = backends.len(),
            strategy = strategy.as_str(),
            "backend pool initialized"
        );

        Ok(Self {
            backends,
            cursor: AtomicU64::new(0),
            strategy: RwLock::new(strategy),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Snapshot of the registered backends, configured order preserved
    pub fn list(&self) -> Vec<Arc<Backend>> {
        self.backends.clone()
    }

    /// Update the liveness flag for the backend with the given URL.
    /// Logs only when the status actually changes; warns on unknown URLs.
    pub fn mark(&self, url: &str, alive: bool) {
        let mut found = false;
        for backend in &self.backends {
            if backend.url_str() == url {
                if backend.is_alive() != alive {
                    backend.set_alive(alive);
                    info!(url, alive, "backend status updated");
                }
                found = true;
            }
        }
        if !found {
            warn!(url, "attempted to update status of unknown backend");
        }
    }

    /// Switch the selection strategy
    pub fn set_strategy(&self, tag: &str) -> anyhow::Result<()> {
        let strategy: Strategy = tag.parse()?;
        *self.strategy.write() = strategy;
        info!(strategy = strategy.as_str(), "load balancing strategy changed");
        Ok(())
    }

    pub fn strategy(&self) -> Strategy {
        *self.strategy.read()
    }

    /// Select one healthy backend per the active strategy
    pub fn select(&self) -> Option<Arc<Backend>> {
        let strategy = self.strategy();
        let selected = match strategy {
            Strategy::RoundRobin => self.select_round_robin(),
            Strategy::LeastConnections => self.select_least_connections(),
            Strategy::Random => self.select_random(),
        };

        match &selected {
            Some(backend) => {
                debug!(
                    url = %backend.url_str(),
                    strategy = strategy.as_str(),
                    "selected backend"
                );
            }
            None => {
                warn!(strategy = strategy.as_str(), "no healthy backend found in pool");
            }
        }
        selected
    }

    fn select_round_robin(&self) -> Option<Arc<Backend>> {
        let count = self.backends.len() as u64;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        for i in 0..count {
            let idx = ((start + i) % count) as usize;
            let backend = &self.backends[idx];
            if backend.is_alive() {
                return Some(Arc::clone(backend));
            }
        }
        None
    }

    fn select_least_connections(&self) -> Option<Arc<Backend>> {
        let connections = self.connections.lock();
        let mut selected: Option<(&Arc<Backend>, usize)> = None;

        for backend in &self.backends {
            if !backend.is_alive() {
                continue;
            }
            let count = connections.get(backend.url_str()).copied().unwrap_or(0);
            // Strict comparison keeps the first configured backend on ties
            if selected.map_or(true, |(_, min)| count < min) {
                selected = Some((backend, count));
            }
        }

        selected.map(|(backend, _)| Arc::clone(backend))
    }

    fn select_random(&self) -> Option<Arc<Backend>> {
        let alive: Vec<&Arc<Backend>> = self.backends.iter().filter(|b| b.is_alive()).collect();
        if alive.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..alive.len());
        Some(Arc::clone(alive[idx]))
    }

    /// Increment the active connection count for a backend
    pub fn incr(&self, backend: &Backend) {
        let mut connections = self.connections.lock();
        *connections.entry(backend.url_str().to_string()).or_insert(0) += 1;
    }

    /// Decrement the active connection count for a backend, clamping at 0
    pub fn decr(&self, backend: &Backend) {
        let mut connections = self.connections.lock();
        if let Some(count) = connections.get_mut(backend.url_str()) {
            *count = count.saturating_sub(1);
        }
    }

    /// Current active connection count for a backend
    pub fn active(&self, backend: &Backend) -> usize {
        self.connections
            .lock()
            .get(backend.url_str())
            .copied()
            .unwrap_or(0)
    }
}

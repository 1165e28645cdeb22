//! Per-client rate limiting
//!
//! Clients are keyed by API key or IP. Each registered client has a token
//! bucket; unregistered clients are not limited. The in-memory limiter here
//! refills buckets from a background task; the durable variant lives in
//! [`crate::hybrid`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Rate limit settings for one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub client_id: String,
    pub capacity: i64,
    pub rate_per_second: i64,
}

impl RateLimitSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.client_id.is_empty() {
            anyhow::bail!("client_id must not be empty");
        }
        if self.capacity <= 0 {
            anyhow::bail!("capacity must be greater than 0");
        }
        if self.rate_per_second <= 0 {
            anyhow::bail!("rate_per_second must be greater than 0");
        }
        Ok(())
    }
}

/// Capability set every limiter implementation provides
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check whether the client may make a request, consuming one token.
    /// Unregistered clients are unlimited.
    async fn allow(&self, client_id: &str) -> bool;

    /// Install or replace the client's settings with a full bucket
    async fn set(&self, settings: &RateLimitSettings) -> anyhow::Result<()>;

    /// Remove the client's limit entirely
    async fn remove(&self, client_id: &str) -> anyhow::Result<()>;

    /// Stop background work and release resources
    async fn stop(&self);
}

/// Token bucket for one client
#[derive(Debug)]
struct TokenBucket {
    tokens: i64,
    capacity: i64,
    refill_rate: i64,
    last_refill: Instant,
}

struct ClientState {
    #[allow(dead_code)]
    settings: RateLimitSettings,
    bucket: Mutex<TokenBucket>,
}

/// In-memory rate limiter with a one-second background refill tick
pub struct MemoryRateLimiter {
    clients: Arc<RwLock<HashMap<String, ClientState>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl MemoryRateLimiter {
    /// Create the limiter and spawn its refill task.
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let clients: Arc<RwLock<HashMap<String, ClientState>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let refill_clients = Arc::clone(&clients);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        refill_all(&refill_clients);
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("rate limiter refill task stopping");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            clients,
            shutdown_tx,
        }
    }
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Refill every bucket: add floor(elapsed * rate) tokens, clamped to
/// capacity. The refill timestamp only advances when tokens were added so
/// sub-second fractions keep accumulating.
fn refill_all(clients: &RwLock<HashMap<String, ClientState>>) {
    let clients = clients.read();
    for (client_id, state) in clients.iter() {
        let mut bucket = state.bucket.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let tokens_to_add = (elapsed * bucket.refill_rate as f64).floor() as i64;

        if tokens_to_add > 0 {
            bucket.tokens = (bucket.tokens + tokens_to_add).min(bucket.capacity);
            bucket.last_refill = now;
            debug!(client = %client_id, tokens = bucket.tokens, "tokens refilled");
        }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, client_id: &str) -> bool {
        let clients = self.clients.read();
        let state = match clients.get(client_id) {
            Some(state) => state,
            None => return true,
        };

        let mut bucket = state.bucket.lock();
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            debug!(client = client_id, tokens_left = bucket.tokens, "token consumed");
            true
        } else {
            debug!(client = client_id, "rate limit exceeded");
            false
        }
    }

    async fn set(&self, settings: &RateLimitSettings) -> anyhow::Result<()> {
        let bucket = TokenBucket {
            tokens: settings.capacity,
            capacity: settings.capacity,
            refill_rate: settings.rate_per_second,
            last_refill: Instant::now(),
        };

        self.clients.write().insert(
            settings.client_id.clone(),
            ClientState {
                settings: settings.clone(),
                bucket: Mutex::new(bucket),
            },
        );

        info!(
            client = %settings.client_id,
            capacity = settings.capacity,
            rate = settings.rate_per_second,
            "rate limit set for client"
        );
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> anyhow::Result<()> {
        self.clients.write().remove(client_id);
        info!(client = client_id, "rate limit removed for client");
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("rate limiter stopped");
    }
}

/// Admin-facing registry over a limiter: validates settings, tracks the
/// clients registered during this process lifetime and delegates
/// enforcement state to the limiter.
pub struct RateLimitService {
    limiter: Arc<dyn RateLimiter>,
    settings: RwLock<HashMap<String, RateLimitSettings>>,
}

impl RateLimitService {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            settings: RwLock::new(HashMap::new()),
        }
    }

    /// Create or update a client's settings
    pub async fn create_or_update(&self, settings: RateLimitSettings) -> anyhow::Result<()> {
        settings.validate()?;
        self.limiter.set(&settings).await?;
        self.settings
            .write()
            .insert(settings.client_id.clone(), settings.clone());
        info!(client = %settings.client_id, "rate limit settings updated");
        Ok(())
    }

    /// Remove a client. Errors with "client not found" when unknown.
    pub async fn remove(&self, client_id: &str) -> anyhow::Result<()> {
        if self.settings.write().remove(client_id).is_none() {
            anyhow::bail!("client not found");
        }

        if let Err(e) = self.limiter.remove(client_id).await {
            warn!(client = client_id, error = %e, "failed to remove limit from backing store");
        }

        info!(client = client_id, "client removed");
        Ok(())
    }

    /// All registered clients, ordered by id
    pub fn list(&self) -> Vec<RateLimitSettings> {
        let mut clients: Vec<RateLimitSettings> = self.settings.read().values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(client_id: &str, capacity: i64, rate_per_second: i64) -> RateLimitSettings {
        RateLimitSettings {
            client_id: client_id.to_string(),
            capacity,
            rate_per_second,
        }
    }

    #[tokio::test]
    async fn test_unregistered_client_is_unlimited() {
        let limiter = MemoryRateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.allow("unknown").await);
        }
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_token_bucket_consumption_and_refill() {
        let limiter = MemoryRateLimiter::new();
        limiter.set(&settings("test-client", 5, 1)).await.unwrap();

        // Burst up to capacity
        for i in 0..5 {
            assert!(limiter.allow("test-client").await, "request {} should pass", i);
        }

        // Bucket exhausted
        assert!(!limiter.allow("test-client").await);

        // Wait for the refill tick to add tokens again
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(limiter.allow("test-client").await);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_tokens_never_exceed_capacity() {
        let limiter = MemoryRateLimiter::new();
        limiter.set(&settings("burst", 2, 100)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;

        // Despite the high rate, only capacity tokens are available
        assert!(limiter.allow("burst").await);
        assert!(limiter.allow("burst").await);
        assert!(!limiter.allow("burst").await);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_consumption_is_bounded() {
        let limiter = Arc::new(MemoryRateLimiter::new());
        limiter.set(&settings("concurrent", 50, 1)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let mut allowed = 0;
                for _ in 0..20 {
                    if limiter.allow("concurrent").await {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 50);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_set_replaces_bucket() {
        let limiter = MemoryRateLimiter::new();
        limiter.set(&settings("client", 1, 1)).await.unwrap();
        assert!(limiter.allow("client").await);
        assert!(!limiter.allow("client").await);

        // Re-registering refills the bucket
        limiter.set(&settings("client", 1, 1)).await.unwrap();
        assert!(limiter.allow("client").await);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_remove_makes_client_unlimited() {
        let limiter = MemoryRateLimiter::new();
        limiter.set(&settings("client", 1, 1)).await.unwrap();
        assert!(limiter.allow("client").await);
        assert!(!limiter.allow("client").await);

        limiter.remove("client").await.unwrap();
        assert!(limiter.allow("client").await);

        limiter.stop().await;
    }

    #[test]
    fn test_settings_validation() {
        assert!(settings("c", 10, 1).validate().is_ok());
        assert!(settings("", 10, 1).validate().is_err());
        assert!(settings("c", 0, 1).validate().is_err());
        assert!(settings("c", 10, 0).validate().is_err());
        assert!(settings("c", -1, 1).validate().is_err());
    }

    #[test]
    fn test_settings_json_field_names() {
        let json = serde_json::to_string(&settings("api_key1", 5, 2)).unwrap();
        assert!(json.contains("\"client_id\":\"api_key1\""));
        assert!(json.contains("\"capacity\":5"));
        assert!(json.contains("\"rate_per_second\":2"));
    }

    #[tokio::test]
    async fn test_service_round_trip() {
        let limiter: Arc<dyn RateLimiter> = Arc::new(MemoryRateLimiter::new());
        let service = RateLimitService::new(Arc::clone(&limiter));

        service
            .create_or_update(settings("alpha", 10, 2))
            .await
            .unwrap();
        service
            .create_or_update(settings("beta", 20, 4))
            .await
            .unwrap();

        let clients = service.list();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].client_id, "alpha");
        assert_eq!(clients[1], settings("beta", 20, 4));

        service.remove("alpha").await.unwrap();
        assert_eq!(service.list().len(), 1);

        let err = service.remove("alpha").await.unwrap_err();
        assert_eq!(err.to_string(), "client not found");

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_service_rejects_invalid_settings() {
        let limiter: Arc<dyn RateLimiter> = Arc::new(MemoryRateLimiter::new());
        let service = RateLimitService::new(Arc::clone(&limiter));

        assert!(service.create_or_update(settings("", 10, 1)).await.is_err());
        assert!(service.create_or_update(settings("c", 0, 1)).await.is_err());
        assert!(service.list().is_empty());

        limiter.stop().await;
    }
}

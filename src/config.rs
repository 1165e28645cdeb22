use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::pool::Strategy;

/// Global configuration for the load balancer
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address to listen on, e.g. ":8080" or "127.0.0.1:8080"
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Upstream backends as absolute URLs
    #[serde(default)]
    pub backends: Vec<String>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Active health checking configuration
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Load balancing configuration
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Log level: debug, info, warn or error (default: info)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or text (default: text)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Enable periodic health checks (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between check rounds (default: 15s)
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for each probe, should be below the interval (default: 3s)
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Path probed on each backend, appended to the backend URL (default: "")
    #[serde(default)]
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            path: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Enable the rate limiting subsystem (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Enforce rate limits on proxied traffic (default: false)
    #[serde(default)]
    pub middleware: bool,

    /// Default bucket capacity for new clients (default: 100)
    #[serde(default = "default_capacity")]
    pub default_capacity: i64,

    /// Default refill rate in tokens per second (default: 10)
    #[serde(default = "default_rate_per_second")]
    pub default_rate_per_second: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            middleware: false,
            default_capacity: default_capacity(),
            default_rate_per_second: default_rate_per_second(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// Selection strategy: round-robin, least-connections or random
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
        }
    }
}

fn default_listen_address() -> String {
    ":8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_capacity() -> i64 {
    100
}

fn default_rate_per_second() -> i64 {
    10
}

fn default_strategy() -> String {
    "round-robin".to_string()
}

impl Config {
    /// Load configuration from a YAML file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("failed to read config file {}: {}", path.as_ref().display(), e)
        })?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.log.level = config.log.level.to_lowercase();
        config.log.format = config.log.format.to_lowercase();
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_address.is_empty() {
            anyhow::bail!("listenAddress must not be empty");
        }

        if self.backends.is_empty() {
            anyhow::bail!("at least one backend must be configured");
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.as_str()) {
                anyhow::bail!("duplicate backend address in configuration: {}", backend);
            }
        }

        match self.log.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("log.level must be debug, info, warn or error, got '{}'", other),
        }
        match self.log.format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("log.format must be json or text, got '{}'", other),
        }

        if self.health_check.enabled {
            if self.health_check.interval.is_zero() {
                anyhow::bail!("healthCheck.interval must be positive");
            }
            if self.health_check.timeout.is_zero() {
                anyhow::bail!("healthCheck.timeout must be positive");
            }
            if self.health_check.timeout >= self.health_check.interval {
                tracing::warn!(
                    timeout_secs = self.health_check.timeout.as_secs(),
                    interval_secs = self.health_check.interval.as_secs(),
                    "healthCheck.timeout is not below healthCheck.interval"
                );
            }
        }

        if self.rate_limit.enabled {
            if self.rate_limit.default_capacity <= 0 {
                anyhow::bail!("rateLimit.defaultCapacity must be greater than 0");
            }
            if self.rate_limit.default_rate_per_second <= 0 {
                anyhow::bail!("rateLimit.defaultRatePerSecond must be greater than 0");
            }
        }

        self.strategy()?;

        Ok(())
    }

    /// Parse the configured load balancing strategy
    pub fn strategy(&self) -> anyhow::Result<Strategy> {
        self.load_balancer.strategy.parse()
    }

    /// Resolve the listen address into a socket address.
    /// A bare ":port" binds all interfaces.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        };
        addr.parse()
            .map_err(|e| anyhow::anyhow!("invalid listenAddress '{}': {}", self.listen_address, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
listenAddress: "127.0.0.1:9090"
backends:
  - "http://127.0.0.1:9001"
  - "http://127.0.0.1:9002"
log:
  level: DEBUG
  format: json
healthCheck:
  enabled: true
  interval: 10s
  timeout: 2s
  path: "/healthz"
rateLimit:
  enabled: true
  middleware: true
  defaultCapacity: 50
  defaultRatePerSecond: 5
loadBalancer:
  strategy: least-connections
"#;

        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.log.level = config.log.level.to_lowercase();
        config.validate().unwrap();

        assert_eq!(config.listen_address, "127.0.0.1:9090");
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "json");
        assert_eq!(config.health_check.interval, Duration::from_secs(10));
        assert_eq!(config.health_check.timeout, Duration::from_secs(2));
        assert_eq!(config.health_check.path, "/healthz");
        assert!(config.rate_limit.enabled);
        assert!(config.rate_limit.middleware);
        assert_eq!(config.rate_limit.default_capacity, 50);
        assert_eq!(config.strategy().unwrap(), Strategy::LeastConnections);
    }

    #[test]
    fn test_defaults() {
        let yaml = r#"
backends:
  - "http://127.0.0.1:9001"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.listen_address, ":8080");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "text");
        assert!(config.health_check.enabled);
        assert_eq!(config.health_check.interval, Duration::from_secs(15));
        assert_eq!(config.health_check.timeout, Duration::from_secs(3));
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.strategy().unwrap(), Strategy::RoundRobin);
    }

    #[test]
    fn test_empty_backends_rejected() {
        let yaml = "listenAddress: \":8080\"\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least one backend"));
    }

    #[test]
    fn test_duplicate_backends_rejected() {
        let yaml = r#"
backends:
  - "http://127.0.0.1:9001"
  - "http://127.0.0.1:9001"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate backend"));
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let yaml = r#"
backends:
  - "http://127.0.0.1:9001"
loadBalancer:
  strategy: weighted
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let yaml = r#"
backends:
  - "http://127.0.0.1:9001"
healthCheck:
  enabled: true
  interval: 0s
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("interval"));
    }

    #[test]
    fn test_listen_addr_bare_port() {
        let yaml = r#"
backends:
  - "http://127.0.0.1:9001"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let addr = config.listen_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_nonpositive_rate_limit_defaults_rejected() {
        let yaml = r#"
backends:
  - "http://127.0.0.1:9001"
rateLimit:
  enabled: true
  defaultCapacity: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("defaultCapacity"));
    }
}

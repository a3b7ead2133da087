use crate::balancer::Strategy;
use crate::breaker::BreakerSettings;
use crate::registry::Instance;
use crate::retry::RetryConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen address for the single gateway listener.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub forward: ForwardConfig,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub breaker: BreakerSection,

    /// Ordered path-prefix routing rules; first match wins.
    #[serde(default)]
    pub routes: Vec<RouteRule>,

    /// Instances seeded into the registry at startup, keyed by service name.
    /// Everything else arrives through `POST /register`.
    #[serde(default)]
    pub services: HashMap<String, Vec<Instance>>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            balancer: BalancerConfig::default(),
            forward: ForwardConfig::default(),
            retry: RetrySection::default(),
            breaker: BreakerSection::default(),
            routes: Vec::new(),
            services: HashMap::new(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Selection strategy name; unknown names fall back to round-robin.
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
        }
    }
}

fn default_strategy() -> String {
    "round-robin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Per-attempt timeout for forwarded requests (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Retries after the initial attempt; 0 disables retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    /// Probe budget while half-open.
    #[serde(default = "default_cb_max_requests")]
    pub max_requests: u32,

    /// Closed-state counter-reset window (seconds).
    #[serde(default = "default_cb_interval")]
    pub interval_secs: u64,

    /// Time spent open before probing again (seconds).
    #[serde(default = "default_cb_timeout")]
    pub timeout_secs: u64,

    /// Consecutive failures that trip the breaker.
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            max_requests: default_cb_max_requests(),
            interval_secs: default_cb_interval(),
            timeout_secs: default_cb_timeout(),
            failure_threshold: default_cb_failure_threshold(),
        }
    }
}

fn default_cb_max_requests() -> u32 {
    3
}

fn default_cb_interval() -> u64 {
    60
}

fn default_cb_timeout() -> u64 {
    30
}

fn default_cb_failure_threshold() -> u32 {
    5
}

/// A path-prefix routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub prefix: String,
    pub service: String,
}

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the gateway starts with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            strategy = %config.strategy(),
            routes = config.routes.len(),
            seeded_services = config.services.len(),
            "loaded gateway configuration"
        );
        Ok(config)
    }

    /// Environment overrides. Invalid or non-positive values leave the
    /// configured value in place.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BALANCER_STRATEGY") {
            self.balancer.strategy = v;
        }
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT") {
            if let Ok(n) = v.parse::<i64>() {
                if n > 0 {
                    self.forward.request_timeout_secs = n as u64;
                }
            }
        }
        if let Ok(v) = std::env::var("RETRY_MAX") {
            if let Ok(n) = v.parse::<u32>() {
                self.retry.max_retries = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.forward.request_timeout_secs == 0 {
            anyhow::bail!("forward.request_timeout_secs must be positive");
        }
        if self.retry.initial_backoff_ms == 0 {
            anyhow::bail!("retry.initial_backoff_ms must be positive");
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            anyhow::bail!("retry.max_backoff_ms must be >= retry.initial_backoff_ms");
        }
        for rule in &self.routes {
            if rule.prefix.is_empty() || rule.service.is_empty() {
                anyhow::bail!("route rules need a non-empty prefix and service");
            }
        }
        for (service, instances) in &self.services {
            if service.is_empty() {
                anyhow::bail!("seeded service has an empty name");
            }
            for instance in instances {
                if instance.id.is_empty() || instance.addr.is_empty() {
                    anyhow::bail!(
                        "seeded instance of '{}' needs a non-empty id and addr",
                        service
                    );
                }
            }
        }
        Ok(())
    }

    pub fn strategy(&self) -> Strategy {
        Strategy::from_name(&self.balancer.strategy)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.forward.request_timeout_secs)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        let threshold = self.breaker.failure_threshold;
        BreakerSettings {
            max_requests: self.breaker.max_requests,
            interval: Duration::from_secs(self.breaker.interval_secs),
            timeout: Duration::from_secs(self.breaker.timeout_secs),
            ready_to_trip: Arc::new(move |counts| counts.consecutive_failures >= threshold),
        }
    }
}

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Application configuration
///
/// Loaded from a TOML file and overridden by `FAIRWAY_*` environment
/// variables for the secrets that should not live on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Session envelope configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Upstream feed configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Cache tier configuration
    #[serde(default)]
    pub cache: CacheSettings,

    /// Rate limiter configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// TTL selection configuration
    #[serde(default)]
    pub ttl: TtlConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Session envelope configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Master encryption key. Required outside dev mode; normally supplied
    /// via FAIRWAY_MASTER_KEY rather than the config file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,

    /// Idle timeout in seconds (default: 30 minutes)
    #[serde(default = "default_session_timeout")]
    pub timeout_seconds: u64,

    /// Absolute session lifetime in seconds (default: 7 days)
    #[serde(default = "default_session_max_age")]
    pub max_age_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            timeout_seconds: default_session_timeout(),
            max_age_seconds: default_session_max_age(),
        }
    }
}

fn default_session_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_session_max_age() -> u64 {
    7 * 24 * 3600 // 7 days
}

/// Upstream feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Vendor base URL
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,

    /// Vendor API key; normally supplied via FAIRWAY_UPSTREAM_KEY
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,

    /// Maximum retry attempts for retryable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            api_key: None,
            timeout_seconds: default_upstream_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

fn default_upstream_base_url() -> String {
    "https://feeds.datagolf.com".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    250
}

/// Eviction policy for a cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    Lru,
    Fifo,
    Lfu,
}

/// One cache tier's configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Whether this tier participates in reads and writes
    #[serde(default = "default_tier_enabled")]
    pub enabled: bool,

    /// Maximum number of entries
    pub max_entries: usize,

    /// Default TTL in seconds
    pub default_ttl_seconds: u64,

    /// Eviction policy
    pub policy: EvictionPolicy,
}

impl TierConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }
}

fn default_tier_enabled() -> bool {
    true
}

/// Cache tier stack configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_l1")]
    pub l1: TierConfig,

    #[serde(default = "default_l2")]
    pub l2: TierConfig,

    #[serde(default = "default_l3")]
    pub l3: TierConfig,

    /// Compress bodies above this size (bytes); 0 disables compression
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            l1: default_l1(),
            l2: default_l2(),
            l3: default_l3(),
            compression_threshold: default_compression_threshold(),
        }
    }
}

fn default_l1() -> TierConfig {
    TierConfig {
        enabled: true,
        max_entries: 1000,
        default_ttl_seconds: 300, // 5 minutes
        policy: EvictionPolicy::Lru,
    }
}

fn default_l2() -> TierConfig {
    TierConfig {
        enabled: true,
        max_entries: 5000,
        default_ttl_seconds: 1800, // 30 minutes
        policy: EvictionPolicy::Fifo,
    }
}

fn default_l3() -> TierConfig {
    TierConfig {
        enabled: true,
        max_entries: 20000,
        default_ttl_seconds: 86400, // 24 hours
        policy: EvictionPolicy::Lfu,
    }
}

fn default_compression_threshold() -> usize {
    4096
}

/// One endpoint's rate limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u64,
    pub window_seconds: u64,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Default per-endpoint rule
    #[serde(default = "default_rate_rule")]
    pub default: RateLimitRule,

    /// Per-endpoint overrides keyed by endpoint name
    #[serde(default)]
    pub endpoints: HashMap<String, RateLimitRule>,

    /// Lower clamp for adaptive adjustment
    #[serde(default = "default_min_limit")]
    pub min_limit: u64,

    /// Upper clamp for adaptive adjustment
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: default_rate_rule(),
            endpoints: HashMap::new(),
            min_limit: default_min_limit(),
            max_limit: default_max_limit(),
        }
    }
}

impl RateLimitConfig {
    /// Rule for an endpoint, falling back to the default
    pub fn rule_for(&self, endpoint: &str) -> RateLimitRule {
        self.endpoints.get(endpoint).copied().unwrap_or(self.default)
    }
}

fn default_rate_rule() -> RateLimitRule {
    RateLimitRule {
        limit: 100,
        window_seconds: 60,
    }
}

fn default_min_limit() -> u64 {
    10
}

fn default_max_limit() -> u64 {
    1000
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before probing
    #[serde(default = "default_open_timeout")]
    pub open_timeout_seconds: u64,

    /// Concurrent trial requests admitted while half-open
    #[serde(default = "default_max_trials")]
    pub max_trials: u32,

    /// Half-open successes required to close the circuit
    #[serde(default = "default_reset_threshold")]
    pub reset_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_seconds: default_open_timeout(),
            max_trials: default_max_trials(),
            reset_threshold: default_reset_threshold(),
        }
    }
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_seconds)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout() -> u64 {
    60
}

fn default_max_trials() -> u32 {
    5
}

fn default_reset_threshold() -> u32 {
    3
}

/// TTL selection configuration (per endpoint category)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Live scoring, betting odds
    #[serde(default = "default_realtime_ttl")]
    pub realtime_seconds: u64,

    /// Field updates, rankings
    #[serde(default = "default_dynamic_ttl")]
    pub dynamic_seconds: u64,

    /// Tournaments, historical stats
    #[serde(default = "default_reference_ttl")]
    pub reference_seconds: u64,

    /// Lower clamp for computed TTLs
    #[serde(default = "default_min_ttl")]
    pub min_seconds: u64,

    /// Upper clamp for computed TTLs
    #[serde(default = "default_max_ttl")]
    pub max_seconds: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            realtime_seconds: default_realtime_ttl(),
            dynamic_seconds: default_dynamic_ttl(),
            reference_seconds: default_reference_ttl(),
            min_seconds: default_min_ttl(),
            max_seconds: default_max_ttl(),
        }
    }
}

fn default_realtime_ttl() -> u64 {
    120
}

fn default_dynamic_ttl() -> u64 {
    1200 // 20 minutes
}

fn default_reference_ttl() -> u64 {
    3600 // 1 hour
}

fn default_min_ttl() -> u64 {
    30
}

fn default_max_ttl() -> u64 {
    86400 // 24 hours
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Development mode relaxes the master-key requirement and includes
    /// error detail blocks in responses
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            dev_mode: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Config {
    /// Load configuration from an optional TOML file, then apply
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let contents = fs::read_to_string(p).map_err(|e| {
                    ProxyError::Config(format!("Failed to read config file {}: {}", p.display(), e))
                })?;
                toml::from_str(&contents)
                    .map_err(|e| ProxyError::Config(format!("Failed to parse config file: {e}")))?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables take precedence over file values so secrets
    /// can stay out of the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("FAIRWAY_MASTER_KEY") {
            self.session.master_key = Some(key);
        }
        if let Ok(key) = std::env::var("FAIRWAY_UPSTREAM_KEY") {
            self.upstream.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("FAIRWAY_UPSTREAM_URL") {
            self.upstream.base_url = url;
        }
        if let Ok(bind) = std::env::var("FAIRWAY_BIND") {
            self.server.bind = bind;
        }
        if std::env::var("FAIRWAY_DEV_MODE").map(|v| v == "1" || v == "true") == Ok(true) {
            self.server.dev_mode = true;
        }
    }

    /// Validate the loaded configuration. A missing master key outside dev
    /// mode is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if !self.server.dev_mode && self.session.master_key.is_none() {
            return Err(ProxyError::Config(
                "session.master_key is required outside dev mode (set FAIRWAY_MASTER_KEY)"
                    .to_string(),
            ));
        }
        if self.upstream.api_key.is_none() {
            return Err(ProxyError::NoApiKey);
        }
        if self.ttl.min_seconds >= self.ttl.max_seconds {
            return Err(ProxyError::Config(
                "ttl.min_seconds must be below ttl.max_seconds".to_string(),
            ));
        }
        for (name, tier) in [
            ("l1", &self.cache.l1),
            ("l2", &self.cache.l2),
            ("l3", &self.cache.l3),
        ] {
            if tier.enabled && tier.max_entries == 0 {
                return Err(ProxyError::Config(format!(
                    "cache.{name}.max_entries must be nonzero when the tier is enabled"
                )));
            }
        }
        Ok(())
    }
}

// Configuration File Support
//
// This module provides configuration file parsing for the wordmeter service.
// Supports TOML format with environment variable overrides.
// The server reads ./wordmeter.toml unless a path is given on the command line.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::logging::LoggingConfig;
use crate::quota::ledger::LedgerSettings;
use crate::quota::DEFAULT_WORD_QUOTA;
use crate::rate_limit::RateLimitConfig;
use crate::stream::{Pacing, StreamOptions};

/// Config file read when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "wordmeter.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Per-user request rate limiting
    pub rate_limit: RateLimitConfig,

    /// Word quota and cache configuration
    pub quota: QuotaConfig,

    /// Token stream pacing and deadline
    pub stream: StreamConfig,

    /// Durable store and cache backend
    pub backend: BackendConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,

    /// How long shutdown waits for in-flight reconciliations
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Word quota configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// Allowance granted to a newly seen user
    pub default_words: u64,

    /// Lifetime of a cached quota entry in seconds
    pub cache_ttl_secs: u64,

    /// Maximum entries in the in-process cache
    pub cache_capacity: u64,

    /// Timeout for each post-stream reconciliation stage
    pub reconcile_timeout_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_words: DEFAULT_WORD_QUOTA,
            cache_ttl_secs: 300,
            cache_capacity: 10_000,
            reconcile_timeout_secs: 30,
        }
    }
}

impl QuotaConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            default_words: self.default_words,
            cache_ttl: self.cache_ttl(),
        }
    }
}

/// Token stream configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Wall-clock bound for one stream
    pub deadline_secs: u64,

    /// Lower bound of the inter-token delay
    pub min_delay_ms: u64,

    /// Upper bound (exclusive) of the inter-token delay
    pub max_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 60,
            min_delay_ms: 500,
            max_delay_ms: 1000,
        }
    }
}

impl StreamConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn pacing(&self) -> Pacing {
        Pacing::new(
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    /// Options for a request that sets no per-request overrides
    pub fn default_options(&self) -> StreamOptions {
        StreamOptions {
            deadline: self.deadline(),
            ..StreamOptions::default()
        }
    }
}

/// Which implementation backs the store and cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store and moka cache
    #[default]
    Memory,
    /// Redis for both store and cache
    Redis,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err(format!("Invalid backend: {}", s)),
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,

    /// Used when `kind = "redis"`
    pub redis_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to expose /metrics
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from `path`, or from `./wordmeter.toml` when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from_path(path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH)))
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or if
    /// the resulting configuration is invalid. A missing file yields the
    /// defaults with environment overrides applied.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - WORDMETER_HOST, WORDMETER_PORT
    /// - WORDMETER_BACKEND, WORDMETER_REDIS_URL
    /// - WORDMETER_RATE_LIMIT (requests per window; 0 disables)
    /// - WORDMETER_LOG_LEVEL, WORDMETER_LOG_FORMAT
    /// - WORDMETER_DEADLINE_SECS
    pub fn apply_env_overrides(self) -> Result<Self> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("WORDMETER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("WORDMETER_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid WORDMETER_PORT: {}", port))?;
        }

        if let Some(kind) = lookup("WORDMETER_BACKEND") {
            self.backend.kind = kind.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(url) = lookup("WORDMETER_REDIS_URL") {
            self.backend.redis_url = url;
        }

        if let Some(limit) = lookup("WORDMETER_RATE_LIMIT") {
            let limit: u32 = limit
                .parse()
                .with_context(|| format!("Invalid WORDMETER_RATE_LIMIT: {}", limit))?;
            if limit == 0 {
                self.rate_limit.enabled = false;
            } else {
                self.rate_limit.requests_per_window = limit;
            }
        }

        // Logging overrides
        if let Some(level) = lookup("WORDMETER_LOG_LEVEL") {
            self.logging.level = level.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(format) = lookup("WORDMETER_LOG_FORMAT") {
            self.logging.format = format.parse().map_err(anyhow::Error::msg)?;
        }

        if let Some(secs) = lookup("WORDMETER_DEADLINE_SECS") {
            self.stream.deadline_secs = secs
                .parse()
                .with_context(|| format!("Invalid WORDMETER_DEADLINE_SECS: {}", secs))?;
        }

        Ok(self)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be > 0");
        }

        if self.rate_limit.enabled {
            if self.rate_limit.requests_per_window == 0 {
                anyhow::bail!("Rate limit must admit at least one request per window");
            }
            if self.rate_limit.window_secs == 0 {
                anyhow::bail!("Rate limit window must be > 0 seconds");
            }
            if self.rate_limit.sweep_interval_secs == 0 {
                anyhow::bail!("Rate limit sweep interval must be > 0 seconds");
            }
        }

        if self.quota.default_words == 0 {
            anyhow::bail!("Default word quota must be > 0");
        }
        if self.quota.cache_ttl_secs == 0 {
            anyhow::bail!("Quota cache TTL must be > 0 seconds");
        }
        if self.quota.reconcile_timeout_secs == 0 {
            anyhow::bail!("Reconcile timeout must be > 0 seconds");
        }

        if self.stream.deadline_secs == 0 {
            anyhow::bail!("Stream deadline must be > 0 seconds");
        }
        if self.stream.min_delay_ms > self.stream.max_delay_ms {
            anyhow::bail!(
                "Stream min_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.stream.min_delay_ms,
                self.stream.max_delay_ms
            );
        }

        if self.backend.kind == BackendKind::Redis && self.backend.redis_url.is_empty() {
            anyhow::bail!("Redis backend selected but no redis_url configured");
        }

        Ok(())
    }
}

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::retry::RetryPolicy;
use crate::tier::{ConcurrencyStep, ConcurrencyTable, QualityProfile, QualityTier, TierTable};

pub const CONFIG_VERSION: u32 = 1;

// ─── Input (as written in TOML) ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FarmConfigInput {
    pub version: u32,
    pub pool: PoolConfigInput,
    pub retry: RetryConfigInput,
    pub handshake: HandshakeConfigInput,
    pub events: EventsConfigInput,
    pub tiers: Vec<TierInput>,
    pub concurrency: Vec<ConcurrencyInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoolConfigInput {
    pub max_connections: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub bytes_per_connection: Option<u64>,
    pub memory_warning_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfigInput {
    pub max_attempts: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub jitter: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HandshakeConfigInput {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventsConfigInput {
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TierInput {
    pub max_devices: Option<usize>,
    pub resolution: u16,
    pub bitrate_bps: u32,
    pub max_fps: u32,
    pub label: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConcurrencyInput {
    pub max_devices: Option<usize>,
    pub cap: usize,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Soft capacity; see [`crate::pool::ConnectionPool::register`].
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub bytes_per_connection: u64,
    pub memory_warning_bytes: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 200,
            idle_timeout: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(60),
            bytes_per_connection: 3 * 1024 * 1024,
            memory_warning_bytes: 500 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FarmConfig {
    pub version: u32,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub handshake_timeout: Duration,
    pub tiers: TierTable,
    pub concurrency: ConcurrencyTable,
    /// Buffer of each broadcast event channel.
    pub event_capacity: usize,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tiers: TierTable::default(),
            concurrency: ConcurrencyTable::default(),
            event_capacity: 1024,
        }
    }
}

impl FarmConfigInput {
    pub fn resolve(self) -> Result<FarmConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = FarmConfig::default();

        let pool = PoolConfig {
            max_connections: self
                .pool
                .max_connections
                .unwrap_or(defaults.pool.max_connections),
            idle_timeout: self
                .pool
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.pool.idle_timeout),
            cleanup_interval: self
                .pool
                .cleanup_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.pool.cleanup_interval),
            bytes_per_connection: self
                .pool
                .bytes_per_connection
                .unwrap_or(defaults.pool.bytes_per_connection),
            memory_warning_bytes: self
                .pool
                .memory_warning_bytes
                .unwrap_or(defaults.pool.memory_warning_bytes),
        };
        if pool.max_connections == 0 {
            return Err(invalid("pool.max_connections", "must be at least 1"));
        }
        if pool.cleanup_interval.is_zero() {
            return Err(invalid("pool.cleanup_interval_secs", "must be non-zero"));
        }

        let retry = RetryPolicy {
            max_attempts: self
                .retry
                .max_attempts
                .unwrap_or(defaults.retry.max_attempts),
            base_delay: self
                .retry
                .base_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_delay: self
                .retry
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
            jitter: self.retry.jitter.unwrap_or(defaults.retry.jitter),
        };
        if retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&retry.jitter) {
            return Err(invalid("retry.jitter", "must be in [0, 1)"));
        }
        if retry.base_delay > retry.max_delay {
            return Err(invalid(
                "retry.base_backoff_ms",
                "must not exceed retry.max_backoff_ms",
            ));
        }

        let handshake_timeout = self
            .handshake
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.handshake_timeout);
        if handshake_timeout.is_zero() {
            return Err(invalid("handshake.timeout_ms", "must be non-zero"));
        }

        let event_capacity = self
            .events
            .capacity
            .unwrap_or(defaults.event_capacity);
        if event_capacity == 0 {
            return Err(invalid("events.capacity", "must be at least 1"));
        }

        let tiers = if self.tiers.is_empty() {
            defaults.tiers
        } else {
            TierTable::new(
                self.tiers
                    .into_iter()
                    .map(|t| QualityTier {
                        max_devices: t.max_devices,
                        profile: QualityProfile::new(
                            t.resolution,
                            t.bitrate_bps,
                            t.max_fps,
                            t.label.trim(),
                        ),
                    })
                    .collect(),
            )?
        };

        let concurrency = if self.concurrency.is_empty() {
            defaults.concurrency
        } else {
            ConcurrencyTable::new(
                self.concurrency
                    .into_iter()
                    .map(|c| ConcurrencyStep {
                        max_devices: c.max_devices,
                        cap: c.cap,
                    })
                    .collect(),
            )?
        };

        Ok(FarmConfig {
            version,
            pool,
            retry,
            handshake_timeout,
            tiers,
            concurrency,
            event_capacity,
        })
    }
}

impl FarmConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(FarmConfig::default());
        }
        let parsed: FarmConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

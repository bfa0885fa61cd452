//! # Quality Tier Selection
//!
//! Maps fleet size to a streaming profile and to the number of handshakes
//! allowed in flight at once. Both are evaluated once per batch so every
//! device in a batch streams with the same settings.
//!
//! Tables are keyed by inclusive upper bounds on the device count; the last
//! entry is unbounded. Values never increase as the count grows.

use serde::Serialize;

use crate::error::ConfigError;

// ─── QualityProfile ─────────────────────────────────────────────────────────

/// Streaming settings shared by every device in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityProfile {
    /// Maximum frame dimension in pixels (1080, 720, ...).
    pub resolution: u16,
    pub bit_rate_bps: u32,
    pub max_fps: u32,
    pub tier_label: String,
}

impl QualityProfile {
    pub fn new(resolution: u16, bit_rate_bps: u32, max_fps: u32, label: &str) -> Self {
        QualityProfile {
            resolution,
            bit_rate_bps,
            max_fps,
            tier_label: label.to_string(),
        }
    }

    /// Whether `self` is no richer than `other` on every axis.
    fn at_most(&self, other: &QualityProfile) -> bool {
        self.resolution <= other.resolution
            && self.bit_rate_bps <= other.bit_rate_bps
            && self.max_fps <= other.max_fps
    }
}

/// A profile applying to batches of up to `max_devices` devices.
/// `None` marks the final catch-all tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityTier {
    pub max_devices: Option<usize>,
    pub profile: QualityProfile,
}

// ─── TierTable ──────────────────────────────────────────────────────────────

/// Validated, ordered quality tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    tiers: Vec<QualityTier>,
}

impl Default for TierTable {
    fn default() -> Self {
        TierTable {
            tiers: vec![
                QualityTier {
                    max_devices: Some(5),
                    profile: QualityProfile::new(1080, 8_000_000, 60, "Ultra"),
                },
                QualityTier {
                    max_devices: Some(20),
                    profile: QualityProfile::new(720, 4_000_000, 30, "High"),
                },
                QualityTier {
                    max_devices: Some(50),
                    profile: QualityProfile::new(480, 2_000_000, 30, "Medium"),
                },
                QualityTier {
                    max_devices: Some(100),
                    profile: QualityProfile::new(360, 1_000_000, 15, "Low"),
                },
                QualityTier {
                    max_devices: None,
                    profile: QualityProfile::new(240, 500_000, 10, "Minimal"),
                },
            ],
        }
    }
}

impl TierTable {
    pub fn new(tiers: Vec<QualityTier>) -> Result<Self, ConfigError> {
        let bounds: Vec<Option<usize>> = tiers.iter().map(|t| t.max_devices).collect();
        check_bounds("tiers", &bounds)?;
        for pair in tiers.windows(2) {
            if !pair[1].profile.at_most(&pair[0].profile) {
                return Err(ConfigError::InvalidTable {
                    table: "tiers",
                    reason: format!(
                        "tier {:?} is richer than the smaller-fleet tier {:?}",
                        pair[1].profile.tier_label, pair[0].profile.tier_label
                    ),
                });
            }
        }
        Ok(TierTable { tiers })
    }

    /// Profile for a batch of `device_count` devices.
    pub fn select(&self, device_count: usize) -> &QualityProfile {
        let idx = bucket(self.tiers.iter().map(|t| t.max_devices), device_count);
        &self.tiers[idx].profile
    }

    pub fn tiers(&self) -> &[QualityTier] {
        &self.tiers
    }
}

/// Profile from the default tier table.
pub fn select_tier(device_count: usize) -> QualityProfile {
    TierTable::default().select(device_count).clone()
}

// ─── ConcurrencyTable ───────────────────────────────────────────────────────

/// Handshakes allowed in flight for batches up to `max_devices` devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyStep {
    pub max_devices: Option<usize>,
    pub cap: usize,
}

/// Validated concurrency caps. Larger batches get fewer simultaneous
/// handshakes so the shared forwarding layer is not flooded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyTable {
    steps: Vec<ConcurrencyStep>,
}

impl Default for ConcurrencyTable {
    fn default() -> Self {
        let step = |max_devices, cap| ConcurrencyStep { max_devices, cap };
        ConcurrencyTable {
            steps: vec![
                step(Some(5), 5),
                step(Some(20), 4),
                step(Some(50), 3),
                step(Some(100), 2),
                step(None, 1),
            ],
        }
    }
}

impl ConcurrencyTable {
    pub fn new(steps: Vec<ConcurrencyStep>) -> Result<Self, ConfigError> {
        let bounds: Vec<Option<usize>> = steps.iter().map(|s| s.max_devices).collect();
        check_bounds("concurrency", &bounds)?;
        if steps.iter().any(|s| s.cap == 0) {
            return Err(ConfigError::InvalidTable {
                table: "concurrency",
                reason: "cap must be at least 1".into(),
            });
        }
        if steps.windows(2).any(|pair| pair[1].cap > pair[0].cap) {
            return Err(ConfigError::InvalidTable {
                table: "concurrency",
                reason: "caps must not increase with batch size".into(),
            });
        }
        Ok(ConcurrencyTable { steps })
    }

    /// Concurrency cap for a batch of `device_count` devices. Always >= 1.
    pub fn cap_for(&self, device_count: usize) -> usize {
        let idx = bucket(self.steps.iter().map(|s| s.max_devices), device_count);
        self.steps[idx].cap
    }

    pub fn steps(&self) -> &[ConcurrencyStep] {
        &self.steps
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Index of the first bucket whose inclusive bound covers `count`.
/// Validated tables end with an unbounded bucket, so this always lands.
fn bucket(bounds: impl Iterator<Item = Option<usize>>, count: usize) -> usize {
    let mut last = 0;
    for (idx, bound) in bounds.enumerate() {
        last = idx;
        match bound {
            Some(max) if count > max => continue,
            _ => return idx,
        }
    }
    last
}

fn check_bounds(table: &'static str, bounds: &[Option<usize>]) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTable {
        table,
        reason: reason.to_string(),
    };
    let Some((last, head)) = bounds.split_last() else {
        return Err(invalid("table is empty"));
    };
    if last.is_some() {
        return Err(invalid("final entry must omit max_devices"));
    }
    let mut prev: Option<usize> = None;
    for bound in head {
        let Some(max) = *bound else {
            return Err(invalid("only the final entry may omit max_devices"));
        };
        if prev.is_some_and(|p| max <= p) {
            return Err(invalid("max_devices must be strictly ascending"));
        }
        prev = Some(max);
    }
    Ok(())
}

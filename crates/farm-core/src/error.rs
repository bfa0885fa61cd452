//! Error taxonomy for the connection core.
//!
//! Per-device failures never escape the orchestrator: they are retried and,
//! once retries run out, reported as [`DeviceError::RetryExhausted`] in the
//! batch report. Pool capacity pressure is not an error at all; it shows up
//! as [`crate::pool::PoolEvent::LimitReached`].

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::device::Channel;

/// Why a single handshake attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("{channel} channel: connection refused")]
    ConnectRefused { channel: Channel },

    #[error("handshake timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("malformed device header: {0}")]
    HandshakeParse(String),

    /// One channel completed its half, the other failed or timed out.
    #[error("{failed} channel failed after {ready} channel completed: {reason}")]
    PartialHandshake {
        ready: Channel,
        failed: Channel,
        reason: String,
    },

    #[error("{channel} channel I/O error ({kind:?}): {reason}")]
    Io {
        channel: Channel,
        kind: io::ErrorKind,
        reason: String,
    },

    #[error("handshake task panicked: {0}")]
    Panicked(String),
}

impl HandshakeError {
    /// Classify a socket error observed on `channel`.
    pub fn from_io(channel: Channel, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => HandshakeError::ConnectRefused { channel },
            kind => HandshakeError::Io {
                channel,
                kind,
                reason: err.to_string(),
            },
        }
    }
}

/// Terminal per-device outcome surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("gave up after {attempts} attempts, last error: {last}")]
    RetryExhausted { attempts: u32, last: HandshakeError },
}

/// Configuration could not be parsed or failed validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid {table} table: {reason}")]
    InvalidTable { table: &'static str, reason: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Serialize any `Display` value as its rendered string.
pub(crate) fn serialize_display<T: fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

//! Device identity, per-connection parameters and connection states.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tier::QualityProfile;

// ─── DeviceId ───────────────────────────────────────────────────────────────

/// Opaque device key: an adb serial or an `address:port` pair.
///
/// Cheap to clone; the string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        DeviceId(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId::new(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId(Arc::from(s))
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ─── Channel ────────────────────────────────────────────────────────────────

/// One of the two sockets that make up a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Carries the device-info header followed by the encoded video stream.
    Video,
    /// Carries input/control messages.
    Control,
}

impl Channel {
    pub fn peer(self) -> Channel {
        match self {
            Channel::Video => Channel::Control,
            Channel::Control => Channel::Video,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Video => f.write_str("video"),
            Channel::Control => f.write_str("control"),
        }
    }
}

// ─── ConnectionParams ───────────────────────────────────────────────────────

/// Immutable per-device snapshot taken from the batch's quality profile
/// at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionParams {
    pub id: DeviceId,
    /// Maximum dimension of the mirrored frame, in pixels.
    pub target_resolution: u16,
    pub bit_rate_bps: u32,
    pub max_fps: u32,
}

impl ConnectionParams {
    pub fn from_profile(id: DeviceId, profile: &QualityProfile) -> Self {
        ConnectionParams {
            id,
            target_resolution: profile.resolution,
            bit_rate_bps: profile.bit_rate_bps,
            max_fps: profile.max_fps,
        }
    }
}

// ─── ConnectionState ────────────────────────────────────────────────────────

/// Connection lifecycle of one identifier.
///
/// ```text
///   Queued ──▶ Connecting ──▶ AwaitingPeerHandshake ──▶ Connected
///                  │                   │
///                  └──────▶ Failed ◀───┘
///                             │
///                 Retrying ◀──┴──▶ Abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Queued,
    Connecting,
    /// One channel finished its half of the handshake; waiting on the other.
    AwaitingPeerHandshake,
    Connected,
    Failed,
    Retrying,
    /// Terminal: every retry attempt was used up.
    Abandoned,
}

impl ConnectionState {
    /// Whether no further transition will happen within the batch.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Abandoned)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn device_id_borrows_as_str() {
        let mut map = HashMap::new();
        map.insert(DeviceId::from("emulator-5554"), 1);
        assert_eq!(map.get("emulator-5554"), Some(&1));
        assert_eq!(DeviceId::from("a").to_string(), "a");
    }

    #[test]
    fn params_copy_profile() {
        let profile = QualityProfile {
            resolution: 360,
            bit_rate_bps: 1_000_000,
            max_fps: 15,
            tier_label: "Low".into(),
        };
        let p = ConnectionParams::from_profile("dev".into(), &profile);
        assert_eq!(p.target_resolution, 360);
        assert_eq!(p.bit_rate_bps, 1_000_000);
        assert_eq!(p.max_fps, 15);
    }

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Abandoned.is_terminal());
        assert!(!ConnectionState::Retrying.is_terminal());
        assert!(!ConnectionState::Failed.is_terminal());
        assert_eq!(Channel::Video.peer(), Channel::Control);
    }
}

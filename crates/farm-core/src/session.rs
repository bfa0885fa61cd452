//! Live two-channel device session.
//!
//! A session owns the video and control sockets of one device from the
//! moment its handshake completes until it is removed from the pool.
//! Consumers borrow the sockets with [`DeviceSession::take_channels`] and
//! hand them back with [`DeviceSession::restore_channels`] so a released
//! session can be reused without a second handshake.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::time::Instant;

use crate::device::DeviceId;
use crate::handshake::DeviceInfo;
use crate::transport::BoxedStream;
use crate::util::lock_or_recover;

/// The open sockets of a session plus any bytes read past the handshake.
pub struct SessionChannels {
    pub video: BoxedStream,
    pub control: BoxedStream,
    pub video_prefix: Bytes,
    /// Empty for sessions from [`crate::handshake::perform`], which stops
    /// reading control right after the greeting.
    pub control_prefix: Bytes,
}

impl fmt::Debug for SessionChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionChannels")
            .field("video_prefix", &self.video_prefix.len())
            .field("control_prefix", &self.control_prefix.len())
            .finish_non_exhaustive()
    }
}

/// A connected device. Shared as [`SessionHandle`].
pub struct DeviceSession {
    id: DeviceId,
    info: DeviceInfo,
    channels: Mutex<Option<SessionChannels>>,
    closed: AtomicBool,
    established_at: Instant,
}

/// Shared reference to a pooled session. Two handles for the same device
/// point at the same allocation.
pub type SessionHandle = Arc<DeviceSession>;

impl DeviceSession {
    pub fn new(id: DeviceId, info: DeviceInfo, channels: SessionChannels) -> Self {
        DeviceSession {
            id,
            info,
            channels: Mutex::new(Some(channels)),
            closed: AtomicBool::new(false),
            established_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Move the sockets out for streaming. `None` if already taken or closed.
    pub fn take_channels(&self) -> Option<SessionChannels> {
        lock_or_recover(&self.channels).take()
    }

    /// Return sockets taken earlier. A closed session drops them instead;
    /// returns whether they were kept.
    pub fn restore_channels(&self, channels: SessionChannels) -> bool {
        let mut slot = lock_or_recover(&self.channels);
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(channels);
        true
    }

    pub fn has_channels(&self) -> bool {
        lock_or_recover(&self.channels).is_some()
    }

    /// Drop both sockets. Idempotent.
    pub fn close(&self) {
        let mut slot = lock_or_recover(&self.channels);
        self.closed.store(true, Ordering::Release);
        if slot.take().is_some() {
            tracing::debug!(device = %self.id, "session sockets closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session() -> (DeviceSession, tokio::io::DuplexStream) {
        let (video, peer) = tokio::io::duplex(64);
        let (control, _control_peer) = tokio::io::duplex(64);
        let channels = SessionChannels {
            video: Box::new(video),
            control: Box::new(control),
            video_prefix: Bytes::new(),
            control_prefix: Bytes::new(),
        };
        let info = DeviceInfo {
            name: "Pixel7".into(),
            width: 1080,
            height: 2400,
        };
        (DeviceSession::new("dev-A".into(), info, channels), peer)
    }

    #[tokio::test]
    async fn take_and_restore() {
        let (s, mut peer) = session();
        let mut ch = s.take_channels().unwrap();
        assert!(!s.has_channels());
        assert!(s.take_channels().is_none());

        ch.video.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        assert!(s.restore_channels(ch));
        assert!(s.has_channels());
    }

    #[tokio::test]
    async fn close_drops_sockets() {
        let (s, mut peer) = session();
        s.close();
        s.close();
        assert!(s.is_closed());
        assert!(!s.has_channels());
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn restore_after_close_is_refused() {
        let (s, _peer) = session();
        let ch = s.take_channels().unwrap();
        s.close();
        assert!(!s.restore_channels(ch));
        assert!(!s.has_channels());
    }
}

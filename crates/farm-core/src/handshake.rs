//! # Session Handshake
//!
//! Promotes one device from `Connecting` to `Connected` over two sockets
//! opened against the device's forwarded port:
//!
//! ```text
//!   video:   [greeting:1][name:64][reserved:4][width:u32 BE][height:u32 BE][stream...]
//!   control: [greeting:1][control messages...]
//! ```
//!
//! The protocol lives in [`HandshakeMachine`], a transport-agnostic state
//! machine fed with socket events. [`perform`] drives it from async reads
//! on whatever a [`Connector`] opens, under one wall-clock timeout.
//!
//! ```text
//!   video:   Connecting ──connected──▶ Greeting ──1 byte──▶ Header ──76 bytes──▶ Ready
//!   control: Connecting ──connected──▶ Greeting ──1 byte──▶ Ready
//!
//!   both Ready ─▶ Connected      any error/close/timeout first ─▶ Failed
//! ```
//!
//! The two channels complete in any order. A channel that finished its half
//! is held until its peer does; a failure on either side fails the device.

use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

use crate::device::{Channel, ConnectionParams, ConnectionState, DeviceId};
use crate::error::HandshakeError;
use crate::session::{DeviceSession, SessionChannels};
use crate::transport::{BoxedStream, Connector};

/// Size of the NUL-padded device name field.
pub const DEVICE_NAME_FIELD_LENGTH: usize = 64;
/// Name field, 4 reserved bytes, then width and height.
pub const DEVICE_INFO_LENGTH: usize = DEVICE_NAME_FIELD_LENGTH + 12;
/// Liveness byte each channel sends before anything else.
pub const GREETING_LENGTH: usize = 1;
/// Default bound on a whole handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

const VIDEO_READ_CHUNK: usize = 4096;

// ─── Device Info Header ─────────────────────────────────────────────────────

/// Identity and frame size announced by the device on the video channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Parse the device-info header from the first [`DEVICE_INFO_LENGTH`] bytes
/// of `buf`. Trailing bytes are ignored.
pub fn parse_device_info(buf: &[u8]) -> Result<DeviceInfo, HandshakeError> {
    if buf.len() < DEVICE_INFO_LENGTH {
        return Err(HandshakeError::HandshakeParse(format!(
            "header needs {DEVICE_INFO_LENGTH} bytes, got {}",
            buf.len()
        )));
    }

    // The last byte of the field is always treated as NUL, whatever the
    // device sent there.
    let field = &buf[..DEVICE_NAME_FIELD_LENGTH - 1];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let name = String::from_utf8_lossy(&field[..end]).into_owned();

    let mut dims = &buf[DEVICE_NAME_FIELD_LENGTH + 4..DEVICE_INFO_LENGTH];
    let width = dims.get_u32();
    let height = dims.get_u32();
    if width == 0 || height == 0 {
        return Err(HandshakeError::HandshakeParse(format!(
            "invalid frame size {width}x{height}"
        )));
    }

    Ok(DeviceInfo {
        name,
        width,
        height,
    })
}

/// Encode a device-info header (without the greeting byte).
///
/// Names longer than the field are truncated; the reserved bytes are zero.
pub fn encode_device_info(name: &str, width: u32, height: u32) -> Bytes {
    let raw = name.as_bytes();
    let len = raw.len().min(DEVICE_NAME_FIELD_LENGTH - 1);
    let mut buf = BytesMut::with_capacity(DEVICE_INFO_LENGTH);
    buf.put_slice(&raw[..len]);
    buf.put_bytes(0, DEVICE_NAME_FIELD_LENGTH - len);
    buf.put_u32(0);
    buf.put_u32(width);
    buf.put_u32(height);
    buf.freeze()
}

// ─── State Machine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoPhase {
    Connecting,
    Greeting,
    Header,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlPhase {
    Connecting,
    Greeting,
    Ready,
}

/// Socket-level input to the handshake.
#[derive(Debug)]
pub enum HandshakeEvent<'a> {
    Connected(Channel),
    Data(Channel, &'a [u8]),
    /// Orderly EOF from the peer.
    Closed(Channel),
    Error(Channel, io::Error),
}

/// What the handshake produced once both channels are done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub info: DeviceInfo,
    /// Video bytes that arrived in the same reads as the header.
    pub video_prefix: Bytes,
    /// Control bytes that arrived in the same read as the greeting. Only a
    /// caller feeding the machine multi-byte control reads sees any;
    /// [`perform`] reads control one byte at a time, so this is empty there.
    pub control_prefix: Bytes,
}

/// Result of feeding one event.
#[derive(Debug)]
pub enum HandshakeStep {
    Pending,
    Complete(HandshakeOutcome),
    Failed(HandshakeError),
}

/// Two-channel handshake state machine.
///
/// Holds partial progress of whichever channel finishes first. Once it
/// reports `Complete` or `Failed` further events are ignored.
#[derive(Debug)]
pub struct HandshakeMachine {
    video: VideoPhase,
    control: ControlPhase,
    header: BytesMut,
    info: Option<DeviceInfo>,
    video_prefix: BytesMut,
    control_prefix: BytesMut,
    state: ConnectionState,
    finished: bool,
}

impl Default for HandshakeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeMachine {
    pub fn new() -> Self {
        HandshakeMachine {
            video: VideoPhase::Connecting,
            control: ControlPhase::Connecting,
            header: BytesMut::with_capacity(DEVICE_INFO_LENGTH),
            info: None,
            video_prefix: BytesMut::new(),
            control_prefix: BytesMut::new(),
            state: ConnectionState::Connecting,
            finished: false,
        }
    }

    /// `Connecting`, `AwaitingPeerHandshake`, `Connected` or `Failed`.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the driver should still wait for `channel` to connect.
    pub fn awaits_connect(&self, channel: Channel) -> bool {
        !self.finished
            && match channel {
                Channel::Video => self.video == VideoPhase::Connecting,
                Channel::Control => self.control == ControlPhase::Connecting,
            }
    }

    /// Whether the driver should read from `channel`.
    pub fn awaits_data(&self, channel: Channel) -> bool {
        !self.finished
            && match channel {
                Channel::Video => matches!(self.video, VideoPhase::Greeting | VideoPhase::Header),
                Channel::Control => self.control == ControlPhase::Greeting,
            }
    }

    fn is_ready(&self, channel: Channel) -> bool {
        match channel {
            Channel::Video => self.video == VideoPhase::Ready,
            Channel::Control => self.control == ControlPhase::Ready,
        }
    }

    pub fn on_event(&mut self, event: HandshakeEvent<'_>) -> HandshakeStep {
        if self.finished {
            return HandshakeStep::Pending;
        }

        match event {
            HandshakeEvent::Connected(Channel::Video) => {
                if self.video == VideoPhase::Connecting {
                    self.video = VideoPhase::Greeting;
                }
            }
            HandshakeEvent::Connected(Channel::Control) => {
                if self.control == ControlPhase::Connecting {
                    self.control = ControlPhase::Greeting;
                }
            }
            HandshakeEvent::Data(Channel::Video, bytes) => {
                if let Err(err) = self.on_video_data(bytes) {
                    return self.fail(Channel::Video, err);
                }
            }
            HandshakeEvent::Data(Channel::Control, bytes) => self.on_control_data(bytes),
            HandshakeEvent::Closed(channel) => {
                let err = self.closed_error(channel);
                return self.fail(channel, err);
            }
            HandshakeEvent::Error(channel, err) => {
                return self.fail(channel, HandshakeError::from_io(channel, &err));
            }
        }

        self.progress()
    }

    /// Classify expiry of the handshake timeout.
    pub fn on_timeout(&mut self, elapsed: Duration) -> HandshakeError {
        self.finished = true;
        self.state = ConnectionState::Failed;
        let reason = format!("timed out after {elapsed:?}");
        match (self.is_ready(Channel::Video), self.is_ready(Channel::Control)) {
            (true, false) => HandshakeError::PartialHandshake {
                ready: Channel::Video,
                failed: Channel::Control,
                reason,
            },
            (false, true) => HandshakeError::PartialHandshake {
                ready: Channel::Control,
                failed: Channel::Video,
                reason,
            },
            _ => HandshakeError::ConnectTimeout(elapsed),
        }
    }

    fn on_video_data(&mut self, mut bytes: &[u8]) -> Result<(), HandshakeError> {
        if self.video == VideoPhase::Greeting {
            if bytes.is_empty() {
                return Ok(());
            }
            bytes = &bytes[GREETING_LENGTH..];
            self.video = VideoPhase::Header;
        }

        match self.video {
            VideoPhase::Header => {
                self.header.extend_from_slice(bytes);
                if self.header.len() >= DEVICE_INFO_LENGTH {
                    let rest = self.header.split_off(DEVICE_INFO_LENGTH);
                    self.info = Some(parse_device_info(&self.header)?);
                    self.video_prefix.extend_from_slice(&rest);
                    self.video = VideoPhase::Ready;
                }
            }
            VideoPhase::Ready => self.video_prefix.extend_from_slice(bytes),
            VideoPhase::Connecting | VideoPhase::Greeting => {}
        }
        Ok(())
    }

    fn on_control_data(&mut self, mut bytes: &[u8]) {
        if self.control == ControlPhase::Greeting {
            if bytes.is_empty() {
                return;
            }
            bytes = &bytes[GREETING_LENGTH..];
            self.control = ControlPhase::Ready;
        }
        if self.control == ControlPhase::Ready {
            self.control_prefix.extend_from_slice(bytes);
        }
    }

    fn progress(&mut self) -> HandshakeStep {
        match (self.is_ready(Channel::Video), self.is_ready(Channel::Control)) {
            (true, true) => match self.info.take() {
                Some(info) => {
                    self.finished = true;
                    self.state = ConnectionState::Connected;
                    HandshakeStep::Complete(HandshakeOutcome {
                        info,
                        video_prefix: self.video_prefix.split().freeze(),
                        control_prefix: self.control_prefix.split().freeze(),
                    })
                }
                None => self.fail(
                    Channel::Video,
                    HandshakeError::HandshakeParse("video ready without header".into()),
                ),
            },
            (false, false) => HandshakeStep::Pending,
            _ => {
                self.state = ConnectionState::AwaitingPeerHandshake;
                HandshakeStep::Pending
            }
        }
    }

    fn closed_error(&self, channel: Channel) -> HandshakeError {
        if channel == Channel::Video && self.video == VideoPhase::Header {
            return HandshakeError::HandshakeParse(format!(
                "video channel closed after {} of {DEVICE_INFO_LENGTH} header bytes",
                self.header.len()
            ));
        }
        HandshakeError::Io {
            channel,
            kind: io::ErrorKind::UnexpectedEof,
            reason: "peer closed the channel mid-handshake".into(),
        }
    }

    /// Fail the whole device. Socket-level failures on one channel after the
    /// other finished are reported as partial; header parse errors keep
    /// their own kind.
    fn fail(&mut self, channel: Channel, cause: HandshakeError) -> HandshakeStep {
        self.finished = true;
        self.state = ConnectionState::Failed;
        let peer = channel.peer();
        let err = match cause {
            HandshakeError::HandshakeParse(_) => cause,
            _ if self.is_ready(peer) && !self.is_ready(channel) => {
                HandshakeError::PartialHandshake {
                    ready: peer,
                    failed: channel,
                    reason: cause.to_string(),
                }
            }
            _ => cause,
        };
        HandshakeStep::Failed(err)
    }
}

// ─── Async Driver ───────────────────────────────────────────────────────────

/// Run one handshake for `params.id` against `connector`.
///
/// Both channels are opened concurrently and read as data arrives; nothing
/// here blocks a thread. On failure or timeout both sockets are dropped.
pub async fn perform(
    connector: &dyn Connector,
    params: &ConnectionParams,
    timeout: Duration,
) -> Result<DeviceSession, HandshakeError> {
    let started = Instant::now();
    let mut machine = HandshakeMachine::new();
    tracing::debug!(device = %params.id, timeout_ms = timeout.as_millis() as u64, "handshake starting");

    let driven = tokio::time::timeout(timeout, drive(connector, &params.id, &mut machine)).await;
    match driven {
        Ok(Ok((outcome, video, control))) => {
            tracing::debug!(
                device = %params.id,
                name = %outcome.info.name,
                width = outcome.info.width,
                height = outcome.info.height,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "handshake complete"
            );
            let channels = SessionChannels {
                video,
                control,
                video_prefix: outcome.video_prefix,
                control_prefix: outcome.control_prefix,
            };
            Ok(DeviceSession::new(params.id.clone(), outcome.info, channels))
        }
        Ok(Err(err)) => {
            tracing::debug!(device = %params.id, error = %err, "handshake failed");
            Err(err)
        }
        Err(_) => {
            let err = machine.on_timeout(started.elapsed());
            tracing::debug!(device = %params.id, error = %err, "handshake timed out");
            Err(err)
        }
    }
}

async fn drive(
    connector: &dyn Connector,
    id: &DeviceId,
    machine: &mut HandshakeMachine,
) -> Result<(HandshakeOutcome, BoxedStream, BoxedStream), HandshakeError> {
    let mut video_open = connector.open(id, Channel::Video);
    let mut control_open = connector.open(id, Channel::Control);
    let mut video: Option<BoxedStream> = None;
    let mut control: Option<BoxedStream> = None;
    let mut video_buf = vec![0u8; VIDEO_READ_CHUNK];
    // One byte at a time: nothing past the greeting is pulled off the wire.
    let mut control_buf = [0u8; GREETING_LENGTH];

    loop {
        let step = tokio::select! {
            opened = &mut video_open, if machine.awaits_connect(Channel::Video) => {
                on_open(machine, Channel::Video, opened, &mut video)
            }
            opened = &mut control_open, if machine.awaits_connect(Channel::Control) => {
                on_open(machine, Channel::Control, opened, &mut control)
            }
            read = read_some(&mut video, &mut video_buf), if machine.awaits_data(Channel::Video) => {
                on_read(machine, Channel::Video, read, &video_buf)
            }
            read = read_some(&mut control, &mut control_buf), if machine.awaits_data(Channel::Control) => {
                on_read(machine, Channel::Control, read, &control_buf)
            }
            else => HandshakeStep::Failed(HandshakeError::Io {
                channel: Channel::Video,
                kind: io::ErrorKind::Other,
                reason: "no channel left to drive".into(),
            }),
        };

        tracing::trace!(device = %id, state = %machine.state(), "handshake step");
        match step {
            HandshakeStep::Pending => continue,
            HandshakeStep::Failed(err) => return Err(err),
            HandshakeStep::Complete(outcome) => {
                return match (video.take(), control.take()) {
                    (Some(v), Some(c)) => Ok((outcome, v, c)),
                    _ => Err(HandshakeError::Io {
                        channel: Channel::Video,
                        kind: io::ErrorKind::NotConnected,
                        reason: "handshake completed without both sockets".into(),
                    }),
                };
            }
        }
    }
}

fn on_open(
    machine: &mut HandshakeMachine,
    channel: Channel,
    opened: io::Result<BoxedStream>,
    slot: &mut Option<BoxedStream>,
) -> HandshakeStep {
    match opened {
        Ok(stream) => {
            *slot = Some(stream);
            machine.on_event(HandshakeEvent::Connected(channel))
        }
        Err(err) => machine.on_event(HandshakeEvent::Error(channel, err)),
    }
}

fn on_read(
    machine: &mut HandshakeMachine,
    channel: Channel,
    read: io::Result<usize>,
    buf: &[u8],
) -> HandshakeStep {
    match read {
        Ok(0) => machine.on_event(HandshakeEvent::Closed(channel)),
        Ok(n) => machine.on_event(HandshakeEvent::Data(channel, &buf[..n])),
        Err(err) => machine.on_event(HandshakeEvent::Error(channel, err)),
    }
}

async fn read_some(stream: &mut Option<BoxedStream>, buf: &mut [u8]) -> io::Result<usize> {
    match stream {
        Some(s) => s.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel7_header() -> Bytes {
        encode_device_info("Pixel7", 1080, 2400)
    }

    #[test]
    fn parse_pixel7_header() {
        let header = pixel7_header();
        assert_eq!(header.len(), DEVICE_INFO_LENGTH);
        let info = parse_device_info(&header).unwrap();
        assert_eq!(info.name, "Pixel7");
        assert_eq!(info.width, 1080);
        assert_eq!(info.height, 2400);
    }

    #[test]
    fn parse_reads_big_endian_dimensions_at_fixed_offsets() {
        let mut raw = vec![0u8; DEVICE_INFO_LENGTH];
        raw[..3].copy_from_slice(b"abc");
        // Reserved bytes are ignored whatever they hold.
        raw[64..68].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        raw[68..72].copy_from_slice(&[0x00, 0x00, 0x04, 0x38]);
        raw[72..76].copy_from_slice(&[0x00, 0x00, 0x09, 0x60]);
        let info = parse_device_info(&raw).unwrap();
        assert_eq!(info.name, "abc");
        assert_eq!((info.width, info.height), (1080, 2400));
    }

    #[test]
    fn parse_forces_terminator_in_last_name_byte() {
        let mut raw = vec![b'x'; DEVICE_INFO_LENGTH];
        raw[68..72].copy_from_slice(&720u32.to_be_bytes());
        raw[72..76].copy_from_slice(&1280u32.to_be_bytes());
        let info = parse_device_info(&raw).unwrap();
        assert_eq!(info.name.len(), DEVICE_NAME_FIELD_LENGTH - 1);
    }

    #[test]
    fn parse_rejects_short_and_zero_sized() {
        let header = pixel7_header();
        assert!(matches!(
            parse_device_info(&header[..DEVICE_INFO_LENGTH - 1]),
            Err(HandshakeError::HandshakeParse(_))
        ));
        let zero = encode_device_info("z", 0, 100);
        assert!(matches!(
            parse_device_info(&zero),
            Err(HandshakeError::HandshakeParse(_))
        ));
    }

    #[test]
    fn encode_truncates_long_names() {
        let long = "n".repeat(200);
        let header = encode_device_info(&long, 10, 20);
        assert_eq!(header.len(), DEVICE_INFO_LENGTH);
        let info = parse_device_info(&header).unwrap();
        assert_eq!(info.name.len(), DEVICE_NAME_FIELD_LENGTH - 1);
    }

    fn video_payload() -> Vec<u8> {
        let mut v = vec![0x01];
        v.extend_from_slice(&pixel7_header());
        v
    }

    #[test]
    fn video_first_then_control() {
        let mut m = HandshakeMachine::new();
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(matches!(m.on_event(HandshakeEvent::Connected(Channel::Video)), HandshakeStep::Pending));
        assert!(matches!(m.on_event(HandshakeEvent::Connected(Channel::Control)), HandshakeStep::Pending));

        let payload = video_payload();
        assert!(matches!(
            m.on_event(HandshakeEvent::Data(Channel::Video, &payload)),
            HandshakeStep::Pending
        ));
        assert_eq!(m.state(), ConnectionState::AwaitingPeerHandshake);

        match m.on_event(HandshakeEvent::Data(Channel::Control, &[0x01])) {
            HandshakeStep::Complete(outcome) => {
                assert_eq!(outcome.info.name, "Pixel7");
                assert_eq!((outcome.info.width, outcome.info.height), (1080, 2400));
                assert!(outcome.video_prefix.is_empty());
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn control_first_then_video_in_fragments() {
        let mut m = HandshakeMachine::new();
        m.on_event(HandshakeEvent::Connected(Channel::Control));
        m.on_event(HandshakeEvent::Data(Channel::Control, &[0x01]));
        assert_eq!(m.state(), ConnectionState::AwaitingPeerHandshake);
        assert!(!m.awaits_data(Channel::Control));

        m.on_event(HandshakeEvent::Connected(Channel::Video));
        let payload = video_payload();
        // Greeting alone, then the header split mid-way.
        assert!(matches!(m.on_event(HandshakeEvent::Data(Channel::Video, &payload[..1])), HandshakeStep::Pending));
        assert!(matches!(m.on_event(HandshakeEvent::Data(Channel::Video, &payload[1..40])), HandshakeStep::Pending));
        assert!(m.awaits_data(Channel::Video));
        match m.on_event(HandshakeEvent::Data(Channel::Video, &payload[40..])) {
            HandshakeStep::Complete(outcome) => assert_eq!(outcome.info.name, "Pixel7"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn bytes_past_header_are_kept() {
        let mut m = HandshakeMachine::new();
        m.on_event(HandshakeEvent::Connected(Channel::Video));
        m.on_event(HandshakeEvent::Connected(Channel::Control));
        m.on_event(HandshakeEvent::Data(Channel::Control, &[0x01]));
        let mut payload = video_payload();
        payload.extend_from_slice(b"\x00\x00\x00\x01frame");
        match m.on_event(HandshakeEvent::Data(Channel::Video, &payload)) {
            HandshakeStep::Complete(outcome) => {
                assert_eq!(&outcome.video_prefix[..], b"\x00\x00\x00\x01frame");
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn control_error_after_video_header_is_partial_failure() {
        let mut m = HandshakeMachine::new();
        m.on_event(HandshakeEvent::Connected(Channel::Video));
        m.on_event(HandshakeEvent::Connected(Channel::Control));
        let payload = video_payload();
        m.on_event(HandshakeEvent::Data(Channel::Video, &payload));

        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        match m.on_event(HandshakeEvent::Error(Channel::Control, err)) {
            HandshakeStep::Failed(HandshakeError::PartialHandshake { ready, failed, .. }) => {
                assert_eq!(ready, Channel::Video);
                assert_eq!(failed, Channel::Control);
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
        assert_eq!(m.state(), ConnectionState::Failed);
        // Late events change nothing.
        assert!(matches!(m.on_event(HandshakeEvent::Data(Channel::Control, &[1])), HandshakeStep::Pending));
        assert_eq!(m.state(), ConnectionState::Failed);
    }

    #[test]
    fn refused_before_anything_is_connect_refused() {
        let mut m = HandshakeMachine::new();
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        match m.on_event(HandshakeEvent::Error(Channel::Video, err)) {
            HandshakeStep::Failed(HandshakeError::ConnectRefused { channel }) => {
                assert_eq!(channel, Channel::Video)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn close_mid_header_is_parse_error() {
        let mut m = HandshakeMachine::new();
        m.on_event(HandshakeEvent::Connected(Channel::Video));
        let payload = video_payload();
        m.on_event(HandshakeEvent::Data(Channel::Video, &payload[..20]));
        match m.on_event(HandshakeEvent::Closed(Channel::Video)) {
            HandshakeStep::Failed(HandshakeError::HandshakeParse(msg)) => {
                assert!(msg.contains("19 of 76"), "{msg}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn timeout_classification() {
        let mut nothing = HandshakeMachine::new();
        assert!(matches!(
            nothing.on_timeout(Duration::from_secs(30)),
            HandshakeError::ConnectTimeout(_)
        ));

        let mut control_only = HandshakeMachine::new();
        control_only.on_event(HandshakeEvent::Connected(Channel::Control));
        control_only.on_event(HandshakeEvent::Data(Channel::Control, &[1]));
        match control_only.on_timeout(Duration::from_secs(30)) {
            HandshakeError::PartialHandshake { ready, failed, .. } => {
                assert_eq!(ready, Channel::Control);
                assert_eq!(failed, Channel::Video);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(control_only.state(), ConnectionState::Failed);
    }

    #[test]
    fn control_bytes_after_greeting_only_from_direct_feeds() {
        let mut m = HandshakeMachine::new();
        m.on_event(HandshakeEvent::Connected(Channel::Video));
        m.on_event(HandshakeEvent::Connected(Channel::Control));
        m.on_event(HandshakeEvent::Data(Channel::Control, b"\x01ctl"));
        match m.on_event(HandshakeEvent::Data(Channel::Video, &video_payload())) {
            HandshakeStep::Complete(outcome) => assert_eq!(&outcome.control_prefix[..], b"ctl"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn perform_leaves_control_bytes_on_the_socket() {
        use crate::transport::{Connector, SimulatedConnector, SimulatedDevice};
        use tokio::io::AsyncReadExt;

        // Control greets once; anything after it belongs to the consumer.
        let sim = SimulatedConnector::new();
        sim.add("d".into(), SimulatedDevice::new("Pixel7", 1080, 2400));
        let params = ConnectionParams::from_profile("d".into(), &crate::tier::select_tier(1));
        let session = perform(&sim as &dyn Connector, &params, Duration::from_secs(5))
            .await
            .unwrap();
        let mut channels = session.take_channels().unwrap();
        assert!(channels.control_prefix.is_empty());

        let mut byte = [0u8; 1];
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            channels.control.read(&mut byte),
        )
        .await;
        assert!(pending.is_err(), "control bytes beyond the greeting");
    }
}

//! # Channel Transport
//!
//! How the handshake reaches a device. A [`Connector`] opens one channel
//! socket for a device identifier; the handshake never learns whether that
//! is a TCP connection to a forwarded port or an in-memory pipe.
//!
//! - [`TcpConnector`]: loopback TCP against ports recorded in a [`PortMap`]
//!   by whatever sets up the forwarding.
//! - [`SimulatedConnector`]: in-process devices built on
//!   [`tokio::io::duplex`], with scripted refusals, stalls and early closes.
//!   Used by tests and by the agent's `--simulate` mode.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::device::{Channel, DeviceId};
use crate::handshake::encode_device_info;
use crate::util::lock_or_recover;

/// Byte stream carrying one channel.
pub trait DeviceStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DeviceStream for T {}

pub type BoxedStream = Box<dyn DeviceStream>;

/// Opens channel sockets towards devices.
pub trait Connector: Send + Sync {
    fn open<'a>(
        &'a self,
        device: &'a DeviceId,
        channel: Channel,
    ) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

// ─── TCP ────────────────────────────────────────────────────────────────────

/// Device → forwarded local port.
#[derive(Debug, Default)]
pub struct PortMap {
    ports: RwLock<HashMap<DeviceId, u16>>,
}

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, device: DeviceId, port: u16) -> Option<u16> {
        self.ports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device, port)
    }

    pub fn release(&self, device: &DeviceId) -> Option<u16> {
        self.ports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device)
    }

    pub fn port_of(&self, device: &DeviceId) -> Option<u16> {
        self.ports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.ports.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connects both channels of a device to the same forwarded port; the
/// device side tells them apart by accept order.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    ports: Arc<PortMap>,
    host: IpAddr,
}

impl TcpConnector {
    pub fn new(ports: Arc<PortMap>) -> Self {
        TcpConnector {
            ports,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn ports(&self) -> &Arc<PortMap> {
        &self.ports
    }
}

impl Connector for TcpConnector {
    fn open<'a>(
        &'a self,
        device: &'a DeviceId,
        channel: Channel,
    ) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let port = self.ports.port_of(device).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no forwarded port for {device}"),
                )
            })?;
            let addr = SocketAddr::new(self.host, port);
            tracing::trace!(%device, %channel, %addr, "opening channel");
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

// ─── Simulation ─────────────────────────────────────────────────────────────

const GREETING: u8 = 0x01;
const SIM_PIPE_CAPACITY: usize = 64 * 1024;

/// Scripted misbehaviour of one simulated channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFault {
    /// Accept the connection but never send anything.
    Stall,
    /// Send only the first `n` handshake bytes, then close.
    CloseAfter(usize),
}

/// A fake device served from memory.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Delay before each channel is accepted.
    pub connect_delay: Duration,
    /// The first `n` attempts are refused on both channels.
    pub refuse_attempts: u32,
    pub video_fault: Option<ChannelFault>,
    pub control_fault: Option<ChannelFault>,
}

impl SimulatedDevice {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        SimulatedDevice {
            name: name.to_string(),
            width,
            height,
            connect_delay: Duration::ZERO,
            refuse_attempts: 0,
            video_fault: None,
            control_fault: None,
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn refusing(mut self, attempts: u32) -> Self {
        self.refuse_attempts = attempts;
        self
    }

    pub fn with_fault(mut self, channel: Channel, fault: ChannelFault) -> Self {
        match channel {
            Channel::Video => self.video_fault = Some(fault),
            Channel::Control => self.control_fault = Some(fault),
        }
        self
    }

    fn handshake_bytes(&self, channel: Channel) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(GREETING);
        if channel == Channel::Video {
            buf.put_slice(&encode_device_info(&self.name, self.width, self.height));
        }
        buf
    }
}

#[derive(Debug)]
struct SimSlot {
    device: SimulatedDevice,
    video_opens: u32,
    control_opens: u32,
}

/// In-memory [`Connector`] over a set of [`SimulatedDevice`]s.
#[derive(Debug, Default)]
pub struct SimulatedConnector {
    devices: Mutex<HashMap<DeviceId, SimSlot>>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` well-behaved devices named `{prefix}-{n}`.
    pub fn fleet(prefix: &str, count: usize, connect_delay: Duration) -> Self {
        let sim = Self::new();
        for n in 0..count {
            let id = format!("{prefix}-{n}");
            sim.add(
                DeviceId::from(id.as_str()),
                SimulatedDevice::new(&id, 1080, 2400).with_connect_delay(connect_delay),
            );
        }
        sim
    }

    pub fn add(&self, id: DeviceId, device: SimulatedDevice) {
        lock_or_recover(&self.devices).insert(
            id,
            SimSlot {
                device,
                video_opens: 0,
                control_opens: 0,
            },
        );
    }

    /// Identifiers of every simulated device, sorted.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = lock_or_recover(&self.devices).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// How many times `channel` of `device` was opened, refusals included.
    pub fn opens(&self, device: &DeviceId, channel: Channel) -> u32 {
        lock_or_recover(&self.devices)
            .get(device)
            .map(|slot| match channel {
                Channel::Video => slot.video_opens,
                Channel::Control => slot.control_opens,
            })
            .unwrap_or(0)
    }

    /// Video opens across all devices, i.e. handshake attempts started.
    pub fn total_attempts(&self) -> u32 {
        lock_or_recover(&self.devices)
            .values()
            .map(|slot| slot.video_opens)
            .sum()
    }
}

impl SimulatedConnector {
    /// Count the open and snapshot the device. Runs when `open` is called,
    /// not when its future is first polled, so every attempt is counted on
    /// both channels.
    fn check_out(&self, device: &DeviceId, channel: Channel) -> io::Result<(SimulatedDevice, u32)> {
        let mut devices = lock_or_recover(&self.devices);
        let slot = devices.get_mut(device).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no simulated device {device}"),
            )
        })?;
        let counter = match channel {
            Channel::Video => &mut slot.video_opens,
            Channel::Control => &mut slot.control_opens,
        };
        *counter += 1;
        Ok((slot.device.clone(), *counter))
    }
}

impl Connector for SimulatedConnector {
    fn open<'a>(
        &'a self,
        device: &'a DeviceId,
        channel: Channel,
    ) -> BoxFuture<'a, io::Result<BoxedStream>> {
        let checked_out = self.check_out(device, channel);
        Box::pin(async move {
            let (sim, attempt) = checked_out?;

            if !sim.connect_delay.is_zero() {
                tokio::time::sleep(sim.connect_delay).await;
            }
            if attempt <= sim.refuse_attempts {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "simulated refusal",
                ));
            }

            let fault = match channel {
                Channel::Video => sim.video_fault,
                Channel::Control => sim.control_fault,
            };
            let payload = sim.handshake_bytes(channel);
            let (client, server) = tokio::io::duplex(SIM_PIPE_CAPACITY);
            tokio::spawn(serve_channel(server, payload, fault));
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

/// Device side of one simulated channel: write the handshake bytes, then
/// hold the pipe open until the client drops it.
async fn serve_channel(
    mut server: tokio::io::DuplexStream,
    payload: BytesMut,
    fault: Option<ChannelFault>,
) {
    let send = match fault {
        Some(ChannelFault::Stall) => 0,
        Some(ChannelFault::CloseAfter(n)) => n.min(payload.len()),
        None => payload.len(),
    };
    if server.write_all(&payload[..send]).await.is_err() {
        return;
    }
    if matches!(fault, Some(ChannelFault::CloseAfter(_))) {
        return;
    }
    let mut sink = [0u8; 256];
    while let Ok(n) = server.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
}

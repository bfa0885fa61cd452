//! # farm-core
//!
//! Connection core for a screen-mirroring device farm.
//!
//! Connects batches of devices reachable over a local TCP forwarding layer,
//! each through a two-socket binary handshake, under a concurrency cap that
//! shrinks as the fleet grows. Live sessions are pooled and reused; failed
//! handshakes are retried with jittered exponential backoff.
//!
//! ## Crate structure
//!
//! - [`tier`]: Fleet size → quality profile and concurrency cap
//! - [`retry`]: Backoff and attempt budget
//! - [`handshake`]: Device-info header codec, handshake state machine and driver
//! - [`transport`]: `Connector` seam: loopback TCP and simulated devices
//! - [`session`]: Live two-channel session handle
//! - [`pool`]: Session pool: reuse, idle sweep, LRU eviction
//! - [`orchestrator`]: Batch scheduler with bounded concurrency
//! - [`config`]: TOML configuration
//! - [`metrics`]: Prometheus text rendering
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use farm_core::{ConnectionPool, FarmConfig, Orchestrator, PortMap, TcpConnector};
//!
//! # async fn run() {
//! let config = FarmConfig::default();
//! let ports = Arc::new(PortMap::new());
//! ports.assign("emulator-5554".into(), 27183);
//!
//! let pool = Arc::new(ConnectionPool::from_config(&config, Arc::new(TcpConnector::new(ports))));
//! let orchestrator = Orchestrator::new(&config, pool);
//! let report = orchestrator.connect_devices(vec!["emulator-5554".into()]).await;
//! println!("{} connected, {} abandoned", report.successful, report.failed);
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod handshake;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod retry;
pub mod session;
pub mod tier;
pub mod transport;

mod util;

pub use config::{FarmConfig, PoolConfig};
pub use device::{Channel, ConnectionParams, ConnectionState, DeviceId};
pub use error::{ConfigError, DeviceError, HandshakeError};
pub use handshake::DeviceInfo;
pub use orchestrator::{BatchEvent, BatchProgress, BatchReport, Orchestrator};
pub use pool::{ConnectionPool, PoolEvent, PoolStats, RemovalReason};
pub use retry::RetryPolicy;
pub use session::{DeviceSession, SessionHandle};
pub use tier::{select_tier, QualityProfile};
pub use transport::{Connector, PortMap, SimulatedConnector, SimulatedDevice, TcpConnector};

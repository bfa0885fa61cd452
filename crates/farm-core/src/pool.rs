//! # Connection Pool
//!
//! Owns every live [`DeviceSession`], keyed by device identifier. At most
//! one session exists per identifier.
//!
//! - `acquire` hands out an idle session again without a new handshake,
//!   or runs one and registers the result.
//! - `release` marks a session idle; its sockets stay open for reuse.
//! - `sweep` closes sessions idle for longer than the idle timeout.
//! - Registration at capacity evicts the least-recently-used idle session.
//!   With no idle victim the registration still goes through and the pool
//!   runs over its soft limit.
//!
//! All map mutation happens under one mutex; nothing awaits while holding
//! it, so a handshake in progress never blocks `release` or `sweep`.
//!
//! At most one handshake per identifier runs at a time. Whoever starts one
//! holds a [`HandshakeClaim`]; everyone else gets a [`HandshakeWait`] and
//! looks at the pool again once the claim is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{FarmConfig, PoolConfig};
use crate::device::{ConnectionParams, DeviceId};
use crate::error::HandshakeError;
use crate::handshake;
use crate::session::{DeviceSession, SessionHandle};
use crate::transport::Connector;
use crate::util::lock_or_recover;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

// ─── Events & Stats ─────────────────────────────────────────────────────────

/// Why a session left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Explicit,
    IdleTimeout,
    Evicted,
}

/// Pool lifecycle notifications, delivered over a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    Acquired { id: DeviceId, reused: bool },
    Released { id: DeviceId },
    Removed { id: DeviceId, reason: RemovalReason },
    /// A registration found the pool at capacity.
    LimitReached { max_connections: usize },
    MemoryWarning { estimated_bytes: u64 },
}

/// Point-in-time pool statistics for status surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub total_usage: u64,
    pub active_identifiers: Vec<DeviceId>,
    pub max_connections: usize,
    pub estimated_memory_bytes: u64,
}

// ─── Entries ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PooledSession {
    params: ConnectionParams,
    handle: SessionHandle,
    in_use: bool,
    usage_count: u64,
    last_used_at: Instant,
}

#[derive(Debug)]
struct PoolInner {
    sessions: HashMap<DeviceId, PooledSession>,
    max_connections: usize,
    idle_timeout: Duration,
}

impl PoolInner {
    fn lru_idle(&self) -> Option<DeviceId> {
        self.sessions
            .iter()
            .filter(|(_, s)| !s.in_use)
            .min_by_key(|(_, s)| s.last_used_at)
            .map(|(id, _)| id.clone())
    }
}

// ─── Handshake Claims ───────────────────────────────────────────────────────

/// Exclusive right to handshake one device. Released on drop, so register
/// the session before letting go of it.
pub struct HandshakeClaim<'a> {
    pool: &'a ConnectionPool,
    id: DeviceId,
    // Dropping the sender wakes every waiter.
    _done: watch::Sender<()>,
}

impl HandshakeClaim<'_> {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }
}

impl Drop for HandshakeClaim<'_> {
    fn drop(&mut self) {
        lock_or_recover(&self.pool.inflight).remove(&self.id);
    }
}

impl std::fmt::Debug for HandshakeClaim<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeClaim").field("id", &self.id).finish()
    }
}

/// Handle on a handshake someone else is running.
#[derive(Debug)]
pub struct HandshakeWait(watch::Receiver<()>);

impl HandshakeWait {
    /// Resolves once the other handshake has finished, successfully or not.
    pub async fn finished(mut self) {
        while self.0.changed().await.is_ok() {}
    }
}

#[derive(Debug)]
pub enum Claim<'a> {
    Claimed(HandshakeClaim<'a>),
    InFlight(HandshakeWait),
}

// ─── Pool ───────────────────────────────────────────────────────────────────

pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    inflight: Mutex<HashMap<DeviceId, watch::Receiver<()>>>,
    bytes_per_connection: u64,
    memory_warning_bytes: u64,
    connector: Arc<dyn Connector>,
    handshake_timeout: Duration,
    events: broadcast::Sender<PoolEvent>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        handshake_timeout: Duration,
    ) -> Self {
        Self::build(config, connector, handshake_timeout, DEFAULT_EVENT_CAPACITY)
    }

    pub fn from_config(config: &FarmConfig, connector: Arc<dyn Connector>) -> Self {
        Self::build(
            config.pool.clone(),
            connector,
            config.handshake_timeout,
            config.event_capacity,
        )
    }

    fn build(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        handshake_timeout: Duration,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        ConnectionPool {
            inner: Mutex::new(PoolInner {
                sessions: HashMap::new(),
                max_connections: config.max_connections.max(1),
                idle_timeout: config.idle_timeout,
            }),
            inflight: Mutex::new(HashMap::new()),
            bytes_per_connection: config.bytes_per_connection,
            memory_warning_bytes: config.memory_warning_bytes,
            connector,
            handshake_timeout,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ─── Acquire / Release ──────────────────────────────────────────────

    /// Session for `params.id`: a pooled one if present, else a fresh
    /// handshake registered in-use. Concurrent callers for the same id
    /// share one handshake; if it fails, the next waiter runs its own.
    pub async fn acquire(&self, params: ConnectionParams) -> Result<SessionHandle, HandshakeError> {
        loop {
            if let Some(handle) = self.try_reuse(&params.id) {
                return Ok(handle);
            }
            match self.claim_handshake(&params.id) {
                Claim::Claimed(claim) => {
                    // Registered between the lookup and the claim.
                    if let Some(handle) = self.try_reuse(&params.id) {
                        return Ok(handle);
                    }
                    let session =
                        handshake::perform(self.connector.as_ref(), &params, self.handshake_timeout)
                            .await?;
                    let handle = self.register(params, session);
                    drop(claim);
                    return Ok(handle);
                }
                Claim::InFlight(wait) => {
                    tracing::debug!(device = %params.id, "handshake already in flight, waiting");
                    wait.finished().await;
                }
            }
        }
    }

    /// Take the handshake slot for `id`, or learn that it is taken.
    pub fn claim_handshake(&self, id: &DeviceId) -> Claim<'_> {
        let mut inflight = lock_or_recover(&self.inflight);
        if let Some(rx) = inflight.get(id) {
            return Claim::InFlight(HandshakeWait(rx.clone()));
        }
        let (tx, rx) = watch::channel(());
        inflight.insert(id.clone(), rx);
        Claim::Claimed(HandshakeClaim {
            pool: self,
            id: id.clone(),
            _done: tx,
        })
    }

    /// Whether a handshake for `id` is currently running.
    pub fn is_handshaking(&self, id: &DeviceId) -> bool {
        lock_or_recover(&self.inflight).contains_key(id)
    }

    /// The pooled session for `id`, if any, marked in-use.
    ///
    /// Asking for a session that is already in use returns the same handle
    /// and logs a warning.
    pub fn try_reuse(&self, id: &DeviceId) -> Option<SessionHandle> {
        let handle = {
            let mut inner = lock_or_recover(&self.inner);
            let entry = inner.sessions.get_mut(id)?;
            if entry.in_use {
                tracing::warn!(device = %id, "acquire for a session already in use, returning existing handle");
                return Some(entry.handle.clone());
            }
            entry.in_use = true;
            entry.usage_count += 1;
            entry.last_used_at = Instant::now();
            tracing::debug!(device = %id, usage = entry.usage_count, "reusing pooled session");
            entry.handle.clone()
        };
        self.emit(PoolEvent::Acquired {
            id: id.clone(),
            reused: true,
        });
        Some(handle)
    }

    /// Add a freshly handshaken session, in use.
    ///
    /// If a session for the same identifier was registered meanwhile, that
    /// one is kept and `session` is closed.
    pub fn register(&self, params: ConnectionParams, session: DeviceSession) -> SessionHandle {
        let id = params.id.clone();
        let mut events = Vec::new();
        let mut evicted: Option<SessionHandle> = None;

        let (handle, total) = {
            let mut inner = lock_or_recover(&self.inner);

            if let Some(existing) = inner.sessions.get_mut(&id) {
                tracing::warn!(device = %id, "session registered twice, keeping the pooled one");
                existing.in_use = true;
                existing.usage_count += 1;
                existing.last_used_at = Instant::now();
                let handle = existing.handle.clone();
                drop(inner);
                session.close();
                return handle;
            }

            if inner.sessions.len() >= inner.max_connections {
                let max_connections = inner.max_connections;
                events.push(PoolEvent::LimitReached { max_connections });
                match inner.lru_idle() {
                    Some(victim) => {
                        if let Some(old) = inner.sessions.remove(&victim) {
                            tracing::info!(device = %victim, max_connections, "evicting least recently used idle session");
                            evicted = Some(old.handle);
                            events.push(PoolEvent::Removed {
                                id: victim,
                                reason: RemovalReason::Evicted,
                            });
                        }
                    }
                    None => {
                        tracing::warn!(
                            device = %id,
                            max_connections,
                            "pool at capacity with no idle session to evict, exceeding soft limit"
                        );
                    }
                }
            }

            let handle: SessionHandle = Arc::new(session);
            inner.sessions.insert(
                id.clone(),
                PooledSession {
                    params,
                    handle: handle.clone(),
                    in_use: true,
                    usage_count: 1,
                    last_used_at: Instant::now(),
                },
            );
            (handle, inner.sessions.len())
        };

        if let Some(old) = evicted {
            old.close();
        }

        tracing::info!(
            device = %id,
            name = %handle.info().name,
            width = handle.info().width,
            height = handle.info().height,
            total,
            "session registered"
        );
        events.push(PoolEvent::Acquired {
            id,
            reused: false,
        });

        let estimated_bytes = total as u64 * self.bytes_per_connection;
        if estimated_bytes > self.memory_warning_bytes {
            tracing::warn!(
                estimated_bytes,
                threshold = self.memory_warning_bytes,
                sessions = total,
                "estimated session memory above warning threshold"
            );
            events.push(PoolEvent::MemoryWarning { estimated_bytes });
        }

        for event in events {
            self.emit(event);
        }
        handle
    }

    /// Mark the session idle. Sockets stay open. Returns whether a session
    /// was in use.
    pub fn release(&self, id: &DeviceId) -> bool {
        {
            let mut inner = lock_or_recover(&self.inner);
            match inner.sessions.get_mut(id) {
                Some(entry) if entry.in_use => {
                    entry.in_use = false;
                    entry.last_used_at = Instant::now();
                }
                Some(_) => {
                    tracing::debug!(device = %id, "release of an already idle session");
                    return false;
                }
                None => {
                    tracing::warn!(device = %id, "release of unknown session");
                    return false;
                }
            }
        }
        self.emit(PoolEvent::Released { id: id.clone() });
        true
    }

    /// Close and forget the session, in use or not.
    pub fn remove(&self, id: &DeviceId) -> Option<SessionHandle> {
        let removed = lock_or_recover(&self.inner).sessions.remove(id);
        match removed {
            Some(entry) => {
                entry.handle.close();
                tracing::info!(device = %id, usage = entry.usage_count, "session removed");
                self.emit(PoolEvent::Removed {
                    id: id.clone(),
                    reason: RemovalReason::Explicit,
                });
                Some(entry.handle)
            }
            None => {
                tracing::warn!(device = %id, "remove of unknown session");
                None
            }
        }
    }

    /// Close every idle session whose idle time exceeds the idle timeout.
    /// In-use sessions are never touched. Returns how many were closed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(DeviceId, SessionHandle)> = {
            let mut inner = lock_or_recover(&self.inner);
            let idle_timeout = inner.idle_timeout;
            let ids: Vec<DeviceId> = inner
                .sessions
                .iter()
                .filter(|(_, s)| !s.in_use && now.duration_since(s.last_used_at) > idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.sessions.remove(&id).map(|s| (id, s.handle)))
                .collect()
        };

        for (id, handle) in &expired {
            handle.close();
            tracing::debug!(device = %id, "idle session expired");
            self.emit(PoolEvent::Removed {
                id: id.clone(),
                reason: RemovalReason::IdleTimeout,
            });
        }
        if !expired.is_empty() {
            tracing::info!(expired = expired.len(), remaining = self.total_count(), "idle sweep");
        }
        expired.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` flips
    /// to `true` or its sender is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("pool sweeper stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    // ─── Runtime Knobs ──────────────────────────────────────────────────

    pub fn set_max_connections(&self, max_connections: usize) {
        lock_or_recover(&self.inner).max_connections = max_connections.max(1);
    }

    pub fn max_connections(&self) -> usize {
        lock_or_recover(&self.inner).max_connections
    }

    pub fn set_idle_timeout(&self, idle_timeout: Duration) {
        lock_or_recover(&self.inner).idle_timeout = idle_timeout;
    }

    pub fn idle_timeout(&self) -> Duration {
        lock_or_recover(&self.inner).idle_timeout
    }

    /// Whether a new session fits under the soft limit.
    pub fn can_acquire_new_connection(&self) -> bool {
        let inner = lock_or_recover(&self.inner);
        inner.sessions.len() < inner.max_connections
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn active_count(&self) -> usize {
        lock_or_recover(&self.inner)
            .sessions
            .values()
            .filter(|s| s.in_use)
            .count()
    }

    pub fn idle_count(&self) -> usize {
        lock_or_recover(&self.inner)
            .sessions
            .values()
            .filter(|s| !s.in_use)
            .count()
    }

    pub fn total_count(&self) -> usize {
        lock_or_recover(&self.inner).sessions.len()
    }

    pub fn total_usage_count(&self) -> u64 {
        lock_or_recover(&self.inner)
            .sessions
            .values()
            .map(|s| s.usage_count)
            .sum()
    }

    /// In-use identifiers, sorted.
    pub fn active_identifiers(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = lock_or_recover(&self.inner)
            .sessions
            .iter()
            .filter(|(_, s)| s.in_use)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        lock_or_recover(&self.inner).sessions.contains_key(id)
    }

    pub fn is_in_use(&self, id: &DeviceId) -> bool {
        lock_or_recover(&self.inner)
            .sessions
            .get(id)
            .is_some_and(|s| s.in_use)
    }

    pub fn usage_count(&self, id: &DeviceId) -> Option<u64> {
        lock_or_recover(&self.inner)
            .sessions
            .get(id)
            .map(|s| s.usage_count)
    }

    /// Parameters the pooled session for `id` was established with.
    pub fn params_of(&self, id: &DeviceId) -> Option<ConnectionParams> {
        lock_or_recover(&self.inner)
            .sessions
            .get(id)
            .map(|s| s.params.clone())
    }

    pub fn estimated_memory_bytes(&self) -> u64 {
        self.total_count() as u64 * self.bytes_per_connection
    }

    pub fn snapshot(&self) -> PoolStats {
        let inner = lock_or_recover(&self.inner);
        let mut stats = PoolStats {
            max_connections: inner.max_connections,
            total: inner.sessions.len(),
            ..Default::default()
        };
        for (id, s) in &inner.sessions {
            stats.total_usage += s.usage_count;
            if s.in_use {
                stats.active += 1;
                stats.active_identifiers.push(id.clone());
            } else {
                stats.idle += 1;
            }
        }
        stats.active_identifiers.sort();
        stats.estimated_memory_bytes = stats.total as u64 * self.bytes_per_connection;
        stats
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.snapshot();
        f.debug_struct("ConnectionPool")
            .field("active", &stats.active)
            .field("idle", &stats.idle)
            .field("max_connections", &stats.max_connections)
            .finish_non_exhaustive()
    }
}

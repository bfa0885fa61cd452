//! # Connection Orchestrator
//!
//! Connects a batch of devices under a concurrency cap.
//!
//! ```text
//!   connect_devices(ids)
//!     │  dedupe, pick profile + cap from batch size (once)
//!     │  in-use ids count as connected, the rest are queued in order
//!     ▼
//!   ┌──────── drain loop ─────────────────────────────────────────┐
//!   │ while active < cap: pop front                               │
//!   │     pooled idle session? reuse, Connected                   │
//!   │     handshake running elsewhere? wait for it, then re-queue │
//!   │     else start a handshake (Connecting)                     │
//!   │ wait for the next in-flight future:                         │
//!   │     handshake ok    → register with pool, Connected         │
//!   │     handshake err   → attempts left? Retrying + backoff     │
//!   │                       else Abandoned                        │
//!   │     backoff elapsed → back of the queue (Queued)            │
//!   │     other handshake done → back of the queue                │
//!   └──────────── until the queue and in-flight set are empty ────┘
//! ```
//!
//! Handshakes and backoff timers are futures polled together from the
//! caller's task; a stalled device occupies one slot until its handshake
//! timeout and never blocks the rest. Per-device failures end up in the
//! [`BatchReport`], never as an `Err`.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::FarmConfig;
use crate::device::{ConnectionParams, ConnectionState, DeviceId};
use crate::error::{serialize_display, DeviceError, HandshakeError};
use crate::handshake;
use crate::pool::{Claim, ConnectionPool, HandshakeClaim};
use crate::retry::{RetryPolicy, RetryRecord};
use crate::session::DeviceSession;
use crate::tier::{ConcurrencyTable, QualityProfile, TierTable};
use crate::util::lock_or_recover;

// ─── Events & Report ────────────────────────────────────────────────────────

/// Batch counters, emitted after every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub batch: u64,
    /// Connected plus abandoned.
    pub completed: usize,
    pub total: usize,
    /// Abandoned so far.
    pub failed: usize,
    pub queued: usize,
    pub active: usize,
    /// Failed devices still waiting out their backoff.
    pub retrying: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        batch: u64,
        total: usize,
        profile: QualityProfile,
        concurrency_cap: usize,
    },
    StateChanged {
        batch: u64,
        id: DeviceId,
        state: ConnectionState,
        attempt: u32,
    },
    Progress(BatchProgress),
    Completed {
        batch: u64,
        successful: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbandonedDevice {
    pub id: DeviceId,
    #[serde(serialize_with = "serialize_display")]
    pub error: DeviceError,
}

/// Outcome of one `connect_devices` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch: u64,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub profile: QualityProfile,
    pub concurrency_cap: usize,
    /// Most handshakes observed in flight at once.
    pub peak_in_flight: usize,
    /// Handshakes started, retries included.
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub abandoned: Vec<AbandonedDevice>,
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

enum TaskOutcome<'a> {
    Handshake {
        params: ConnectionParams,
        attempt: u32,
        result: Result<DeviceSession, HandshakeError>,
        // Held until the session is registered.
        claim: HandshakeClaim<'a>,
    },
    RetryDue(DeviceId),
    /// A handshake for this id started elsewhere has finished.
    PeerSettled(DeviceId),
}

/// Per-call bookkeeping. Lives on the `connect_devices` stack only.
struct BatchRun {
    batch: u64,
    total: usize,
    queue: VecDeque<DeviceId>,
    active: usize,
    peak_in_flight: usize,
    connected: usize,
    attempts: HashMap<DeviceId, u32>,
    retries: HashMap<DeviceId, RetryRecord>,
    abandoned: Vec<AbandonedDevice>,
    total_attempts: u32,
}

impl BatchRun {
    fn progress(&self) -> BatchProgress {
        BatchProgress {
            batch: self.batch,
            completed: self.connected + self.abandoned.len(),
            total: self.total,
            failed: self.abandoned.len(),
            queued: self.queue.len(),
            active: self.active,
            retrying: {
                let now = Instant::now();
                self.retries
                    .values()
                    .filter(|r| r.next_attempt_at > now)
                    .count()
            },
        }
    }
}

pub struct Orchestrator {
    pool: Arc<ConnectionPool>,
    tiers: TierTable,
    concurrency: ConcurrencyTable,
    retry: RetryPolicy,
    events: broadcast::Sender<BatchEvent>,
    states: Mutex<HashMap<DeviceId, ConnectionState>>,
    batch_seq: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: &FarmConfig, pool: Arc<ConnectionPool>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Orchestrator {
            pool,
            tiers: config.tiers.clone(),
            concurrency: config.concurrency.clone(),
            retry: config.retry.clone(),
            events,
            states: Mutex::new(HashMap::new()),
            batch_seq: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Last state recorded for `id` by any batch.
    pub fn state_of(&self, id: &DeviceId) -> Option<ConnectionState> {
        lock_or_recover(&self.states).get(id).copied()
    }

    /// Connect every identifier in `ids` and wait for the batch to settle.
    ///
    /// Duplicate identifiers are connected once. Order of completion is
    /// unspecified.
    pub async fn connect_devices(&self, ids: Vec<DeviceId>) -> BatchReport {
        let batch = self.batch_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();

        let mut seen = HashSet::new();
        let ids: Vec<DeviceId> = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
        let total = ids.len();

        let profile = self.tiers.select(total).clone();
        let cap = self.concurrency.cap_for(total);
        let timeout = self.pool.handshake_timeout();

        tracing::info!(
            batch,
            total,
            tier = %profile.tier_label,
            resolution = profile.resolution,
            bitrate = profile.bit_rate_bps,
            fps = profile.max_fps,
            cap,
            "batch started"
        );
        self.emit(BatchEvent::Started {
            batch,
            total,
            profile: profile.clone(),
            concurrency_cap: cap,
        });

        let mut run = BatchRun {
            batch,
            total,
            queue: VecDeque::with_capacity(total),
            active: 0,
            peak_in_flight: 0,
            connected: 0,
            attempts: HashMap::new(),
            retries: HashMap::new(),
            abandoned: Vec::new(),
            total_attempts: 0,
        };

        for id in ids {
            if self.pool.is_in_use(&id) {
                tracing::debug!(batch, device = %id, "already connected, skipping handshake");
                run.connected += 1;
                self.transition(&run, &id, ConnectionState::Connected, 0);
            } else {
                run.queue.push_back(id.clone());
                self.transition(&run, &id, ConnectionState::Queued, 0);
            }
        }

        let pool = self.pool.as_ref();
        let connector = pool.connector().as_ref();
        let mut in_flight: FuturesUnordered<BoxFuture<'_, TaskOutcome<'_>>> =
            FuturesUnordered::new();

        loop {
            while run.active < cap {
                let Some(id) = run.queue.pop_front() else {
                    break;
                };

                if pool.try_reuse(&id).is_some() {
                    self.reused(&mut run, &id);
                    continue;
                }

                let claim = match pool.claim_handshake(&id) {
                    // Registered by another caller between the lookup and the claim.
                    Claim::Claimed(_) if pool.try_reuse(&id).is_some() => {
                        self.reused(&mut run, &id);
                        continue;
                    }
                    Claim::Claimed(claim) => claim,
                    Claim::InFlight(wait) => {
                        tracing::debug!(batch, device = %id, "handshake already in flight elsewhere, waiting");
                        in_flight.push(Box::pin(async move {
                            wait.finished().await;
                            TaskOutcome::PeerSettled(id)
                        }));
                        continue;
                    }
                };

                let attempt = run.attempts.get(&id).copied().unwrap_or(0) + 1;
                run.attempts.insert(id.clone(), attempt);
                run.active += 1;
                run.peak_in_flight = run.peak_in_flight.max(run.active);
                run.total_attempts += 1;
                self.transition(&run, &id, ConnectionState::Connecting, attempt);

                let params = ConnectionParams::from_profile(id, &profile);
                in_flight.push(Box::pin(async move {
                    let result = AssertUnwindSafe(handshake::perform(connector, &params, timeout))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(HandshakeError::Panicked(panic_message(&*panic))));
                    TaskOutcome::Handshake {
                        params,
                        attempt,
                        result,
                        claim,
                    }
                }));
            }

            let Some(outcome) = in_flight.next().await else {
                if run.queue.is_empty() {
                    break;
                }
                continue;
            };

            match outcome {
                TaskOutcome::Handshake {
                    params,
                    attempt,
                    result,
                    claim,
                } => {
                    run.active -= 1;
                    let id = params.id.clone();
                    match result {
                        Ok(session) => {
                            self.pool.register(params, session);
                            drop(claim);
                            run.retries.remove(&id);
                            run.connected += 1;
                            tracing::debug!(batch, device = %id, attempt, "device connected");
                            self.transition(&run, &id, ConnectionState::Connected, attempt);
                        }
                        Err(err) => {
                            drop(claim);
                            self.transition(&run, &id, ConnectionState::Failed, attempt);
                            if self.retry.should_retry(attempt) {
                                let delay = self.retry.backoff_delay(attempt);
                                let next_attempt_at = Instant::now() + delay;
                                tracing::warn!(
                                    batch,
                                    device = %id,
                                    attempt,
                                    max_attempts = self.retry.max_attempts,
                                    delay_ms = delay.as_millis() as u64,
                                    error = %err,
                                    "handshake failed, retrying"
                                );
                                run.retries.insert(
                                    id.clone(),
                                    RetryRecord {
                                        id: id.clone(),
                                        attempt_count: attempt,
                                        next_attempt_at,
                                        last_error: err,
                                    },
                                );
                                self.transition(&run, &id, ConnectionState::Retrying, attempt);
                                in_flight.push(Box::pin(async move {
                                    tokio::time::sleep_until(next_attempt_at).await;
                                    TaskOutcome::RetryDue(id)
                                }));
                            } else {
                                tracing::warn!(
                                    batch,
                                    device = %id,
                                    attempts = attempt,
                                    error = %err,
                                    "handshake failed, abandoning device"
                                );
                                run.retries.remove(&id);
                                run.abandoned.push(AbandonedDevice {
                                    id: id.clone(),
                                    error: DeviceError::RetryExhausted {
                                        attempts: attempt,
                                        last: err,
                                    },
                                });
                                self.transition(&run, &id, ConnectionState::Abandoned, attempt);
                            }
                        }
                    }
                }
                TaskOutcome::RetryDue(id) => {
                    let attempt = match run.retries.get(&id) {
                        Some(record) => {
                            tracing::debug!(
                                batch,
                                device = %id,
                                attempt = record.attempt_count,
                                late_ms = Instant::now()
                                    .saturating_duration_since(record.next_attempt_at)
                                    .as_millis() as u64,
                                last_error = %record.last_error,
                                "retry due"
                            );
                            record.attempt_count
                        }
                        None => 0,
                    };
                    run.queue.push_back(id.clone());
                    self.transition(&run, &id, ConnectionState::Queued, attempt);
                }
                TaskOutcome::PeerSettled(id) => {
                    run.queue.push_back(id);
                }
            }
        }

        let report = BatchReport {
            batch,
            total,
            successful: run.connected,
            failed: run.abandoned.len(),
            profile,
            concurrency_cap: cap,
            peak_in_flight: run.peak_in_flight,
            attempts: run.total_attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
            abandoned: run.abandoned,
        };
        tracing::info!(
            batch,
            successful = report.successful,
            failed = report.failed,
            attempts = report.attempts,
            peak_in_flight = report.peak_in_flight,
            elapsed_ms = report.elapsed_ms,
            "batch completed"
        );
        self.emit(BatchEvent::Completed {
            batch,
            successful: report.successful,
            failed: report.failed,
        });
        report
    }

    fn reused(&self, run: &mut BatchRun, id: &DeviceId) {
        tracing::debug!(batch = run.batch, device = %id, "reused pooled session");
        run.retries.remove(id);
        run.connected += 1;
        self.transition(run, id, ConnectionState::Connected, 0);
    }

    fn transition(&self, run: &BatchRun, id: &DeviceId, state: ConnectionState, attempt: u32) {
        lock_or_recover(&self.states).insert(id.clone(), state);
        self.emit(BatchEvent::StateChanged {
            batch: run.batch,
            id: id.clone(),
            state,
            attempt,
        });
        self.emit(BatchEvent::Progress(run.progress()));
    }

    fn emit(&self, event: BatchEvent) {
        let _ = self.events.send(event);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimulatedConnector, SimulatedDevice};
    use std::time::Duration;

    fn orchestrator(sim: SimulatedConnector, config: FarmConfig) -> Orchestrator {
        let pool = Arc::new(ConnectionPool::from_config(&config, Arc::new(sim)));
        Orchestrator::new(&config, pool)
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_completes_immediately() {
        let orch = orchestrator(SimulatedConnector::new(), FarmConfig::default());
        let report = orch.connect_devices(Vec::new()).await;
        assert_eq!(report.total, 0);
        assert_eq!(report.successful, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(report.attempts, 0);
        assert_eq!(report.profile.tier_label, "Ultra");
    }

    #[tokio::test(start_paused = true)]
    async fn progress_reports_completed_and_failed() {
        let sim = SimulatedConnector::new();
        sim.add("ok".into(), SimulatedDevice::new("ok", 720, 1280));
        sim.add("bad".into(), SimulatedDevice::new("bad", 720, 1280).refusing(u32::MAX));
        let orch = orchestrator(sim, FarmConfig::default());
        let mut events = orch.subscribe();

        let report = orch.connect_devices(vec!["ok".into(), "bad".into()]).await;
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);

        let mut last_progress = None;
        let mut completed = None;
        while let Ok(event) = events.try_recv() {
            match event {
                BatchEvent::Progress(p) => {
                    assert!(p.completed <= p.total);
                    assert!(p.failed <= p.completed);
                    last_progress = Some(p);
                }
                BatchEvent::Completed { successful, failed, .. } => completed = Some((successful, failed)),
                _ => {}
            }
        }
        let p = last_progress.unwrap();
        assert_eq!((p.completed, p.total, p.failed), (2, 2, 1));
        assert_eq!(completed, Some((1, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_abandons_on_first_failure() {
        let sim = SimulatedConnector::new();
        sim.add("x".into(), SimulatedDevice::new("x", 720, 1280).refusing(1));
        let mut config = FarmConfig::default();
        config.retry.max_attempts = 1;
        let orch = orchestrator(sim, config);
        let report = orch.connect_devices(vec!["x".into()]).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.attempts, 1);
        assert!(matches!(
            report.abandoned[0].error,
            DeviceError::RetryExhausted { attempts: 1, .. }
        ));
        assert_eq!(orch.state_of(&"x".into()), Some(ConnectionState::Abandoned));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_is_retried_then_abandoned() {
        let sim = SimulatedConnector::new();
        sim.add(
            "stall".into(),
            SimulatedDevice::new("stall", 720, 1280)
                .with_fault(crate::device::Channel::Video, crate::transport::ChannelFault::Stall)
                .with_fault(crate::device::Channel::Control, crate::transport::ChannelFault::Stall),
        );
        let mut config = FarmConfig::default();
        config.handshake_timeout = Duration::from_secs(2);
        let orch = orchestrator(sim, config);
        let report = orch.connect_devices(vec!["stall".into()]).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.attempts, 3);
        match &report.abandoned[0].error {
            DeviceError::RetryExhausted { last, .. } => {
                assert!(matches!(last, HandshakeError::ConnectTimeout(_)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn panic_payloads_render() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*s), "boom");
        let s: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*s), "bang");
        let s: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*s), "non-string panic payload");
    }
}

//! Connection Pool Implementation

use crate::factory::DriverFactory;
use metrics::{counter, histogram};
use obd_protocol::{Elm327Driver, ObdError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on simultaneously open drivers
    pub max_connections: usize,
    /// Period of the idle-adapter probe; 0 disables it
    pub health_check_interval_ms: u64,
    /// Consecutive probe failures before an adapter is evicted
    pub max_failures: u32,
    /// Wait-queue timeout when the caller gives none
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 3,
            health_check_interval_ms: 30_000,
            max_failures: 3,
            acquire_timeout_ms: 10_000,
        }
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    /// Slots reserved by acquisitions still connecting a new driver
    pub connecting: usize,
    pub total_acquired: u64,
    /// Mean wait-queue time over all acquisitions
    pub avg_wait_ms: f64,
    pub evictions: u64,
}

struct Entry {
    id: Uuid,
    vehicle_id: String,
    driver: Arc<Elm327Driver>,
    /// Bumped on every hand-out so stale leases cannot release it
    lease: u64,
    in_use: bool,
    /// Held by the health check rather than a caller
    checking: bool,
    failure_count: u32,
    last_health_check: Option<Instant>,
}

impl Entry {
    fn lease_to(&mut self, vehicle_id: &str) -> Grant {
        if self.vehicle_id != vehicle_id {
            debug!("Re-keying adapter {} from {} to {}", self.id, self.vehicle_id, vehicle_id);
            self.vehicle_id = vehicle_id.to_string();
        }
        self.in_use = true;
        self.lease += 1;
        Grant {
            entry: self.id,
            lease: self.lease,
            vehicle_id: vehicle_id.to_string(),
            driver: Arc::clone(&self.driver),
        }
    }
}

struct Grant {
    entry: Uuid,
    lease: u64,
    vehicle_id: String,
    driver: Arc<Elm327Driver>,
}

/// What an acquisition was given
enum Claim {
    Entry(Grant),
    /// Room for one more driver, which the acquirer creates
    Slot,
}

/// A claim in transit to a queued waiter. Dropped unaccepted, it goes
/// back to the pool.
struct Handoff {
    pool: Weak<PoolInner>,
    claim: Option<Claim>,
}

impl Handoff {
    fn into_claim(mut self) -> Option<Claim> {
        self.claim.take()
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        debug!("Reclaiming adapter handed to a cancelled request");
        let mut state = pool.lock();
        state.revert(claim);
        pool.dispatch(&mut state);
    }
}

struct Waiter {
    id: u64,
    vehicle_id: String,
    tx: oneshot::Sender<Result<Handoff, ObdError>>,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<Entry>,
    reserved: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    closed: bool,
    total_acquired: u64,
    total_wait_ms: f64,
    evictions: u64,
}

impl PoolState {
    fn claim(&mut self, vehicle_id: &str, max_connections: usize) -> Option<Claim> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.vehicle_id == vehicle_id) {
            return (!entry.in_use).then(|| Claim::Entry(entry.lease_to(vehicle_id)));
        }
        if self.entries.len() + self.reserved < max_connections {
            self.reserved += 1;
            return Some(Claim::Slot);
        }
        let entry = self.entries.iter_mut().find(|e| !e.in_use)?;
        Some(Claim::Entry(entry.lease_to(vehicle_id)))
    }

    fn release(&mut self, entry: Uuid, lease: u64) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.id == entry && e.lease == lease && e.in_use)
        {
            Some(entry) => {
                entry.in_use = false;
                entry.checking = false;
                true
            }
            None => false,
        }
    }

    /// Undo a claim whose recipient went away
    fn revert(&mut self, claim: Claim) {
        match claim {
            Claim::Slot => self.reserved = self.reserved.saturating_sub(1),
            Claim::Entry(grant) => {
                self.release(grant.entry, grant.lease);
            }
        }
    }

    /// Hand freed capacity to waiters, oldest first. Waiters whose vehicle
    /// is still busy keep their place.
    fn dispatch(&mut self, max_connections: usize, pool: &Weak<PoolInner>) {
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].tx.is_closed() {
                self.waiters.remove(i);
                continue;
            }
            let vehicle_id = self.waiters[i].vehicle_id.clone();
            let Some(claim) = self.claim(&vehicle_id, max_connections) else {
                i += 1;
                continue;
            };
            let Some(waiter) = self.waiters.remove(i) else {
                break;
            };
            debug!("Handing adapter to queued request {} for {}", waiter.id, vehicle_id);
            let handoff = Handoff {
                pool: Weak::clone(pool),
                claim: Some(claim),
            };
            if let Err(Ok(handoff)) = waiter.tx.send(Ok(handoff)) {
                if let Some(claim) = handoff.into_claim() {
                    self.revert(claim);
                }
            }
        }
    }

    fn record_acquisition(&mut self, waited: Duration) {
        let waited_ms = waited.as_secs_f64() * 1000.0;
        self.total_acquired += 1;
        self.total_wait_ms += waited_ms;
        counter!("obd_pool_acquisitions_total").increment(1);
        histogram!("obd_pool_wait_ms").record(waited_ms);
    }
}

struct PoolInner {
    this: Weak<PoolInner>,
    config: PoolConfig,
    factory: Box<dyn DriverFactory>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, state: &mut PoolState) {
        state.dispatch(self.config.max_connections, &self.this);
    }

    fn accept(self: &Arc<Self>, claim: Claim) -> Accepted {
        match claim {
            Claim::Entry(grant) => Accepted::Lease(PooledDriver {
                pool: Arc::clone(self),
                entry: grant.entry,
                lease: grant.lease,
                vehicle_id: grant.vehicle_id,
                driver: grant.driver,
                released: false,
            }),
            Claim::Slot => Accepted::Slot(SlotReservation {
                pool: Arc::clone(self),
                armed: true,
            }),
        }
    }

    async fn wait(
        self: &Arc<Self>,
        id: u64,
        mut rx: oneshot::Receiver<Result<Handoff, ObdError>>,
        vehicle_id: &str,
        timeout: Duration,
    ) -> Result<Accepted, ObdError> {
        let timed_out = || {
            ObdError::Connection(format!(
                "timed out after {}ms waiting for an adapter for {vehicle_id}",
                timeout.as_millis()
            ))
        };
        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ObdError::Connection("connection pool dropped the request".into())),
            Err(_) => {
                let mut state = self.lock();
                if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                    state.waiters.remove(pos);
                    warn!("Acquire for {} timed out after {:?}", vehicle_id, timeout);
                    return Err(timed_out());
                }
                drop(state);
                // A hand-off won the race with the timer
                rx.try_recv().unwrap_or_else(|_| Err(timed_out()))
            }
        };
        match outcome?.into_claim() {
            Some(claim) => Ok(self.accept(claim)),
            None => Err(timed_out()),
        }
    }

    /// Turn an accepted claim into a connected lease
    async fn complete(&self, accepted: Accepted, vehicle_id: &str) -> Result<PooledDriver, ObdError> {
        match accepted {
            Accepted::Lease(lease) => {
                if !lease.driver.is_ready() {
                    info!("Reconnecting adapter for {} ({})", vehicle_id, lease.driver.state());
                    if let Err(err) = lease.driver.connect().await {
                        lease.evict().await;
                        return Err(ObdError::Connection(format!(
                            "reconnect for {vehicle_id} failed: {err}"
                        )));
                    }
                }
                Ok(lease)
            }
            Accepted::Slot(reservation) => {
                let driver = Arc::new(self.factory.create(vehicle_id)?);
                driver.connect().await?;
                match reservation.fill(Arc::clone(&driver), vehicle_id) {
                    Some(lease) => Ok(lease),
                    None => {
                        driver.disconnect().await;
                        Err(shutting_down())
                    }
                }
            }
        }
    }

    /// Probe every idle adapter once
    async fn health_check(&self) {
        let candidates: Vec<(Uuid, u64, Arc<Elm327Driver>)> = {
            let mut state = self.lock();
            state
                .entries
                .iter_mut()
                .filter(|e| !e.in_use)
                .map(|e| {
                    e.in_use = true;
                    e.checking = true;
                    e.lease += 1;
                    (e.id, e.lease, Arc::clone(&e.driver))
                })
                .collect()
        };
        if !candidates.is_empty() {
            debug!("Health check over {} idle adapter(s)", candidates.len());
        }

        for (id, lease, driver) in candidates {
            let result = driver.probe().await;
            let evicted = {
                let mut state = self.lock();
                let Some(pos) = state
                    .entries
                    .iter()
                    .position(|e| e.id == id && e.lease == lease)
                else {
                    continue;
                };
                let entry = &mut state.entries[pos];
                if let Some(previous) = entry.last_health_check.replace(Instant::now()) {
                    debug!("{} last checked {:?} ago", entry.vehicle_id, previous.elapsed());
                }
                match &result {
                    Ok(()) => entry.failure_count = 0,
                    Err(err) => {
                        entry.failure_count += 1;
                        warn!(
                            "Health check failed for {} ({}/{}): {}",
                            entry.vehicle_id, entry.failure_count, self.config.max_failures, err
                        );
                    }
                }
                let evicted = if entry.failure_count >= self.config.max_failures {
                    let removed = state.entries.remove(pos);
                    state.evictions += 1;
                    Some(removed)
                } else {
                    state.release(id, lease);
                    None
                };
                self.dispatch(&mut state);
                evicted
            };
            if let Some(entry) = evicted {
                info!("Evicting adapter for {} after {} failed health checks", entry.vehicle_id, entry.failure_count);
                counter!("obd_pool_evictions_total").increment(1);
                entry.driver.disconnect().await;
            }
        }
    }
}

fn shutting_down() -> ObdError {
    ObdError::Connection("connection pool is shutting down".into())
}

enum Accepted {
    Lease(PooledDriver),
    Slot(SlotReservation),
}

/// Capacity held for a driver that is still connecting
struct SlotReservation {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl SlotReservation {
    /// Register the connected driver; `None` when the pool has shut down
    fn fill(mut self, driver: Arc<Elm327Driver>, vehicle_id: &str) -> Option<PooledDriver> {
        let id = Uuid::new_v4();
        {
            let mut state = self.pool.lock();
            if state.closed {
                return None;
            }
            state.reserved = state.reserved.saturating_sub(1);
            state.entries.push(Entry {
                id,
                vehicle_id: vehicle_id.to_string(),
                driver: Arc::clone(&driver),
                lease: 1,
                in_use: true,
                checking: false,
                failure_count: 0,
                last_health_check: None,
            });
        }
        self.armed = false;
        info!("Opened adapter {} for {}", id, vehicle_id);
        Some(PooledDriver {
            pool: Arc::clone(&self.pool),
            entry: id,
            lease: 1,
            vehicle_id: vehicle_id.to_string(),
            driver,
            released: false,
        })
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.lock();
            state.reserved = state.reserved.saturating_sub(1);
            self.pool.dispatch(&mut state);
        }
    }
}

/// A driver on loan from the pool; released when dropped
pub struct PooledDriver {
    pool: Arc<PoolInner>,
    entry: Uuid,
    lease: u64,
    vehicle_id: String,
    driver: Arc<Elm327Driver>,
    released: bool,
}

impl std::fmt::Debug for PooledDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledDriver")
            .field("entry", &self.entry)
            .field("lease", &self.lease)
            .field("vehicle_id", &self.vehicle_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl PooledDriver {
    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn driver(&self) -> &Arc<Elm327Driver> {
        &self.driver
    }

    /// Return the driver to the pool now
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let mut state = self.pool.lock();
        if state.release(self.entry, self.lease) {
            debug!("Released adapter for {}", self.vehicle_id);
            self.pool.dispatch(&mut state);
        }
    }

    /// Tear the entry down instead of returning it
    async fn evict(mut self) {
        self.released = true;
        let removed = {
            let mut state = self.pool.lock();
            let pos = state
                .entries
                .iter()
                .position(|e| e.id == self.entry && e.lease == self.lease);
            let removed = pos.map(|pos| state.entries.remove(pos));
            if removed.is_some() {
                state.evictions += 1;
                self.pool.dispatch(&mut state);
            }
            removed
        };
        if removed.is_some() {
            warn!("Evicting adapter for {} after failed reconnect", self.vehicle_id);
            counter!("obd_pool_evictions_total").increment(1);
            self.driver.disconnect().await;
        }
    }
}

impl Deref for PooledDriver {
    type Target = Elm327Driver;

    fn deref(&self) -> &Self::Target {
        &self.driver
    }
}

impl Drop for PooledDriver {
    fn drop(&mut self) {
        self.release_inner();
    }
}

async fn health_loop(pool: Weak<PoolInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.health_check().await;
    }
}

/// Bounded pool of ELM327 drivers keyed by vehicle id
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    health: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool and start its health-check loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig, factory: impl DriverFactory + 'static) -> Self {
        let period = Duration::from_millis(config.health_check_interval_ms);
        info!(
            "Connection pool created: max {} adapters, health check every {:?}",
            config.max_connections, period
        );
        let inner = Arc::new_cyclic(|this| PoolInner {
            this: Weak::clone(this),
            config,
            factory: Box::new(factory),
            state: Mutex::new(PoolState::default()),
        });
        let health = (!period.is_zero()).then(|| tokio::spawn(health_loop(Arc::downgrade(&inner), period)));
        Self {
            inner,
            health: Mutex::new(health),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a connected driver for `vehicle_id`.
    ///
    /// Reuses the vehicle's idle entry, opens a new driver while below
    /// `max_connections`, takes over another vehicle's idle adapter, or
    /// queues FIFO for up to `timeout` (the configured default when `None`).
    pub async fn acquire_connection(
        &self,
        vehicle_id: &str,
        timeout: Option<Duration>,
    ) -> Result<PooledDriver, ObdError> {
        let timeout = timeout.unwrap_or(Duration::from_millis(self.inner.config.acquire_timeout_ms));
        let immediate = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(shutting_down());
            }
            match state.claim(vehicle_id, self.inner.config.max_connections) {
                Some(claim) => Ok(claim),
                None => {
                    let (tx, rx) = oneshot::channel();
                    let id = state.next_waiter;
                    state.next_waiter += 1;
                    state.waiters.push_back(Waiter {
                        id,
                        vehicle_id: vehicle_id.to_string(),
                        tx,
                    });
                    debug!("{} queued for an adapter ({} waiting)", vehicle_id, state.waiters.len());
                    Err((id, rx))
                }
            }
        };

        let (accepted, waited) = match immediate {
            Ok(claim) => (self.inner.accept(claim), Duration::ZERO),
            Err((id, rx)) => {
                let started = Instant::now();
                let accepted = self.inner.wait(id, rx, vehicle_id, timeout).await?;
                (accepted, started.elapsed())
            }
        };

        let lease = self.inner.complete(accepted, vehicle_id).await?;
        self.inner.lock().record_acquisition(waited);
        debug!("Acquired adapter for {} after {:?} in queue", vehicle_id, waited);
        Ok(lease)
    }

    /// Release the lease currently held for `vehicle_id`
    pub fn release_connection(&self, vehicle_id: &str) -> Result<(), ObdError> {
        let mut state = self.inner.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.vehicle_id == vehicle_id && e.in_use && !e.checking)
            .ok_or_else(|| ObdError::Connection(format!("no active connection for {vehicle_id}")))?;
        entry.in_use = false;
        debug!("Released adapter for {}", vehicle_id);
        self.inner.dispatch(&mut state);
        Ok(())
    }

    /// Run one health-check pass now
    pub async fn run_health_check(&self) {
        self.inner.health_check().await;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let active = state.entries.iter().filter(|e| e.in_use && !e.checking).count();
        PoolStats {
            active,
            idle: state.entries.len() - active,
            waiting: state.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            connecting: state.reserved,
            total_acquired: state.total_acquired,
            avg_wait_ms: if state.total_acquired > 0 {
                state.total_wait_ms / state.total_acquired as f64
            } else {
                0.0
            },
            evictions: state.evictions,
        }
    }

    /// Fail queued requests and disconnect every adapter. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(task) = self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }

        let (entries, waiters) = {
            let mut state = self.inner.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.entries),
                std::mem::take(&mut state.waiters),
            )
        };
        if entries.is_empty() && waiters.is_empty() {
            return;
        }

        info!(
            "Shutting down connection pool: {} adapter(s), {} queued request(s)",
            entries.len(),
            waiters.len()
        );
        for waiter in waiters {
            let _ = waiter.tx.send(Err(shutting_down()));
        }
        for entry in entries {
            entry.driver.disconnect().await;
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(task) = self
            .health
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

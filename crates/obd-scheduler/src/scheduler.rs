//! Polling Manager Implementation

use metrics::counter;
use obd_protocol::{DecodedValue, Elm327Driver, ObdError, PidValueCache};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the polling manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Identifier used for PID cache keys
    pub vehicle_id: String,
    /// Tick period used when `start_polling` gets no interval
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            vehicle_id: "default".to_string(),
            interval_ms: 1000,
        }
    }
}

/// One PID in the poll queue
#[derive(Debug, Clone)]
pub struct PollingTarget {
    /// Catalog name of the PID
    pub pid_name: String,
    /// Higher is polled earlier
    pub priority: u8,
    /// Insertion order, breaks priority ties
    seq: u64,
}

impl Eq for PollingTarget {}

impl PartialEq for PollingTarget {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Ord for PollingTarget {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority first, then earliest insertion
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PollingTarget {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A PID that failed during a cycle
#[derive(Debug, Clone)]
pub struct PollFailure {
    pub pid_name: String,
    pub error: ObdError,
}

/// Outcome of one pass over the queue
#[derive(Debug, Clone)]
pub struct PollReport {
    /// 1-based cycle number
    pub cycle: u64,
    pub readings: Vec<DecodedValue>,
    pub failures: Vec<PollFailure>,
    pub duration: Duration,
}

/// Polling counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollingStats {
    pub cycles_completed: u64,
    /// Ticks dropped because the previous cycle was still running
    pub ticks_skipped: u64,
    pub readings: u64,
    pub failures: u64,
    pub last_cycle_ms: Option<u64>,
}

#[derive(Default)]
struct TargetQueue {
    heap: BinaryHeap<PollingTarget>,
    next_seq: u64,
}

struct Inner {
    driver: Arc<Elm327Driver>,
    vehicle_id: String,
    targets: Mutex<TargetQueue>,
    in_flight: AtomicBool,
    stats: Mutex<PollingStats>,
    cache: Option<Arc<PidValueCache>>,
    reports: Option<mpsc::Sender<PollReport>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the in-flight flag when a cycle ends or is aborted
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Inner {
    fn ordered_targets(&self) -> Vec<PollingTarget> {
        let mut ordered = lock(&self.targets).heap.clone().into_sorted_vec();
        ordered.reverse();
        ordered
    }

    /// Run one cycle unless another is in flight
    async fn run_cycle(&self) -> Option<PollReport> {
        if self
            .in_flight
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            lock(&self.stats).ticks_skipped += 1;
            debug!("Poll cycle still running, skipping tick");
            return None;
        }
        let _guard = CycleGuard(&self.in_flight);

        let started = Instant::now();
        let mut readings = Vec::new();
        let mut failures = Vec::new();

        for target in self.ordered_targets() {
            let result = match self.driver.catalog().by_name(&target.pid_name) {
                Some(def) => self.driver.read_definition(def).await,
                None => Err(ObdError::Unsupported(format!("unknown PID '{}'", target.pid_name))),
            };
            match result {
                Ok(value) => {
                    if let Some(cache) = &self.cache {
                        cache.insert(&self.vehicle_id, value.clone());
                    }
                    readings.push(value);
                }
                Err(error) => {
                    warn!("Polling {} failed: {}", target.pid_name, error);
                    failures.push(PollFailure {
                        pid_name: target.pid_name,
                        error,
                    });
                }
            }
        }

        let duration = started.elapsed();
        let cycle = {
            let mut stats = lock(&self.stats);
            stats.cycles_completed += 1;
            stats.readings += readings.len() as u64;
            stats.failures += failures.len() as u64;
            stats.last_cycle_ms = Some(duration.as_millis() as u64);
            stats.cycles_completed
        };
        counter!("obd_poll_cycles_total").increment(1);
        debug!(
            "Poll cycle {} for {}: {} readings, {} failures in {:?}",
            cycle,
            self.vehicle_id,
            readings.len(),
            failures.len(),
            duration
        );

        let report = PollReport {
            cycle,
            readings,
            failures,
            duration,
        };
        if let Some(tx) = &self.reports {
            // Slow consumers lose reports rather than stalling the loop
            let _ = tx.try_send(report.clone());
        }
        Some(report)
    }
}

/// Optional destinations for poll results
#[derive(Clone, Default)]
pub struct PollingSinks {
    /// Every successful reading is written through
    pub cache: Option<Arc<PidValueCache>>,
    /// One [`PollReport`] per cycle
    pub reports: Option<mpsc::Sender<PollReport>>,
}

/// Periodically reads a prioritised set of PIDs through one driver
pub struct PollingManager {
    inner: Arc<Inner>,
    config: PollingConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingManager {
    /// Create a polling manager for a driver
    pub fn new(driver: Arc<Elm327Driver>, config: PollingConfig) -> Self {
        Self::with_sinks(driver, config, PollingSinks::default())
    }

    /// Create a polling manager that also feeds a cache and a report channel
    pub fn with_sinks(driver: Arc<Elm327Driver>, config: PollingConfig, sinks: PollingSinks) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                vehicle_id: config.vehicle_id.clone(),
                targets: Mutex::new(TargetQueue::default()),
                in_flight: AtomicBool::new(false),
                stats: Mutex::new(PollingStats::default()),
                cache: sinks.cache,
                reports: sinks.reports,
            }),
            config,
            task: Mutex::new(None),
        }
    }

    /// Queue a catalog PID by name. Re-adding updates the priority in place.
    pub fn add_pid(&self, name: &str, priority: Option<u8>) -> Result<(), ObdError> {
        let def = self
            .inner
            .driver
            .catalog()
            .by_name(name)
            .ok_or_else(|| ObdError::Unsupported(format!("unknown PID '{name}'")))?;
        let priority = priority.unwrap_or_else(|| def.default_priority());

        let mut queue = lock(&self.inner.targets);
        let mut items = std::mem::take(&mut queue.heap).into_vec();
        match items.iter_mut().find(|t| t.pid_name == def.name) {
            Some(existing) => existing.priority = priority,
            None => {
                let seq = queue.next_seq;
                queue.next_seq += 1;
                items.push(PollingTarget {
                    pid_name: def.name.to_string(),
                    priority,
                    seq,
                });
            }
        }
        queue.heap = BinaryHeap::from(items);
        debug!("Polling {} at priority {}", def.name, priority);
        Ok(())
    }

    /// Returns whether the PID was queued
    pub fn remove_pid(&self, name: &str) -> bool {
        let mut queue = lock(&self.inner.targets);
        let before = queue.heap.len();
        queue.heap.retain(|t| t.pid_name != name);
        queue.heap.len() != before
    }

    pub fn remove_all_pids(&self) {
        lock(&self.inner.targets).heap.clear();
    }

    /// Queued targets in poll order
    pub fn targets(&self) -> Vec<PollingTarget> {
        self.inner.ordered_targets()
    }

    /// Start the recurring timer; the first cycle runs immediately
    pub fn start_polling(&self, interval: Option<Duration>) -> Result<(), ObdError> {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(ObdError::State {
                operation: "start polling again",
                state: self.inner.driver.state(),
            });
        }
        if lock(&self.inner.targets).heap.is_empty() {
            return Err(ObdError::Unsupported("no PIDs queued for polling".into()));
        }

        let period = interval
            .unwrap_or(Duration::from_millis(self.config.interval_ms))
            .max(Duration::from_millis(1));
        let inner = Arc::clone(&self.inner);
        info!(
            "Starting polling for {} every {:?} ({} PIDs)",
            self.config.vehicle_id,
            period,
            lock(&inner.targets).heap.len()
        );

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut _current: Option<AbortOnDrop> = None;
            loop {
                ticker.tick().await;
                if inner.in_flight.load(AtomicOrdering::Acquire) {
                    lock(&inner.stats).ticks_skipped += 1;
                    debug!("Poll cycle still running, skipping tick");
                    continue;
                }
                let inner = Arc::clone(&inner);
                _current = Some(AbortOnDrop(tokio::spawn(async move {
                    inner.run_cycle().await;
                })));
            }
        }));
        Ok(())
    }

    /// Cancel the timer and any cycle in flight. Idempotent.
    pub fn stop_polling(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
            info!("Stopped polling for {}", self.config.vehicle_id);
        }
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Run a single cycle now
    pub async fn poll_once(&self) -> Result<PollReport, ObdError> {
        self.inner
            .run_cycle()
            .await
            .ok_or_else(|| ObdError::State {
                operation: "poll while a cycle is running",
                state: self.inner.driver.state(),
            })
    }

    pub fn stats(&self) -> PollingStats {
        lock(&self.inner.stats).clone()
    }
}

impl Drop for PollingManager {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{
        DriverOptions, RetryPolicyConfig, RetryPolicyOptions, SimulatedTransport, SimulatorHandle,
    };

    async fn driver() -> (Arc<Elm327Driver>, SimulatorHandle) {
        let transport = SimulatedTransport::default();
        let handle = transport.handle();
        let options = DriverOptions {
            command_timeout: Some(Duration::from_millis(500)),
            retry: RetryPolicyConfig {
                operation: RetryPolicyOptions::NONE,
                ..RetryPolicyConfig::default()
            },
            ..DriverOptions::default()
        };
        let driver = Arc::new(Elm327Driver::new(Box::new(transport), options));
        driver.connect().await.unwrap();
        (driver, handle)
    }

    fn names(manager: &PollingManager) -> Vec<String> {
        manager.targets().into_iter().map(|t| t.pid_name).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_ordered_by_priority_then_insertion() {
        let (driver, _) = driver().await;
        let manager = PollingManager::new(driver, PollingConfig::default());

        manager.add_pid("Engine Coolant Temperature", None).unwrap();
        manager.add_pid("Vehicle Speed", None).unwrap();
        manager.add_pid("Engine RPM", None).unwrap();
        assert_eq!(
            names(&manager),
            vec!["Vehicle Speed", "Engine RPM", "Engine Coolant Temperature"]
        );

        // Re-adding keeps insertion order but changes priority
        manager.add_pid("Engine Coolant Temperature", Some(20)).unwrap();
        assert_eq!(
            names(&manager),
            vec!["Engine Coolant Temperature", "Vehicle Speed", "Engine RPM"]
        );
        assert_eq!(manager.targets().len(), 3);

        assert!(manager.remove_pid("Vehicle Speed"));
        assert!(!manager.remove_pid("Vehicle Speed"));
        manager.remove_all_pids();
        assert!(manager.targets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_unknown_pid() {
        let (driver, _) = driver().await;
        let manager = PollingManager::new(driver, PollingConfig::default());
        assert!(matches!(
            manager.add_pid("Flux Capacitor", None),
            Err(ObdError::Unsupported(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_once_collects_failures_and_fills_cache() {
        let (driver, _) = driver().await;
        let cache = Arc::new(PidValueCache::new());
        let config = PollingConfig {
            vehicle_id: "vehicle-7".into(),
            ..PollingConfig::default()
        };
        let sinks = PollingSinks {
            cache: Some(Arc::clone(&cache)),
            ..PollingSinks::default()
        };
        let manager = PollingManager::with_sinks(driver, config, sinks);

        manager.add_pid("Engine RPM", None).unwrap();
        // Off in the simulator's support bitmap
        manager.add_pid("MAF Air Flow Rate", None).unwrap();
        manager.add_pid("Vehicle Speed", None).unwrap();

        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.cycle, 1);
        assert_eq!(report.readings.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].pid_name, "MAF Air Flow Rate");
        assert!(matches!(report.failures[0].error, ObdError::Unsupported(_)));

        assert_eq!(cache.get("vehicle-7", "Engine RPM").unwrap().value, 1726.0);
        assert_eq!(cache.get("vehicle-7", "Vehicle Speed").unwrap().value, 42.0);

        let stats = manager.stats();
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.readings, 2);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_polling_preconditions() {
        let (driver, _) = driver().await;
        let manager = PollingManager::new(driver, PollingConfig::default());
        assert!(matches!(manager.start_polling(None), Err(ObdError::Unsupported(_))));

        manager.add_pid("Engine RPM", None).unwrap();
        manager.start_polling(None).unwrap();
        assert!(manager.is_polling());
        assert!(matches!(manager.start_polling(None), Err(ObdError::State { .. })));

        manager.stop_polling();
        manager.stop_polling();
        assert!(!manager.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_delivers_reports() {
        let (driver, _) = driver().await;
        let (tx, mut rx) = mpsc::channel(8);
        let sinks = PollingSinks {
            reports: Some(tx),
            ..PollingSinks::default()
        };
        let manager = PollingManager::with_sinks(driver, PollingConfig::default(), sinks);
        manager.add_pid("Engine RPM", None).unwrap();
        manager.start_polling(Some(Duration::from_millis(100))).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.cycle, second.cycle), (1, 2));
        assert_eq!(second.readings[0].name, "Engine RPM");
        manager.stop_polling();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycles_skip_ticks() {
        let (driver, handle) = driver().await;
        handle.set_response_delay(Duration::from_millis(250));
        let manager = PollingManager::new(Arc::clone(&driver), PollingConfig::default());
        manager.add_pid("Engine RPM", None).unwrap();
        manager.start_polling(Some(Duration::from_millis(100))).unwrap();

        tokio::time::sleep(Duration::from_millis(650)).await;
        manager.stop_polling();

        let stats = manager.stats();
        assert!(stats.cycles_completed >= 1);
        assert!(stats.ticks_skipped >= 1);

        // Aborting mid-command hands the driver back
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(driver.is_ready());
    }
}

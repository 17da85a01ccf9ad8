//! Multi-pass adapter self-check
//!
//! Reads the same small PID set and the stored trouble codes several times
//! and reports whether the vehicle answered every pass the same way.

use crate::driver::Elm327Driver;
use crate::error::ObdError;
use crate::mode;
use crate::protocol::ObdProtocol;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Pause between two passes
pub const SELF_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Engine RPM, coolant temperature and vehicle speed
const SELF_CHECK_PIDS: [u8; 3] = [0x0C, 0x05, 0x0D];

/// Outcome of one pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelfCheckStep {
    /// 1-based pass number
    pub attempt: u32,
    pub duration_ms: u64,
    /// Decoded values keyed by PID name
    pub values: BTreeMap<String, f64>,
    /// Stored codes, sorted
    pub dtcs: Vec<String>,
    pub errors: Vec<String>,
}

impl SelfCheckStep {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

/// Aggregated result of [`Elm327Driver::self_check`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelfCheckReport {
    pub attempts_planned: u32,
    pub attempts_performed: u32,
    pub passes: u32,
    pub fails: u32,
    /// Every passing step saw the same PIDs and the same codes
    pub consistent: bool,
    pub protocol: Option<ObdProtocol>,
    /// Min/max per PID over the passing steps
    pub ranges: BTreeMap<String, ValueRange>,
    pub summary: String,
    pub steps: Vec<SelfCheckStep>,
}

impl SelfCheckReport {
    pub fn passed(&self) -> bool {
        self.passes > 0 && self.fails == 0 && self.consistent
    }
}

impl Elm327Driver {
    /// Run `passes` rounds (at least one) of PID and DTC reads.
    ///
    /// PIDs the vehicle does not support are skipped, every other failure is
    /// recorded on its step.
    pub async fn self_check(&self, passes: u32) -> SelfCheckReport {
        let planned = passes.max(1);
        let mut steps = Vec::with_capacity(planned as usize);

        for attempt in 1..=planned {
            steps.push(self.self_check_pass(attempt).await);
            if attempt < planned {
                tokio::time::sleep(SELF_CHECK_INTERVAL).await;
            }
        }

        let report = summarize(planned, self.status().protocol, steps);
        if report.passed() {
            info!("{}: self-check {}", self.name(), report.summary);
        } else {
            warn!("{}: self-check {}", self.name(), report.summary);
        }
        report
    }

    async fn self_check_pass(&self, attempt: u32) -> SelfCheckStep {
        let started = Instant::now();
        let mut values = BTreeMap::new();
        let mut errors = Vec::new();

        for pid in SELF_CHECK_PIDS {
            match self.read_pid(mode::CURRENT_DATA, pid).await {
                Ok(value) => {
                    values.insert(value.name, value.value);
                }
                Err(ObdError::Unsupported(_)) => {}
                Err(err) => errors.push(format!("PID {pid:02X}: {err}")),
            }
        }

        let dtcs = match self.read_dtc().await {
            Ok(found) => {
                let mut codes: Vec<String> = found.into_iter().map(|dtc| dtc.code).collect();
                codes.sort();
                codes
            }
            Err(err) => {
                errors.push(format!("read DTCs: {err}"));
                Vec::new()
            }
        };

        SelfCheckStep {
            attempt,
            duration_ms: started.elapsed().as_millis() as u64,
            values,
            dtcs,
            errors,
        }
    }
}

fn summarize(planned: u32, protocol: Option<ObdProtocol>, steps: Vec<SelfCheckStep>) -> SelfCheckReport {
    let passes = steps.iter().filter(|step| step.passed()).count() as u32;
    let fails = steps.len() as u32 - passes;
    let consistent = is_consistent(&steps);

    let mut ranges: BTreeMap<String, ValueRange> = BTreeMap::new();
    for (name, &value) in steps.iter().filter(|step| step.passed()).flat_map(|step| &step.values) {
        ranges
            .entry(name.clone())
            .and_modify(|range| {
                range.min = range.min.min(value);
                range.max = range.max.max(value);
            })
            .or_insert(ValueRange { min: value, max: value });
    }

    let summary = format!(
        "{} attempts: {} passed, {} failed. Consistency: {}",
        planned,
        passes,
        fails,
        if consistent { "OK" } else { "MISMATCH" }
    );

    SelfCheckReport {
        attempts_planned: planned,
        attempts_performed: steps.len() as u32,
        passes,
        fails,
        consistent,
        protocol,
        ranges,
        summary,
        steps,
    }
}

/// Live values drift between passes, so only the answered PIDs and the
/// code list are compared
fn is_consistent(steps: &[SelfCheckStep]) -> bool {
    let mut passing = steps.iter().filter(|step| step.passed());
    let Some(baseline) = passing.next() else {
        return true;
    };
    passing.all(|step| step.dtcs == baseline.dtcs && step.values.keys().eq(baseline.values.keys()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverOptions;
    use crate::retry::{RetryPolicyConfig, RetryPolicyOptions};
    use crate::transport::{SimulatedTransport, SimulatorHandle};

    fn quick(max_attempts: u32) -> RetryPolicyOptions {
        RetryPolicyOptions {
            max_attempts,
            base_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    async fn connected() -> (Elm327Driver, SimulatorHandle) {
        let options = DriverOptions {
            command_timeout: Some(Duration::from_millis(500)),
            retry: RetryPolicyConfig {
                connect: quick(3),
                init: quick(2),
                operation: quick(2),
            },
            ..DriverOptions::default()
        };
        let transport = SimulatedTransport::default();
        let handle = transport.handle();
        let driver = Elm327Driver::new(Box::new(transport), options);
        driver.connect().await.unwrap();
        handle.clear_written();
        (driver, handle)
    }

    fn step(attempt: u32, pids: &[(&str, f64)], dtcs: &[&str], errors: &[&str]) -> SelfCheckStep {
        SelfCheckStep {
            attempt,
            duration_ms: 0,
            values: pids.iter().map(|(name, value)| (name.to_string(), *value)).collect(),
            dtcs: dtcs.iter().map(|code| code.to_string()).collect(),
            errors: errors.iter().map(|err| err.to_string()).collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_check_passes_on_steady_vehicle() {
        let (driver, handle) = connected().await;
        let started = Instant::now();
        let report = driver.self_check(3).await;

        assert!(report.passed(), "{}", report.summary);
        assert_eq!(report.attempts_planned, 3);
        assert_eq!(report.attempts_performed, 3);
        assert_eq!(report.passes, 3);
        assert_eq!(report.protocol, Some(ObdProtocol::Auto));
        assert_eq!(report.summary, "3 attempts: 3 passed, 0 failed. Consistency: OK");
        assert_eq!(report.ranges["Engine RPM"], ValueRange { min: 1726.0, max: 1726.0 });
        assert_eq!(report.ranges["Vehicle Speed"].max, 42.0);
        assert_eq!(report.steps[0].dtcs, vec!["P0133", "P0420"]);
        assert_eq!(
            report.steps.iter().map(|step| step.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        // Four reads per pass, two pauses between three passes
        assert_eq!(handle.written_commands().len(), 12);
        assert!(started.elapsed() >= SELF_CHECK_INTERVAL * 2);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["passes"], 3);
        assert_eq!(json["steps"][2]["values"]["Engine Coolant Temperature"], 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_check_records_failing_pid() {
        let (driver, handle) = connected().await;
        handle.silence("010D");

        let report = driver.self_check(2).await;
        assert!(!report.passed());
        assert_eq!(report.passes, 0);
        assert_eq!(report.fails, 2);
        assert!(report.steps[0].errors[0].starts_with("PID 0D"));
        assert!(report.steps[0].values.contains_key("Engine RPM"));
        assert!(report.ranges.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_check_runs_at_least_once() {
        let (driver, _handle) = connected().await;
        let report = driver.self_check(0).await;
        assert_eq!(report.attempts_planned, 1);
        assert_eq!(report.steps.len(), 1);
        assert!(report.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_check_requires_connection() {
        let driver = Elm327Driver::new(Box::new(SimulatedTransport::default()), DriverOptions::default());
        let report = driver.self_check(1).await;
        assert_eq!(report.fails, 1);
        assert_eq!(report.steps[0].errors.len(), 4);
        assert!(!report.passed());
    }

    #[test]
    fn test_consistency_ignores_value_drift_and_failed_steps() {
        let steps = vec![
            step(1, &[("Engine RPM", 800.0)], &["P0420"], &[]),
            step(2, &[("Engine RPM", 2400.0)], &["P0420"], &[]),
            step(3, &[], &[], &["PID 0C: timeout"]),
        ];
        assert!(is_consistent(&steps));

        let report = summarize(3, None, steps);
        assert_eq!(report.ranges["Engine RPM"], ValueRange { min: 800.0, max: 2400.0 });
        assert_eq!(report.fails, 1);
        assert!(!report.passed());
    }

    #[test]
    fn test_consistency_flags_changed_codes_or_pids() {
        let codes_changed = vec![
            step(1, &[("Engine RPM", 800.0)], &["P0420"], &[]),
            step(2, &[("Engine RPM", 800.0)], &["P0133", "P0420"], &[]),
        ];
        assert!(!is_consistent(&codes_changed));

        let pid_dropped = vec![
            step(1, &[("Engine RPM", 800.0), ("Vehicle Speed", 0.0)], &[], &[]),
            step(2, &[("Engine RPM", 800.0)], &[], &[]),
        ];
        let report = summarize(2, None, pid_dropped);
        assert!(!report.consistent);
        assert!(report.summary.ends_with("MISMATCH"));
        assert!(is_consistent(&[]));
    }
}

//! OBD-II Diagnostics Agent
//!
//! Opens pooled ELM327 adapters for the configured vehicles, reads their
//! VIN and trouble codes, then polls live PIDs and logs every cycle.

use anyhow::Context;
use obd_pool::{ConnectionPool, TransportDriverFactory};
use obd_protocol::{PidValueCache, RetryPolicyConfig};
use obd_scheduler::{PollingConfig, PollingManager, PollingSinks};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod settings;

pub use settings::{PollingSettings, Settings, VehicleSettings, ENV_PREFIX};

/// Initialize logging.
///
/// `OBD_LOG_LEVEL` takes an env-filter directive (default `info`);
/// `OBD_LOG_FORMAT=json` switches to JSON lines.
pub fn init_logging() -> anyhow::Result<()> {
    let level = std::env::var("OBD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("OBD_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let builder = FmtSubscriber::builder().with_env_filter(filter).with_target(true);
    let installed = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.context("failed to set tracing subscriber")
}

/// What one vehicle session achieved
#[derive(Debug, Clone, Default, Serialize)]
pub struct VehicleSummary {
    pub vehicle_id: String,
    pub vin: Option<String>,
    pub dtcs: Vec<String>,
    pub cycles: u64,
    pub readings: u64,
    pub failures: u64,
}

/// Final snapshot printed on exit
#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub vehicles: Vec<VehicleSummary>,
    pub pool: obd_pool::PoolStats,
    pub pid_cache: obd_protocol::CacheStats,
}

/// Run every configured vehicle session to completion, or until Ctrl-C
pub async fn run(settings: Settings) -> anyhow::Result<AgentSummary> {
    let retry = RetryPolicyConfig::load().context("invalid retry configuration")?;
    let options = settings.driver_options(retry);
    info!(
        "Transport {:?}, profile {}, {} vehicle(s)",
        settings.transport,
        options.profile.name,
        settings.vehicles.len()
    );

    let factory = TransportDriverFactory::new(settings.transport.clone(), options);
    let pool = Arc::new(ConnectionPool::new(settings.pool.clone(), factory));
    let cache = Arc::new(PidValueCache::new());

    let mut sessions = JoinSet::new();
    for vehicle_id in &settings.vehicles {
        sessions.spawn(vehicle_session(
            Arc::clone(&pool),
            Arc::clone(&cache),
            vehicle_id.clone(),
            settings.polling.clone(),
        ));
    }

    let mut vehicles = Vec::new();
    loop {
        tokio::select! {
            joined = sessions.join_next() => match joined {
                Some(Ok(Ok(summary))) => vehicles.push(summary),
                Some(Ok(Err(err))) => error!("Vehicle session failed: {:#}", err),
                Some(Err(err)) => error!("Vehicle session panicked: {}", err),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping {} session(s)", sessions.len());
                sessions.abort_all();
                break;
            }
        }
    }

    pool.shutdown().await;
    Ok(AgentSummary {
        vehicles,
        pool: pool.stats(),
        pid_cache: cache.stats(),
    })
}

async fn vehicle_session(
    pool: Arc<ConnectionPool>,
    cache: Arc<PidValueCache>,
    vehicle_id: String,
    polling: PollingSettings,
) -> anyhow::Result<VehicleSummary> {
    let lease = pool
        .acquire_connection(&vehicle_id, None)
        .await
        .with_context(|| format!("no adapter for {vehicle_id}"))?;
    let status = lease.status();
    info!(
        "{} connected via {} (protocol {:?}, adapter {:?})",
        vehicle_id, status.name, status.protocol, status.adapter_version
    );

    let mut summary = VehicleSummary {
        vehicle_id: vehicle_id.clone(),
        ..VehicleSummary::default()
    };
    match lease.read_vin().await {
        Ok(vin) => summary.vin = Some(vin),
        Err(err) => warn!("{}: VIN unavailable: {}", vehicle_id, err),
    }
    match lease.read_dtc().await {
        Ok(dtcs) => {
            for dtc in &dtcs {
                info!("{}: {} [{:?}] {}", vehicle_id, dtc.code, dtc.severity, dtc.description);
            }
            summary.dtcs = dtcs.into_iter().map(|dtc| dtc.code).collect();
        }
        Err(err) => warn!("{}: reading trouble codes failed: {}", vehicle_id, err),
    }

    let (tx, mut reports) = mpsc::channel(16);
    let manager = PollingManager::with_sinks(
        Arc::clone(lease.driver()),
        PollingConfig {
            vehicle_id: vehicle_id.clone(),
            interval_ms: polling.interval_ms,
        },
        PollingSinks {
            cache: Some(cache),
            reports: Some(tx),
        },
    );
    for pid in &polling.pids {
        if let Err(err) = manager.add_pid(pid, None) {
            warn!("{}: skipping PID {:?}: {}", vehicle_id, pid, err);
        }
    }
    if manager.targets().is_empty() {
        return Ok(summary);
    }

    manager.start_polling(Some(Duration::from_millis(polling.interval_ms)))?;
    while summary.cycles < polling.cycles {
        let Some(report) = reports.recv().await else {
            break;
        };
        let values: Vec<String> = report
            .readings
            .iter()
            .map(|v| format!("{}={:.1}{}", v.name, v.value, v.unit.as_deref().unwrap_or("")))
            .collect();
        info!("{} cycle {}: {}", vehicle_id, report.cycle, values.join(" "));
        for failure in &report.failures {
            warn!("{} cycle {}: {} failed: {}", vehicle_id, report.cycle, failure.pid_name, failure.error);
        }
        summary.cycles += 1;
        summary.readings += report.readings.len() as u64;
        summary.failures += report.failures.len() as u64;
    }
    manager.stop_polling();
    lease.release();
    Ok(summary)
}

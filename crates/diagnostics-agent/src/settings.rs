//! Agent settings
//!
//! Built-in defaults, then an optional TOML file, then `OBD_AGENT__*`
//! environment variables (`OBD_AGENT__POOL__MAX_CONNECTIONS=2`,
//! `OBD_AGENT__VEHICLES=car-a,car-b`).

use config::{Config, ConfigError, Environment, File, FileFormat};
use obd_pool::PoolConfig;
use obd_protocol::{DriverOptions, ProfileRegistry, RetryPolicyConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment prefix for agent settings
pub const ENV_PREFIX: &str = "OBD_AGENT";

/// Which protocol profile the drivers use
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleSettings {
    /// Explicit profile name; wins over make/year
    pub profile: Option<String>,
    pub make: Option<String>,
    pub year: Option<u16>,
    pub command_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub interval_ms: u64,
    pub pids: Vec<String>,
    /// Cycles per vehicle before the agent releases its adapter
    pub cycles: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            pids: vec![
                "Engine RPM".to_string(),
                "Vehicle Speed".to_string(),
                "Engine Coolant Temperature".to_string(),
            ],
            cycles: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub vehicles: Vec<String>,
    pub transport: TransportConfig,
    pub vehicle: VehicleSettings,
    pub pool: PoolConfig,
    pub polling: PollingSettings,
    /// Print the Prometheus exposition on exit
    pub print_metrics: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vehicles: vec!["vehicle-1".to_string()],
            transport: TransportConfig::default(),
            vehicle: VehicleSettings::default(),
            pool: PoolConfig::default(),
            polling: PollingSettings::default(),
            print_metrics: false,
        }
    }
}

impl Settings {
    /// Load from `path` (when given) and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path, Environment::with_prefix(ENV_PREFIX))
    }

    pub fn load_from(path: Option<&Path>, environment: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        let settings: Settings = builder
            .add_source(
                environment
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("vehicles")
                    .with_list_parse_key("polling.pids"),
            )
            .build()?
            .try_deserialize()?;
        debug!("Loaded agent settings: {:?}", settings);
        Ok(settings)
    }

    /// Driver options for these settings, with retry tunables from the
    /// environment
    pub fn driver_options(&self, retry: RetryPolicyConfig) -> DriverOptions {
        let profile = match (&self.vehicle.profile, &self.vehicle.make) {
            (Some(name), _) => ProfileRegistry::get(Some(name)),
            (None, Some(make)) => ProfileRegistry::for_vehicle(make, self.vehicle.year),
            (None, None) => ProfileRegistry::get(None),
        };
        DriverOptions {
            profile,
            command_timeout: self.vehicle.command_timeout_ms.map(Duration::from_millis),
            retry,
            ..DriverOptions::default()
        }
    }
}

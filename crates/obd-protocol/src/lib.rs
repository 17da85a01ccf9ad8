//! OBD-II Protocol Implementation
//!
//! Transport-agnostic driver for ELM327-compatible OBD-II adapters:
//! serial, TCP (Wi-Fi dongles) and an in-memory simulator behind one
//! [`Transport`] trait, PID and DTC catalogs, response parsers, protocol
//! profiles and retry policies. Supports ISO 15765-4 (CAN) and the legacy
//! J1850, ISO 9141-2 and KWP2000 buses.

mod cache;
mod config;
mod driver;
mod dtc;
mod error;
mod parser;
mod pid;
mod protocol;
mod retry;
mod selfcheck;
mod transport;

pub use cache::{DtcDescriptionCache, PidValueCache};
pub use obd_cache::CacheStats;
pub use self::config::ENV_PREFIX as RETRY_ENV_PREFIX;
pub use driver::{
    clean_response, DriverEvent, DriverMetrics, DriverOptions, DriverState, DriverStatus, Elm327Driver,
};
pub use dtc::{normalize_dtc_code, severity_for, DtcCatalog, DtcDefinition, DtcInfo, DtcSystem, Severity};
pub use error::{ErrorReport, ObdError};
pub use parser::{
    decode_dtc, hex_line, hex_lines, parse_dtc_response, parse_pid_response, parse_supported_pids,
    parse_vin, parse_with_catalog, response_mode,
};
pub use pid::{DecodedValue, Formula, PidCatalog, PidDefinition};
pub use protocol::{ObdProtocol, ProfileQuirks, ProfileRegistry, ProtocolProfile};
pub use retry::{
    calculate_backoff_delay, retry_if, retry_with_policy, RetryConfigError, RetryPolicyConfig,
    RetryPolicyOptions,
};
pub use selfcheck::{SelfCheckReport, SelfCheckStep, ValueRange, SELF_CHECK_INTERVAL};
pub use transport::{
    SerialTransport, SimulatedTransport, SimulatorHandle, SimulatorOptions, TcpTransport, Transport,
    TransportConfig, TransportEvent,
};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
}

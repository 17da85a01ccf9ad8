//! ELM327 Driver
//!
//! Owns one [`Transport`] and runs the adapter through its lifecycle:
//! reset and configure the ELM327, walk the protocol profile until a bus
//! answers, then serve one request at a time while `Ready`.
//!
//! All methods take `&self`, so a driver can be shared behind an `Arc`
//! between a pool, a polling loop and ad-hoc callers. Mutual exclusion is
//! expressed through [`DriverState`]: only the caller that moved the driver
//! into `Connecting` or `Busy` talks to the adapter.

use crate::cache::DtcDescriptionCache;
use crate::dtc::{DtcCatalog, DtcInfo};
use crate::error::ObdError;
use crate::mode;
use crate::parser;
use crate::pid::{DecodedValue, PidCatalog, PidDefinition};
use crate::protocol::{ObdProtocol, ProfileRegistry, ProtocolProfile};
use crate::retry::{retry_if, retry_with_policy, RetryPolicyConfig};
use crate::transport::{Transport, TransportEvent};
use metrics::{counter, histogram};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of an adapter session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    /// A command is in flight
    Busy,
    /// The link failed; `connect` again to recover
    Error,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Disconnected => "disconnected",
            DriverState::Connecting => "connecting",
            DriverState::Initializing => "initializing",
            DriverState::Ready => "ready",
            DriverState::Busy => "busy",
            DriverState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Notifications delivered to the listener registered with
/// [`Elm327Driver::subscribe_events`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Connected { protocol: ObdProtocol },
    Disconnected,
    /// One framed adapter response
    Data(String),
    Error(String),
}

/// Driver tunables
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub profile: &'static ProtocolProfile,
    /// Skip the profile walk and use this protocol (auto remains the fallback)
    pub protocol: Option<ObdProtocol>,
    /// Per-command timeout; defaults to the profile's recommendation
    pub command_timeout: Option<Duration>,
    pub retry: RetryPolicyConfig,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            profile: ProfileRegistry::get(None),
            protocol: None,
            command_timeout: None,
            retry: RetryPolicyConfig::default(),
        }
    }
}

impl DriverOptions {
    /// Use a named profile (unknown names fall back to `auto`)
    pub fn with_profile(mut self, name: &str) -> Self {
        self.profile = ProfileRegistry::get(Some(name));
        self
    }

    /// Use the profile matching a vehicle make and model year
    pub fn for_vehicle(mut self, make: &str, year: Option<u16>) -> Self {
        self.profile = ProfileRegistry::for_vehicle(make, year);
        self
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
            .unwrap_or_else(|| Duration::from_millis(self.profile.recommended_timeout_ms()))
    }
}

/// Command counters for one driver
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriverMetrics {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub timeouts: u64,
    /// Running mean over successful commands
    pub average_latency_ms: f64,
    pub last_command: Option<String>,
    pub last_duration_ms: Option<u64>,
}

/// Point-in-time view of a driver
#[derive(Debug, Clone, Serialize)]
pub struct DriverStatus {
    pub name: String,
    pub state: DriverState,
    pub profile: &'static str,
    pub protocol: Option<ObdProtocol>,
    pub adapter_version: Option<String>,
    pub supported_pids: Vec<u8>,
    pub pending_command: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_connected_at_ms: Option<u64>,
    pub metrics: DriverMetrics,
}

#[derive(Debug, Default)]
struct SessionInfo {
    pending_command: Option<String>,
    last_error: Option<String>,
    consecutive_failures: u32,
    last_connected_at_ms: Option<u64>,
    adapter_version: Option<String>,
    protocol: Option<ObdProtocol>,
    /// Bitmap from `0100`; `None` until a protocol answered
    supported_pids: Option<Vec<u8>>,
    metrics: DriverMetrics,
}

/// State shared with the response pump task
struct Shared {
    name: String,
    state: watch::Sender<DriverState>,
    info: StdMutex<SessionInfo>,
    listener: StdMutex<Option<mpsc::UnboundedSender<DriverEvent>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Shared {
    fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    fn set_state(&self, next: DriverState) -> DriverState {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("{}: {} -> {}", self.name, previous, next);
        }
        previous
    }

    /// Atomically move to `to` if the current state is one of `from`.
    /// On refusal the observed state is returned.
    fn transition(&self, from: &[DriverState], to: DriverState) -> Result<(), DriverState> {
        let mut observed = DriverState::Disconnected;
        let moved = self.state.send_if_modified(|state| {
            observed = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            debug!("{}: {} -> {}", self.name, observed, to);
            Ok(())
        } else {
            Err(observed)
        }
    }

    fn emit(&self, event: DriverEvent) {
        if let Some(listener) = lock(&self.listener).as_ref() {
            let _ = listener.send(event);
        }
    }

    /// Link failure reported by the transport
    fn fail(&self, reason: String, event: DriverEvent) {
        use DriverState::*;
        // An explicit disconnect has already settled the state
        if self
            .transition(&[Connecting, Initializing, Ready, Busy], Error)
            .is_ok()
        {
            warn!("{}: {}", self.name, reason);
        }
        lock(&self.info).last_error = Some(reason);
        self.emit(event);
    }
}

/// Returns a `Busy` driver to `Ready` when the command finishes or is dropped
struct BusyGuard<'a>(&'a Shared);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .transition(&[DriverState::Busy], DriverState::Ready);
    }
}

/// Strip prompts, blank lines and progress chatter from one adapter reply
pub fn clean_response(raw: &str) -> String {
    raw.split(|c| c == '\r' || c == '\n')
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_progress_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_progress_line(line: &str) -> bool {
    let upper = line.to_ascii_uppercase();
    upper.starts_with("SEARCHING") || (upper.starts_with("BUS INIT") && !upper.contains("ERROR"))
}

/// Frames transport bytes into responses at each `>` prompt
async fn pump(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    responses: mpsc::UnboundedSender<String>,
) {
    let mut buffer = String::new();
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Data(bytes) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(end) = buffer.find('>') {
                    let frame: String = buffer.drain(..=end).collect();
                    let response = clean_response(&frame[..frame.len() - 1]);
                    shared.emit(DriverEvent::Data(response.clone()));
                    if responses.send(response).is_err() {
                        return;
                    }
                }
            }
            TransportEvent::Error(message) => {
                shared.fail(format!("transport error: {message}"), DriverEvent::Error(message));
                return;
            }
            TransportEvent::Closed => {
                shared.fail("transport closed".to_string(), DriverEvent::Disconnected);
                return;
            }
        }
    }
}

struct DriverSession {
    transport: Box<dyn Transport>,
    responses: Option<mpsc::UnboundedReceiver<String>>,
    pump: Option<JoinHandle<()>>,
}

/// ELM327 driver over any [`Transport`]
pub struct Elm327Driver {
    shared: Arc<Shared>,
    session: Mutex<DriverSession>,
    options: DriverOptions,
    catalog: Arc<PidCatalog>,
    dtc_catalog: Arc<DtcCatalog>,
    dtc_cache: Option<Arc<DtcDescriptionCache>>,
}

impl Elm327Driver {
    pub fn new(transport: Box<dyn Transport>, options: DriverOptions) -> Self {
        let (state, _) = watch::channel(DriverState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                name: transport.name(),
                state,
                info: StdMutex::new(SessionInfo::default()),
                listener: StdMutex::new(None),
            }),
            session: Mutex::new(DriverSession {
                transport,
                responses: None,
                pump: None,
            }),
            options,
            catalog: Arc::new(PidCatalog::standard()),
            dtc_catalog: Arc::new(DtcCatalog::standard()),
            dtc_cache: None,
        }
    }

    /// Share catalogs between drivers instead of building one per driver
    pub fn with_catalogs(mut self, pids: Arc<PidCatalog>, dtcs: Arc<DtcCatalog>) -> Self {
        self.catalog = pids;
        self.dtc_catalog = dtcs;
        self
    }

    pub fn with_dtc_cache(mut self, cache: Arc<DtcDescriptionCache>) -> Self {
        self.dtc_cache = Some(cache);
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn catalog(&self) -> &Arc<PidCatalog> {
        &self.catalog
    }

    pub fn state(&self) -> DriverState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == DriverState::Ready
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<DriverState> {
        self.shared.state.subscribe()
    }

    /// Register the event listener, replacing any previous one
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<DriverEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.listener) = Some(tx);
        rx
    }

    pub fn status(&self) -> DriverStatus {
        let info = lock(&self.shared.info);
        DriverStatus {
            name: self.shared.name.clone(),
            state: self.state(),
            profile: self.options.profile.name,
            protocol: info.protocol,
            adapter_version: info.adapter_version.clone(),
            supported_pids: info.supported_pids.clone().unwrap_or_default(),
            pending_command: info.pending_command.clone(),
            last_error: info.last_error.clone(),
            consecutive_failures: info.consecutive_failures,
            last_connected_at_ms: info.last_connected_at_ms,
            metrics: info.metrics.clone(),
        }
    }

    /// Open the transport, initialise the adapter and select a protocol.
    ///
    /// Already-connected drivers return immediately. On failure the
    /// transport is closed and the driver is left `Disconnected`.
    pub async fn connect(&self) -> Result<(), ObdError> {
        use DriverState::*;
        if let Err(state) = self
            .shared
            .transition(&[Disconnected, Error], Connecting)
        {
            return match state {
                Ready | Busy => Ok(()),
                state => Err(ObdError::State {
                    operation: "connect",
                    state,
                }),
            };
        }

        info!("{}: connecting with profile {}", self.shared.name, self.options.profile.name);
        match self.establish().await {
            Ok(protocol) => {
                {
                    let mut info = lock(&self.shared.info);
                    info.last_connected_at_ms = Some(now_ms());
                    info.consecutive_failures = 0;
                    info.last_error = None;
                }
                self.shared.set_state(Ready);
                info!("{}: ready on {}", self.shared.name, protocol.description());
                self.shared.emit(DriverEvent::Connected { protocol });
                Ok(())
            }
            Err(err) => {
                warn!("{}: connect failed: {}", self.shared.name, err);
                self.teardown().await;
                lock(&self.shared.info).last_error = Some(err.to_string());
                self.shared.set_state(Disconnected);
                Err(match err {
                    ObdError::Protocol { .. } | ObdError::Connection(_) => err,
                    other => ObdError::Connection(format!("connect failed: {other}")),
                })
            }
        }
    }

    /// Close the transport. Safe to call in any state.
    pub async fn disconnect(&self) {
        self.teardown().await;
        if self.shared.set_state(DriverState::Disconnected) != DriverState::Disconnected {
            info!("{}: disconnected", self.shared.name);
            self.shared.emit(DriverEvent::Disconnected);
        }
    }

    /// Send a raw command and return the framed reply, unclassified
    pub async fn send_command(&self, raw: &str) -> Result<String, ObdError> {
        let _busy = self.enter_busy("send command")?;
        self.exchange(raw.trim(), self.options.command_timeout()).await
    }

    /// Read a catalog PID by mode and number
    pub async fn read_pid(&self, mode: u8, pid: u8) -> Result<DecodedValue, ObdError> {
        let def = self
            .catalog
            .get(mode, pid)
            .ok_or_else(|| ObdError::Unsupported(format!("PID {mode:02X}{pid:02X} is not in the catalog")))?;
        self.read_definition(def).await
    }

    pub async fn read_pid_by_name(&self, name: &str) -> Result<DecodedValue, ObdError> {
        let def = self
            .catalog
            .by_name(name)
            .ok_or_else(|| ObdError::Unsupported(format!("unknown PID '{name}'")))?;
        self.read_definition(def).await
    }

    /// Request and decode one PID, retrying transient failures
    pub async fn read_definition(&self, def: &PidDefinition) -> Result<DecodedValue, ObdError> {
        let known_unsupported = def.mode == mode::CURRENT_DATA
            && (0x01..=0x20).contains(&def.pid)
            && lock(&self.shared.info)
                .supported_pids
                .as_ref()
                .map_or(false, |supported| !supported.contains(&def.pid));
        if known_unsupported {
            return Err(ObdError::Unsupported(format!(
                "{} (PID {:02X}) is not supported by this vehicle",
                def.name, def.pid
            )));
        }

        let response = self.request(&def.request(), "read PID").await?;
        parser::parse_pid_response(&response, def)
    }

    /// Read stored trouble codes with descriptions
    pub async fn read_dtc(&self) -> Result<Vec<DtcInfo>, ObdError> {
        let response = match self.request("03", "read DTCs").await {
            Err(ObdError::Unsupported(reason)) if reason.contains("NO DATA") => return Ok(Vec::new()),
            other => other?,
        };
        let codes = parser::parse_dtc_response(&response)?;
        if !codes.is_empty() {
            info!("{}: {} stored DTC(s): {}", self.shared.name, codes.len(), codes.join(", "));
        }
        Ok(codes.iter().map(|code| self.describe_dtc(code)).collect())
    }

    /// Describe a code from the cache, falling back to the catalog
    pub fn describe_dtc(&self, code: &str) -> DtcInfo {
        if let Some(hit) = self.dtc_cache.as_ref().and_then(|cache| cache.get(code)) {
            return hit;
        }
        let info = self.dtc_catalog.describe(code);
        if let Some(cache) = &self.dtc_cache {
            cache.insert(info.clone());
        }
        info
    }

    /// Clear stored codes and the MIL. The ECU must answer `OK` or a line
    /// opening with the positive `44` reply, optionally behind a CAN length
    /// byte.
    pub async fn clear_dtc(&self) -> Result<(), ObdError> {
        let command = format!("{:02X}", mode::CLEAR_DTC);
        let response = self.request(&command, "clear DTCs").await?;
        let positive = parser::response_mode(mode::CLEAR_DTC);
        let acknowledged = response.lines().any(|line| line.trim().eq_ignore_ascii_case("OK"))
            || parser::hex_lines(&response)
                .map(|lines| {
                    lines.iter().any(|line| match line.as_slice() {
                        [first, ..] if *first == positive => true,
                        [len, second, ..] => *len as usize == line.len() - 1 && *second == positive,
                        _ => false,
                    })
                })
                .unwrap_or(false);
        if !acknowledged {
            return Err(ObdError::parse("clear DTC not acknowledged", response));
        }
        info!("{}: DTCs cleared", self.shared.name);
        Ok(())
    }

    pub async fn read_vin(&self) -> Result<String, ObdError> {
        let command = format!("{:02X}02", mode::VEHICLE_INFO);
        let response = self.request(&command, "read VIN").await?;
        parser::parse_vin(&response)
    }

    /// Single `ATI` round trip used as a liveness check
    pub async fn probe(&self) -> Result<(), ObdError> {
        self.execute("ATI", "probe").await.map(|_| ())
    }

    fn enter_busy(&self, operation: &'static str) -> Result<BusyGuard<'_>, ObdError> {
        self.shared
            .transition(&[DriverState::Ready], DriverState::Busy)
            .map_err(|state| ObdError::State { operation, state })?;
        Ok(BusyGuard(&self.shared))
    }

    /// One gated attempt with adapter reply classification
    async fn execute(&self, command: &str, operation: &'static str) -> Result<String, ObdError> {
        let _busy = self.enter_busy(operation)?;
        self.command(command, self.options.command_timeout()).await
    }

    /// [`Self::execute`] under the operation retry policy
    async fn request(&self, command: &str, operation: &'static str) -> Result<String, ObdError> {
        retry_if(
            &self.options.retry.operation,
            |_| self.execute(command, operation),
            ObdError::is_retryable,
            |attempt, err| debug!("{}: {} attempt {} failed: {}", self.shared.name, command, attempt, err),
        )
        .await
    }

    async fn command(&self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        let response = self.exchange(command, timeout).await?;
        match ObdError::from_adapter_reply(command, &response) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    async fn exchange(&self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        let started = Instant::now();
        lock(&self.shared.info).pending_command = Some(command.to_string());
        let result = self.round_trip(command, timeout).await;
        self.record(command, started.elapsed(), &result);
        result
    }

    async fn round_trip(&self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        let mut session = self.session.lock().await;
        let DriverSession {
            transport, responses, ..
        } = &mut *session;
        let responses = responses
            .as_mut()
            .ok_or_else(|| ObdError::Connection(format!("{} is not connected", self.shared.name)))?;

        // Late replies to commands that already timed out
        while responses.try_recv().is_ok() {}

        debug!("{} -> {}", self.shared.name, command);
        transport.write(format!("{command}\r").as_bytes()).await?;
        match tokio::time::timeout(timeout, responses.recv()).await {
            Ok(Some(response)) => {
                debug!("{} <- {:?}", self.shared.name, response);
                Ok(response)
            }
            Ok(None) => Err(ObdError::Connection(format!(
                "link lost while waiting for {command}"
            ))),
            Err(_) => Err(ObdError::Timeout {
                command: command.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn record(&self, command: &str, elapsed: Duration, result: &Result<String, ObdError>) {
        let elapsed_ms = elapsed.as_millis() as u64;
        let mut guard = lock(&self.shared.info);
        let info = &mut *guard;
        info.pending_command = None;

        let metrics = &mut info.metrics;
        metrics.total_commands += 1;
        metrics.last_command = Some(command.to_string());
        metrics.last_duration_ms = Some(elapsed_ms);
        counter!("obd_commands_total").increment(1);

        match result {
            Ok(_) => {
                metrics.successful_commands += 1;
                let n = metrics.successful_commands as f64;
                metrics.average_latency_ms += (elapsed_ms as f64 - metrics.average_latency_ms) / n;
                info.consecutive_failures = 0;
                histogram!("obd_command_latency_ms").record(elapsed_ms as f64);
            }
            Err(err) => {
                metrics.failed_commands += 1;
                if matches!(err, ObdError::Timeout { .. }) {
                    metrics.timeouts += 1;
                }
                info.consecutive_failures += 1;
                info.last_error = Some(err.to_string());
                counter!("obd_command_failures_total", "kind" => err.code()).increment(1);
            }
        }
    }

    async fn establish(&self) -> Result<ObdProtocol, ObdError> {
        let retry = self.options.retry;
        self.teardown().await;

        retry_with_policy(
            &retry.connect,
            |_| self.open_link(),
            |attempt, err| {
                warn!(
                    "{}: open attempt {}/{} failed: {}",
                    self.shared.name, attempt, retry.connect.max_attempts, err
                )
            },
        )
        .await?;

        self.shared
            .transition(&[DriverState::Connecting], DriverState::Initializing)
            .map_err(|state| ObdError::Connection(format!("link dropped while connecting ({state})")))?;

        let timeout = self.options.command_timeout();
        let banner = self.init_command("ATZ", timeout).await?;
        let version = banner
            .lines()
            .find(|line| line.to_ascii_uppercase().contains("ELM"))
            .or_else(|| banner.lines().last())
            .map(str::to_string);
        lock(&self.shared.info).adapter_version = version;

        let headers = if self.options.profile.headers { "ATH1" } else { "ATH0" };
        for command in ["ATE0", "ATL0", "ATS0", headers] {
            self.init_command(command, timeout).await?;
        }
        for command in self.options.profile.init_commands {
            if let Err(err) = self.init_command(command, timeout).await {
                warn!("{}: optional init command {} failed: {}", self.shared.name, command, err);
            }
        }

        self.select_protocol(timeout).await
    }

    async fn open_link(&self) -> Result<(), ObdError> {
        let mut session = self.session.lock().await;
        let events = session.transport.subscribe();
        session.transport.open().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        session.responses = Some(rx);
        session.pump = Some(tokio::spawn(pump(Arc::clone(&self.shared), events, tx)));
        debug!("{}: transport open", self.shared.name);
        Ok(())
    }

    async fn init_command(&self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        retry_if(
            &self.options.retry.init,
            |_| self.command(command, timeout),
            ObdError::is_retryable,
            |attempt, err| debug!("{}: {} attempt {} failed: {}", self.shared.name, command, attempt, err),
        )
        .await
    }

    /// Walk the candidate protocols, then auto, until `0100` answers
    async fn select_protocol(&self, timeout: Duration) -> Result<ObdProtocol, ObdError> {
        let mut candidates = match self.options.protocol {
            Some(protocol) => vec![protocol],
            None => self.options.profile.protocols.to_vec(),
        };
        if !candidates.contains(&ObdProtocol::Auto) {
            candidates.push(ObdProtocol::Auto);
        }

        let mut tried = Vec::with_capacity(candidates.len());
        for protocol in candidates {
            if self.state() == DriverState::Error {
                return Err(ObdError::Connection("link lost during protocol selection".into()));
            }
            tried.push(protocol.id().to_string());
            match self.try_protocol(protocol, timeout).await {
                Ok(supported) => {
                    debug!("{}: {} supports {} PIDs", self.shared.name, protocol, supported.len());
                    let mut info = lock(&self.shared.info);
                    info.protocol = Some(protocol);
                    info.supported_pids = Some(supported);
                    return Ok(protocol);
                }
                Err(err) => debug!("{}: protocol {} rejected: {}", self.shared.name, protocol, err),
            }
        }
        Err(ObdError::Protocol { tried })
    }

    async fn try_protocol(&self, protocol: ObdProtocol, timeout: Duration) -> Result<Vec<u8>, ObdError> {
        self.init_command(&protocol.to_elm_command(), timeout).await?;
        for command in protocol.init_commands() {
            self.init_command(command, timeout).await?;
        }
        let probe_timeout = timeout.max(Duration::from_millis(protocol.timeout_ms()));
        let response = self.command("0100", probe_timeout).await?;
        parser::parse_supported_pids(&response)
    }

    async fn teardown(&self) {
        let mut session = self.session.lock().await;
        if let Some(pump) = session.pump.take() {
            pump.abort();
        }
        session.responses = None;
        session.transport.close().await;
    }
}

impl Drop for Elm327Driver {
    fn drop(&mut self) {
        if let Some(pump) = self.session.get_mut().pump.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtc::Severity;
    use crate::retry::RetryPolicyOptions;
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

    fn options() -> DriverOptions {
        DriverOptions {
            command_timeout: Some(Duration::from_millis(500)),
            retry: RetryPolicyConfig {
                connect: quick(3),
                init: quick(2),
                operation: quick(3),
            },
            ..DriverOptions::default()
        }
    }

    fn simulated(options: DriverOptions) -> (Arc<Elm327Driver>, SimulatorHandle) {
        let transport = SimulatedTransport::default();
        let handle = transport.handle();
        (Arc::new(Elm327Driver::new(Box::new(transport), options)), handle)
    }

    async fn connected() -> (Arc<Elm327Driver>, SimulatorHandle) {
        let (driver, handle) = simulated(options());
        driver.connect().await.unwrap();
        handle.clear_written();
        (driver, handle)
    }

    async fn wait_for(driver: &Elm327Driver, wanted: DriverState) {
        let mut rx = driver.watch_state();
        while *rx.borrow_and_update() != wanted {
            rx.changed().await.unwrap();
        }
    }

    #[test]
    fn test_clean_response() {
        assert_eq!(clean_response("SEARCHING...\r41 0C 1A F8\r\r"), "41 0C 1A F8");
        assert_eq!(clean_response("BUS INIT: ...OK\r41 00 BE 3E B8 13\r"), "41 00 BE 3E B8 13");
        assert_eq!(clean_response("BUS INIT: ...ERROR\r"), "BUS INIT: ...ERROR");
        assert_eq!(clean_response("49 02 01 00\r49 02 02 48\r\r"), "49 02 01 00\n49 02 02 48");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_runs_init_sequence() {
        let (driver, handle) = simulated(options());
        let mut events = driver.subscribe_events();
        driver.connect().await.unwrap();

        assert_eq!(driver.state(), DriverState::Ready);
        assert_eq!(
            handle.written_commands(),
            vec!["ATZ", "ATE0", "ATL0", "ATS0", "ATH0", "ATSP0", "0100"]
        );

        let status = driver.status();
        assert_eq!(status.protocol, Some(ObdProtocol::Auto));
        assert_eq!(status.adapter_version.as_deref(), Some("ELM327 v1.5"));
        assert!(status.supported_pids.contains(&0x0C));
        assert!(status.last_connected_at_ms.is_some());

        let mut saw_connected = false;
        while let Ok(event) = events.try_recv() {
            saw_connected |= event == DriverEvent::Connected { protocol: ObdProtocol::Auto };
        }
        assert!(saw_connected);

        // Connecting twice is a no-op
        driver.connect().await.unwrap();
        assert_eq!(handle.written_commands().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_walk_skips_unreachable_protocols() {
        let (driver, handle) = simulated(options().with_profile("toyota_lexus"));
        handle.make_unreachable(ObdProtocol::Iso15765_4Can11bit500);
        driver.connect().await.unwrap();

        assert_eq!(driver.status().protocol, Some(ObdProtocol::Iso9141_2));
        let written = handle.written_commands();
        assert!(written.contains(&"ATH1".to_string()));
        assert!(written.contains(&"ATCAF0".to_string()));
        assert!(written.contains(&"ATST64".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_error_lists_every_attempt() {
        let (driver, handle) = simulated(options().with_profile("honda"));
        handle.set_response("0100", "UNABLE TO CONNECT");

        match driver.connect().await {
            Err(ObdError::Protocol { tried }) => {
                assert_eq!(tried, vec!["iso15765-4", "kwp2000-f", "auto"]);
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
        assert_eq!(driver.state(), DriverState::Disconnected);
        assert!(!handle.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_failed_opens() {
        let (driver, handle) = simulated(options());
        handle.fail_next_opens(2);
        driver.connect().await.unwrap();
        assert!(driver.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_policy() {
        let (driver, handle) = simulated(options());
        handle.fail_next_opens(10);

        let err = driver.connect().await.unwrap_err();
        assert_eq!(err.code(), "connection_error");
        assert_eq!(driver.state(), DriverState::Disconnected);
        assert!(driver.status().last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_pid_decodes_rpm() {
        let (driver, handle) = connected().await;
        let value = driver.read_pid(0x01, 0x0C).await.unwrap();

        assert_eq!(value.name, "Engine RPM");
        assert_eq!(value.unit.as_deref(), Some("rpm"));
        assert_eq!(value.value, 1726.0);
        assert_eq!(handle.written_commands(), vec!["010C"]);
        assert_eq!(driver.state(), DriverState::Ready);

        let by_name = driver.read_pid_by_name("Vehicle Speed").await.unwrap();
        assert_eq!(by_name.value, 42.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_pid_never_hits_the_bus() {
        let (driver, handle) = connected().await;

        // MAF is off in the simulator's 0100 bitmap
        let err = driver.read_pid(0x01, 0x10).await.unwrap_err();
        assert!(matches!(err, ObdError::Unsupported(_)));
        assert!(handle.written_commands().is_empty());

        let err = driver.read_pid(0x01, 0xEE).await.unwrap_err();
        assert!(matches!(err, ObdError::Unsupported(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_is_unsupported_without_retry() {
        let (driver, handle) = connected().await;
        handle.set_response("010C", "NO DATA");

        let err = driver.read_pid(0x01, 0x0C).await.unwrap_err();
        assert!(matches!(err, ObdError::Unsupported(_)));
        assert_eq!(handle.written_commands(), vec!["010C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_reported() {
        let (driver, handle) = connected().await;
        handle.silence("010C");

        let err = driver.read_pid(0x01, 0x0C).await.unwrap_err();
        assert!(matches!(err, ObdError::Timeout { ref command, timeout_ms: 500 } if command == "010C"));
        assert_eq!(driver.state(), DriverState::Ready);

        let status = driver.status();
        assert_eq!(status.metrics.timeouts, 3);
        assert_eq!(status.consecutive_failures, 3);

        handle.unsilence("010C");
        driver.read_pid(0x01, 0x0C).await.unwrap();
        assert_eq!(driver.status().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_driver_rejects_second_command() {
        let (driver, handle) = connected().await;
        handle.silence("010D");

        let pending = {
            let driver = Arc::clone(&driver);
            tokio::spawn(async move { driver.send_command("010D").await })
        };
        wait_for(&driver, DriverState::Busy).await;

        let err = driver.send_command("ATI").await.unwrap_err();
        assert!(matches!(
            err,
            ObdError::State {
                state: DriverState::Busy,
                ..
            }
        ));
        assert_eq!(driver.status().pending_command.as_deref(), Some("010D"));

        assert!(matches!(pending.await.unwrap(), Err(ObdError::Timeout { .. })));
        assert_eq!(driver.state(), DriverState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_returns_to_ready() {
        let (driver, handle) = connected().await;
        handle.set_error_rate(1.0);

        let err = driver.send_command("ATI").await.unwrap_err();
        assert!(matches!(err, ObdError::Transport(_)));
        assert_eq!(driver.state(), DriverState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_close_moves_to_error() {
        let (driver, handle) = connected().await;
        let mut events = driver.subscribe_events();

        handle.simulate_disconnect();
        wait_for(&driver, DriverState::Error).await;
        assert_eq!(events.recv().await, Some(DriverEvent::Disconnected));

        let err = driver.read_pid(0x01, 0x0C).await.unwrap_err();
        assert!(matches!(
            err,
            ObdError::State {
                state: DriverState::Error,
                ..
            }
        ));

        driver.connect().await.unwrap();
        assert!(driver.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_event() {
        let (driver, handle) = connected().await;
        let mut events = driver.subscribe_events();

        handle.simulate_error("bus glitch");
        wait_for(&driver, DriverState::Error).await;
        assert_eq!(events.recv().await, Some(DriverEvent::Error("bus glitch".into())));
        assert!(driver.status().last_error.unwrap().contains("bus glitch"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_dtc_with_descriptions() {
        let cache = Arc::new(DtcDescriptionCache::new());
        let driver = Elm327Driver::new(Box::new(SimulatedTransport::default()), options())
            .with_dtc_cache(Arc::clone(&cache));
        driver.connect().await.unwrap();

        let codes = driver.read_dtc().await.unwrap();
        let names: Vec<_> = codes.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(names, vec!["P0133", "P0420"]);
        assert!(codes.iter().all(|c| c.severity == Severity::Warning));

        driver.read_dtc().await.unwrap();
        assert_eq!(cache.stats().hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_dtc_no_data_means_none() {
        let (driver, handle) = connected().await;
        handle.set_response("03", "NO DATA");
        assert!(driver.read_dtc().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_dtc() {
        let (driver, handle) = connected().await;
        driver.clear_dtc().await.unwrap();

        handle.set_response("04", "12 34");
        let err = driver.clear_dtc().await.unwrap_err();
        assert_eq!(err.code(), "parse_error");
        assert_eq!(handle.written_commands(), vec!["04", "04"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_dtc_requires_positive_reply() {
        let (driver, handle) = connected().await;

        // 0x44 appearing as a data byte is not an acknowledgement
        handle.set_response("04", "43 44");
        assert_eq!(driver.clear_dtc().await.unwrap_err().code(), "parse_error");
        handle.set_response("04", "12 44 00");
        assert_eq!(driver.clear_dtc().await.unwrap_err().code(), "parse_error");

        handle.set_response("04", "OK");
        driver.clear_dtc().await.unwrap();
        handle.set_response("04", "7E8 01 44");
        driver.clear_dtc().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_vin() {
        let (driver, _handle) = connected().await;
        assert_eq!(driver.read_vin().await.unwrap(), "1HGCM82633A004352");
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_require_connection() {
        let (driver, _handle) = simulated(options());
        let err = driver.read_vin().await.unwrap_err();
        assert!(matches!(
            err,
            ObdError::State {
                state: DriverState::Disconnected,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let (driver, handle) = connected().await;
        let mut events = driver.subscribe_events();

        driver.disconnect().await;
        driver.disconnect().await;
        assert_eq!(driver.state(), DriverState::Disconnected);
        assert!(!handle.is_open());
        assert_eq!(events.recv().await, Some(DriverEvent::Disconnected));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_track_latency() {
        let (driver, handle) = connected().await;
        handle.set_response_delay(Duration::from_millis(40));

        driver.probe().await.unwrap();
        let metrics = driver.status().metrics;
        assert_eq!(metrics.last_command.as_deref(), Some("ATI"));
        assert!(metrics.last_duration_ms.unwrap() >= 40);
        assert_eq!(metrics.failed_commands, 0);
        assert!(metrics.average_latency_ms > 0.0);
    }
}

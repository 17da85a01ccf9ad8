//! In-memory ELM327 simulator

use super::{Transport, TransportEvent};
use crate::error::ObdError;
use crate::protocol::ObdProtocol;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const DEFAULT_RESPONSES: &[(&str, &str)] = &[
    ("ATZ", "ELM327 v1.5"),
    ("ATI", "ELM327 v1.5"),
    ("ATE0", "OK"),
    ("ATL0", "OK"),
    ("ATS0", "OK"),
    ("ATH0", "OK"),
    ("ATH1", "OK"),
    ("ATCAF0", "OK"),
    ("ATST64", "OK"),
    ("ATSP0", "OK"),
    ("ATSP1", "OK"),
    ("ATSP2", "OK"),
    ("ATSP3", "OK"),
    ("ATSP4", "OK"),
    ("ATSP5", "OK"),
    ("ATSP6", "OK"),
    ("ATSP7", "OK"),
    ("ATSP8", "OK"),
    ("ATSP9", "OK"),
    ("0100", "41 00 BE 3E B8 13"),
    ("0120", "41 20 80 00 00 01"),
    ("0104", "41 04 7F"),
    ("0105", "41 05 64"),
    ("010A", "41 0A C8"),
    ("010B", "41 0B 65"),
    ("010C", "41 0C 1A F8"),
    ("010D", "41 0D 2A"),
    ("010F", "41 0F 50"),
    ("0110", "41 10 1A F8"),
    ("0111", "41 11 80"),
    ("0142", "41 42 30 39"),
    ("03", "43 02 01 33 04 20"),
    ("04", "44"),
    ("0900", "49 00 55 40 00 00"),
    (
        "0902",
        "49 02 01 00 00 00 31\r49 02 02 48 47 43 4D\r49 02 03 38 32 36 33\r49 02 04 33 41 30 30\r49 02 05 34 33 35 32",
    ),
];

/// Simulator tunables
#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    /// Delay before each reply
    pub response_delay: Duration,
    /// Probability in `0.0..=1.0` that a write fails
    pub error_rate: f64,
    /// Extra or replacement command -> reply entries
    pub responses: HashMap<String, String>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            response_delay: Duration::ZERO,
            error_rate: 0.0,
            responses: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct SimState {
    open: bool,
    responses: HashMap<String, String>,
    silenced: HashSet<String>,
    fail_opens: u32,
    error_rate: f64,
    response_delay: Duration,
    written: Vec<String>,
    selected_protocol: Option<String>,
    unreachable: HashSet<String>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl SimState {
    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn reply_for(&self, command: &str) -> String {
        let bus_down = self
            .selected_protocol
            .as_ref()
            .is_some_and(|selected| self.unreachable.contains(selected));
        if bus_down && !command.starts_with("AT") {
            return "UNABLE TO CONNECT".to_string();
        }
        if let Some(reply) = self.responses.get(command) {
            return reply.clone();
        }
        if command.starts_with("01") || command.starts_with("09") {
            "NO DATA".to_string()
        } else {
            "?".to_string()
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Transport answering from a canned response table
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTransport {
    pub fn new(options: SimulatorOptions) -> Self {
        let mut responses: HashMap<String, String> = DEFAULT_RESPONSES
            .iter()
            .map(|(cmd, reply)| (cmd.to_string(), reply.to_string()))
            .collect();
        responses.extend(
            options
                .responses
                .into_iter()
                .map(|(cmd, reply)| (cmd.trim().to_ascii_uppercase(), reply)),
        );

        Self {
            state: Arc::new(Mutex::new(SimState {
                open: false,
                responses,
                silenced: HashSet::new(),
                fail_opens: 0,
                error_rate: options.error_rate.clamp(0.0, 1.0),
                response_delay: options.response_delay,
                written: Vec::new(),
                selected_protocol: None,
                unreachable: HashSet::new(),
                events: None,
            })),
        }
    }

    /// Control handle that stays valid after the transport is boxed
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(SimulatorOptions::default())
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(&mut self) -> Result<(), ObdError> {
        let mut state = lock(&self.state);
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(ObdError::Transport("simulated open failure".into()));
        }
        if !state.open {
            state.open = true;
            info!("Simulator connection opened");
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = lock(&self.state);
        if state.open {
            state.open = false;
            debug!("Simulator connection closed");
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError> {
        let (reply, delay, events) = {
            let mut state = lock(&self.state);
            if !state.open {
                return Err(ObdError::Transport("simulator is not open".into()));
            }

            let command = String::from_utf8_lossy(data)
                .replace('\r', "")
                .trim()
                .to_ascii_uppercase();
            state.written.push(command.clone());
            if command.starts_with("ATSP") {
                state.selected_protocol = Some(command.clone());
            }

            if state.error_rate > 0.0 && fastrand::f64() < state.error_rate {
                return Err(ObdError::Transport(format!("simulated write failure on {command}")));
            }
            if state.silenced.contains(&command) {
                debug!("Simulator ignoring {}", command);
                return Ok(());
            }

            let reply = format!("{}\r\r>", state.reply_for(&command));
            (reply, state.response_delay, state.events.clone())
        };

        let Some(tx) = events else {
            return Ok(());
        };
        if delay.is_zero() {
            let _ = tx.send(TransportEvent::Data(reply.into_bytes()));
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(TransportEvent::Data(reply.into_bytes()));
            });
        }
        Ok(())
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).events = Some(tx);
        rx
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    fn name(&self) -> String {
        "simulator".to_string()
    }
}

/// Runtime controls for a [`SimulatedTransport`]
#[derive(Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatorHandle {
    /// Override the reply to one command
    pub fn set_response(&self, command: &str, reply: &str) {
        lock(&self.state)
            .responses
            .insert(command.trim().to_ascii_uppercase(), reply.to_string());
    }

    /// Never answer `command`, forcing a timeout
    pub fn silence(&self, command: &str) {
        lock(&self.state)
            .silenced
            .insert(command.trim().to_ascii_uppercase());
    }

    /// Answer `command` again
    pub fn unsilence(&self, command: &str) {
        lock(&self.state)
            .silenced
            .remove(&command.trim().to_ascii_uppercase());
    }

    /// Answer OBD requests with `UNABLE TO CONNECT` while `protocol` is selected
    pub fn make_unreachable(&self, protocol: ObdProtocol) {
        lock(&self.state)
            .unreachable
            .insert(protocol.to_elm_command());
    }

    /// Make the next `count` calls to `open` fail
    pub fn fail_next_opens(&self, count: u32) {
        lock(&self.state).fail_opens = count;
    }

    pub fn set_error_rate(&self, rate: f64) {
        lock(&self.state).error_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_response_delay(&self, delay: Duration) {
        lock(&self.state).response_delay = delay;
    }

    /// Emit a transport error event
    pub fn simulate_error(&self, message: &str) {
        lock(&self.state).emit(TransportEvent::Error(message.to_string()));
    }

    /// Drop the link as if the adapter was unplugged
    pub fn simulate_disconnect(&self) {
        let mut state = lock(&self.state);
        if state.open {
            state.open = false;
            state.emit(TransportEvent::Closed);
        }
    }

    /// Commands written so far, normalized
    pub fn written_commands(&self) -> Vec<String> {
        lock(&self.state).written.clone()
    }

    pub fn clear_written(&self) {
        lock(&self.state).written.clear();
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }
}

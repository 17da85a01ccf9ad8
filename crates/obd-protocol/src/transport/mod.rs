//! Byte-stream transports to an ELM327 adapter
//!
//! A transport only moves bytes. Framing on the `>` prompt happens in the
//! driver, so every back-end delivers raw chunks as [`TransportEvent::Data`].

mod serial;
mod simulator;
mod tcp;

pub use serial::SerialTransport;
pub use simulator::{SimulatedTransport, SimulatorHandle, SimulatorOptions};
pub use tcp::TcpTransport;

use crate::error::ObdError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Notification from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw bytes received from the adapter
    Data(Vec<u8>),
    /// Lower-layer failure; the link may be unusable
    Error(String),
    /// The medium went away
    Closed,
}

/// Raw byte channel to an adapter
#[async_trait]
pub trait Transport: Send {
    /// Open the medium; a no-op when already open
    async fn open(&mut self) -> Result<(), ObdError>;

    /// Close the medium. Idempotent and infallible.
    async fn close(&mut self);

    /// Write raw bytes
    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError>;

    /// Register the single event listener, replacing any previous one.
    ///
    /// Call before [`Transport::open`]; events from the opened medium go to
    /// the listener registered at that point.
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent>;

    fn is_open(&self) -> bool;

    /// Short description for logs, e.g. `serial:/dev/ttyUSB0`
    fn name(&self) -> String;
}

/// How to reach the adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// In-memory ELM327 simulator
    Simulator {
        #[serde(default)]
        response_delay_ms: u64,
        #[serde(default)]
        error_rate: f64,
    },
    /// USB/Bluetooth serial port
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// Wi-Fi adapter
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
}

fn default_baud_rate() -> u32 {
    serial::DEFAULT_BAUD_RATE
}

fn default_tcp_port() -> u16 {
    tcp::DEFAULT_PORT
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Simulator {
            response_delay_ms: 0,
            error_rate: 0.0,
        }
    }
}

impl TransportConfig {
    /// Build an unopened transport
    pub fn build(&self) -> Box<dyn Transport> {
        match self {
            TransportConfig::Simulator {
                response_delay_ms,
                error_rate,
            } => Box::new(SimulatedTransport::new(SimulatorOptions {
                response_delay: std::time::Duration::from_millis(*response_delay_ms),
                error_rate: *error_rate,
                ..SimulatorOptions::default()
            })),
            TransportConfig::Serial { path, baud_rate } => {
                Box::new(SerialTransport::new(path.clone(), *baud_rate))
            }
            TransportConfig::Tcp { host, port } => Box::new(TcpTransport::new(host.clone(), *port)),
        }
    }
}

/// Write half plus the task pumping the read half into events.
///
/// Shared by the serial and TCP transports.
pub(crate) struct StreamLink<S> {
    writer: WriteHalf<S>,
    reader: JoinHandle<()>,
}

impl<S> StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(crate) fn start(
        stream: S,
        label: String,
        events: Option<mpsc::UnboundedSender<TransportEvent>>,
    ) -> Self {
        let (mut read_half, writer) = tokio::io::split(stream);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let event = match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!("{}: stream closed by peer", label);
                        TransportEvent::Closed
                    }
                    Ok(n) => TransportEvent::Data(buf[..n].to_vec()),
                    Err(e) => {
                        warn!("{}: read failed: {}", label, e);
                        TransportEvent::Error(e.to_string())
                    }
                };
                let terminal = !matches!(event, TransportEvent::Data(_));
                if let Some(tx) = &events {
                    let _ = tx.send(event);
                }
                if terminal {
                    break;
                }
            }
        });

        Self { writer, reader }
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<(), ObdError> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(mut self) {
        self.reader.abort();
        let _ = self.writer.shutdown().await;
    }
}

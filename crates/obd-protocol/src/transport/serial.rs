//! Serial port transport (USB and Bluetooth SPP adapters)

use super::{StreamLink, Transport, TransportEvent};
use crate::error::ObdError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

/// Factory default of most ELM327 v1.x USB and Bluetooth adapters
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// ELM327 on a serial device such as `/dev/ttyUSB0` or `COM3`
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    link: Option<StreamLink<SerialStream>>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            link: None,
            events: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<(), ObdError> {
        if self.link.is_some() {
            return Ok(());
        }
        let stream = tokio_serial::new(&self.path, self.baud_rate).open_native_async()?;
        info!("Opened serial port {} at {} baud", self.path, self.baud_rate);
        self.link = Some(StreamLink::start(stream, self.name(), self.events.clone()));
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
            info!("Closed serial port {}", self.path);
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError> {
        match self.link.as_mut() {
            Some(link) => link.write(data).await,
            None => Err(ObdError::Transport(format!("{} is not open", self.path))),
        }
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn name(&self) -> String {
        format!("serial:{}", self.path)
    }
}

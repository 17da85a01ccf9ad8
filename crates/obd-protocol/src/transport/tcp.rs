//! TCP transport for Wi-Fi ELM327 adapters

use super::{StreamLink, Transport, TransportEvent};
use crate::error::ObdError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::info;

/// Port most Wi-Fi dongles listen on
pub const DEFAULT_PORT: u16 = 35000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// ELM327 reachable over TCP, typically `192.168.0.10:35000`
pub struct TcpTransport {
    host: String,
    port: u16,
    link: Option<StreamLink<TcpStream>>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            link: None,
            events: None,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<(), ObdError> {
        if self.link.is_some() {
            return Ok(());
        }
        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| ObdError::Transport(format!("connect to {} timed out", self.name())))??;
        stream.set_nodelay(true)?;

        info!("Connected to {}", self.name());
        self.link = Some(StreamLink::start(stream, self.name(), self.events.clone()));
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
            info!("Closed {}", self.name());
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError> {
        match self.link.as_mut() {
            Some(link) => link.write(data).await,
            None => Err(ObdError::Transport(format!("{} is not open", self.name()))),
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
        format!("tcp:{}:{}", self.host, self.port)
    }
}

//! Seam between the engine and the port agent relaying bytes to the instrument.
//!
//! Outbound bytes go through the [`Transport`] trait. Inbound bytes arrive as
//! [`Inbound`] batches on a bounded channel whose sending half, the
//! [`PortAgentLink`], belongs to whatever component reads from the port
//! agent. The engine never opens sockets itself.
//!
//! ```
//! use marine_driver::transport::{Inbound, port_agent_channel};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (link, mut inbound) = port_agent_channel(8);
//! link.deliver(&b"S>"[..]).await.unwrap();
//! link.close("port agent exited").await;
//!
//! assert!(matches!(inbound.recv().await, Some(Inbound::Data(_))));
//! assert!(matches!(inbound.recv().await, Some(Inbound::Closed(_))));
//! # }
//! ```

use bytes::Bytes;
use marine_core::{Error, Result};
use tokio::sync::mpsc;

/// Sink for bytes written to the instrument.
pub trait Transport: Send + 'static {
    /// Write `bytes` to the instrument.
    ///
    /// # Errors
    /// Returns `Error::ConnectionLost` or `Error::Io` if the port agent can no
    /// longer accept data.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;
}

/// One notification from the port agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A batch of raw bytes in arrival order.
    Data(Bytes),
    /// The port agent connection ended.
    Closed(String),
}

/// Sending half of the inbound channel.
#[derive(Debug, Clone)]
pub struct PortAgentLink {
    tx: mpsc::Sender<Inbound>,
}

impl PortAgentLink {
    /// Deliver a batch of bytes, waiting for channel capacity.
    pub async fn deliver(&self, data: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(Inbound::Data(data.into()))
            .await
            .map_err(|_| Error::ConnectionLost("protocol dropped its inbound channel".into()))
    }

    /// Deliver without waiting. Fails if the channel is full or closed.
    pub fn try_deliver(&self, data: impl Into<Bytes>) -> Result<()> {
        self.tx
            .try_send(Inbound::Data(data.into()))
            .map_err(|e| Error::ConnectionLost(format!("inbound channel unavailable: {e}")))
    }

    /// Report that the connection ended.
    pub async fn close(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Inbound::Closed(reason.into())).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create an inbound channel with room for `capacity` batches.
pub fn port_agent_channel(capacity: usize) -> (PortAgentLink, mpsc::Receiver<Inbound>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PortAgentLink { tx }, rx)
}

/// [`Transport`] that forwards outbound bytes to a channel read by the
/// port agent bridge.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(bytes))
            .map_err(|_| Error::ConnectionLost("outbound channel closed".into()))
    }
}

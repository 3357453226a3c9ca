//! Frame transport abstraction.
//!
//! The master and outstation exchange `LinkFrame`s through a `Transport`.
//! The engine does not care whether frames travel over TCP, a serial line or
//! an in-process channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::LinkFrame;
use crate::error::{Dnp3Error, Result};

/// A bidirectional frame transport.
#[async_trait]
pub trait Transport: Send {
    /// Establish the connection. Called again after every disconnect.
    async fn connect(&mut self) -> Result<()>;

    /// Send one frame.
    async fn send_frame(&mut self, frame: LinkFrame) -> Result<()>;

    /// Receive the next frame.
    ///
    /// Must be cancel safe: dropping the future before it completes must not
    /// lose a frame.
    async fn recv_frame(&mut self) -> Result<LinkFrame>;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;

    /// Human readable peer description for logging.
    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn send_frame(&mut self, frame: LinkFrame) -> Result<()> {
        (**self).send_frame(frame).await
    }

    async fn recv_frame(&mut self) -> Result<LinkFrame> {
        (**self).recv_frame().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn peer(&self) -> String {
        (**self).peer()
    }
}

/// In-process transport backed by unbounded channels.
///
/// Created in connected pairs with [`MemoryTransport::pair`]. Once either
/// side is closed or dropped the other side sees `ChannelClosed`.
#[derive(Debug)]
pub struct MemoryTransport {
    name: &'static str,
    tx: Option<mpsc::UnboundedSender<LinkFrame>>,
    rx: mpsc::UnboundedReceiver<LinkFrame>,
}

impl MemoryTransport {
    /// Create two connected transports.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                name: "memory-a",
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                name: "memory-b",
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }

    fn sender(&self) -> Result<&mpsc::UnboundedSender<LinkFrame>> {
        match &self.tx {
            Some(tx) if !tx.is_closed() => Ok(tx),
            _ => Err(Dnp3Error::NotConnected),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self) -> Result<()> {
        self.sender().map(|_| ())
    }

    async fn send_frame(&mut self, frame: LinkFrame) -> Result<()> {
        self.sender()?
            .send(frame)
            .map_err(|_| Dnp3Error::ChannelClosed)
    }

    async fn recv_frame(&mut self) -> Result<LinkFrame> {
        self.rx.recv().await.ok_or(Dnp3Error::ChannelClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn peer(&self) -> String {
        self.name.to_string()
    }
}

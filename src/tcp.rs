//! TCP transport and listener.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::{LinkCodec, LinkFrame};
use crate::error::{Dnp3Error, Result};
use crate::outstation::OutstationHandle;
use crate::transport::Transport;

/// Default DNP3 TCP port.
pub const DEFAULT_PORT: u16 = 20000;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Link frames over a TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    address: Option<String>,
    connect_timeout: Duration,
    peer: String,
    framed: Option<Framed<TcpStream, LinkCodec>>,
}

impl TcpTransport {
    /// Client transport that connects to `address` (host:port).
    pub fn client(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            peer: address.clone(),
            address: Some(address),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            framed: None,
        }
    }

    /// Transport over an already accepted stream. It cannot reconnect.
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true).ok();
        Self {
            address: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            peer,
            framed: Some(Framed::new(stream, LinkCodec::new())),
        }
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn framed(&mut self) -> Result<&mut Framed<TcpStream, LinkCodec>> {
        self.framed.as_mut().ok_or(Dnp3Error::NotConnected)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.framed.is_some() {
            return Ok(());
        }
        let Some(address) = self.address.clone() else {
            return Err(Dnp3Error::NotConnected);
        };

        let stream = timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Dnp3Error::ConnectionTimeout)?
            .map_err(Dnp3Error::Io)?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true).ok();
        debug!("Connected to {}", address);
        self.framed = Some(Framed::new(stream, LinkCodec::new()));
        Ok(())
    }

    async fn send_frame(&mut self, frame: LinkFrame) -> Result<()> {
        let result = self.framed()?.send(frame).await;
        if result.is_err() {
            self.framed = None;
        }
        result
    }

    async fn recv_frame(&mut self) -> Result<LinkFrame> {
        let next = self.framed()?.next().await;
        match next {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => {
                self.framed = None;
                Err(e)
            }
            None => {
                self.framed = None;
                Err(Dnp3Error::connection("connection closed by peer"))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            framed.close().await?;
        }
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// TCP listener that attaches accepted connections to an outstation.
///
/// A newly accepted connection replaces the outstation's current one.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Bind to a local address.
    pub async fn bind(address: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the outstation shuts down.
    pub async fn serve(self, outstation: OutstationHandle) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            info!("Accepted connection from {}", addr);
            if outstation
                .attach(TcpTransport::from_stream(stream))
                .await
                .is_err()
            {
                info!("Outstation shut down, stopping listener");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_tcp_transport_exchanges_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut server = TcpTransport::from_stream(stream);
            let frame = server.recv_frame().await.unwrap();
            server
                .send_frame(LinkFrame::link_status(frame.source, frame.destination))
                .await
                .unwrap();
        });

        let mut client = TcpTransport::client(addr.to_string());
        client.connect().await.unwrap();
        client
            .send_frame(LinkFrame::request_link_status(1024, 1))
            .await
            .unwrap();
        let answer = client.recv_frame().await.unwrap();
        assert_eq!(answer, LinkFrame::link_status(1, 1024));
        assert_eq!(answer.payload, Bytes::new());

        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_without_connect_fails() {
        let mut client = TcpTransport::client("127.0.0.1:1");
        let result = client
            .send_frame(LinkFrame::request_link_status(1, 2))
            .await;
        assert!(matches!(result, Err(Dnp3Error::NotConnected)));
    }
}

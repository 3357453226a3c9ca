//! Outstation role.
//!
//! An outstation owns a [`Database`] and answers requests arriving over the
//! transport attached to it. It runs as a single tokio task; the returned
//! [`OutstationHandle`] is used to attach transports, enable or disable the
//! outstation and update the database.
//!
//! ```rust,ignore
//! use voltage_dnp3::outstation::{spawn_outstation, OutstationConfig, OutstationHandlers};
//! use voltage_dnp3::outstation::database::{PointConfig, UpdateOptions};
//! use voltage_dnp3::{Measurement, PointType, TcpServer, Value};
//!
//! let outstation = spawn_outstation(OutstationConfig::new(1024, 1), OutstationHandlers::default())?;
//! outstation.transaction(|tx| tx.add(PointType::BinaryInput, 0, PointConfig::new()))?;
//!
//! tokio::spawn(TcpServer::bind("0.0.0.0:20000").await?.serve(outstation.clone()));
//!
//! outstation.transaction(|tx| {
//!     tx.update(0, Measurement::new(Value::Binary(true)), UpdateOptions::detect())
//! })?;
//! ```

mod config;
pub mod database;
mod session;
mod traits;

use std::future::pending;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::codec::LinkFrame;
use crate::decode::DecodeLevel;
use crate::error::{Dnp3Error, Result};
use crate::transport::Transport;

pub use config::*;
pub use database::{Database, DatabaseConfig, Transaction};
pub use traits::*;

use session::Session;

/// Capacity of the handle to task message queue.
const MESSAGE_QUEUE_SIZE: usize = 16;

enum OutstationMessage {
    Attach(Box<dyn Transport>),
    Enable,
    Disable,
    SetDecodeLevel(DecodeLevel),
    Shutdown,
}

/// Handle to a running outstation.
///
/// Cloning the handle is cheap. The outstation task stops when
/// [`OutstationHandle::shutdown`] is called or every handle is dropped.
#[derive(Debug, Clone)]
pub struct OutstationHandle {
    database: Arc<Database>,
    tx: mpsc::Sender<OutstationMessage>,
}

impl std::fmt::Debug for OutstationMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attach(transport) => write!(f, "Attach({})", transport.peer()),
            Self::Enable => f.write_str("Enable"),
            Self::Disable => f.write_str("Disable"),
            Self::SetDecodeLevel(level) => write!(f, "SetDecodeLevel({:?})", level),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl OutstationHandle {
    /// Attach a transport, replacing the current one.
    pub async fn attach(&self, transport: impl Transport + 'static) -> Result<()> {
        self.send(OutstationMessage::Attach(Box::new(transport)))
            .await
    }

    /// Start answering requests on the attached transport.
    pub async fn enable(&self) -> Result<()> {
        self.send(OutstationMessage::Enable).await
    }

    /// Stop reading from the attached transport. The transport stays
    /// attached and the database keeps accepting updates.
    pub async fn disable(&self) -> Result<()> {
        self.send(OutstationMessage::Disable).await
    }

    /// Change the protocol trace level.
    pub async fn set_decode_level(&self, level: DecodeLevel) -> Result<()> {
        self.send(OutstationMessage::SetDecodeLevel(level)).await
    }

    /// Stop the outstation task and close its transport.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(OutstationMessage::Shutdown).await
    }

    /// The outstation database.
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Run `f` as one database transaction.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        self.database.transaction(f)
    }

    async fn send(&self, message: OutstationMessage) -> Result<()> {
        self.tx.send(message).await.map_err(|_| Dnp3Error::Shutdown)
    }
}

/// Validate `config` and spawn the outstation task.
///
/// Must be called from within a tokio runtime. The outstation starts
/// enabled with no transport attached.
pub fn spawn_outstation(config: OutstationConfig, handlers: OutstationHandlers) -> Result<OutstationHandle> {
    config.validate()?;
    let database = Arc::new(Database::with_clock(
        config.database.clone(),
        handlers.clock.clone(),
    ));
    let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_SIZE);

    info!(
        "Starting outstation {} for master {}",
        config.outstation_address, config.master_address
    );
    let task = OutstationTask {
        session: Session::new(config, database.clone(), handlers),
        transport: None,
        rx,
        enabled: true,
    };
    tokio::spawn(task.run());

    Ok(OutstationHandle { database, tx })
}

enum Event {
    Frame(Result<LinkFrame>),
    Message(Option<OutstationMessage>),
    Changed,
    Timeout,
}

struct OutstationTask {
    session: Session,
    transport: Option<Box<dyn Transport>>,
    rx: mpsc::Receiver<OutstationMessage>,
    enabled: bool,
}

impl OutstationTask {
    async fn run(mut self) {
        loop {
            let deadline = self.session.next_deadline();
            let database = self.session.database().clone();

            let event = tokio::select! {
                biased;
                message = self.rx.recv() => Event::Message(message),
                frame = recv(&mut self.transport, self.enabled) => Event::Frame(frame),
                _ = database.changed().notified() => Event::Changed,
                _ = wait(deadline) => Event::Timeout,
            };

            match event {
                Event::Frame(Ok(frame)) => self.session.handle_frame(frame, Instant::now()),
                Event::Frame(Err(e)) => {
                    warn!("Transport error: {}", e);
                    self.detach().await;
                }
                Event::Message(Some(OutstationMessage::Attach(transport))) => {
                    self.attach(transport).await;
                }
                Event::Message(Some(OutstationMessage::Enable)) => {
                    info!("Outstation enabled");
                    self.enabled = true;
                }
                Event::Message(Some(OutstationMessage::Disable)) => {
                    info!("Outstation disabled");
                    self.enabled = false;
                    self.session.reset();
                }
                Event::Message(Some(OutstationMessage::SetDecodeLevel(level))) => {
                    self.session.set_decode_level(level);
                }
                Event::Message(Some(OutstationMessage::Shutdown)) | Event::Message(None) => {
                    info!("Outstation shutting down");
                    self.detach().await;
                    return;
                }
                Event::Changed => {}
                Event::Timeout => self.session.on_timeout(Instant::now()),
            }

            if self.transport.is_some() && self.enabled {
                self.session.poll_unsolicited(Instant::now());
            }
            if let Err(e) = self.flush().await {
                warn!("Send failed: {}", e);
                self.detach().await;
            }
        }
    }

    async fn attach(&mut self, mut transport: Box<dyn Transport>) {
        self.detach().await;
        match transport.connect().await {
            Ok(()) => {
                info!("Transport attached: {}", transport.peer());
                self.transport = Some(transport);
            }
            Err(e) => warn!("Attached transport {} failed: {}", transport.peer(), e),
        }
    }

    async fn detach(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            debug!("Closing transport {}", transport.peer());
            if let Err(e) = transport.close().await {
                debug!("Close failed: {}", e);
            }
        }
        self.session.reset();
    }

    async fn flush(&mut self) -> Result<()> {
        let frames = self.session.drain();
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };
        for frame in frames {
            transport.send_frame(frame).await?;
        }
        Ok(())
    }
}

async fn recv(transport: &mut Option<Box<dyn Transport>>, enabled: bool) -> Result<LinkFrame> {
    match transport {
        Some(transport) if enabled => transport.recv_frame().await,
        _ => pending().await,
    }
}

async fn wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::parser::parse_response;
    use crate::transport::MemoryTransport;
    use crate::types::{FunctionCode, ObjectHeader, Request, Sequence};

    fn read_class0(seq: u8) -> LinkFrame {
        let request = Request::new(Sequence::new(seq), FunctionCode::Read, vec![ObjectHeader::Class0]);
        LinkFrame::user_data(1024, 1, request.encode())
    }

    #[tokio::test]
    async fn test_outstation_answers_over_memory_transport() {
        let config = OutstationConfig::new(1024, 1).allow_unsolicited(false);
        let outstation = spawn_outstation(config, OutstationHandlers::default()).unwrap();
        let (local, mut remote) = MemoryTransport::pair();
        outstation.attach(local).await.unwrap();

        remote.send_frame(read_class0(2)).await.unwrap();
        let frame = remote.recv_frame().await.unwrap();
        let response = parse_response(&frame.payload).unwrap();
        assert_eq!(response.control.seq, Sequence::new(2));
        assert_eq!(frame.destination, 1);

        outstation.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_outstation_ignores_requests() {
        let config = OutstationConfig::new(1024, 1).allow_unsolicited(false);
        let outstation = spawn_outstation(config, OutstationHandlers::default()).unwrap();
        let (local, mut remote) = MemoryTransport::pair();
        outstation.attach(local).await.unwrap();
        outstation.disable().await.unwrap();

        remote.send_frame(read_class0(0)).await.unwrap();
        let answer = tokio::time::timeout(Duration::from_secs(1), remote.recv_frame()).await;
        assert!(answer.is_err());

        outstation.enable().await.unwrap();
        let frame = remote.recv_frame().await.unwrap();
        assert!(parse_response(&frame.payload).is_ok());
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let outstation = spawn_outstation(OutstationConfig::default(), OutstationHandlers::default()).unwrap();
        outstation.shutdown().await.unwrap();
        tokio::task::yield_now().await;

        let (local, _remote) = MemoryTransport::pair();
        let mut result = outstation.attach(local).await;
        for _ in 0..10 {
            if result.is_err() {
                break;
            }
            tokio::task::yield_now().await;
            let (local, _remote) = MemoryTransport::pair();
            result = outstation.attach(local).await;
        }
        assert!(matches!(result, Err(Dnp3Error::Shutdown)));
    }

    #[test]
    fn test_spawn_rejects_invalid_config() {
        let result = spawn_outstation(OutstationConfig::new(5, 5), OutstationHandlers::default());
        assert!(matches!(result, Err(Dnp3Error::InvalidConfig(_))));
    }
}

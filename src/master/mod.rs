//! Master role.
//!
//! A master channel owns one transport and any number of associations, one
//! per outstation address. The channel task connects, reconnects with the
//! configured backoff and routes received frames to the association whose
//! address matches the frame source. Each association runs its own task
//! that executes one request at a time:
//!
//! 1. startup (disable unsolicited, integrity poll, enable unsolicited)
//! 2. automatic tasks raised by IIN bits (clear restart, time sync,
//!    integrity after overflow, event scans)
//! 3. demanded polls, then user requests in submission order, then due polls
//!
//! ```rust,ignore
//! use voltage_dnp3::master::{spawn_master, AssociationConfig, AssociationHandlers, MasterChannelConfig, ReadRequest};
//! use voltage_dnp3::{NullListener, TcpTransport};
//!
//! let channel = spawn_master(
//!     MasterChannelConfig::new(1),
//!     TcpTransport::client("127.0.0.1:20000"),
//!     NullListener,
//! );
//! let association = channel
//!     .add_association(1024, AssociationConfig::default(), AssociationHandlers::default())
//!     .await?;
//! channel.enable().await?;
//!
//! association.add_poll(ReadRequest::integrity(), Duration::from_secs(60)).await?;
//! ```

mod association;
mod channel;
mod config;
mod handler;
mod task;

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::decode::DecodeLevel;
use crate::error::{CommandError, Dnp3Error, FileError, Result, TaskError, TimeSyncError};
use crate::transport::Transport;
use crate::types::{
    AttrId, Attribute, CommandHeaders, CommandMode, EventClasses, FileInfo, FileMode, IndexRange,
};

pub use config::*;
pub use handler::*;
pub use task::{FreezeType, ReadRequest, RestartType};

use channel::{ChannelMessage, ChannelTask, MESSAGE_QUEUE_SIZE};
use task::{AssociationMessage, Reply, UserTask};

/// Spawn a master channel over `transport`.
///
/// Must be called from within a tokio runtime. The channel starts disabled;
/// add associations, then call [`MasterChannel::enable`] to connect.
pub fn spawn_master(
    config: MasterChannelConfig,
    transport: impl Transport + 'static,
    listener: impl Listener<ChannelState> + 'static,
) -> MasterChannel {
    info!("Starting master channel {} to {}", config.master_address, transport.peer());
    let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_SIZE);
    let task = ChannelTask::new(config, Box::new(transport), Box::new(listener), rx);
    tokio::spawn(task.run());
    MasterChannel { tx }
}

/// Handle to a master channel.
#[derive(Debug, Clone)]
pub struct MasterChannel {
    tx: mpsc::Sender<ChannelMessage>,
}

impl MasterChannel {
    /// Start connecting.
    pub async fn enable(&self) -> Result<()> {
        self.send(ChannelMessage::Enable).await
    }

    /// Close the connection and stop reconnecting. Queued requests of every
    /// association fail.
    pub async fn disable(&self) -> Result<()> {
        self.send(ChannelMessage::Disable).await
    }

    /// Change the protocol trace level of every association.
    pub async fn set_decode_level(&self, level: DecodeLevel) -> Result<()> {
        self.send(ChannelMessage::SetDecodeLevel(level)).await
    }

    /// Add an association for the outstation at `address`.
    pub async fn add_association(
        &self,
        address: u16,
        config: AssociationConfig,
        handlers: AssociationHandlers,
    ) -> Result<AssociationHandle> {
        let (reply, rx) = oneshot::channel();
        self.send(ChannelMessage::AddAssociation {
            address,
            config,
            handlers,
            reply,
        })
        .await?;
        let tx = rx.await.map_err(|_| Dnp3Error::Shutdown)??;
        Ok(AssociationHandle {
            address,
            tx,
            channel: self.tx.clone(),
        })
    }

    /// Stop the channel and every association.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(ChannelMessage::Shutdown).await
    }

    async fn send(&self, message: ChannelMessage) -> Result<()> {
        self.tx.send(message).await.map_err(|_| Dnp3Error::Shutdown)
    }
}

/// Handle to one association.
///
/// Requests are queued and executed in order. Each method resolves when its
/// request completes or fails. The association is removed once every handle
/// to it, poll handles included, has been dropped.
#[derive(Debug, Clone)]
pub struct AssociationHandle {
    address: u16,
    tx: mpsc::Sender<AssociationMessage>,
    channel: mpsc::Sender<ChannelMessage>,
}

impl AssociationHandle {
    /// Link address of the outstation.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Read the objects of `request` once.
    pub async fn read(&self, request: ReadRequest) -> std::result::Result<(), TaskError> {
        self.execute(|reply| UserTask::Read { request, reply }).await
    }

    /// Execute controls with DIRECT_OPERATE or SELECT then OPERATE.
    ///
    /// A failed SELECT is retried per the task retry strategy. A DIRECT_OPERATE
    /// or OPERATE that gets no valid response fails with
    /// [`CommandError::OperateUnconfirmed`] and is never sent twice.
    pub async fn operate(
        &self,
        mode: CommandMode,
        headers: CommandHeaders,
    ) -> std::result::Result<(), CommandError> {
        if headers.is_empty() {
            return Ok(());
        }
        self.execute(|reply| UserTask::Command {
            mode,
            headers,
            reply,
        })
        .await
    }

    /// Synchronize the outstation clock.
    pub async fn synchronize_time(&self, mode: TimeSyncMode) -> std::result::Result<(), TimeSyncError> {
        self.execute(|reply| UserTask::TimeSync { mode, reply }).await
    }

    /// Cold restart. Returns the delay the outstation needs.
    pub async fn cold_restart(&self) -> std::result::Result<Duration, TaskError> {
        self.restart(RestartType::Cold).await
    }

    /// Warm restart. Returns the delay the outstation needs.
    pub async fn warm_restart(&self) -> std::result::Result<Duration, TaskError> {
        self.restart(RestartType::Warm).await
    }

    async fn restart(&self, kind: RestartType) -> std::result::Result<Duration, TaskError> {
        self.execute(|reply| UserTask::Restart { kind, reply }).await
    }

    /// Freeze counters within `range`.
    pub async fn freeze(&self, kind: FreezeType, range: IndexRange) -> std::result::Result<(), TaskError> {
        self.execute(|reply| UserTask::Freeze { kind, range, reply })
            .await
    }

    /// Enable unsolicited reporting of `classes`.
    pub async fn enable_unsolicited(&self, classes: EventClasses) -> std::result::Result<(), TaskError> {
        self.execute(|reply| UserTask::Unsolicited {
            enable: true,
            classes,
            reply,
        })
        .await
    }

    /// Disable unsolicited reporting of `classes`.
    pub async fn disable_unsolicited(&self, classes: EventClasses) -> std::result::Result<(), TaskError> {
        self.execute(|reply| UserTask::Unsolicited {
            enable: false,
            classes,
            reply,
        })
        .await
    }

    /// Open a file on the outstation.
    pub async fn open_file(
        &self,
        name: impl Into<String>,
        mode: FileMode,
        size: u32,
        max_block_size: u16,
    ) -> std::result::Result<FileInfo, FileError> {
        let name = name.into();
        self.execute(|reply| UserTask::OpenFile {
            name,
            mode,
            size,
            max_block_size,
            reply,
        })
        .await
    }

    /// Read a file opened for reading, block by block, until the last block.
    pub async fn read_file(&self, handle: u32) -> std::result::Result<Bytes, FileError> {
        self.execute(|reply| UserTask::ReadFile { handle, reply })
            .await
    }

    /// Write `data` to a file opened for writing in blocks of `block_size`.
    pub async fn write_file(
        &self,
        handle: u32,
        data: impl Into<Bytes>,
        block_size: u16,
    ) -> std::result::Result<(), FileError> {
        let data = data.into();
        self.execute(|reply| UserTask::WriteFile {
            handle,
            data,
            block_size,
            reply,
        })
        .await
    }

    /// Close a file handle.
    pub async fn close_file(&self, handle: u32) -> std::result::Result<(), FileError> {
        self.execute(|reply| UserTask::CloseFile { handle, reply })
            .await
    }

    /// Read device attributes. Values go to the read handler.
    pub async fn read_attributes(&self, id: AttrId) -> std::result::Result<(), TaskError> {
        self.execute(|reply| UserTask::ReadAttributes { id, reply })
            .await
    }

    /// Write one device attribute.
    pub async fn write_attribute(&self, attribute: Attribute) -> std::result::Result<(), TaskError> {
        self.execute(|reply| UserTask::WriteAttribute { attribute, reply })
            .await
    }

    /// Check that the outstation's link layer answers.
    pub async fn check_link_status(&self) -> std::result::Result<(), TaskError> {
        self.execute(|reply| UserTask::LinkStatus { reply }).await
    }

    /// Add a periodic poll. The first run happens one period from now.
    pub async fn add_poll(&self, request: ReadRequest, period: Duration) -> Result<PollHandle> {
        if period.is_zero() {
            return Err(Dnp3Error::invalid_config("poll period must be non-zero"));
        }
        let (reply, rx) = oneshot::channel();
        self.send(AssociationMessage::AddPoll {
            request,
            period,
            reply,
        })
        .await?;
        let id = rx.await.map_err(|_| Dnp3Error::Shutdown)?;
        Ok(PollHandle {
            id,
            tx: self.tx.clone(),
        })
    }

    /// Resume the association after [`AssociationHandle::disable`].
    /// Startup runs again.
    pub async fn enable(&self) -> Result<()> {
        self.send(AssociationMessage::Enable).await
    }

    /// Stop executing requests. Queued and running requests fail with
    /// [`TaskError::Shutdown`]; new ones fail with
    /// [`TaskError::AssociationDisabled`].
    pub async fn disable(&self) -> Result<()> {
        self.send(AssociationMessage::Disable).await
    }

    /// Remove the association from its channel.
    pub async fn remove(&self) -> Result<()> {
        self.send(AssociationMessage::Remove).await?;
        self.channel
            .send(ChannelMessage::RemoveAssociation(self.address))
            .await
            .map_err(|_| Dnp3Error::Shutdown)
    }

    async fn execute<T, E>(&self, task: impl FnOnce(Reply<T, E>) -> UserTask) -> std::result::Result<T, E>
    where
        E: From<TaskError>,
    {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AssociationMessage::Task(task(reply)))
            .await
            .is_err()
        {
            return Err(TaskError::Shutdown.into());
        }
        rx.await.unwrap_or_else(|_| Err(TaskError::Shutdown.into()))
    }

    async fn send(&self, message: AssociationMessage) -> Result<()> {
        self.tx.send(message).await.map_err(|_| Dnp3Error::Shutdown)
    }
}

/// Handle to a periodic poll.
#[derive(Debug, Clone)]
pub struct PollHandle {
    id: u64,
    tx: mpsc::Sender<AssociationMessage>,
}

impl PollHandle {
    /// Run the poll as soon as possible. The periodic schedule is kept.
    pub async fn demand(&self) -> Result<()> {
        self.send(AssociationMessage::DemandPoll(self.id)).await
    }

    /// Stop the poll.
    pub async fn remove(&self) -> Result<()> {
        self.send(AssociationMessage::RemovePoll(self.id)).await
    }

    async fn send(&self, message: AssociationMessage) -> Result<()> {
        self.tx.send(message).await.map_err(|_| Dnp3Error::Shutdown)
    }
}

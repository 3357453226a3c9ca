//! Error types for the DNP3 master and outstation.

use thiserror::Error;

use crate::types::{CommandStatus, FileStatus, Iin2};

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Dnp3Error>;

/// Transport, codec and configuration errors.
#[derive(Debug, Error)]
pub enum Dnp3Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected to remote
    #[error("Not connected")]
    NotConnected,

    /// Connection timeout
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed application fragment
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// An association with this address already exists
    #[error("Association {0} already exists")]
    DuplicateAssociation(u16),

    /// A point with this type and index already exists
    #[error("Duplicate point: {0}")]
    DuplicatePoint(String),

    /// No point with this type and index exists
    #[error("Unknown point: {0}")]
    UnknownPoint(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The task or channel was shut down
    #[error("Shutdown")]
    Shutdown,
}

impl Dnp3Error {
    /// Create a connection error with a message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Check if this error indicates a connection problem.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::NotConnected
                | Self::ConnectionTimeout
                | Self::Io(_)
                | Self::ChannelClosed
        )
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectionTimeout | Self::Io(_)
        )
    }
}

/// Errors found while parsing an application fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Fragment ended before the expected data
    #[error("insufficient bytes")]
    InsufficientBytes,

    /// Function code is not known
    #[error("unknown function code: {0}")]
    UnknownFunction(u8),

    /// Group/variation pair is not known
    #[error("unknown object g{0}v{1}")]
    UnknownObject(u8, u8),

    /// Qualifier code not supported for this object
    #[error("unsupported qualifier: 0x{0:02X}")]
    UnsupportedQualifier(u8),

    /// Start index greater than stop index
    #[error("bad range: start {0} > stop {1}")]
    BadRange(u16, u16),

    /// Object value could not be decoded
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    /// Bytes left after the last object header
    #[error("trailing bytes: {0}")]
    TrailingBytes(usize),
}

impl ParseError {
    /// IIN2 bit that reports this error to the master.
    pub fn iin2(&self) -> Iin2 {
        match self {
            Self::UnknownFunction(_) => Iin2::NO_FUNC_CODE_SUPPORT,
            Self::UnknownObject(_, _) => Iin2::OBJECT_UNKNOWN,
            Self::InsufficientBytes
            | Self::UnsupportedQualifier(_)
            | Self::BadRange(_, _)
            | Self::InvalidValue(_)
            | Self::TrailingBytes(_) => Iin2::PARAMETER_ERROR,
        }
    }
}

/// Generic failure of a master task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The channel is not connected
    #[error("no connection")]
    NoConnection,

    /// The association or channel was disabled or removed
    #[error("shutdown")]
    Shutdown,

    /// The association is disabled
    #[error("association disabled")]
    AssociationDisabled,

    /// The request queue is full
    #[error("too many queued requests")]
    TooManyRequests,

    /// No response arrived within the response timeout
    #[error("response timeout")]
    ResponseTimeout,

    /// The response could not be parsed or did not match the request
    #[error("bad response: {0}")]
    BadResponse(String),

    /// The outstation rejected the request with IIN2 bits
    #[error("rejected by outstation: {0}")]
    Rejected(Iin2),
}

impl TaskError {
    /// Create a bad response error.
    pub fn bad_response(msg: impl Into<String>) -> Self {
        Self::BadResponse(msg.into())
    }

    /// Check if the task should be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResponseTimeout | Self::BadResponse(_) | Self::Rejected(_)
        )
    }
}

/// Failure of a command task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Generic task failure
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The SELECT response reported a non-success status
    #[error("select failed: {0}")]
    SelectFailed(CommandStatus),

    /// The OPERATE response reported a non-success status
    #[error("operate failed: {0}")]
    OperateFailed(CommandStatus),

    /// The response objects did not echo the request
    #[error("response does not match request")]
    Mismatch,

    /// OPERATE could not be sent within the select timeout
    #[error("select expired before operate")]
    SelectTimeout,

    /// No valid response to DIRECT_OPERATE or OPERATE. The outstation may
    /// have executed the controls, so the command is not repeated.
    #[error("operate unconfirmed: {0}")]
    OperateUnconfirmed(TaskError),
}

impl CommandError {
    /// Check if the command should be retried after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Task(err) => err.is_retryable(),
            Self::Mismatch | Self::SelectTimeout => true,
            Self::SelectFailed(_) | Self::OperateFailed(_) | Self::OperateUnconfirmed(_) => false,
        }
    }
}

/// Failure of a time synchronization task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeSyncError {
    /// Generic task failure
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The local clock returned an invalid time
    #[error("local clock unavailable")]
    ClockUnavailable,

    /// The outstation reported a delay longer than the measured round trip
    #[error("outstation delay {0} ms exceeds round trip")]
    BadOutstationTimeDelay(u16),

    /// Computed time does not fit the 48-bit timestamp
    #[error("time overflow")]
    Overflow,

    /// NEED_TIME was still set after the write
    #[error("outstation still needs time")]
    StillNeedsTime,
}

impl TimeSyncError {
    /// Check if the time sync should be retried after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Task(err) => err.is_retryable(),
            Self::BadOutstationTimeDelay(_) | Self::StillNeedsTime => true,
            Self::ClockUnavailable | Self::Overflow => false,
        }
    }
}

/// Failure of a file transfer task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileError {
    /// Generic task failure
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The outstation returned a failure status
    #[error("file status: {0:?}")]
    Status(FileStatus),

    /// Blocks arrived out of order
    #[error("bad block number: expected {expected}, received {received}")]
    BadBlockNum {
        /// Expected block number
        expected: u32,
        /// Received block number
        received: u32,
    },
}

impl FileError {
    /// Check if the file operation should be retried after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Task(err) => err.is_retryable(),
            Self::Status(_) | Self::BadBlockNum { .. } => false,
        }
    }
}

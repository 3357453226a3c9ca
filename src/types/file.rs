//! File transfer objects (g70).

use bytes::Bytes;

/// Status code carried by file command and transport status objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    /// Request accepted
    Success,
    /// Permission denied
    PermissionDenied,
    /// Unsupported open mode
    InvalidMode,
    /// File not found
    NotFound,
    /// File locked by another user
    FileLocked,
    /// Too many files open
    TooManyOpen,
    /// Unknown file handle
    InvalidHandle,
    /// Block size not acceptable
    WriteBlockSize,
    /// Communication lost while transferring
    CommLost,
    /// File operations are not supported
    NotSupported,
    /// Block received out of sequence
    BlockSequence,
    /// Any other code
    Other(u8),
}

impl FileStatus {
    /// Parse from the wire byte.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::PermissionDenied,
            2 => Self::InvalidMode,
            3 => Self::NotFound,
            4 => Self::FileLocked,
            5 => Self::TooManyOpen,
            6 => Self::InvalidHandle,
            7 => Self::WriteBlockSize,
            8 => Self::CommLost,
            9 => Self::NotSupported,
            20 => Self::BlockSequence,
            other => Self::Other(other),
        }
    }

    /// Wire byte.
    pub const fn as_u8(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::PermissionDenied => 1,
            Self::InvalidMode => 2,
            Self::NotFound => 3,
            Self::FileLocked => 4,
            Self::TooManyOpen => 5,
            Self::InvalidHandle => 6,
            Self::WriteBlockSize => 7,
            Self::CommLost => 8,
            Self::NotSupported => 9,
            Self::BlockSequence => 20,
            Self::Other(x) => *x,
        }
    }
}

/// Mode requested when opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FileMode {
    /// Open for reading
    Read = 1,
    /// Create or truncate for writing
    Write = 2,
    /// Open for appending
    Append = 3,
}

impl FileMode {
    /// Parse from the wire value.
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            3 => Some(Self::Append),
            _ => None,
        }
    }
}

/// File open request (g70v3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOpen {
    /// Request identifier echoed in the status
    pub request_id: u16,
    /// Open mode
    pub mode: FileMode,
    /// Largest block the master accepts
    pub max_block_size: u16,
    /// File size for writes, 0 for reads
    pub size: u32,
    /// Path of the file on the outstation
    pub name: String,
}

/// File command status (g70v4): answer to OPEN_FILE and CLOSE_FILE, and the
/// object carried by CLOSE_FILE requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCommandStatus {
    /// Handle assigned by the outstation
    pub handle: u32,
    /// File size in bytes
    pub size: u32,
    /// Block size the outstation will use
    pub max_block_size: u16,
    /// Request identifier
    pub request_id: u16,
    /// Result of the command
    pub status: FileStatus,
}

/// File transport (g70v5): one block of file data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransport {
    /// File handle
    pub handle: u32,
    /// Block number
    pub block: u32,
    /// True for the final block
    pub last: bool,
    /// Block data, empty in read requests
    pub data: Bytes,
}

impl FileTransport {
    /// Flag in the block number marking the final block.
    pub const LAST_BLOCK: u32 = 0x8000_0000;

    /// Block number with the final-block bit applied.
    pub const fn raw_block(&self) -> u32 {
        if self.last {
            self.block | Self::LAST_BLOCK
        } else {
            self.block
        }
    }
}

/// File transport status (g70v6): answer to a written block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTransportStatus {
    /// File handle
    pub handle: u32,
    /// Block number being acknowledged
    pub block: u32,
    /// True if this acknowledged the final block
    pub last: bool,
    /// Result of the write
    pub status: FileStatus,
}

/// Information returned by a successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Handle used for later block transfers
    pub handle: u32,
    /// File size in bytes
    pub size: u32,
    /// Block size negotiated with the outstation
    pub max_block_size: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_status_codes() {
        assert_eq!(FileStatus::from_u8(3), FileStatus::NotFound);
        assert_eq!(FileStatus::from_u8(20).as_u8(), 20);
        assert_eq!(FileStatus::from_u8(200), FileStatus::Other(200));
    }

    #[test]
    fn test_last_block_bit() {
        let block = FileTransport {
            handle: 1,
            block: 4,
            last: true,
            data: Bytes::new(),
        };
        assert_eq!(block.raw_block(), 0x8000_0004);
        assert_eq!(FileMode::from_u16(2), Some(FileMode::Write));
        assert_eq!(FileMode::from_u16(7), None);
    }
}

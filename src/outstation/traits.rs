//! Application callbacks of the outstation.

use std::sync::Arc;

use bytes::Bytes;

use crate::clock::{Clock, SystemClock};
use crate::outstation::database::Database;
use crate::types::{AnalogOutput, CommandStatus, Crob, FileInfo, FileOpen, FileStatus, IndexRange, OperateType, Timestamp};

/// IIN bits owned by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplicationIin {
    /// Time synchronization required
    pub need_time: bool,
    /// Some points are in local control
    pub local_control: bool,
    /// Abnormal device condition
    pub device_trouble: bool,
    /// Configuration corrupt
    pub config_corrupt: bool,
}

/// Delay reported in a restart response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDelay {
    /// Coarse delay in seconds (g52v1)
    Seconds(u16),
    /// Fine delay in milliseconds (g52v2)
    Milliseconds(u16),
}

/// Outcome of a freeze request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeResult {
    /// Counters were frozen
    Success,
    /// A requested index does not exist
    ParameterError,
    /// Freezing is not supported
    NotSupported,
}

/// Device level callbacks.
pub trait OutstationApplication: Send {
    /// The master wrote the absolute time.
    fn write_absolute_time(&mut self, _time: Timestamp) {}

    /// IIN bits reported in every response.
    ///
    /// Called without the database lock held, so the application may read
    /// the database here.
    fn application_iin(&self) -> ApplicationIin {
        ApplicationIin::default()
    }

    /// Cold restart request. `None` means not supported.
    fn cold_restart(&mut self) -> Option<RestartDelay> {
        None
    }

    /// Warm restart request. `None` means not supported.
    fn warm_restart(&mut self) -> Option<RestartDelay> {
        None
    }

    /// Freeze counters within `range`, clearing them if `clear` is set.
    fn freeze_counters(&mut self, range: IndexRange, clear: bool, database: &Database) -> FreezeResult {
        database.transaction(|tx| tx.freeze_counters(range, clear));
        FreezeResult::Success
    }
}

/// Control callbacks. Every control is rejected with `NotSupported` unless
/// overridden.
pub trait ControlHandler: Send {
    /// Called before the controls of a request are processed.
    fn begin_fragment(&mut self) {}

    /// Called after the controls of a request are processed.
    fn end_fragment(&mut self, _database: &Database) {}

    /// Validate a CROB for a later OPERATE.
    fn select_crob(&mut self, _crob: &Crob, _index: u16, _database: &Database) -> CommandStatus {
        CommandStatus::NotSupported
    }

    /// Execute a CROB.
    fn operate_crob(
        &mut self,
        _crob: &Crob,
        _index: u16,
        _op_type: OperateType,
        _database: &Database,
    ) -> CommandStatus {
        CommandStatus::NotSupported
    }

    /// Validate an analog output for a later OPERATE.
    fn select_analog_output(
        &mut self,
        _command: &AnalogOutput,
        _index: u16,
        _database: &Database,
    ) -> CommandStatus {
        CommandStatus::NotSupported
    }

    /// Execute an analog output.
    fn operate_analog_output(
        &mut self,
        _command: &AnalogOutput,
        _index: u16,
        _op_type: OperateType,
        _database: &Database,
    ) -> CommandStatus {
        CommandStatus::NotSupported
    }
}

/// File transfer callbacks. Every operation returns `NotSupported` unless
/// overridden.
pub trait FileHandler: Send {
    /// Open a file.
    fn open(&mut self, _request: &FileOpen) -> Result<FileInfo, FileStatus> {
        Err(FileStatus::NotSupported)
    }

    /// Read one block, returning the data and whether it is the last block.
    fn read_block(&mut self, _handle: u32, _block: u32, _max_size: u16) -> Result<(Bytes, bool), FileStatus> {
        Err(FileStatus::NotSupported)
    }

    /// Write one block.
    fn write_block(&mut self, _handle: u32, _block: u32, _last: bool, _data: &[u8]) -> FileStatus {
        FileStatus::NotSupported
    }

    /// Close a file.
    fn close(&mut self, _handle: u32) -> FileStatus {
        FileStatus::NotSupported
    }
}

/// Application with the default behavior.
#[derive(Debug, Default)]
pub struct DefaultApplication;

impl OutstationApplication for DefaultApplication {}

/// Control handler that rejects every control.
#[derive(Debug, Default)]
pub struct NullControlHandler;

impl ControlHandler for NullControlHandler {}

/// File handler that rejects every operation.
#[derive(Debug, Default)]
pub struct NullFileHandler;

impl FileHandler for NullFileHandler {}

/// Callbacks and clock used by an outstation.
pub struct OutstationHandlers {
    /// Device level callbacks
    pub application: Box<dyn OutstationApplication>,
    /// Control callbacks
    pub control: Box<dyn ControlHandler>,
    /// File transfer callbacks
    pub file: Box<dyn FileHandler>,
    /// Time source for local timestamps
    pub clock: Arc<dyn Clock>,
}

impl Default for OutstationHandlers {
    fn default() -> Self {
        Self {
            application: Box::new(DefaultApplication),
            control: Box::new(NullControlHandler),
            file: Box::new(NullFileHandler),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl OutstationHandlers {
    /// Replace the application callbacks.
    pub fn application(mut self, application: impl OutstationApplication + 'static) -> Self {
        self.application = Box::new(application);
        self
    }

    /// Replace the control handler.
    pub fn control(mut self, control: impl ControlHandler + 'static) -> Self {
        self.control = Box::new(control);
        self
    }

    /// Replace the file handler.
    pub fn file(mut self, file: impl FileHandler + 'static) -> Self {
        self.file = Box::new(file);
        self
    }

    /// Replace the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for OutstationHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutstationHandlers").finish_non_exhaustive()
    }
}

//! Control objects: CROB, analog output commands and their status codes.

/// Status returned for each control object in a command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandStatus {
    /// Command accepted
    Success,
    /// OPERATE arrived after the select timeout
    Timeout,
    /// No matching SELECT preceded the OPERATE
    NoSelect,
    /// Request was malformed
    FormatError,
    /// Control operation not supported for this point
    NotSupported,
    /// Operation already in progress
    AlreadyActive,
    /// Hardware problem
    HardwareError,
    /// The point is in local control
    Local,
    /// Too many controls in one request
    TooManyObjects,
    /// Not authorized
    NotAuthorized,
    /// Code not understood by this implementation
    Unknown(u8),
}

impl CommandStatus {
    /// Parse from the wire byte.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::Timeout,
            2 => Self::NoSelect,
            3 => Self::FormatError,
            4 => Self::NotSupported,
            5 => Self::AlreadyActive,
            6 => Self::HardwareError,
            7 => Self::Local,
            8 => Self::TooManyObjects,
            9 => Self::NotAuthorized,
            other => Self::Unknown(other),
        }
    }

    /// Wire byte.
    pub const fn as_u8(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Timeout => 1,
            Self::NoSelect => 2,
            Self::FormatError => 3,
            Self::NotSupported => 4,
            Self::AlreadyActive => 5,
            Self::HardwareError => 6,
            Self::Local => 7,
            Self::TooManyObjects => 8,
            Self::NotAuthorized => 9,
            Self::Unknown(x) => *x,
        }
    }

    /// True only for `Success`.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(x) => write!(f, "unknown status ({x})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Operation requested by a CROB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpType {
    /// No operation
    Nul = 0,
    /// Pulse the output on
    PulseOn = 1,
    /// Pulse the output off
    PulseOff = 2,
    /// Latch the output on
    LatchOn = 3,
    /// Latch the output off
    LatchOff = 4,
}

/// Trip/close pairing requested by a CROB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TripCloseCode {
    /// Not paired
    Nul = 0,
    /// Close
    Close = 1,
    /// Trip
    Trip = 2,
}

/// Control relay output block (g12v1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Crob {
    /// Operation type
    pub op_type: OpType,
    /// Trip/close code
    pub tcc: TripCloseCode,
    /// Number of times to execute the operation
    pub count: u8,
    /// On time in milliseconds
    pub on_time: u32,
    /// Off time in milliseconds
    pub off_time: u32,
}

impl Crob {
    const OP_MASK: u8 = 0x0F;
    const TCC_SHIFT: u8 = 6;

    /// Create a CROB with a count of one and no timing.
    pub const fn new(op_type: OpType) -> Self {
        Self {
            op_type,
            tcc: TripCloseCode::Nul,
            count: 1,
            on_time: 0,
            off_time: 0,
        }
    }

    /// Latch on.
    pub const fn latch_on() -> Self {
        Self::new(OpType::LatchOn)
    }

    /// Latch off.
    pub const fn latch_off() -> Self {
        Self::new(OpType::LatchOff)
    }

    /// Pulse on for `on_time` milliseconds.
    pub const fn pulse_on(on_time: u32) -> Self {
        let mut crob = Self::new(OpType::PulseOn);
        crob.on_time = on_time;
        crob
    }

    /// Set the trip/close code.
    pub const fn with_tcc(mut self, tcc: TripCloseCode) -> Self {
        self.tcc = tcc;
        self
    }

    /// Encode the control code byte.
    pub const fn control_code(&self) -> u8 {
        ((self.tcc as u8) << Self::TCC_SHIFT) | (self.op_type as u8)
    }

    /// Split a control code byte into its operation and trip/close code.
    pub fn parse_control_code(code: u8) -> Option<(OpType, TripCloseCode)> {
        let op_type = match code & Self::OP_MASK {
            0 => OpType::Nul,
            1 => OpType::PulseOn,
            2 => OpType::PulseOff,
            3 => OpType::LatchOn,
            4 => OpType::LatchOff,
            _ => return None,
        };
        let tcc = match code >> Self::TCC_SHIFT {
            0 => TripCloseCode::Nul,
            1 => TripCloseCode::Close,
            2 => TripCloseCode::Trip,
            _ => return None,
        };
        Some((op_type, tcc))
    }
}

/// Analog output command (g41).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogOutput {
    /// Requested setpoint
    pub value: f64,
}

impl AnalogOutput {
    /// Create a setpoint command.
    pub const fn new(value: f64) -> Self {
        Self { value }
    }
}

/// A control object with its point index and status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandItem<T> {
    /// Point index
    pub index: u16,
    /// Control object
    pub command: T,
    /// Status, `Success` in requests
    pub status: CommandStatus,
}

impl<T> CommandItem<T> {
    /// Create a request item.
    pub const fn new(index: u16, command: T) -> Self {
        Self {
            index,
            command,
            status: CommandStatus::Success,
        }
    }

    /// Copy of this item with a different status.
    pub fn with_status(self, status: CommandStatus) -> Self {
        Self { status, ..self }
    }
}

/// How the master executes a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandMode {
    /// Single DIRECT_OPERATE request
    DirectOperate,
    /// SELECT followed by OPERATE
    SelectBeforeOperate,
}

/// Operation stage reported to the outstation control handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperateType {
    /// OPERATE after a SELECT
    SelectBeforeOperate,
    /// DIRECT_OPERATE
    DirectOperate,
    /// DIRECT_OPERATE_NR
    DirectOperateNoAck,
}

/// One header worth of controls in a command request.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandHeader {
    /// CROBs (g12v1)
    Crob(Vec<CommandItem<Crob>>),
    /// Analog outputs (g41)
    AnalogOutput(Vec<CommandItem<AnalogOutput>>),
}

impl CommandHeader {
    /// Number of controls in this header.
    pub fn len(&self) -> usize {
        match self {
            Self::Crob(items) => items.len(),
            Self::AnalogOutput(items) => items.len(),
        }
    }

    /// True if the header carries no controls.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First non-success status in the header, if any.
    pub fn first_failure(&self) -> Option<CommandStatus> {
        match self {
            Self::Crob(items) => items.iter().map(|x| x.status).find(|s| !s.is_success()),
            Self::AnalogOutput(items) => {
                items.iter().map(|x| x.status).find(|s| !s.is_success())
            }
        }
    }
}

/// Controls sent by a master command task.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandHeaders {
    headers: Vec<CommandHeader>,
}

impl CommandHeaders {
    /// Empty command set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a CROB. Consecutive CROBs share a header.
    pub fn add_crob(mut self, index: u16, crob: Crob) -> Self {
        let item = CommandItem::new(index, crob);
        match self.headers.last_mut() {
            Some(CommandHeader::Crob(items)) => items.push(item),
            _ => self.headers.push(CommandHeader::Crob(vec![item])),
        }
        self
    }

    /// Add an analog output. Consecutive analog outputs share a header.
    pub fn add_analog_output(mut self, index: u16, value: f64) -> Self {
        let item = CommandItem::new(index, AnalogOutput::new(value));
        match self.headers.last_mut() {
            Some(CommandHeader::AnalogOutput(items)) => items.push(item),
            _ => self.headers.push(CommandHeader::AnalogOutput(vec![item])),
        }
        self
    }

    /// The headers in request order.
    pub fn headers(&self) -> &[CommandHeader] {
        &self.headers
    }

    /// True if no controls were added.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_status_codes() {
        for code in 0..=9 {
            assert_eq!(CommandStatus::from_u8(code).as_u8(), code);
        }
        assert_eq!(CommandStatus::from_u8(126), CommandStatus::Unknown(126));
        assert!(CommandStatus::Success.is_success());
        assert!(!CommandStatus::NoSelect.is_success());
    }

    #[test]
    fn test_crob_control_code() {
        let crob = Crob::latch_on().with_tcc(TripCloseCode::Close);
        assert_eq!(crob.control_code(), 0x43);
        assert_eq!(
            Crob::parse_control_code(0x43),
            Some((OpType::LatchOn, TripCloseCode::Close))
        );
        assert_eq!(Crob::parse_control_code(0x0F), None);
        assert_eq!(Crob::pulse_on(250).on_time, 250);
    }

    #[test]
    fn test_command_headers_grouping() {
        let headers = CommandHeaders::new()
            .add_crob(0, Crob::latch_on())
            .add_crob(1, Crob::latch_off())
            .add_analog_output(3, 12.5)
            .add_crob(4, Crob::latch_on());

        assert_eq!(headers.headers().len(), 3);
        assert_eq!(headers.headers()[0].len(), 2);
        assert!(matches!(headers.headers()[1], CommandHeader::AnalogOutput(_)));
    }

    #[test]
    fn test_first_failure() {
        let header = CommandHeader::Crob(vec![
            CommandItem::new(0, Crob::latch_on()),
            CommandItem::new(1, Crob::latch_on()).with_status(CommandStatus::Local),
        ]);
        assert_eq!(header.first_failure(), Some(CommandStatus::Local));
    }
}

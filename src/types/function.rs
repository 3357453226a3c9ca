//! Application and link layer function codes.

use crate::error::ParseError;

/// Application layer function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    // ============================================
    // Requests
    // ============================================
    /// Confirm a response (CONFIRM)
    Confirm = 0,
    /// Read objects (READ)
    Read = 1,
    /// Write objects (WRITE)
    Write = 2,
    /// First half of select-before-operate (SELECT)
    Select = 3,
    /// Second half of select-before-operate (OPERATE)
    Operate = 4,
    /// Single-pass control (DIRECT_OPERATE)
    DirectOperate = 5,
    /// Single-pass control without a response (DIRECT_OPERATE_NR)
    DirectOperateNoResponse = 6,
    /// Copy counters to frozen counters (IMMEDIATE_FREEZE)
    ImmediateFreeze = 7,
    /// IMMEDIATE_FREEZE without a response (IMMEDIATE_FREEZE_NR)
    ImmediateFreezeNoResponse = 8,
    /// Freeze and then clear counters (FREEZE_CLEAR)
    FreezeClear = 9,
    /// FREEZE_CLEAR without a response (FREEZE_CLEAR_NR)
    FreezeClearNoResponse = 10,
    /// Full restart (COLD_RESTART)
    ColdRestart = 13,
    /// Partial restart (WARM_RESTART)
    WarmRestart = 14,
    /// Enable unsolicited reporting per class (ENABLE_UNSOLICITED)
    EnableUnsolicited = 20,
    /// Disable unsolicited reporting per class (DISABLE_UNSOLICITED)
    DisableUnsolicited = 21,
    /// Measure the outstation processing delay (DELAY_MEASURE)
    DelayMeasure = 23,
    /// Record the time of reception for a LAN time sync (RECORD_CURRENT_TIME)
    RecordCurrentTime = 24,
    /// Open a file (OPEN_FILE)
    OpenFile = 25,
    /// Close a file (CLOSE_FILE)
    CloseFile = 26,

    // ============================================
    // Responses
    // ============================================
    /// Solicited response (RESPONSE)
    Response = 129,
    /// Unsolicited response (UNSOLICITED_RESPONSE)
    UnsolicitedResponse = 130,
}

impl FunctionCode {
    /// Parse a function code from its wire byte.
    pub fn from_u8(value: u8) -> Result<Self, ParseError> {
        let code = match value {
            0 => Self::Confirm,
            1 => Self::Read,
            2 => Self::Write,
            3 => Self::Select,
            4 => Self::Operate,
            5 => Self::DirectOperate,
            6 => Self::DirectOperateNoResponse,
            7 => Self::ImmediateFreeze,
            8 => Self::ImmediateFreezeNoResponse,
            9 => Self::FreezeClear,
            10 => Self::FreezeClearNoResponse,
            13 => Self::ColdRestart,
            14 => Self::WarmRestart,
            20 => Self::EnableUnsolicited,
            21 => Self::DisableUnsolicited,
            23 => Self::DelayMeasure,
            24 => Self::RecordCurrentTime,
            25 => Self::OpenFile,
            26 => Self::CloseFile,
            129 => Self::Response,
            130 => Self::UnsolicitedResponse,
            other => return Err(ParseError::UnknownFunction(other)),
        };
        Ok(code)
    }

    /// Wire byte of this function code.
    #[inline]
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// True for the two response function codes.
    #[inline]
    pub const fn is_response(&self) -> bool {
        matches!(self, Self::Response | Self::UnsolicitedResponse)
    }

    /// True if the outstation never answers this request.
    #[inline]
    pub const fn is_no_response(&self) -> bool {
        matches!(
            self,
            Self::DirectOperateNoResponse
                | Self::ImmediateFreezeNoResponse
                | Self::FreezeClearNoResponse
        )
    }

    /// Short protocol name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Confirm => "CONFIRM",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Select => "SELECT",
            Self::Operate => "OPERATE",
            Self::DirectOperate => "DIRECT_OPERATE",
            Self::DirectOperateNoResponse => "DIRECT_OPERATE_NR",
            Self::ImmediateFreeze => "IMMEDIATE_FREEZE",
            Self::ImmediateFreezeNoResponse => "IMMEDIATE_FREEZE_NR",
            Self::FreezeClear => "FREEZE_CLEAR",
            Self::FreezeClearNoResponse => "FREEZE_CLEAR_NR",
            Self::ColdRestart => "COLD_RESTART",
            Self::WarmRestart => "WARM_RESTART",
            Self::EnableUnsolicited => "ENABLE_UNSOLICITED",
            Self::DisableUnsolicited => "DISABLE_UNSOLICITED",
            Self::DelayMeasure => "DELAY_MEASURE",
            Self::RecordCurrentTime => "RECORD_CURRENT_TIME",
            Self::OpenFile => "OPEN_FILE",
            Self::CloseFile => "CLOSE_FILE",
            Self::Response => "RESPONSE",
            Self::UnsolicitedResponse => "UNSOLICITED_RESPONSE",
        }
    }
}

impl std::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Link layer function carried in the link frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkFunction {
    /// Unconfirmed user data carrying an application fragment
    UserData = 0x44,
    /// Request the status of the remote link
    RequestLinkStatus = 0x49,
    /// Link status answer
    LinkStatus = 0x0B,
}

impl LinkFunction {
    /// Parse from the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x44 => Some(Self::UserData),
            0x49 => Some(Self::RequestLinkStatus),
            0x0B => Some(Self::LinkStatus),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_values() {
        assert_eq!(FunctionCode::Read.as_u8(), 1);
        assert_eq!(FunctionCode::DelayMeasure.as_u8(), 23);
        assert_eq!(FunctionCode::UnsolicitedResponse.as_u8(), 130);
        assert_eq!(FunctionCode::from_u8(24).unwrap(), FunctionCode::RecordCurrentTime);
    }

    #[test]
    fn test_unknown_function_code() {
        assert_eq!(
            FunctionCode::from_u8(0x1F),
            Err(ParseError::UnknownFunction(0x1F))
        );
    }

    #[test]
    fn test_no_response_functions() {
        assert!(FunctionCode::DirectOperateNoResponse.is_no_response());
        assert!(FunctionCode::FreezeClearNoResponse.is_no_response());
        assert!(!FunctionCode::DirectOperate.is_no_response());
        assert!(FunctionCode::Response.is_response());
    }

    #[test]
    fn test_link_function() {
        assert_eq!(LinkFunction::from_u8(0x49), Some(LinkFunction::RequestLinkStatus));
        assert_eq!(LinkFunction::from_u8(0x00), None);
    }
}

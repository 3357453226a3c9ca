//! Application layer request and response fragments.

use bytes::{BufMut, Bytes, BytesMut};

use super::function::FunctionCode;
use super::header::{Control, Iin, Sequence};
use super::object::ObjectHeader;

/// Request fragment sent by a master.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Control octet
    pub control: Control,
    /// Function code
    pub function: FunctionCode,
    /// Object headers
    pub objects: Vec<ObjectHeader>,
}

impl Request {
    /// Create a single-fragment request.
    pub fn new(seq: Sequence, function: FunctionCode, objects: Vec<ObjectHeader>) -> Self {
        Self {
            control: Control::request(seq),
            function,
            objects,
        }
    }

    /// Create a confirm for a solicited or unsolicited response.
    pub fn confirm(seq: Sequence, unsolicited: bool) -> Self {
        Self {
            control: Control::confirm(seq, unsolicited),
            function: FunctionCode::Confirm,
            objects: Vec::new(),
        }
    }

    /// Encode into a new buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.control.as_u8());
        buf.put_u8(self.function.as_u8());
        for header in &self.objects {
            header.encode_to(&mut buf);
        }
        buf.freeze()
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.control, self.function)
    }
}

/// Response fragment sent by an outstation.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Control octet
    pub control: Control,
    /// RESPONSE or UNSOLICITED_RESPONSE
    pub function: FunctionCode,
    /// Internal indications
    pub iin: Iin,
    /// Object headers
    pub objects: Vec<ObjectHeader>,
}

impl Response {
    /// Create a solicited response.
    pub fn solicited(seq: Sequence, con: bool, iin: Iin, objects: Vec<ObjectHeader>) -> Self {
        Self {
            control: Control::response(seq, con),
            function: FunctionCode::Response,
            iin,
            objects,
        }
    }

    /// Create an unsolicited response.
    pub fn unsolicited(seq: Sequence, iin: Iin, objects: Vec<ObjectHeader>) -> Self {
        Self {
            control: Control::unsolicited(seq),
            function: FunctionCode::UnsolicitedResponse,
            iin,
            objects,
        }
    }

    /// True for unsolicited responses.
    pub fn is_unsolicited(&self) -> bool {
        self.function == FunctionCode::UnsolicitedResponse
    }

    /// Encode into a new buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u8(self.control.as_u8());
        buf.put_u8(self.function.as_u8());
        buf.put_u8(self.iin.iin1.as_u8());
        buf.put_u8(self.iin.iin2.as_u8());
        for header in &self.objects {
            header.encode_to(&mut buf);
        }
        buf.freeze()
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.control, self.function, self.iin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Iin1, Iin2};

    #[test]
    fn test_encode_request() {
        let request = Request::new(Sequence::new(2), FunctionCode::Read, vec![ObjectHeader::Class0]);
        assert_eq!(request.encode().as_ref(), &[0xC2, 0x01, 60, 1, 0x06]);
    }

    #[test]
    fn test_encode_confirm() {
        let confirm = Request::confirm(Sequence::new(5), true);
        assert_eq!(confirm.encode().as_ref(), &[0xD5, 0x00]);
    }

    #[test]
    fn test_encode_null_unsolicited() {
        let iin = Iin::new(Iin1::DEVICE_RESTART, Iin2::default());
        let response = Response::unsolicited(Sequence::new(0), iin, Vec::new());
        assert!(response.is_unsolicited());
        assert_eq!(response.encode().as_ref(), &[0xF0, 0x82, 0x80, 0x00]);
    }
}

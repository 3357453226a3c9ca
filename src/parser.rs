//! Application fragment parser.
//!
//! This module turns raw application fragments into `Request` and `Response`
//! values. Every read is bounds checked; a truncated or malformed fragment is
//! reported as a `ParseError` rather than a panic.
//!
//! # Example
//!
//! ```rust,ignore
//! let response = parse_response(&frame.payload)?;
//! for header in &response.objects {
//!     println!("{header}");
//! }
//! ```

use bytes::Bytes;

use crate::error::ParseError;
use crate::types::{
    group, qualifier, AnalogOutput, AttrId, AttrValue, Attribute, CommandItem, CommandStatus,
    Control, Crob, DoubleBit, EventClass, EventVariation, FileCommandStatus, FileMode, FileOpen,
    FileStatus, FileTransport, FileTransportStatus, Flags, FunctionCode, Iin, Iin1, Iin2,
    IndexRange, Measurement, ObjectHeader, PointType, Request, Response, StaticVariation, Time,
    TimeQuality, Timestamp, Value, ANALOG_OUTPUT_VARIATION,
};

type ParseResult<T> = std::result::Result<T, ParseError>;

/// Group, variation and qualifier octets.
const HEADER_PREFIX_LEN: usize = 3;

/// Bounds-checked little-endian reader.
#[derive(Debug)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn take(&mut self, count: usize) -> ParseResult<&'a [u8]> {
        if self.data.len() < count {
            return Err(ParseError::InsufficientBytes);
        }
        let (head, tail) = self.data.split_at(count);
        self.data = tail;
        Ok(head)
    }

    pub(crate) fn read_u8(&mut self) -> ParseResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> ParseResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> ParseResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_i32(&mut self) -> ParseResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub(crate) fn read_u48(&mut self) -> ParseResult<u64> {
        let b = self.take(6)?;
        let mut raw = [0u8; 8];
        raw[..6].copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn read_f64(&mut self) -> ParseResult<f64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }
}

/// Range field decoded from a qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Range {
    All,
    StartStop(u16, u16),
    Count(u16),
    Prefixed(u16),
    FreeFormat(u8),
}

impl Range {
    fn parse(qualifier: u8, reader: &mut Reader<'_>) -> ParseResult<Self> {
        let range = match qualifier {
            qualifier::RANGE_8 => {
                let start = reader.read_u8()? as u16;
                let stop = reader.read_u8()? as u16;
                Self::start_stop(start, stop)?
            }
            qualifier::RANGE_16 => {
                let start = reader.read_u16()?;
                let stop = reader.read_u16()?;
                Self::start_stop(start, stop)?
            }
            qualifier::ALL => Self::All,
            qualifier::COUNT_8 => Self::Count(reader.read_u8()? as u16),
            qualifier::COUNT_PREFIX_16 => Self::Prefixed(reader.read_u16()?),
            qualifier::FREE_FORMAT => Self::FreeFormat(reader.read_u8()?),
            other => return Err(ParseError::UnsupportedQualifier(other)),
        };
        Ok(range)
    }

    fn start_stop(start: u16, stop: u16) -> ParseResult<Self> {
        if start > stop {
            return Err(ParseError::BadRange(start, stop));
        }
        Ok(Self::StartStop(start, stop))
    }

    fn qualifier(&self) -> u8 {
        match self {
            Self::All => qualifier::ALL,
            Self::StartStop(_, _) => qualifier::RANGE_16,
            Self::Count(_) => qualifier::COUNT_8,
            Self::Prefixed(_) => qualifier::COUNT_PREFIX_16,
            Self::FreeFormat(_) => qualifier::FREE_FORMAT,
        }
    }

    fn unsupported(&self) -> ParseError {
        ParseError::UnsupportedQualifier(self.qualifier())
    }

    fn count_limit(&self) -> ParseResult<Option<u8>> {
        match self {
            Self::All => Ok(None),
            Self::Count(n) => Ok(Some((*n).min(u8::MAX as u16) as u8)),
            other => Err(other.unsupported()),
        }
    }
}

/// Parse the control octet and raw function byte of a request.
///
/// Used by the outstation to answer requests whose body cannot be parsed.
pub fn parse_request_header(data: &[u8]) -> ParseResult<(Control, u8)> {
    let mut reader = Reader::new(data);
    let control = Control::from_u8(reader.read_u8()?);
    let function = reader.read_u8()?;
    Ok((control, function))
}

/// Parse a complete request fragment.
pub fn parse_request(data: &[u8]) -> ParseResult<Request> {
    let (control, function) = parse_request_header(data)?;
    let function = FunctionCode::from_u8(function)?;
    if function.is_response() {
        return Err(ParseError::UnknownFunction(function.as_u8()));
    }
    let objects = parse_objects(&data[2..], function)?;
    Ok(Request {
        control,
        function,
        objects,
    })
}

/// Parse a complete response fragment.
pub fn parse_response(data: &[u8]) -> ParseResult<Response> {
    let mut reader = Reader::new(data);
    let control = Control::from_u8(reader.read_u8()?);
    let function = FunctionCode::from_u8(reader.read_u8()?)?;
    if !function.is_response() {
        return Err(ParseError::UnknownFunction(function.as_u8()));
    }
    let iin1 = Iin1::from_u8(reader.read_u8()?);
    let iin2 = Iin2::from_u8(reader.read_u8()?);
    let objects = parse_objects(&data[4..], function)?;
    Ok(Response {
        control,
        function,
        iin: Iin::new(iin1, iin2),
        objects,
    })
}

/// Parse the object headers of a fragment body.
///
/// A tail shorter than an object header (group, variation, qualifier) is
/// reported as `TrailingBytes`.
///
/// Static, event and attribute headers carry values only in responses and
/// WRITE requests; in other requests they are read requests.
pub fn parse_objects(data: &[u8], function: FunctionCode) -> ParseResult<Vec<ObjectHeader>> {
    let carries_data = function.is_response() || function == FunctionCode::Write;
    let mut reader = Reader::new(data);
    let mut headers = Vec::new();
    while !reader.is_empty() {
        if reader.remaining() < HEADER_PREFIX_LEN {
            return Err(ParseError::TrailingBytes(reader.remaining()));
        }
        headers.push(parse_header(&mut reader, carries_data)?);
    }
    Ok(headers)
}

fn parse_header(reader: &mut Reader<'_>, carries_data: bool) -> ParseResult<ObjectHeader> {
    let g = reader.read_u8()?;
    let v = reader.read_u8()?;
    let range = Range::parse(reader.read_u8()?, reader)?;
    let unknown = ParseError::UnknownObject(g, v);

    if let Some(point_type) = PointType::from_static_group(g) {
        let variation = StaticVariation::from_u8(v).ok_or(unknown)?;
        if !carries_data {
            let range = match range {
                Range::All => IndexRange::All,
                Range::StartStop(start, stop) => IndexRange::Range { start, stop },
                other => return Err(other.unsupported()),
            };
            return Ok(ObjectHeader::StaticRange {
                point_type,
                variation,
                range,
            });
        }
        if variation == StaticVariation::Any {
            return Err(unknown);
        }
        let with_flags = variation == StaticVariation::WithFlags;
        let values = parse_indexed(reader, range, |r| {
            parse_measurement(r, point_type, with_flags, false)
        })?;
        return Ok(ObjectHeader::Static {
            point_type,
            variation,
            values,
        });
    }

    if let Some(point_type) = PointType::from_event_group(g) {
        let variation = EventVariation::from_u8(v).ok_or(unknown)?;
        if !carries_data {
            return Ok(ObjectHeader::EventRange {
                point_type,
                variation,
                count: range.count_limit()?,
            });
        }
        if variation == EventVariation::Any {
            return Err(unknown);
        }
        let with_time = variation == EventVariation::WithTime;
        let values = parse_indexed(reader, range, |r| {
            parse_measurement(r, point_type, true, with_time)
        })?;
        return Ok(ObjectHeader::Events {
            point_type,
            variation,
            values,
        });
    }

    match (g, v) {
        (group::CLASS, 1) => match range {
            Range::All => Ok(ObjectHeader::Class0),
            other => Err(other.unsupported()),
        },
        (group::CLASS, 2..=4) => Ok(ObjectHeader::EventClass {
            class: EventClass::ALL[(v - 2) as usize],
            count: range.count_limit()?,
        }),
        (group::CROB, 1) => {
            let items = parse_indexed(reader, range, parse_crob)?;
            Ok(ObjectHeader::Crob(
                items
                    .into_iter()
                    .map(|(index, item)| CommandItem { index, ..item })
                    .collect(),
            ))
        }
        (group::ANALOG_OUTPUT, ANALOG_OUTPUT_VARIATION) => {
            let items = parse_indexed(reader, range, |r| {
                let value = r.read_f64()?;
                let status = CommandStatus::from_u8(r.read_u8()?);
                Ok((AnalogOutput::new(value), status))
            })?;
            Ok(ObjectHeader::AnalogOutput(
                items
                    .into_iter()
                    .map(|(index, (command, status))| CommandItem {
                        index,
                        command,
                        status,
                    })
                    .collect(),
            ))
        }
        (group::TIME, 1) | (group::TIME, 3) => {
            expect_single(range)?;
            let ts = Timestamp::new(reader.read_u48()?);
            Ok(if v == 1 {
                ObjectHeader::Time(ts)
            } else {
                ObjectHeader::LastRecordedTime(ts)
            })
        }
        (group::TIME_DELAY, 1) | (group::TIME_DELAY, 2) => {
            expect_single(range)?;
            let delay = reader.read_u16()?;
            Ok(if v == 1 {
                ObjectHeader::TimeDelayCoarse(delay)
            } else {
                ObjectHeader::TimeDelayFine(delay)
            })
        }
        (group::IIN, 1) => match range {
            Range::StartStop(start, stop) if start == stop => {
                let value = reader.read_u8()? & 0x01 != 0;
                Ok(ObjectHeader::Iin {
                    index: start,
                    value,
                })
            }
            Range::StartStop(start, stop) => Err(ParseError::BadRange(start, stop)),
            other => Err(other.unsupported()),
        },
        (group::ATTRIBUTE, _) => {
            let set = match range {
                Range::StartStop(start, stop) if start == stop && stop <= u8::MAX as u16 => {
                    start as u8
                }
                Range::All if !carries_data => 0,
                Range::StartStop(start, stop) => return Err(ParseError::BadRange(start, stop)),
                other => return Err(other.unsupported()),
            };
            let id = AttrId { set, variation: v };
            if carries_data {
                let value = parse_attr_value(reader)?;
                Ok(ObjectHeader::Attribute(Attribute::new(id, value)))
            } else {
                Ok(ObjectHeader::AttributeRequest(id))
            }
        }
        (group::FILE, 3..=6) => {
            let body = free_format_body(reader, range)?;
            let mut body = Reader::new(body);
            let header = match v {
                3 => ObjectHeader::FileOpen(parse_file_open(&mut body)?),
                4 => ObjectHeader::FileCommandStatus(FileCommandStatus {
                    handle: body.read_u32()?,
                    size: body.read_u32()?,
                    max_block_size: body.read_u16()?,
                    request_id: body.read_u16()?,
                    status: FileStatus::from_u8(body.read_u8()?),
                }),
                5 => {
                    let handle = body.read_u32()?;
                    let raw = body.read_u32()?;
                    let data = Bytes::copy_from_slice(body.take(body.remaining())?);
                    ObjectHeader::FileTransport(FileTransport {
                        handle,
                        block: raw & !FileTransport::LAST_BLOCK,
                        last: raw & FileTransport::LAST_BLOCK != 0,
                        data,
                    })
                }
                _ => {
                    let handle = body.read_u32()?;
                    let raw = body.read_u32()?;
                    ObjectHeader::FileTransportStatus(FileTransportStatus {
                        handle,
                        block: raw & !FileTransport::LAST_BLOCK,
                        last: raw & FileTransport::LAST_BLOCK != 0,
                        status: FileStatus::from_u8(body.read_u8()?),
                    })
                }
            };
            Ok(header)
        }
        _ => Err(unknown),
    }
}

fn expect_single(range: Range) -> ParseResult<()> {
    match range {
        Range::Count(1) => Ok(()),
        other => Err(other.unsupported()),
    }
}

fn free_format_body<'a>(reader: &mut Reader<'a>, range: Range) -> ParseResult<&'a [u8]> {
    match range {
        Range::FreeFormat(1) => {
            let length = reader.read_u16()? as usize;
            reader.take(length)
        }
        other => Err(other.unsupported()),
    }
}

/// Parse objects addressed by a start/stop range or an index prefix.
fn parse_indexed<'a, T, F>(
    reader: &mut Reader<'a>,
    range: Range,
    mut parse: F,
) -> ParseResult<Vec<(u16, T)>>
where
    F: FnMut(&mut Reader<'a>) -> ParseResult<T>,
{
    match range {
        Range::StartStop(start, stop) => (start..=stop)
            .map(|index| parse(reader).map(|value| (index, value)))
            .collect(),
        Range::Prefixed(count) => (0..count)
            .map(|_| {
                let index = reader.read_u16()?;
                parse(reader).map(|value| (index, value))
            })
            .collect(),
        other => Err(other.unsupported()),
    }
}

fn parse_crob(reader: &mut Reader<'_>) -> ParseResult<CommandItem<Crob>> {
    let code = reader.read_u8()?;
    let (op_type, tcc) =
        Crob::parse_control_code(code).ok_or(ParseError::InvalidValue("control code"))?;
    let crob = Crob {
        op_type,
        tcc,
        count: reader.read_u8()?,
        on_time: reader.read_u32()?,
        off_time: reader.read_u32()?,
    };
    let status = CommandStatus::from_u8(reader.read_u8()?);
    // index is filled in by the caller
    Ok(CommandItem {
        index: 0,
        command: crob,
        status,
    })
}

fn parse_value(reader: &mut Reader<'_>, point_type: PointType) -> ParseResult<Value> {
    let value = match point_type {
        PointType::BinaryInput => Value::Binary(reader.read_u8()? != 0),
        PointType::BinaryOutputStatus => Value::BinaryOutputStatus(reader.read_u8()? != 0),
        PointType::DoubleBitBinaryInput => Value::DoubleBit(DoubleBit::from_u8(reader.read_u8()?)),
        PointType::Counter => Value::Counter(reader.read_u32()?),
        PointType::FrozenCounter => Value::FrozenCounter(reader.read_u32()?),
        PointType::AnalogInput => Value::Analog(reader.read_f64()?),
        PointType::AnalogOutputStatus => Value::AnalogOutputStatus(reader.read_f64()?),
        PointType::OctetString => {
            let len = reader.read_u8()? as usize;
            Value::OctetString(Bytes::copy_from_slice(reader.take(len)?))
        }
    };
    Ok(value)
}

fn parse_time(reader: &mut Reader<'_>) -> ParseResult<Time> {
    let timestamp = Timestamp::new(reader.read_u48()?);
    let quality =
        TimeQuality::from_u8(reader.read_u8()?).ok_or(ParseError::InvalidValue("time quality"))?;
    Ok(Time { timestamp, quality })
}

fn parse_measurement(
    reader: &mut Reader<'_>,
    point_type: PointType,
    with_flags: bool,
    with_time: bool,
) -> ParseResult<Measurement> {
    let flags = if with_flags {
        Flags::from_u8(reader.read_u8()?)
    } else {
        Flags::ONLINE
    };
    let value = parse_value(reader, point_type)?;
    let time = if with_time {
        Some(parse_time(reader)?)
    } else {
        None
    };
    Ok(Measurement { value, flags, time })
}

fn parse_attr_value(reader: &mut Reader<'_>) -> ParseResult<AttrValue> {
    let type_code = reader.read_u8()?;
    let len = reader.read_u8()? as usize;
    let body = reader.take(len)?;
    let mut body_reader = Reader::new(body);
    let value = match (type_code, len) {
        (1, _) => AttrValue::VisibleString(
            std::str::from_utf8(body)
                .map_err(|_| ParseError::InvalidValue("visible string"))?
                .to_string(),
        ),
        (2, 4) => AttrValue::UnsignedInt(body_reader.read_u32()?),
        (3, 4) => AttrValue::SignedInt(body_reader.read_i32()?),
        (4, 8) => AttrValue::Float(body_reader.read_f64()?),
        (5, _) => AttrValue::OctetString(Bytes::copy_from_slice(body)),
        _ => return Err(ParseError::InvalidValue("attribute type")),
    };
    Ok(value)
}

fn parse_file_open(reader: &mut Reader<'_>) -> ParseResult<FileOpen> {
    let request_id = reader.read_u16()?;
    let mode =
        FileMode::from_u16(reader.read_u16()?).ok_or(ParseError::InvalidValue("file mode"))?;
    let max_block_size = reader.read_u16()?;
    let size = reader.read_u32()?;
    let name_len = reader.read_u16()? as usize;
    let name = std::str::from_utf8(reader.take(name_len)?)
        .map_err(|_| ParseError::InvalidValue("file name"))?
        .to_string();
    Ok(FileOpen {
        request_id,
        mode,
        max_block_size,
        size,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Sequence, TripCloseCode};

    #[test]
    fn test_parse_read_request() {
        let request = parse_request(&[0xC3, 0x01, 60, 2, 0x06, 60, 1, 0x06, 30, 0, 0x00, 1, 4])
            .unwrap();
        assert_eq!(request.control.seq, Sequence::new(3));
        assert_eq!(request.function, FunctionCode::Read);
        assert_eq!(
            request.objects,
            vec![
                ObjectHeader::EventClass {
                    class: EventClass::Class1,
                    count: None
                },
                ObjectHeader::Class0,
                ObjectHeader::StaticRange {
                    point_type: PointType::AnalogInput,
                    variation: StaticVariation::Any,
                    range: IndexRange::Range { start: 1, stop: 4 },
                },
            ]
        );
    }

    #[test]
    fn test_parse_request_errors() {
        assert_eq!(parse_request(&[0xC0]), Err(ParseError::InsufficientBytes));
        assert_eq!(parse_request(&[0xC0, 0x55]), Err(ParseError::UnknownFunction(0x55)));
        assert_eq!(
            parse_request(&[0xC0, 0x01, 99, 1, 0x06]),
            Err(ParseError::UnknownObject(99, 1))
        );
        assert_eq!(
            parse_request(&[0xC0, 0x01, 1, 0, 0x00, 5, 1]),
            Err(ParseError::BadRange(5, 1))
        );
        assert_eq!(
            parse_request(&[0xC0, 0x01, 1, 0, 0x17, 0]),
            Err(ParseError::UnsupportedQualifier(0x17))
        );
    }

    #[test]
    fn test_parse_trailing_bytes() {
        assert_eq!(
            parse_request(&[0xC0, 0x01, 60, 1, 0x06, 60]),
            Err(ParseError::TrailingBytes(1))
        );
        assert_eq!(
            parse_response(&[0xC0, 0x81, 0x00, 0x00, 1, 2]),
            Err(ParseError::TrailingBytes(2))
        );
        assert_eq!(ParseError::TrailingBytes(1).iin2(), Iin2::PARAMETER_ERROR);
    }

    #[test]
    fn test_parse_request_header_survives_bad_body() {
        let (control, function) = parse_request_header(&[0xC7, 0x01, 99]).unwrap();
        assert_eq!(control.seq.value(), 7);
        assert_eq!(function, 1);
    }

    #[test]
    fn test_parse_response_with_values() {
        let data = [
            0xC1, 0x81, 0x80, 0x00, // header, DEVICE_RESTART
            20, 1, 0x01, 2, 0, 3, 0, // counters 2..=3 with flags
            0x01, 10, 0, 0, 0, 0x01, 11, 0, 0, 0,
        ];
        let response = parse_response(&data).unwrap();
        assert!(response.iin.iin1.contains(Iin1::DEVICE_RESTART));
        match &response.objects[0] {
            ObjectHeader::Static { values, .. } => {
                assert_eq!(values.len(), 2);
                assert_eq!(values[0].0, 2);
                assert_eq!(values[1].1.value, Value::Counter(11));
            }
            other => panic!("unexpected header: {other:?}"),
        }
    }

    #[test]
    fn test_parse_crob_request() {
        let data = [
            0xC0, 0x03, 12, 1, 0x28, 1, 0, 5, 0, 0x81, 1, 100, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        let request = parse_request(&data).unwrap();
        match &request.objects[0] {
            ObjectHeader::Crob(items) => {
                assert_eq!(items[0].index, 5);
                assert_eq!(items[0].command.tcc, TripCloseCode::Trip);
                assert_eq!(items[0].command.on_time, 100);
            }
            other => panic!("unexpected header: {other:?}"),
        }
    }

    #[test]
    fn test_parse_truncated_values() {
        let data = [0xC1, 0x81, 0x00, 0x00, 30, 1, 0x00, 0, 1, 0x01];
        assert_eq!(parse_response(&data), Err(ParseError::InsufficientBytes));
    }

    #[test]
    fn test_parse_write_time_and_attribute() {
        let data = [
            0xC0, 0x02, 50, 1, 0x07, 1, 0xE8, 0x03, 0, 0, 0, 0, // time = 1000 ms
            0, 246, 0x00, 0, 0, 1, 3, b'r', b't', b'u',
        ];
        let request = parse_request(&data).unwrap();
        assert_eq!(request.objects[0], ObjectHeader::Time(Timestamp::new(1000)));
        assert_eq!(
            request.objects[1],
            ObjectHeader::Attribute(Attribute::new(
                AttrId::default_set(246),
                AttrValue::VisibleString("rtu".to_string())
            ))
        );
    }
}

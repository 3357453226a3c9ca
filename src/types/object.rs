//! Object headers and their wire encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::attribute::{AttrId, AttrValue, Attribute};
use super::control::{AnalogOutput, CommandHeader, CommandItem, Crob};
use super::data::{EventClass, Measurement, PointType, Time, Timestamp, Value};
use super::file::{FileCommandStatus, FileOpen, FileTransport, FileTransportStatus};

/// Qualifier codes.
pub mod qualifier {
    /// 8-bit start and stop indices
    pub const RANGE_8: u8 = 0x00;
    /// 16-bit start and stop indices
    pub const RANGE_16: u8 = 0x01;
    /// All objects, no range field
    pub const ALL: u8 = 0x06;
    /// 8-bit count
    pub const COUNT_8: u8 = 0x07;
    /// 16-bit count, each object prefixed with a 16-bit index
    pub const COUNT_PREFIX_16: u8 = 0x28;
    /// Free format: 8-bit count, 16-bit object length
    pub const FREE_FORMAT: u8 = 0x5B;
}

/// Object groups that are not point types.
pub mod group {
    /// Device attributes
    pub const ATTRIBUTE: u8 = 0;
    /// Control relay output block
    pub const CROB: u8 = 12;
    /// Analog output command
    pub const ANALOG_OUTPUT: u8 = 41;
    /// Time and date
    pub const TIME: u8 = 50;
    /// Time delay
    pub const TIME_DELAY: u8 = 52;
    /// Class data
    pub const CLASS: u8 = 60;
    /// File control
    pub const FILE: u8 = 70;
    /// Internal indications
    pub const IIN: u8 = 80;
}

/// Index of the DEVICE_RESTART bit in g80v1.
pub const IIN_RESTART_INDEX: u16 = 7;

/// Variation of g41 used for analog output commands.
pub const ANALOG_OUTPUT_VARIATION: u8 = 4;

/// Index range of a static read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexRange {
    /// Every point of the type
    All,
    /// Inclusive index range
    Range {
        /// First index
        start: u16,
        /// Last index
        stop: u16,
    },
}

impl IndexRange {
    /// True if `index` falls within the range.
    pub fn contains(&self, index: u16) -> bool {
        match self {
            Self::All => true,
            Self::Range { start, stop } => (*start..=*stop).contains(&index),
        }
    }
}

/// Static reporting variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StaticVariation {
    /// Outstation chooses (requests only)
    Any = 0,
    /// Value with flags
    #[default]
    WithFlags = 1,
    /// Value without flags
    WithoutFlags = 2,
}

impl StaticVariation {
    /// Parse from the variation byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Any),
            1 => Some(Self::WithFlags),
            2 => Some(Self::WithoutFlags),
            _ => None,
        }
    }
}

/// Event reporting variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EventVariation {
    /// Outstation chooses (requests only)
    Any = 0,
    /// Flags and value
    WithoutTime = 1,
    /// Flags, value and timestamp
    #[default]
    WithTime = 2,
}

impl EventVariation {
    /// Parse from the variation byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Any),
            1 => Some(Self::WithoutTime),
            2 => Some(Self::WithTime),
            _ => None,
        }
    }
}

/// One object header with its range and objects.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectHeader {
    /// Class 0 data request (g60v1)
    Class0,
    /// Event class request (g60v2..v4), optionally limited to `count` events
    EventClass {
        /// Requested class
        class: EventClass,
        /// Maximum number of events
        count: Option<u8>,
    },
    /// Static read request for one point type
    StaticRange {
        /// Point type
        point_type: PointType,
        /// Requested variation
        variation: StaticVariation,
        /// Requested indices
        range: IndexRange,
    },
    /// Event read request for one point type
    EventRange {
        /// Point type
        point_type: PointType,
        /// Requested variation
        variation: EventVariation,
        /// Maximum number of events
        count: Option<u8>,
    },
    /// Static values
    Static {
        /// Point type
        point_type: PointType,
        /// Encoding variation
        variation: StaticVariation,
        /// Index and value pairs
        values: Vec<(u16, Measurement)>,
    },
    /// Event values
    Events {
        /// Point type
        point_type: PointType,
        /// Encoding variation
        variation: EventVariation,
        /// Index and value pairs in report order
        values: Vec<(u16, Measurement)>,
    },
    /// CROBs (g12v1)
    Crob(Vec<CommandItem<Crob>>),
    /// Analog output commands (g41v4)
    AnalogOutput(Vec<CommandItem<AnalogOutput>>),
    /// Absolute time (g50v1)
    Time(Timestamp),
    /// Last recorded time (g50v3)
    LastRecordedTime(Timestamp),
    /// Time delay in seconds (g52v1)
    TimeDelayCoarse(u16),
    /// Time delay in milliseconds (g52v2)
    TimeDelayFine(u16),
    /// Single IIN bit (g80v1)
    Iin {
        /// Bit index
        index: u16,
        /// Bit value
        value: bool,
    },
    /// Attribute read request (g0)
    AttributeRequest(AttrId),
    /// Attribute value (g0)
    Attribute(Attribute),
    /// File open (g70v3)
    FileOpen(FileOpen),
    /// File command status (g70v4)
    FileCommandStatus(FileCommandStatus),
    /// File data block (g70v5)
    FileTransport(FileTransport),
    /// File transport status (g70v6)
    FileTransportStatus(FileTransportStatus),
}

impl ObjectHeader {
    /// Group and variation of this header.
    pub fn group_variation(&self) -> (u8, u8) {
        match self {
            Self::Class0 => (group::CLASS, 1),
            Self::EventClass { class, .. } => (group::CLASS, 2 + class.index() as u8),
            Self::StaticRange {
                point_type,
                variation,
                ..
            }
            | Self::Static {
                point_type,
                variation,
                ..
            } => (point_type.static_group(), *variation as u8),
            Self::EventRange {
                point_type,
                variation,
                ..
            }
            | Self::Events {
                point_type,
                variation,
                ..
            } => (point_type.event_group(), *variation as u8),
            Self::Crob(_) => (group::CROB, 1),
            Self::AnalogOutput(_) => (group::ANALOG_OUTPUT, ANALOG_OUTPUT_VARIATION),
            Self::Time(_) => (group::TIME, 1),
            Self::LastRecordedTime(_) => (group::TIME, 3),
            Self::TimeDelayCoarse(_) => (group::TIME_DELAY, 1),
            Self::TimeDelayFine(_) => (group::TIME_DELAY, 2),
            Self::Iin { .. } => (group::IIN, 1),
            Self::AttributeRequest(id) => (group::ATTRIBUTE, id.variation),
            Self::Attribute(attr) => (group::ATTRIBUTE, attr.id.variation),
            Self::FileOpen(_) => (group::FILE, 3),
            Self::FileCommandStatus(_) => (group::FILE, 4),
            Self::FileTransport(_) => (group::FILE, 5),
            Self::FileTransportStatus(_) => (group::FILE, 6),
        }
    }

    /// Number of objects carried (0 for pure requests).
    pub fn count(&self) -> usize {
        match self {
            Self::Static { values, .. } | Self::Events { values, .. } => values.len(),
            Self::Crob(items) => items.len(),
            Self::AnalogOutput(items) => items.len(),
            Self::Class0
            | Self::EventClass { .. }
            | Self::StaticRange { .. }
            | Self::EventRange { .. }
            | Self::AttributeRequest(_) => 0,
            _ => 1,
        }
    }

    /// Encode the header and its objects.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        let (g, v) = self.group_variation();
        buf.put_u8(g);
        buf.put_u8(v);

        match self {
            Self::Class0 => buf.put_u8(qualifier::ALL),
            Self::EventClass { count, .. } | Self::EventRange { count, .. } => {
                put_count_or_all(buf, *count)
            }
            Self::StaticRange { range, .. } => match range {
                IndexRange::All => buf.put_u8(qualifier::ALL),
                IndexRange::Range { start, stop } => put_start_stop(buf, *start, *stop),
            },
            Self::Static {
                point_type,
                variation,
                values,
            } => {
                let with_flags = *variation != StaticVariation::WithoutFlags;
                match contiguous_range(values) {
                    Some((start, stop)) => {
                        buf.put_u8(qualifier::RANGE_16);
                        buf.put_u16_le(start);
                        buf.put_u16_le(stop);
                        for (_, m) in values {
                            put_measurement(buf, *point_type, m, with_flags, false);
                        }
                    }
                    None => {
                        put_prefixed_count(buf, values.len());
                        for (index, m) in values {
                            buf.put_u16_le(*index);
                            put_measurement(buf, *point_type, m, with_flags, false);
                        }
                    }
                }
            }
            Self::Events {
                point_type,
                variation,
                values,
            } => {
                let with_time = *variation != EventVariation::WithoutTime;
                put_prefixed_count(buf, values.len());
                for (index, m) in values {
                    buf.put_u16_le(*index);
                    put_measurement(buf, *point_type, m, true, with_time);
                }
            }
            Self::Crob(items) => {
                put_prefixed_count(buf, items.len());
                for item in items {
                    buf.put_u16_le(item.index);
                    buf.put_u8(item.command.control_code());
                    buf.put_u8(item.command.count);
                    buf.put_u32_le(item.command.on_time);
                    buf.put_u32_le(item.command.off_time);
                    buf.put_u8(item.status.as_u8());
                }
            }
            Self::AnalogOutput(items) => {
                put_prefixed_count(buf, items.len());
                for item in items {
                    buf.put_u16_le(item.index);
                    buf.put_f64_le(item.command.value);
                    buf.put_u8(item.status.as_u8());
                }
            }
            Self::Time(ts) | Self::LastRecordedTime(ts) => {
                buf.put_u8(qualifier::COUNT_8);
                buf.put_u8(1);
                put_u48(buf, ts.raw());
            }
            Self::TimeDelayCoarse(delay) | Self::TimeDelayFine(delay) => {
                buf.put_u8(qualifier::COUNT_8);
                buf.put_u8(1);
                buf.put_u16_le(*delay);
            }
            Self::Iin { index, value } => {
                put_start_stop(buf, *index, *index);
                buf.put_u8(*value as u8);
            }
            Self::AttributeRequest(id) => {
                buf.put_u8(qualifier::RANGE_8);
                buf.put_u8(id.set);
                buf.put_u8(id.set);
            }
            Self::Attribute(attr) => {
                buf.put_u8(qualifier::RANGE_8);
                buf.put_u8(attr.id.set);
                buf.put_u8(attr.id.set);
                put_attr_value(buf, &attr.value);
            }
            Self::FileOpen(open) => {
                let name = open.name.as_bytes();
                let name_len = name.len().min(u16::MAX as usize - 12);
                put_free_format(buf, 12 + name_len);
                buf.put_u16_le(open.request_id);
                buf.put_u16_le(open.mode as u16);
                buf.put_u16_le(open.max_block_size);
                buf.put_u32_le(open.size);
                buf.put_u16_le(name_len as u16);
                buf.put_slice(&name[..name_len]);
            }
            Self::FileCommandStatus(status) => {
                put_free_format(buf, 13);
                buf.put_u32_le(status.handle);
                buf.put_u32_le(status.size);
                buf.put_u16_le(status.max_block_size);
                buf.put_u16_le(status.request_id);
                buf.put_u8(status.status.as_u8());
            }
            Self::FileTransport(block) => {
                let data_len = block.data.len().min(u16::MAX as usize - 8);
                put_free_format(buf, 8 + data_len);
                buf.put_u32_le(block.handle);
                buf.put_u32_le(block.raw_block());
                buf.put_slice(&block.data[..data_len]);
            }
            Self::FileTransportStatus(status) => {
                put_free_format(buf, 9);
                buf.put_u32_le(status.handle);
                let raw = if status.last {
                    status.block | FileTransport::LAST_BLOCK
                } else {
                    status.block
                };
                buf.put_u32_le(raw);
                buf.put_u8(status.status.as_u8());
            }
        }
    }
}

impl From<&CommandHeader> for ObjectHeader {
    fn from(header: &CommandHeader) -> Self {
        match header {
            CommandHeader::Crob(items) => Self::Crob(items.clone()),
            CommandHeader::AnalogOutput(items) => Self::AnalogOutput(items.clone()),
        }
    }
}

impl std::fmt::Display for ObjectHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (g, v) = self.group_variation();
        write!(f, "g{g}v{v}")?;
        match self {
            Self::Class0 => f.write_str(" all objects"),
            Self::EventClass { count: None, .. } | Self::EventRange { count: None, .. } => {
                f.write_str(" all objects")
            }
            Self::EventClass { count: Some(n), .. } | Self::EventRange { count: Some(n), .. } => {
                write!(f, " count: {n}")
            }
            Self::StaticRange {
                range: IndexRange::All,
                ..
            } => f.write_str(" all objects"),
            Self::StaticRange {
                range: IndexRange::Range { start, stop },
                ..
            } => write!(f, " range: [{start}, {stop}]"),
            Self::AttributeRequest(id) => write!(f, " set: {}", id.set),
            other => write!(f, " count: {}", other.count()),
        }
    }
}

fn contiguous_range(values: &[(u16, Measurement)]) -> Option<(u16, u16)> {
    let (first, _) = values.first()?;
    let contiguous = values
        .iter()
        .enumerate()
        .all(|(i, (index, _))| *index as usize == *first as usize + i);
    contiguous.then(|| (*first, first + (values.len() - 1) as u16))
}

fn put_start_stop(buf: &mut BytesMut, start: u16, stop: u16) {
    if stop <= u8::MAX as u16 {
        buf.put_u8(qualifier::RANGE_8);
        buf.put_u8(start as u8);
        buf.put_u8(stop as u8);
    } else {
        buf.put_u8(qualifier::RANGE_16);
        buf.put_u16_le(start);
        buf.put_u16_le(stop);
    }
}

fn put_count_or_all(buf: &mut BytesMut, count: Option<u8>) {
    match count {
        Some(n) => {
            buf.put_u8(qualifier::COUNT_8);
            buf.put_u8(n);
        }
        None => buf.put_u8(qualifier::ALL),
    }
}

fn put_prefixed_count(buf: &mut BytesMut, count: usize) {
    buf.put_u8(qualifier::COUNT_PREFIX_16);
    buf.put_u16_le(count.min(u16::MAX as usize) as u16);
}

fn put_free_format(buf: &mut BytesMut, length: usize) {
    buf.put_u8(qualifier::FREE_FORMAT);
    buf.put_u8(1);
    buf.put_u16_le(length as u16);
}

pub(crate) fn put_u48(buf: &mut BytesMut, value: u64) {
    buf.put_uint_le(value & Timestamp::MAX_VALUE, 6);
}

fn put_time(buf: &mut BytesMut, time: Option<Time>) {
    let time = time.unwrap_or_else(Time::invalid);
    put_u48(buf, time.timestamp.raw());
    buf.put_u8(time.quality as u8);
}

/// Encode a single value. The point type selects the encoding so an absent
/// or mismatched value is written as the type's default.
fn put_value(buf: &mut BytesMut, point_type: PointType, value: &Value) {
    match (point_type, value) {
        (PointType::BinaryInput, Value::Binary(v))
        | (PointType::BinaryOutputStatus, Value::BinaryOutputStatus(v)) => buf.put_u8(*v as u8),
        (PointType::DoubleBitBinaryInput, Value::DoubleBit(v)) => buf.put_u8(*v as u8),
        (PointType::Counter, Value::Counter(v))
        | (PointType::FrozenCounter, Value::FrozenCounter(v)) => buf.put_u32_le(*v),
        (PointType::AnalogInput, Value::Analog(v))
        | (PointType::AnalogOutputStatus, Value::AnalogOutputStatus(v)) => buf.put_f64_le(*v),
        (PointType::OctetString, Value::OctetString(v)) => put_octets(buf, v),
        (pt, _) => put_value(buf, pt, &pt.default_value()),
    }
}

fn put_octets(buf: &mut BytesMut, bytes: &Bytes) {
    let len = bytes.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&bytes[..len]);
}

fn put_measurement(
    buf: &mut BytesMut,
    point_type: PointType,
    m: &Measurement,
    with_flags: bool,
    with_time: bool,
) {
    if with_flags {
        buf.put_u8(m.flags.as_u8());
    }
    put_value(buf, point_type, &m.value);
    if with_time {
        put_time(buf, m.time);
    }
}

/// Encoded size of one measurement, excluding any index prefix.
pub(crate) fn measurement_size(
    point_type: PointType,
    m: &Measurement,
    with_flags: bool,
    with_time: bool,
) -> usize {
    let value = match (point_type, &m.value) {
        (PointType::OctetString, Value::OctetString(v)) => 1 + v.len().min(u8::MAX as usize),
        (PointType::OctetString, _) => 1,
        (PointType::Counter | PointType::FrozenCounter, _) => 4,
        (PointType::AnalogInput | PointType::AnalogOutputStatus, _) => 8,
        _ => 1,
    };
    value + with_flags as usize + if with_time { 7 } else { 0 }
}

fn put_attr_value(buf: &mut BytesMut, value: &AttrValue) {
    buf.put_u8(value.type_code());
    match value {
        AttrValue::VisibleString(s) => {
            let bytes = s.as_bytes();
            let len = bytes.len().min(u8::MAX as usize);
            buf.put_u8(len as u8);
            buf.put_slice(&bytes[..len]);
        }
        AttrValue::UnsignedInt(v) => {
            buf.put_u8(4);
            buf.put_u32_le(*v);
        }
        AttrValue::SignedInt(v) => {
            buf.put_u8(4);
            buf.put_i32_le(*v);
        }
        AttrValue::Float(v) => {
            buf.put_u8(8);
            buf.put_f64_le(*v);
        }
        AttrValue::OctetString(v) => put_octets(buf, v),
    }
}

//! Measurement types shared by the master and the outstation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// The eight point types held in an outstation database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PointType {
    /// Binary input (g1 / g2)
    BinaryInput,
    /// Double-bit binary input (g3 / g4)
    DoubleBitBinaryInput,
    /// Binary output status (g10 / g11)
    BinaryOutputStatus,
    /// Running counter (g20 / g22)
    Counter,
    /// Frozen counter (g21 / g23)
    FrozenCounter,
    /// Analog input (g30 / g32)
    AnalogInput,
    /// Analog output status (g40 / g42)
    AnalogOutputStatus,
    /// Octet string (g110 / g111)
    OctetString,
}

impl PointType {
    /// All point types in class 0 reporting order.
    pub const ALL: [PointType; 8] = [
        Self::BinaryInput,
        Self::DoubleBitBinaryInput,
        Self::BinaryOutputStatus,
        Self::Counter,
        Self::FrozenCounter,
        Self::AnalogInput,
        Self::AnalogOutputStatus,
        Self::OctetString,
    ];

    /// Object group used for static values.
    pub const fn static_group(&self) -> u8 {
        match self {
            Self::BinaryInput => 1,
            Self::DoubleBitBinaryInput => 3,
            Self::BinaryOutputStatus => 10,
            Self::Counter => 20,
            Self::FrozenCounter => 21,
            Self::AnalogInput => 30,
            Self::AnalogOutputStatus => 40,
            Self::OctetString => 110,
        }
    }

    /// Object group used for events.
    pub const fn event_group(&self) -> u8 {
        match self {
            Self::BinaryInput => 2,
            Self::DoubleBitBinaryInput => 4,
            Self::BinaryOutputStatus => 11,
            Self::Counter => 22,
            Self::FrozenCounter => 23,
            Self::AnalogInput => 32,
            Self::AnalogOutputStatus => 42,
            Self::OctetString => 111,
        }
    }

    /// Look up the point type of a static object group.
    pub fn from_static_group(group: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.static_group() == group)
    }

    /// Look up the point type of an event object group.
    pub fn from_event_group(group: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.event_group() == group)
    }

    /// True for the counter and analog families, which support a deadband.
    pub const fn has_deadband(&self) -> bool {
        matches!(
            self,
            Self::Counter
                | Self::FrozenCounter
                | Self::AnalogInput
                | Self::AnalogOutputStatus
        )
    }

    /// Value assigned to newly configured points.
    pub fn default_value(&self) -> Value {
        match self {
            Self::BinaryInput => Value::Binary(false),
            Self::DoubleBitBinaryInput => Value::DoubleBit(DoubleBit::Indeterminate),
            Self::BinaryOutputStatus => Value::BinaryOutputStatus(false),
            Self::Counter => Value::Counter(0),
            Self::FrozenCounter => Value::FrozenCounter(0),
            Self::AnalogInput => Value::Analog(0.0),
            Self::AnalogOutputStatus => Value::AnalogOutputStatus(0.0),
            Self::OctetString => Value::OctetString(Bytes::new()),
        }
    }
}

impl std::fmt::Display for PointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BinaryInput => "binary input",
            Self::DoubleBitBinaryInput => "double-bit binary input",
            Self::BinaryOutputStatus => "binary output status",
            Self::Counter => "counter",
            Self::FrozenCounter => "frozen counter",
            Self::AnalogInput => "analog input",
            Self::AnalogOutputStatus => "analog output status",
            Self::OctetString => "octet string",
        };
        f.write_str(name)
    }
}

/// Point quality flags.
///
/// Bits 5 and 6 are type specific: CHATTER_FILTER / ROLLOVER / OVER_RANGE
/// share bit 5 and DISCONTINUITY / REFERENCE_ERR share bit 6.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Flags(u8);

impl Flags {
    /// Point is online
    pub const ONLINE: Self = Self(0x01);
    /// Point has not been updated since restart
    pub const RESTART: Self = Self(0x02);
    /// Communication with the source of the point is lost
    pub const COMM_LOST: Self = Self(0x04);
    /// Value is forced at a remote device
    pub const REMOTE_FORCED: Self = Self(0x08);
    /// Value is forced locally
    pub const LOCAL_FORCED: Self = Self(0x10);
    /// Binary inputs: chatter filter active
    pub const CHATTER_FILTER: Self = Self(0x20);
    /// Counters: value rolled over
    pub const ROLLOVER: Self = Self(0x20);
    /// Analogs: value exceeds the representable range
    pub const OVER_RANGE: Self = Self(0x20);
    /// Counters: value is discontinuous
    pub const DISCONTINUITY: Self = Self(0x40);
    /// Analogs: reference signal error
    pub const REFERENCE_ERR: Self = Self(0x40);

    /// Empty flag set.
    pub const NONE: Self = Self(0);

    /// Create from a raw byte.
    #[inline(always)]
    pub const fn from_u8(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw byte value.
    #[inline(always)]
    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// True if all bits in `other` are set.
    #[inline(always)]
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Return a copy with `other` set.
    #[inline(always)]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Return a copy with `other` cleared.
    #[inline(always)]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Flags(0x{:02X})", self.0)
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [&str; 7] = [
            "ONLINE",
            "RESTART",
            "COMM_LOST",
            "REMOTE_FORCED",
            "LOCAL_FORCED",
            "BIT5",
            "BIT6",
        ];
        if self.0 == 0 {
            return f.write_str("-");
        }
        let mut first = true;
        for (bit, name) in NAMES.iter().enumerate() {
            if self.0 & (1 << bit) != 0 {
                if !first {
                    f.write_str("|")?;
                }
                first = false;
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

/// Milliseconds since 1970-01-01 UTC, limited to 48 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Largest value representable in 48 bits.
    pub const MAX_VALUE: u64 = 0xFFFF_FFFF_FFFF;

    /// Create from milliseconds since epoch, masked to 48 bits.
    #[inline]
    pub const fn new(millis: u64) -> Self {
        Self(millis & Self::MAX_VALUE)
    }

    /// Milliseconds since epoch.
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Convert a system time, if it is after the epoch and fits in 48 bits.
    pub fn try_from_system_time(time: SystemTime) -> Option<Self> {
        let millis = time.duration_since(UNIX_EPOCH).ok()?.as_millis();
        let millis = u64::try_from(millis).ok()?;
        (millis <= Self::MAX_VALUE).then_some(Self(millis))
    }

    /// Add a duration, failing if the result does not fit in 48 bits.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let millis = u64::try_from(duration.as_millis()).ok()?;
        let sum = self.0.checked_add(millis)?;
        (sum <= Self::MAX_VALUE).then_some(Self(sum))
    }

    /// Render as a UTC date-time.
    pub fn to_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(i64::try_from(self.0).ok()?)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Quality of a point timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TimeQuality {
    /// The source clock is synchronized
    Synchronized = 0,
    /// The source clock is not synchronized
    Unsynchronized = 1,
    /// No usable time
    Invalid = 2,
}

impl TimeQuality {
    /// Parse from the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Synchronized),
            1 => Some(Self::Unsynchronized),
            2 => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// Timestamp with its quality tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Time {
    /// Timestamp value
    pub timestamp: Timestamp,
    /// Quality tag
    pub quality: TimeQuality,
}

impl Time {
    /// A timestamp from a synchronized clock.
    pub const fn synchronized(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            quality: TimeQuality::Synchronized,
        }
    }

    /// A timestamp from an unsynchronized clock.
    pub const fn unsynchronized(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            quality: TimeQuality::Unsynchronized,
        }
    }

    /// No usable time.
    pub const fn invalid() -> Self {
        Self {
            timestamp: Timestamp::new(0),
            quality: TimeQuality::Invalid,
        }
    }

    /// True unless the quality is `Invalid`.
    pub const fn is_valid(&self) -> bool {
        !matches!(self.quality, TimeQuality::Invalid)
    }
}

/// State of a double-bit binary input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DoubleBit {
    /// Transitioning between states
    Intermediate = 0,
    /// Determined to be off
    DeterminedOff = 1,
    /// Determined to be on
    DeterminedOn = 2,
    /// Abnormal or custom state
    Indeterminate = 3,
}

impl DoubleBit {
    /// Parse from the lower two bits of a byte.
    pub const fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0 => Self::Intermediate,
            1 => Self::DeterminedOff,
            2 => Self::DeterminedOn,
            _ => Self::Indeterminate,
        }
    }
}

/// Type-specific point value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Binary input state
    Binary(bool),
    /// Double-bit binary input state
    DoubleBit(DoubleBit),
    /// Binary output status
    BinaryOutputStatus(bool),
    /// Running counter
    Counter(u32),
    /// Frozen counter
    FrozenCounter(u32),
    /// Analog input
    Analog(f64),
    /// Analog output status
    AnalogOutputStatus(f64),
    /// Octet string
    OctetString(Bytes),
}

impl Value {
    /// Point type this value belongs to.
    pub const fn point_type(&self) -> PointType {
        match self {
            Self::Binary(_) => PointType::BinaryInput,
            Self::DoubleBit(_) => PointType::DoubleBitBinaryInput,
            Self::BinaryOutputStatus(_) => PointType::BinaryOutputStatus,
            Self::Counter(_) => PointType::Counter,
            Self::FrozenCounter(_) => PointType::FrozenCounter,
            Self::Analog(_) => PointType::AnalogInput,
            Self::AnalogOutputStatus(_) => PointType::AnalogOutputStatus,
            Self::OctetString(_) => PointType::OctetString,
        }
    }

    /// Numeric view of counter and analog values.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Counter(v) | Self::FrozenCounter(v) => Some(*v as f64),
            Self::Analog(v) | Self::AnalogOutputStatus(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view of binary values.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Binary(v) | Self::BinaryOutputStatus(v) => Some(*v),
            Self::DoubleBit(DoubleBit::DeterminedOn) => Some(true),
            Self::DoubleBit(DoubleBit::DeterminedOff) => Some(false),
            _ => None,
        }
    }

    /// Absolute numeric distance between two values of the same numeric type.
    pub fn distance(&self, other: &Value) -> Option<f64> {
        match (self, other) {
            (Self::Counter(a), Self::Counter(b))
            | (Self::FrozenCounter(a), Self::FrozenCounter(b)) => Some(a.abs_diff(*b) as f64),
            (Self::Analog(a), Self::Analog(b))
            | (Self::AnalogOutputStatus(a), Self::AnalogOutputStatus(b)) => Some((a - b).abs()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary(v) | Self::BinaryOutputStatus(v) => write!(f, "{v}"),
            Self::DoubleBit(v) => write!(f, "{v:?}"),
            Self::Counter(v) | Self::FrozenCounter(v) => write!(f, "{v}"),
            Self::Analog(v) | Self::AnalogOutputStatus(v) => write!(f, "{v}"),
            Self::OctetString(v) => write!(f, "{v:02X?}"),
        }
    }
}

/// A point value with its flags and optional timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Current value
    pub value: Value,
    /// Quality flags
    pub flags: Flags,
    /// Timestamp, if known
    pub time: Option<Time>,
}

impl Measurement {
    /// An online measurement without a timestamp.
    pub const fn new(value: Value) -> Self {
        Self {
            value,
            flags: Flags::ONLINE,
            time: None,
        }
    }

    /// Replace the flags.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Attach a timestamp.
    pub fn with_time(mut self, time: Time) -> Self {
        self.time = Some(time);
        self
    }

    /// Point type of the value.
    pub const fn point_type(&self) -> PointType {
        self.value.point_type()
    }
}

/// Event class assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventClass {
    /// Class 1 (highest priority)
    Class1,
    /// Class 2
    Class2,
    /// Class 3
    Class3,
}

impl EventClass {
    /// All event classes in priority order.
    pub const ALL: [EventClass; 3] = [Self::Class1, Self::Class2, Self::Class3];

    /// Zero-based position of the class.
    pub const fn index(&self) -> usize {
        match self {
            Self::Class1 => 0,
            Self::Class2 => 1,
            Self::Class3 => 2,
        }
    }
}

/// A set of event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventClasses {
    /// Class 1 selected
    pub class1: bool,
    /// Class 2 selected
    pub class2: bool,
    /// Class 3 selected
    pub class3: bool,
}

impl EventClasses {
    /// Every event class.
    pub const ALL: Self = Self::new(true, true, true);

    /// No event class.
    pub const NONE: Self = Self::new(false, false, false);

    /// Create from individual selections.
    pub const fn new(class1: bool, class2: bool, class3: bool) -> Self {
        Self {
            class1,
            class2,
            class3,
        }
    }

    /// True if `class` is part of the set.
    pub const fn contains(&self, class: EventClass) -> bool {
        match class {
            EventClass::Class1 => self.class1,
            EventClass::Class2 => self.class2,
            EventClass::Class3 => self.class3,
        }
    }

    /// True if no class is selected.
    pub const fn is_empty(&self) -> bool {
        !(self.class1 || self.class2 || self.class3)
    }

    /// Add or remove `class`.
    pub fn set(&mut self, class: EventClass, value: bool) {
        match class {
            EventClass::Class1 => self.class1 = value,
            EventClass::Class2 => self.class2 = value,
            EventClass::Class3 => self.class3 = value,
        }
    }

    /// Iterate the selected classes in priority order.
    pub fn iter(&self) -> impl Iterator<Item = EventClass> + '_ {
        EventClass::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl From<EventClass> for EventClasses {
    fn from(class: EventClass) -> Self {
        let mut classes = Self::NONE;
        classes.set(class, true);
        classes
    }
}

impl std::ops::BitOr for EventClasses {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::new(
            self.class1 | rhs.class1,
            self.class2 | rhs.class2,
            self.class3 | rhs.class3,
        )
    }
}

/// Static (class 0) and event classes requested by a class scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Classes {
    /// Class 0 (static data)
    pub class0: bool,
    /// Event classes
    pub events: EventClasses,
}

impl Classes {
    /// Create from the class 0 flag and an event class set.
    pub const fn new(class0: bool, events: EventClasses) -> Self {
        Self { class0, events }
    }

    /// Class 1, 2, 3 and 0.
    pub const fn integrity() -> Self {
        Self::new(true, EventClasses::ALL)
    }

    /// Event classes only.
    pub const fn events(events: EventClasses) -> Self {
        Self::new(false, events)
    }

    /// True if nothing is selected.
    pub const fn is_empty(&self) -> bool {
        !self.class0 && self.events.is_empty()
    }
}

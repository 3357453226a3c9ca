//! Application layer header fields: control octet, sequence numbers and IIN.

/// Application layer sequence number (4 bits, wraps at 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sequence(u8);

impl Sequence {
    const MASK: u8 = 0x0F;

    /// Create a sequence number from the lower 4 bits of `value`.
    #[inline]
    pub const fn new(value: u8) -> Self {
        Self(value & Self::MASK)
    }

    /// Raw value (0-15).
    #[inline]
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// The sequence number that follows this one.
    #[inline]
    pub const fn next(&self) -> Self {
        Self((self.0 + 1) & Self::MASK)
    }

    /// The sequence number before this one.
    #[inline]
    pub const fn previous(&self) -> Self {
        Self(self.0.wrapping_sub(1) & Self::MASK)
    }

    /// Return the current value and advance to the next one.
    #[inline]
    pub fn increment(&mut self) -> Self {
        let current = *self;
        *self = self.next();
        current
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application control octet.
///
/// ```text
/// +-----+-----+-----+-----+-----------------+
/// | FIR | FIN | CON | UNS |       SEQ       |
/// +-----+-----+-----+-----+-----------------+
///   b7    b6    b5    b4        b3..b0
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    /// First fragment of a message
    pub fir: bool,
    /// Final fragment of a message
    pub fin: bool,
    /// Confirmation requested
    pub con: bool,
    /// Unsolicited response (or confirmation of one)
    pub uns: bool,
    /// Sequence number
    pub seq: Sequence,
}

impl Control {
    const FIR_MASK: u8 = 0x80;
    const FIN_MASK: u8 = 0x40;
    const CON_MASK: u8 = 0x20;
    const UNS_MASK: u8 = 0x10;

    /// Control for a single-fragment request.
    pub const fn request(seq: Sequence) -> Self {
        Self {
            fir: true,
            fin: true,
            con: false,
            uns: false,
            seq,
        }
    }

    /// Control for a single-fragment solicited response.
    pub const fn response(seq: Sequence, con: bool) -> Self {
        Self {
            fir: true,
            fin: true,
            con,
            uns: false,
            seq,
        }
    }

    /// Control for an unsolicited response. Unsolicited responses always request confirmation.
    pub const fn unsolicited(seq: Sequence) -> Self {
        Self {
            fir: true,
            fin: true,
            con: true,
            uns: true,
            seq,
        }
    }

    /// Control for a confirm of a solicited or unsolicited response.
    pub const fn confirm(seq: Sequence, uns: bool) -> Self {
        Self {
            fir: true,
            fin: true,
            con: false,
            uns,
            seq,
        }
    }

    /// Parse from the wire byte.
    #[inline]
    pub const fn from_u8(byte: u8) -> Self {
        Self {
            fir: byte & Self::FIR_MASK != 0,
            fin: byte & Self::FIN_MASK != 0,
            con: byte & Self::CON_MASK != 0,
            uns: byte & Self::UNS_MASK != 0,
            seq: Sequence::new(byte),
        }
    }

    /// Encode to the wire byte.
    #[inline]
    pub const fn as_u8(&self) -> u8 {
        let mut byte = self.seq.value();
        if self.fir {
            byte |= Self::FIR_MASK;
        }
        if self.fin {
            byte |= Self::FIN_MASK;
        }
        if self.con {
            byte |= Self::CON_MASK;
        }
        if self.uns {
            byte |= Self::UNS_MASK;
        }
        byte
    }
}

impl std::fmt::Display for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[fir: {} fin: {} con: {} uns: {} seq: {}]",
            self.fir as u8, self.fin as u8, self.con as u8, self.uns as u8, self.seq
        )
    }
}

macro_rules! iin_bits {
    ($name:ident { $($(#[$doc:meta])* $flag:ident = $mask:expr),* $(,)? }) => {
        impl $name {
            $(
                $(#[$doc])*
                pub const $flag: Self = Self($mask);
            )*

            /// Raw byte value.
            #[inline(always)]
            pub const fn as_u8(&self) -> u8 {
                self.0
            }

            /// Create from a raw byte value.
            #[inline(always)]
            pub const fn from_u8(raw: u8) -> Self {
                Self(raw)
            }

            /// True if every bit in `other` is set in `self`.
            #[inline(always)]
            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// True if no bits are set.
            #[inline(always)]
            pub const fn is_empty(&self) -> bool {
                self.0 == 0
            }

            /// Set or clear the bits of `other`.
            #[inline(always)]
            pub fn set(&mut self, other: Self, value: bool) {
                if value {
                    self.0 |= other.0;
                } else {
                    self.0 &= !other.0;
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut first = true;
                $(
                    if self.contains(Self::$flag) {
                        if !first {
                            f.write_str("|")?;
                        }
                        first = false;
                        f.write_str(stringify!($flag))?;
                    }
                )*
                if first {
                    f.write_str("-")?;
                }
                Ok(())
            }
        }
    };
}

/// First octet of the internal indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct Iin1(u8);

iin_bits!(Iin1 {
    /// A broadcast message was received
    BROADCAST = 0x01,
    /// Class 1 events are available
    CLASS_1_EVENTS = 0x02,
    /// Class 2 events are available
    CLASS_2_EVENTS = 0x04,
    /// Class 3 events are available
    CLASS_3_EVENTS = 0x08,
    /// The outstation requires time synchronization
    NEED_TIME = 0x10,
    /// One or more points are in local control
    LOCAL_CONTROL = 0x20,
    /// Abnormal condition in the outstation
    DEVICE_TROUBLE = 0x40,
    /// The outstation restarted
    DEVICE_RESTART = 0x80,
});

/// Second octet of the internal indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct Iin2(u8);

iin_bits!(Iin2 {
    /// Function code not supported
    NO_FUNC_CODE_SUPPORT = 0x01,
    /// Requested object(s) unknown
    OBJECT_UNKNOWN = 0x02,
    /// Invalid parameters in the qualifier, range or data
    PARAMETER_ERROR = 0x04,
    /// An event buffer overflowed and at least one event was lost
    EVENT_BUFFER_OVERFLOW = 0x08,
    /// Operation already executing
    ALREADY_EXECUTING = 0x10,
    /// Configuration is corrupt
    CONFIG_CORRUPT = 0x20,
});

impl Iin2 {
    /// True if any bit reporting a rejected request is set.
    pub const fn has_request_error(&self) -> bool {
        self.0 & (Self::NO_FUNC_CODE_SUPPORT.0 | Self::OBJECT_UNKNOWN.0 | Self::PARAMETER_ERROR.0)
            != 0
    }
}

/// Internal indications carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Iin {
    /// First octet
    pub iin1: Iin1,
    /// Second octet
    pub iin2: Iin2,
}

impl Iin {
    /// Create from both octets.
    pub const fn new(iin1: Iin1, iin2: Iin2) -> Self {
        Self { iin1, iin2 }
    }
}

impl std::ops::BitOr for Iin {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            iin1: self.iin1 | rhs.iin1,
            iin2: self.iin2 | rhs.iin2,
        }
    }
}

impl std::fmt::Display for Iin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IIN1: {} IIN2: {}", self.iin1, self.iin2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_wraps() {
        let mut seq = Sequence::new(15);
        assert_eq!(seq.increment().value(), 15);
        assert_eq!(seq.value(), 0);
        assert_eq!(Sequence::new(0).previous().value(), 15);
        assert_eq!(Sequence::new(0x1F).value(), 0x0F);
    }

    #[test]
    fn test_control_bits() {
        let control = Control::unsolicited(Sequence::new(3));
        assert_eq!(control.as_u8(), 0xF3);
        assert_eq!(Control::from_u8(0xF3), control);

        let control = Control::response(Sequence::new(1), false);
        assert_eq!(control.as_u8(), 0xC1);
        assert!(!Control::from_u8(0xC1).con);
    }

    #[test]
    fn test_iin_display() {
        let mut iin1 = Iin1::default();
        assert_eq!(iin1.to_string(), "-");
        iin1.set(Iin1::DEVICE_RESTART, true);
        iin1 |= Iin1::CLASS_1_EVENTS;
        assert_eq!(iin1.to_string(), "CLASS_1_EVENTS|DEVICE_RESTART");
        iin1.set(Iin1::DEVICE_RESTART, false);
        assert_eq!(iin1.as_u8(), 0x02);
    }

    #[test]
    fn test_iin2_request_error() {
        assert!(Iin2::OBJECT_UNKNOWN.has_request_error());
        assert!(!Iin2::EVENT_BUFFER_OVERFLOW.has_request_error());
    }
}

//! Device attribute objects (g0).

use bytes::Bytes;

/// Attribute variation that requests every attribute of a set.
pub const ALL_ATTRIBUTES: u8 = 254;

/// Well-known attribute variations of the default set.
pub mod var {
    /// Device manufacturer's software version
    pub const SOFTWARE_VERSION: u8 = 242;
    /// Device manufacturer's hardware version
    pub const HARDWARE_VERSION: u8 = 243;
    /// User-assigned location
    pub const USER_LOCATION: u8 = 245;
    /// User-assigned device name
    pub const DEVICE_NAME: u8 = 246;
    /// Device serial number
    pub const SERIAL_NUMBER: u8 = 248;
    /// Device manufacturer's product name
    pub const PRODUCT_NAME: u8 = 250;
    /// Device manufacturer's name
    pub const MANUFACTURER: u8 = 252;
}

/// Attribute value with its wire data type.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Visible string (type 1)
    VisibleString(String),
    /// Unsigned integer (type 2)
    UnsignedInt(u32),
    /// Signed integer (type 3)
    SignedInt(i32),
    /// Floating point (type 4)
    Float(f64),
    /// Octet string (type 5)
    OctetString(Bytes),
}

impl AttrValue {
    /// Data type code on the wire.
    pub const fn type_code(&self) -> u8 {
        match self {
            Self::VisibleString(_) => 1,
            Self::UnsignedInt(_) => 2,
            Self::SignedInt(_) => 3,
            Self::Float(_) => 4,
            Self::OctetString(_) => 5,
        }
    }

    /// True if `other` has the same data type.
    pub fn same_type(&self, other: &AttrValue) -> bool {
        self.type_code() == other.type_code()
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VisibleString(s) => write!(f, "\"{s}\""),
            Self::UnsignedInt(v) => write!(f, "{v}"),
            Self::SignedInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::OctetString(v) => write!(f, "{v:02X?}"),
        }
    }
}

/// Identifies an attribute: set number and variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttrId {
    /// Attribute set (0 is the default set)
    pub set: u8,
    /// Variation within the set
    pub variation: u8,
}

impl AttrId {
    /// Attribute in the default set.
    pub const fn default_set(variation: u8) -> Self {
        Self { set: 0, variation }
    }
}

impl std::fmt::Display for AttrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "set {} var {}", self.set, self.variation)
    }
}

/// An attribute value as carried in a g0 object.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Set and variation
    pub id: AttrId,
    /// Value
    pub value: AttrValue,
}

impl Attribute {
    /// Create an attribute.
    pub fn new(id: AttrId, value: AttrValue) -> Self {
        Self { id, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_type_codes() {
        assert_eq!(AttrValue::VisibleString("x".into()).type_code(), 1);
        assert_eq!(AttrValue::Float(1.0).type_code(), 4);
        assert!(AttrValue::UnsignedInt(1).same_type(&AttrValue::UnsignedInt(7)));
        assert!(!AttrValue::UnsignedInt(1).same_type(&AttrValue::SignedInt(1)));
    }

    #[test]
    fn test_attr_display() {
        let id = AttrId::default_set(var::DEVICE_NAME);
        assert_eq!(id.to_string(), "set 0 var 246");
        assert_eq!(AttrValue::VisibleString("rtu".into()).to_string(), "\"rtu\"");
    }
}

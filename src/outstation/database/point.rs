//! Point configuration and change detection.

use crate::types::{EventClass, EventVariation, Flags, Measurement, PointType, StaticVariation};

/// How an update decides whether to create an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventMode {
    /// Always create an event
    Force,
    /// Create an event if the flags changed or the value moved past the
    /// deadband (binary values: any value change)
    #[default]
    Detect,
    /// Create an event on any value or flags change, ignoring the deadband
    AnyChange,
    /// Never create an event
    Suppress,
}

/// Options passed with each point update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UpdateOptions {
    /// Event creation mode
    pub event_mode: EventMode,
}

impl UpdateOptions {
    /// Detect events against the stored value.
    pub const fn detect() -> Self {
        Self {
            event_mode: EventMode::Detect,
        }
    }

    /// Always create an event.
    pub const fn force() -> Self {
        Self {
            event_mode: EventMode::Force,
        }
    }

    /// Create an event on any change.
    pub const fn any_change() -> Self {
        Self {
            event_mode: EventMode::AnyChange,
        }
    }

    /// Update the stored value without creating an event.
    pub const fn no_event() -> Self {
        Self {
            event_mode: EventMode::Suppress,
        }
    }
}

/// Per-point configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointConfig {
    /// Event class, `None` disables events for the point
    pub class: Option<EventClass>,
    /// Variation reported when the master asks for any static variation
    pub static_variation: StaticVariation,
    /// Variation reported when the master asks for any event variation
    pub event_variation: EventVariation,
    /// Deadband for counter and analog points
    pub deadband: f64,
}

impl Default for PointConfig {
    fn default() -> Self {
        Self {
            class: Some(EventClass::Class1),
            static_variation: StaticVariation::WithFlags,
            event_variation: EventVariation::WithTime,
            deadband: 0.0,
        }
    }
}

impl PointConfig {
    /// Class 1 events, flags and time reported.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event class.
    pub fn class(mut self, class: Option<EventClass>) -> Self {
        self.class = class;
        self
    }

    /// Set the default static variation.
    pub fn static_variation(mut self, variation: StaticVariation) -> Self {
        self.static_variation = variation;
        self
    }

    /// Set the default event variation.
    pub fn event_variation(mut self, variation: EventVariation) -> Self {
        self.event_variation = variation;
        self
    }

    /// Set the deadband.
    pub fn deadband(mut self, deadband: f64) -> Self {
        self.deadband = deadband.abs();
        self
    }
}

/// A configured point with its stored value.
#[derive(Debug, Clone)]
pub(crate) struct Point {
    pub(crate) config: PointConfig,
    pub(crate) current: Measurement,
}

impl Point {
    pub(crate) fn new(point_type: PointType, config: PointConfig) -> Self {
        Self {
            config,
            current: Measurement::new(point_type.default_value()).with_flags(Flags::RESTART),
        }
    }

    /// Decide whether `next` is event-worthy compared with the stored value.
    pub(crate) fn is_event(&self, next: &Measurement, mode: EventMode) -> bool {
        if self.config.class.is_none() {
            return false;
        }
        match mode {
            EventMode::Force => true,
            EventMode::Suppress => false,
            EventMode::AnyChange => {
                next.flags != self.current.flags || next.value != self.current.value
            }
            EventMode::Detect => {
                if next.flags != self.current.flags {
                    return true;
                }
                match next.value.distance(&self.current.value) {
                    Some(distance) => distance > self.config.deadband,
                    None => next.value != self.current.value,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn analog(value: f64) -> Measurement {
        Measurement::new(Value::Analog(value))
    }

    fn stored(point_type: PointType, config: PointConfig, m: Measurement) -> Point {
        let mut point = Point::new(point_type, config);
        point.current = m;
        point
    }

    #[test]
    fn test_deadband_detection() {
        let point = stored(
            PointType::AnalogInput,
            PointConfig::new().deadband(1.5),
            analog(10.0),
        );
        assert!(!point.is_event(&analog(11.5), EventMode::Detect));
        assert!(point.is_event(&analog(11.6), EventMode::Detect));
        assert!(point.is_event(&analog(8.4), EventMode::Detect));
        assert!(point.is_event(&analog(11.0), EventMode::AnyChange));
        assert!(!point.is_event(&analog(10.0), EventMode::AnyChange));
    }

    #[test]
    fn test_flag_change_is_event() {
        let point = stored(
            PointType::AnalogInput,
            PointConfig::new().deadband(100.0),
            analog(10.0),
        );
        let next = analog(10.0).with_flags(Flags::ONLINE | Flags::COMM_LOST);
        assert!(point.is_event(&next, EventMode::Detect));
    }

    #[test]
    fn test_binary_detection() {
        let point = stored(
            PointType::BinaryInput,
            PointConfig::new(),
            Measurement::new(Value::Binary(false)),
        );
        assert!(point.is_event(&Measurement::new(Value::Binary(true)), EventMode::Detect));
        assert!(!point.is_event(&Measurement::new(Value::Binary(false)), EventMode::Detect));
        assert!(point.is_event(&Measurement::new(Value::Binary(false)), EventMode::Force));
        assert!(!point.is_event(&Measurement::new(Value::Binary(true)), EventMode::Suppress));
    }

    #[test]
    fn test_no_class_never_creates_events() {
        let point = stored(
            PointType::Counter,
            PointConfig::new().class(None),
            Measurement::new(Value::Counter(0)),
        );
        assert!(!point.is_event(&Measurement::new(Value::Counter(50)), EventMode::Force));
    }

    #[test]
    fn test_new_point_reports_restart() {
        let point = Point::new(PointType::Counter, PointConfig::new());
        assert_eq!(point.current.value, Value::Counter(0));
        assert!(point.current.flags.contains(Flags::RESTART));
    }
}

//! Outstation point database.
//!
//! Points, the event buffer and device attributes live behind a single
//! `parking_lot::Mutex`. Every mutation goes through [`Database::transaction`],
//! so a response under construction never observes a partially applied batch.
//!
//! ```rust,ignore
//! database.transaction(|tx| {
//!     tx.add(PointType::BinaryInput, 0, PointConfig::new())?;
//!     tx.update(0, Measurement::new(Value::Binary(true)), UpdateOptions::detect())
//! })?;
//! ```

mod event;
mod point;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{Dnp3Error, Result};
use crate::types::{
    AttrId, AttrValue, Attribute, EventClass, Flags, IndexRange, Measurement, PointType, Time,
    Value,
};

pub(crate) use event::{EventBuffer, Owner};
pub use event::{EventBufferConfig, EventRecord, OverflowPolicy, DEFAULT_EVENT_CAPACITY};
pub(crate) use point::Point;
pub use point::{EventMode, PointConfig, UpdateOptions};

/// Point types included in a class 0 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassZeroConfig {
    /// Binary inputs
    pub binary_input: bool,
    /// Double-bit binary inputs
    pub double_bit_binary_input: bool,
    /// Binary output status
    pub binary_output_status: bool,
    /// Counters
    pub counter: bool,
    /// Frozen counters
    pub frozen_counter: bool,
    /// Analog inputs
    pub analog_input: bool,
    /// Analog output status
    pub analog_output_status: bool,
    /// Octet strings
    pub octet_string: bool,
}

impl Default for ClassZeroConfig {
    fn default() -> Self {
        Self {
            binary_input: true,
            double_bit_binary_input: true,
            binary_output_status: true,
            counter: true,
            frozen_counter: true,
            analog_input: true,
            analog_output_status: true,
            octet_string: false,
        }
    }
}

impl ClassZeroConfig {
    /// True if `point_type` is reported in class 0.
    pub fn includes(&self, point_type: PointType) -> bool {
        match point_type {
            PointType::BinaryInput => self.binary_input,
            PointType::DoubleBitBinaryInput => self.double_bit_binary_input,
            PointType::BinaryOutputStatus => self.binary_output_status,
            PointType::Counter => self.counter,
            PointType::FrozenCounter => self.frozen_counter,
            PointType::AnalogInput => self.analog_input,
            PointType::AnalogOutputStatus => self.analog_output_status,
            PointType::OctetString => self.octet_string,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatabaseConfig {
    /// Event buffer sizing
    pub events: EventBufferConfig,
    /// Class 0 composition
    pub class_zero: ClassZeroConfig,
}

impl DatabaseConfig {
    /// Set the event buffer configuration.
    pub fn events(mut self, events: EventBufferConfig) -> Self {
        self.events = events;
        self
    }

    /// Set the class 0 composition.
    pub fn class_zero(mut self, class_zero: ClassZeroConfig) -> Self {
        self.class_zero = class_zero;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AttrEntry {
    pub(crate) value: AttrValue,
    pub(crate) writable: bool,
}

/// State guarded by the database lock.
#[derive(Debug)]
pub(crate) struct Store {
    points: BTreeMap<PointType, BTreeMap<u16, Point>>,
    pub(crate) events: EventBuffer,
    attributes: BTreeMap<AttrId, AttrEntry>,
    class_zero: ClassZeroConfig,
}

impl Store {
    fn new(config: DatabaseConfig) -> Self {
        Self {
            points: BTreeMap::new(),
            events: EventBuffer::new(config.events),
            attributes: BTreeMap::new(),
            class_zero: config.class_zero,
        }
    }

    pub(crate) fn point(&self, point_type: PointType, index: u16) -> Option<&Point> {
        self.points.get(&point_type)?.get(&index)
    }

    /// Points of one type within `range`, in index order. The flag is true
    /// if an explicit range named an index that is not configured.
    pub(crate) fn range(&self, point_type: PointType, range: IndexRange) -> (Vec<(u16, &Point)>, bool) {
        let Some(points) = self.points.get(&point_type) else {
            return (Vec::new(), range != IndexRange::All);
        };
        match range {
            IndexRange::All => (points.iter().map(|(i, p)| (*i, p)).collect(), false),
            IndexRange::Range { start, stop } => {
                let found: Vec<_> = points.range(start..=stop).map(|(i, p)| (*i, p)).collect();
                let expected = (stop - start) as usize + 1;
                let missing = found.len() != expected;
                (found, missing)
            }
        }
    }

    pub(crate) fn class_zero_types(&self) -> impl Iterator<Item = PointType> + '_ {
        PointType::ALL
            .into_iter()
            .filter(|t| self.class_zero.includes(*t))
    }

    pub(crate) fn attribute(&self, id: AttrId) -> Option<&AttrEntry> {
        self.attributes.get(&id)
    }

    /// Every attribute defined in `set`, in variation order.
    pub(crate) fn attribute_set(&self, set: u8) -> Vec<Attribute> {
        self.attributes
            .iter()
            .filter(|(id, _)| id.set == set)
            .map(|(id, entry)| Attribute::new(*id, entry.value.clone()))
            .collect()
    }

    /// Apply a master write. Fails unless the attribute is defined, writable
    /// and the value has the same type.
    pub(crate) fn write_attribute(&mut self, attr: &Attribute) -> bool {
        match self.attributes.get_mut(&attr.id) {
            Some(entry) if entry.writable && entry.value.same_type(&attr.value) => {
                entry.value = attr.value.clone();
                true
            }
            _ => false,
        }
    }

    fn apply(
        &mut self,
        index: u16,
        mut measurement: Measurement,
        options: UpdateOptions,
        clock: &dyn Clock,
    ) -> Result<bool> {
        let point_type = measurement.point_type();
        if measurement.time.is_none() {
            measurement.time = Some(clock.now());
        }

        let point = self
            .points
            .get_mut(&point_type)
            .and_then(|points| points.get_mut(&index))
            .ok_or_else(|| Dnp3Error::UnknownPoint(format!("{point_type} {index}")))?;

        let is_event = point.is_event(&measurement, options.event_mode);
        let class = point.config.class;
        let variation = point.config.event_variation;
        point.current = measurement.clone();

        match class {
            Some(class) if is_event => Ok(self
                .events
                .insert(point_type, index, class, measurement, variation)),
            _ => Ok(false),
        }
    }
}

/// Shared outstation database.
pub struct Database {
    inner: Mutex<Store>,
    changed: Notify,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Create an empty database that stamps updates with the system clock.
    pub fn new(config: DatabaseConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create an empty database that stamps updates with `clock`.
    pub fn with_clock(config: DatabaseConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Store::new(config)),
            changed: Notify::new(),
            clock,
        }
    }

    /// Run `f` with exclusive access to the database.
    ///
    /// Concurrent transactions are serialized. The outstation is woken once
    /// the transaction completes if any event was recorded.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let (result, events) = {
            let mut store = self.inner.lock();
            let mut tx = Transaction {
                store: &mut store,
                clock: self.clock.as_ref(),
                events: 0,
            };
            let result = f(&mut tx);
            (result, tx.events)
        };
        if events > 0 {
            debug!("Transaction recorded {} event(s)", events);
            self.changed.notify_one();
        }
        result
    }

    /// Current value of one point.
    pub fn static_view(&self, point_type: PointType, index: u16) -> Option<Measurement> {
        self.inner
            .lock()
            .point(point_type, index)
            .map(|p| p.current.clone())
    }

    /// Buffered events of one class in insertion order.
    pub fn event_view(&self, class: EventClass) -> Vec<EventRecord> {
        self.inner.lock().events.view(class)
    }

    /// Number of buffered events of one class.
    pub fn event_count(&self, class: EventClass) -> usize {
        self.inner.lock().events.len(class)
    }

    /// Current value of an attribute.
    pub fn attribute(&self, id: AttrId) -> Option<AttrValue> {
        self.inner.lock().attribute(id).map(|e| e.value.clone())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock()
    }

    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

/// Exclusive access to the database for the duration of a transaction.
pub struct Transaction<'a> {
    store: &'a mut Store,
    clock: &'a dyn Clock,
    events: usize,
}

impl Transaction<'_> {
    /// Configure a new point. The point starts with the type's default value
    /// and the RESTART flag.
    pub fn add(&mut self, point_type: PointType, index: u16, config: PointConfig) -> Result<()> {
        let points = self.store.points.entry(point_type).or_default();
        if points.contains_key(&index) {
            return Err(Dnp3Error::DuplicatePoint(format!("{point_type} {index}")));
        }
        points.insert(index, Point::new(point_type, config));
        Ok(())
    }

    /// Remove a point. Buffered events of the point are kept.
    pub fn remove(&mut self, point_type: PointType, index: u16) -> bool {
        self.store
            .points
            .get_mut(&point_type)
            .is_some_and(|points| points.remove(&index).is_some())
    }

    /// Apply a new sample. The point type is taken from the value.
    ///
    /// The stored value is always replaced. Returns true if an event was
    /// buffered. A measurement without a time is stamped with the clock.
    pub fn update(&mut self, index: u16, measurement: Measurement, options: UpdateOptions) -> Result<bool> {
        let created = self.store.apply(index, measurement, options, self.clock)?;
        if created {
            self.events += 1;
        }
        Ok(created)
    }

    /// Replace only the flags (and optionally the time) of a point.
    pub fn update_flags(
        &mut self,
        point_type: PointType,
        index: u16,
        flags: Flags,
        time: Option<Time>,
        options: UpdateOptions,
    ) -> Result<bool> {
        let current = self
            .store
            .point(point_type, index)
            .map(|p| p.current.clone())
            .ok_or_else(|| Dnp3Error::UnknownPoint(format!("{point_type} {index}")))?;
        let next = Measurement {
            value: current.value,
            flags,
            time,
        };
        self.update(index, next, options)
    }

    /// Copy counters within `range` into the frozen counters with the same
    /// index, optionally clearing the counters. Returns the number frozen.
    pub fn freeze_counters(&mut self, range: IndexRange, clear: bool) -> usize {
        let (counters, _) = self.store.range(PointType::Counter, range);
        let counters: Vec<(u16, Measurement)> = counters
            .into_iter()
            .map(|(i, p)| (i, p.current.clone()))
            .collect();

        let now = self.clock.now();
        let mut frozen = 0;
        for (index, counter) in counters {
            let Value::Counter(count) = counter.value else {
                continue;
            };
            if self.store.point(PointType::FrozenCounter, index).is_some() {
                let snapshot = Measurement::new(Value::FrozenCounter(count))
                    .with_flags(counter.flags)
                    .with_time(now);
                if self.update(index, snapshot, UpdateOptions::detect()).is_ok() {
                    frozen += 1;
                }
            }
            if clear {
                let cleared = Measurement::new(Value::Counter(0))
                    .with_flags(counter.flags)
                    .with_time(now);
                // Counter exists: it was just read from the same store
                self.update(index, cleared, UpdateOptions::detect()).ok();
            }
        }
        frozen
    }

    /// Define a device attribute.
    pub fn define_attribute(&mut self, attribute: Attribute, writable: bool) -> Result<()> {
        if self.store.attributes.contains_key(&attribute.id) {
            return Err(Dnp3Error::invalid_config(format!(
                "attribute {} already defined",
                attribute.id
            )));
        }
        self.store.attributes.insert(
            attribute.id,
            AttrEntry {
                value: attribute.value,
                writable,
            },
        );
        Ok(())
    }

    /// Current value of one point.
    pub fn get(&self, point_type: PointType, index: u16) -> Option<&Measurement> {
        self.store.point(point_type, index).map(|p| &p.current)
    }
}

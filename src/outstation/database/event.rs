//! Bounded per-class event buffer.

use std::collections::VecDeque;

use tracing::warn;

use crate::types::{EventClass, EventClasses, EventVariation, Measurement, PointType};

/// Default capacity of each class queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// What to drop when a class queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest record of the class
    #[default]
    DiscardOldest,
    /// Reject the new record
    DiscardNewest,
}

/// Event buffer sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBufferConfig {
    /// Capacity of the class 1 queue (0 disables class 1 buffering)
    pub max_class_1: usize,
    /// Capacity of the class 2 queue
    pub max_class_2: usize,
    /// Capacity of the class 3 queue
    pub max_class_3: usize,
    /// Overflow policy shared by all classes
    pub overflow: OverflowPolicy,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        Self::all_classes(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBufferConfig {
    /// Same capacity for every class.
    pub fn all_classes(capacity: usize) -> Self {
        Self {
            max_class_1: capacity,
            max_class_2: capacity,
            max_class_3: capacity,
            overflow: OverflowPolicy::default(),
        }
    }

    /// Set the overflow policy.
    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    /// Capacity of one class.
    pub fn capacity(&self, class: EventClass) -> usize {
        match class {
            EventClass::Class1 => self.max_class_1,
            EventClass::Class2 => self.max_class_2,
            EventClass::Class3 => self.max_class_3,
        }
    }
}

/// Immutable snapshot of a point at the time it became an event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Insertion order across all classes
    pub id: u64,
    /// Point type
    pub point_type: PointType,
    /// Point index
    pub index: u16,
    /// Event class
    pub class: EventClass,
    /// Value, flags and time
    pub measurement: Measurement,
    /// Variation configured for the point
    pub variation: EventVariation,
}

/// Which response an event has been written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Owner {
    Solicited,
    Unsolicited,
}

#[derive(Debug, Clone)]
struct Entry {
    record: EventRecord,
    selected: Option<Owner>,
}

/// Event queues with selection and confirmation.
#[derive(Debug)]
pub(crate) struct EventBuffer {
    config: EventBufferConfig,
    queues: [VecDeque<Entry>; 3],
    next_id: u64,
    overflow: bool,
}

impl EventBuffer {
    pub(crate) fn new(config: EventBufferConfig) -> Self {
        Self {
            config,
            queues: Default::default(),
            next_id: 0,
            overflow: false,
        }
    }

    /// Insert a record. Returns false if the record was not buffered.
    pub(crate) fn insert(
        &mut self,
        point_type: PointType,
        index: u16,
        class: EventClass,
        measurement: Measurement,
        variation: EventVariation,
    ) -> bool {
        let capacity = self.config.capacity(class);
        if capacity == 0 {
            return false;
        }

        let queue = &mut self.queues[class.index()];
        if queue.len() >= capacity {
            self.overflow = true;
            match self.config.overflow {
                OverflowPolicy::DiscardOldest => {
                    if let Some(evicted) = queue.pop_front() {
                        warn!(
                            "Event buffer overflow: {:?} dropped {} {}",
                            class, evicted.record.point_type, evicted.record.index
                        );
                    }
                }
                OverflowPolicy::DiscardNewest => {
                    warn!("Event buffer overflow: {:?} rejected {} {}", class, point_type, index);
                    return false;
                }
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        queue.push_back(Entry {
            record: EventRecord {
                id,
                point_type,
                index,
                class,
                measurement,
                variation,
            },
            selected: None,
        });
        true
    }

    /// Records of one class in insertion order, selected or not.
    pub(crate) fn view(&self, class: EventClass) -> Vec<EventRecord> {
        self.queues[class.index()]
            .iter()
            .map(|e| e.record.clone())
            .collect()
    }

    pub(crate) fn len(&self, class: EventClass) -> usize {
        self.queues[class.index()].len()
    }

    pub(crate) fn is_overflown(&self) -> bool {
        self.overflow
    }

    /// Classes holding at least one record not yet written into a response.
    pub(crate) fn unwritten_classes(&self) -> EventClasses {
        let mut classes = EventClasses::NONE;
        for class in EventClass::ALL {
            let any = self.queues[class.index()]
                .iter()
                .any(|e| e.selected.is_none());
            classes.set(class, any);
        }
        classes
    }

    /// Select unwritten records matching `filter`, oldest first across all
    /// classes, and mark them as owned by `owner`. Selection stops at the
    /// first record `accept` refuses.
    pub(crate) fn select<F, A>(&mut self, owner: Owner, filter: F, mut accept: A) -> Vec<EventRecord>
    where
        F: Fn(&EventRecord) -> bool,
        A: FnMut(&EventRecord) -> bool,
    {
        let mut candidates: Vec<(u64, usize, usize)> = Vec::new();
        for (q, queue) in self.queues.iter().enumerate() {
            for (i, entry) in queue.iter().enumerate() {
                if entry.selected.is_none() && filter(&entry.record) {
                    candidates.push((entry.record.id, q, i));
                }
            }
        }
        candidates.sort_unstable_by_key(|(id, _, _)| *id);

        let mut selected = Vec::new();
        for (_, q, i) in candidates {
            let entry = &mut self.queues[q][i];
            if !accept(&entry.record) {
                break;
            }
            entry.selected = Some(owner);
            selected.push(entry.record.clone());
        }
        selected
    }

    /// Remove every record owned by `owner`. Returns the number removed.
    pub(crate) fn confirm(&mut self, owner: Owner) -> usize {
        let mut removed = 0;
        for queue in &mut self.queues {
            let before = queue.len();
            queue.retain(|e| e.selected != Some(owner));
            removed += before - queue.len();
        }
        if removed > 0 {
            self.overflow = false;
        }
        removed
    }

    /// Return records owned by `owner` to the unwritten state.
    pub(crate) fn clear_selection(&mut self, owner: Owner) {
        for entry in self.queues.iter_mut().flatten() {
            if entry.selected == Some(owner) {
                entry.selected = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn insert(buffer: &mut EventBuffer, index: u16, class: EventClass) -> bool {
        buffer.insert(
            PointType::Counter,
            index,
            class,
            Measurement::new(Value::Counter(index as u32)),
            EventVariation::WithoutTime,
        )
    }

    fn indices(records: &[EventRecord]) -> Vec<u16> {
        records.iter().map(|r| r.index).collect()
    }

    #[test]
    fn test_discard_oldest() {
        let mut buffer = EventBuffer::new(EventBufferConfig::all_classes(3));
        for i in 0..4 {
            assert!(insert(&mut buffer, i, EventClass::Class1));
        }
        assert_eq!(buffer.len(EventClass::Class1), 3);
        assert!(buffer.is_overflown());
        assert_eq!(indices(&buffer.view(EventClass::Class1)), vec![1, 2, 3]);
    }

    #[test]
    fn test_discard_newest() {
        let config = EventBufferConfig::all_classes(3).overflow(OverflowPolicy::DiscardNewest);
        let mut buffer = EventBuffer::new(config);
        for i in 0..3 {
            assert!(insert(&mut buffer, i, EventClass::Class2));
        }
        assert!(!insert(&mut buffer, 3, EventClass::Class2));
        assert!(buffer.is_overflown());
        assert_eq!(indices(&buffer.view(EventClass::Class2)), vec![0, 1, 2]);
    }

    #[test]
    fn test_zero_capacity_not_buffered() {
        let mut config = EventBufferConfig::default();
        config.max_class_3 = 0;
        let mut buffer = EventBuffer::new(config);
        assert!(!insert(&mut buffer, 0, EventClass::Class3));
        assert!(!buffer.is_overflown());
    }

    #[test]
    fn test_select_in_insertion_order_across_classes() {
        let mut buffer = EventBuffer::new(EventBufferConfig::default());
        insert(&mut buffer, 0, EventClass::Class2);
        insert(&mut buffer, 1, EventClass::Class1);
        insert(&mut buffer, 2, EventClass::Class2);

        let mut taken = 0;
        let selected = buffer.select(Owner::Solicited, |_| true, |_| {
            taken += 1;
            taken <= 2
        });
        assert_eq!(indices(&selected), vec![0, 1]);
        assert_eq!(buffer.unwritten_classes(), EventClasses::new(false, true, false));

        buffer.clear_selection(Owner::Solicited);
        assert_eq!(buffer.unwritten_classes(), EventClasses::new(true, true, false));
    }

    #[test]
    fn test_confirm_removes_owned_records_and_clears_overflow() {
        let mut buffer = EventBuffer::new(EventBufferConfig::all_classes(2));
        for i in 0..3 {
            insert(&mut buffer, i, EventClass::Class1);
        }
        assert!(buffer.is_overflown());

        buffer.select(Owner::Unsolicited, |r| r.index == 1, |_| true);
        assert_eq!(buffer.confirm(Owner::Solicited), 0);
        assert!(buffer.is_overflown());
        assert_eq!(buffer.confirm(Owner::Unsolicited), 1);
        assert!(!buffer.is_overflown());
        assert_eq!(indices(&buffer.view(EventClass::Class1)), vec![2]);
    }
}

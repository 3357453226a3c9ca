//! Time source used for time synchronization and for stamping local updates.

use std::time::SystemTime;

use parking_lot::Mutex;

use crate::types::{Time, Timestamp};

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    /// Current time. Returns an invalid time if the clock is unavailable.
    fn now(&self) -> Time;
}

/// Clock backed by the system time.
///
/// Reports `Unsynchronized` quality until `set_synchronized(true)` is called.
#[derive(Debug, Default)]
pub struct SystemClock {
    synchronized: Mutex<bool>,
}

impl SystemClock {
    /// Create a clock reporting unsynchronized time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the system time as synchronized to a reference.
    pub fn set_synchronized(&self, synchronized: bool) {
        *self.synchronized.lock() = synchronized;
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Time {
        match Timestamp::try_from_system_time(SystemTime::now()) {
            Some(ts) if *self.synchronized.lock() => Time::synchronized(ts),
            Some(ts) => Time::unsynchronized(ts),
            None => Time::invalid(),
        }
    }
}

/// Clock that returns a fixed, manually advanced time.
#[derive(Debug)]
pub struct FixedClock {
    time: Mutex<Time>,
}

impl FixedClock {
    /// Create a clock stopped at `time`.
    pub fn new(time: Time) -> Self {
        Self {
            time: Mutex::new(time),
        }
    }

    /// Replace the current time.
    pub fn set(&self, time: Time) {
        *self.time.lock() = time;
    }

    /// Advance the timestamp by `millis`.
    pub fn advance(&self, millis: u64) {
        let mut time = self.time.lock();
        time.timestamp = Timestamp::new(time.timestamp.raw().saturating_add(millis));
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Time {
        *self.time.lock()
    }
}

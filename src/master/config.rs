//! Master channel and association configuration.

use std::time::Duration;

use crate::decode::DecodeLevel;
use crate::error::{Dnp3Error, Result};
use crate::retry::RetryStrategy;
use crate::types::{Classes, EventClasses};

/// Default master link address.
pub const DEFAULT_MASTER_ADDRESS: u16 = 1;

/// Default time to wait for a response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time an OPERATE may follow its SELECT.
pub const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default limit of queued user requests per association.
pub const DEFAULT_MAX_QUEUED_USER_REQUESTS: usize = 16;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound on the reconnect delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Time synchronization procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeSyncMode {
    /// RECORD_CURRENT_TIME followed by a write of the last recorded time
    Lan,
    /// DELAY_MEASURE followed by a delay compensated absolute time write
    NonLan,
}

/// Configuration of a master channel.
#[derive(Debug, Clone)]
pub struct MasterChannelConfig {
    /// Link address of the master
    pub master_address: u16,
    /// Reconnect strategy, normally with unlimited attempts
    pub connect_retry: RetryStrategy,
    /// Protocol trace level
    pub decode_level: DecodeLevel,
}

impl Default for MasterChannelConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MASTER_ADDRESS)
    }
}

impl MasterChannelConfig {
    /// Create a configuration with default reconnect timing.
    pub fn new(master_address: u16) -> Self {
        Self {
            master_address,
            connect_retry: RetryStrategy::forever(
                DEFAULT_RECONNECT_DELAY,
                DEFAULT_MAX_RECONNECT_DELAY,
            ),
            decode_level: DecodeLevel::default(),
        }
    }

    /// Set the reconnect strategy.
    pub fn connect_retry(mut self, strategy: RetryStrategy) -> Self {
        self.connect_retry = strategy;
        self
    }

    /// Set the protocol trace level.
    pub fn decode_level(mut self, level: DecodeLevel) -> Self {
        self.decode_level = level;
        self
    }
}

/// Configuration of one association.
#[derive(Debug, Clone)]
pub struct AssociationConfig {
    /// Time to wait for each response fragment
    pub response_timeout: Duration,
    /// Retry strategy of every task
    pub task_retry: RetryStrategy,
    /// Maximum time between a SELECT response and the OPERATE
    pub select_timeout: Duration,
    /// Classes disabled for unsolicited reporting at startup
    pub disable_unsolicited_classes: EventClasses,
    /// Classes read by the startup integrity poll
    pub startup_integrity_classes: Classes,
    /// Classes enabled for unsolicited reporting at startup
    pub enable_unsolicited_classes: EventClasses,
    /// Synchronize time automatically when NEED_TIME is set
    pub auto_time_sync: Option<TimeSyncMode>,
    /// Run an integrity poll when the event buffer overflowed
    pub integrity_on_overflow: bool,
    /// Classes scanned automatically when the outstation reports events
    pub event_scan_on_events_available: EventClasses,
    /// Maximum number of user requests waiting to execute
    pub max_queued_user_requests: usize,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            task_retry: RetryStrategy::default(),
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            disable_unsolicited_classes: EventClasses::ALL,
            startup_integrity_classes: Classes::integrity(),
            enable_unsolicited_classes: EventClasses::ALL,
            auto_time_sync: None,
            integrity_on_overflow: true,
            event_scan_on_events_available: EventClasses::NONE,
            max_queued_user_requests: DEFAULT_MAX_QUEUED_USER_REQUESTS,
        }
    }
}

impl AssociationConfig {
    /// Configuration with no startup requests.
    pub fn quiet() -> Self {
        Self {
            disable_unsolicited_classes: EventClasses::NONE,
            startup_integrity_classes: Classes::new(false, EventClasses::NONE),
            enable_unsolicited_classes: EventClasses::NONE,
            ..Self::default()
        }
    }

    /// Set the response timeout.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the task retry strategy.
    pub fn task_retry(mut self, strategy: RetryStrategy) -> Self {
        self.task_retry = strategy;
        self
    }

    /// Set the select timeout.
    pub fn select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    /// Set the classes disabled at startup.
    pub fn disable_unsolicited_classes(mut self, classes: EventClasses) -> Self {
        self.disable_unsolicited_classes = classes;
        self
    }

    /// Set the classes of the startup integrity poll.
    pub fn startup_integrity_classes(mut self, classes: Classes) -> Self {
        self.startup_integrity_classes = classes;
        self
    }

    /// Set the classes enabled at startup.
    pub fn enable_unsolicited_classes(mut self, classes: EventClasses) -> Self {
        self.enable_unsolicited_classes = classes;
        self
    }

    /// Set the automatic time synchronization mode.
    pub fn auto_time_sync(mut self, mode: Option<TimeSyncMode>) -> Self {
        self.auto_time_sync = mode;
        self
    }

    /// Enable or disable the integrity poll after an event buffer overflow.
    pub fn integrity_on_overflow(mut self, enabled: bool) -> Self {
        self.integrity_on_overflow = enabled;
        self
    }

    /// Set the classes scanned when the outstation reports events.
    pub fn event_scan_on_events_available(mut self, classes: EventClasses) -> Self {
        self.event_scan_on_events_available = classes;
        self
    }

    /// Set the user request queue limit.
    pub fn max_queued_user_requests(mut self, max: usize) -> Self {
        self.max_queued_user_requests = max;
        self
    }

    /// Check the configuration before the association is added.
    pub fn validate(&self) -> Result<()> {
        if self.response_timeout.is_zero() {
            return Err(Dnp3Error::invalid_config("response timeout must be non-zero"));
        }
        if self.max_queued_user_requests == 0 {
            return Err(Dnp3Error::invalid_config(
                "max_queued_user_requests must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_association_defaults_run_full_startup() {
        let config = AssociationConfig::default();
        assert_eq!(config.disable_unsolicited_classes, EventClasses::ALL);
        assert_eq!(config.startup_integrity_classes, Classes::integrity());
        assert!(config.integrity_on_overflow);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_quiet_association_has_no_startup() {
        let config = AssociationConfig::quiet();
        assert!(config.disable_unsolicited_classes.is_empty());
        assert!(config.startup_integrity_classes.is_empty());
        assert!(config.enable_unsolicited_classes.is_empty());
    }

    #[test]
    fn test_association_validation() {
        assert!(AssociationConfig::default()
            .response_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(AssociationConfig::default()
            .max_queued_user_requests(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_channel_retries_forever() {
        let config = MasterChannelConfig::default();
        assert_eq!(config.connect_retry.max_attempts, None);
        assert_eq!(config.connect_retry.initial_delay, DEFAULT_RECONNECT_DELAY);
    }
}

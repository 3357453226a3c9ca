//! Outstation configuration.

use std::time::Duration;

use crate::decode::DecodeLevel;
use crate::error::{Dnp3Error, Result};
use crate::outstation::database::DatabaseConfig;

/// Default outstation link address.
pub const DEFAULT_OUTSTATION_ADDRESS: u16 = 1024;

/// Default master link address.
pub const DEFAULT_MASTER_ADDRESS: u16 = 1;

/// Default time to wait for a solicited confirm.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay after unsolicited retries are exhausted.
pub const DEFAULT_UNSOLICITED_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default time an OPERATE may follow its SELECT.
pub const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do with a new request while waiting for a solicited confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConfirmWaitPolicy {
    /// Stop waiting and process the request. Selected events return to the
    /// buffer and are reported again.
    #[default]
    Abandon,
    /// Keep waiting; the request is processed once the wait ends
    Queue,
}

/// Outstation configuration.
#[derive(Debug, Clone)]
pub struct OutstationConfig {
    /// Link address of this outstation
    pub outstation_address: u16,
    /// Link address of the master
    pub master_address: u16,
    /// Solicited confirm timeout
    pub solicited_confirm_timeout: Duration,
    /// Unsolicited confirm timeout
    pub unsolicited_confirm_timeout: Duration,
    /// Unsolicited retries before backing off, `None` retries forever
    pub max_unsolicited_retries: Option<usize>,
    /// Delay after unsolicited retries are exhausted
    pub unsolicited_retry_delay: Duration,
    /// Maximum time between SELECT and OPERATE
    pub select_timeout: Duration,
    /// Maximum controls accepted in one request, `None` is unlimited
    pub max_controls_per_request: Option<u16>,
    /// Behavior of new requests during a solicited confirm wait
    pub confirm_wait_policy: ConfirmWaitPolicy,
    /// Allow unsolicited reporting once the master enables it
    pub allow_unsolicited: bool,
    /// Protocol trace level
    pub decode_level: DecodeLevel,
    /// Database configuration
    pub database: DatabaseConfig,
}

impl Default for OutstationConfig {
    fn default() -> Self {
        Self::new(DEFAULT_OUTSTATION_ADDRESS, DEFAULT_MASTER_ADDRESS)
    }
}

impl OutstationConfig {
    /// Create a configuration with default timing.
    pub fn new(outstation_address: u16, master_address: u16) -> Self {
        Self {
            outstation_address,
            master_address,
            solicited_confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            unsolicited_confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            max_unsolicited_retries: None,
            unsolicited_retry_delay: DEFAULT_UNSOLICITED_RETRY_DELAY,
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            max_controls_per_request: None,
            confirm_wait_policy: ConfirmWaitPolicy::default(),
            allow_unsolicited: true,
            decode_level: DecodeLevel::default(),
            database: DatabaseConfig::default(),
        }
    }

    /// Set the solicited confirm timeout.
    pub fn solicited_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.solicited_confirm_timeout = timeout;
        self
    }

    /// Set the unsolicited confirm timeout.
    pub fn unsolicited_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.unsolicited_confirm_timeout = timeout;
        self
    }

    /// Set the unsolicited retry limit.
    pub fn max_unsolicited_retries(mut self, retries: Option<usize>) -> Self {
        self.max_unsolicited_retries = retries;
        self
    }

    /// Set the delay after unsolicited retries are exhausted.
    pub fn unsolicited_retry_delay(mut self, delay: Duration) -> Self {
        self.unsolicited_retry_delay = delay;
        self
    }

    /// Set the select timeout.
    pub fn select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    /// Set the maximum number of controls per request.
    pub fn max_controls_per_request(mut self, max: Option<u16>) -> Self {
        self.max_controls_per_request = max;
        self
    }

    /// Set the confirm wait policy.
    pub fn confirm_wait_policy(mut self, policy: ConfirmWaitPolicy) -> Self {
        self.confirm_wait_policy = policy;
        self
    }

    /// Enable or disable unsolicited reporting.
    pub fn allow_unsolicited(mut self, allow: bool) -> Self {
        self.allow_unsolicited = allow;
        self
    }

    /// Set the protocol trace level.
    pub fn decode_level(mut self, level: DecodeLevel) -> Self {
        self.decode_level = level;
        self
    }

    /// Set the database configuration.
    pub fn database(mut self, database: DatabaseConfig) -> Self {
        self.database = database;
        self
    }

    /// Check the configuration before spawning.
    pub fn validate(&self) -> Result<()> {
        if crate::codec::is_broadcast(self.outstation_address) {
            return Err(Dnp3Error::invalid_config(format!(
                "outstation address {} is a broadcast address",
                self.outstation_address
            )));
        }
        if self.outstation_address == self.master_address {
            return Err(Dnp3Error::invalid_config(
                "outstation and master addresses must differ",
            ));
        }
        if self.solicited_confirm_timeout.is_zero() || self.unsolicited_confirm_timeout.is_zero() {
            return Err(Dnp3Error::invalid_config("confirm timeout must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outstation_config_defaults() {
        let config = OutstationConfig::default();
        assert_eq!(config.outstation_address, DEFAULT_OUTSTATION_ADDRESS);
        assert_eq!(config.confirm_wait_policy, ConfirmWaitPolicy::Abandon);
        assert!(config.allow_unsolicited);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_outstation_config_validation() {
        assert!(OutstationConfig::new(0xFFFF, 1).validate().is_err());
        assert!(OutstationConfig::new(10, 10).validate().is_err());
        assert!(OutstationConfig::new(10, 1)
            .solicited_confirm_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}

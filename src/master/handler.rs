//! Callbacks of the master.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::types::{Attribute, Iin, Measurement, PointType};

/// Why a response was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadType {
    /// Integrity poll run at startup or after an overflow
    StartupIntegrity,
    /// Unsolicited response
    Unsolicited,
    /// One-off read requested by the user
    SinglePoll,
    /// Periodic or demanded poll
    PeriodicPoll,
}

/// Describes the object header a batch of values came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderInfo {
    /// Point type of the values
    pub point_type: PointType,
    /// Variation on the wire
    pub variation: u8,
    /// True for event objects
    pub is_event: bool,
}

/// Receives measurements from responses.
///
/// Each response fragment produces one `begin_fragment`, one
/// `handle_points` call per value header and one `end_fragment`.
pub trait ReadHandler: Send {
    /// A fragment is about to be processed.
    fn begin_fragment(&mut self, _read_type: ReadType, _iin: Iin) {}

    /// Values of one object header, in wire order.
    fn handle_points(&mut self, info: HeaderInfo, values: &[(u16, Measurement)]);

    /// A device attribute.
    fn handle_attribute(&mut self, _read_type: ReadType, _attribute: &Attribute) {}

    /// The fragment has been processed.
    fn end_fragment(&mut self, _read_type: ReadType, _iin: Iin) {}
}

/// Read handler that discards everything.
#[derive(Debug, Default)]
pub struct NullReadHandler;

impl ReadHandler for NullReadHandler {
    fn handle_points(&mut self, _info: HeaderInfo, _values: &[(u16, Measurement)]) {}
}

/// Receives state changes.
pub trait Listener<T>: Send {
    /// Called with every new value.
    fn update(&mut self, value: T);
}

impl<T, F> Listener<T> for F
where
    F: FnMut(T) + Send,
{
    fn update(&mut self, value: T) {
        self(value)
    }
}

/// Listener that ignores every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl<T> Listener<T> for NullListener {
    fn update(&mut self, _value: T) {}
}

/// Connection state of a master channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Not trying to connect
    Disabled,
    /// Connect attempt in progress
    Connecting,
    /// Connected
    Connected,
    /// Waiting before the next connect attempt
    WaitRetry,
    /// The channel task stopped
    Shutdown,
}

/// State of one association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// Disabled by the user
    Disabled,
    /// Enabled, waiting for the channel to connect
    WaitingForConnection,
    /// Running the startup requests
    Startup,
    /// Ready for user requests and polls
    Ready,
}

/// Callbacks and time source of one association.
pub struct AssociationHandlers {
    /// Receives measurements and attributes
    pub read: Box<dyn ReadHandler>,
    /// Receives association state changes
    pub listener: Box<dyn Listener<AssociationState>>,
    /// Time source for time synchronization
    pub clock: Arc<dyn Clock>,
}

impl Default for AssociationHandlers {
    fn default() -> Self {
        Self {
            read: Box::new(NullReadHandler),
            listener: Box::new(NullListener),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl AssociationHandlers {
    /// Replace the read handler.
    pub fn read(mut self, handler: impl ReadHandler + 'static) -> Self {
        self.read = Box::new(handler);
        self
    }

    /// Replace the state listener.
    pub fn listener(mut self, listener: impl Listener<AssociationState> + 'static) -> Self {
        self.listener = Box::new(listener);
        self
    }

    /// Replace the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for AssociationHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationHandlers").finish_non_exhaustive()
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "DISABLED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::WaitRetry => write!(f, "WAIT_RETRY"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_closure_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut listener = move |state: ChannelState| sink.lock().push(state);

        listener.update(ChannelState::Connecting);
        listener.update(ChannelState::Connected);
        assert_eq!(
            *seen.lock(),
            vec![ChannelState::Connecting, ChannelState::Connected]
        );
    }

    #[test]
    fn test_channel_state_display() {
        assert_eq!(ChannelState::WaitRetry.to_string(), "WAIT_RETRY");
    }
}

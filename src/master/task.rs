//! Work items executed by an association.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{CommandError, FileError, TaskError, TimeSyncError};
use crate::master::config::TimeSyncMode;
use crate::master::handler::ReadType;
use crate::types::{
    AttrId, Attribute, Classes, CommandHeader, CommandHeaders, CommandMode, EventClass,
    EventClasses, FileInfo, FileMode, IndexRange, ObjectHeader, PointType, StaticVariation,
};

/// Objects requested by a read or poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    headers: Vec<ObjectHeader>,
}

impl ReadRequest {
    /// Event classes followed by class 0, in that order.
    pub fn class_scan(classes: Classes) -> Self {
        let mut headers: Vec<ObjectHeader> = classes
            .events
            .iter()
            .map(|class| ObjectHeader::EventClass { class, count: None })
            .collect();
        if classes.class0 {
            headers.push(ObjectHeader::Class0);
        }
        Self { headers }
    }

    /// Class 1, 2, 3 and 0.
    pub fn integrity() -> Self {
        Self::class_scan(Classes::integrity())
    }

    /// Static values of one type within `start..=stop`.
    pub fn static_range(point_type: PointType, start: u16, stop: u16) -> Self {
        Self::single(ObjectHeader::StaticRange {
            point_type,
            variation: StaticVariation::Any,
            range: IndexRange::Range { start, stop },
        })
    }

    /// Every static value of one type.
    pub fn all_objects(point_type: PointType) -> Self {
        Self::single(ObjectHeader::StaticRange {
            point_type,
            variation: StaticVariation::Any,
            range: IndexRange::All,
        })
    }

    /// One event class, optionally limited to `count` events.
    pub fn event_class(class: EventClass, count: Option<u8>) -> Self {
        Self::single(ObjectHeader::EventClass { class, count })
    }

    /// Arbitrary request headers.
    pub fn from_headers(headers: Vec<ObjectHeader>) -> Self {
        Self { headers }
    }

    /// The request headers.
    pub fn headers(&self) -> &[ObjectHeader] {
        &self.headers
    }

    /// True if nothing would be requested.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn single(header: ObjectHeader) -> Self {
        Self {
            headers: vec![header],
        }
    }
}

/// Kind of counter freeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FreezeType {
    /// IMMEDIATE_FREEZE
    Immediate,
    /// FREEZE_CLEAR
    FreezeAndClear,
}

/// Kind of restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartType {
    /// COLD_RESTART
    Cold,
    /// WARM_RESTART
    Warm,
}

pub(crate) type Reply<T, E> = oneshot::Sender<Result<T, E>>;

/// A request queued by the user.
#[derive(Debug)]
pub(crate) enum UserTask {
    Read {
        request: ReadRequest,
        reply: Reply<(), TaskError>,
    },
    Command {
        mode: CommandMode,
        headers: CommandHeaders,
        reply: Reply<(), CommandError>,
    },
    TimeSync {
        mode: TimeSyncMode,
        reply: Reply<(), TimeSyncError>,
    },
    Restart {
        kind: RestartType,
        reply: Reply<Duration, TaskError>,
    },
    Freeze {
        kind: FreezeType,
        range: IndexRange,
        reply: Reply<(), TaskError>,
    },
    Unsolicited {
        enable: bool,
        classes: EventClasses,
        reply: Reply<(), TaskError>,
    },
    OpenFile {
        name: String,
        mode: FileMode,
        size: u32,
        max_block_size: u16,
        reply: Reply<FileInfo, FileError>,
    },
    ReadFile {
        handle: u32,
        reply: Reply<Bytes, FileError>,
    },
    WriteFile {
        handle: u32,
        data: Bytes,
        block_size: u16,
        reply: Reply<(), FileError>,
    },
    CloseFile {
        handle: u32,
        reply: Reply<(), FileError>,
    },
    ReadAttributes {
        id: AttrId,
        reply: Reply<(), TaskError>,
    },
    WriteAttribute {
        attribute: Attribute,
        reply: Reply<(), TaskError>,
    },
    LinkStatus {
        reply: Reply<(), TaskError>,
    },
}

impl UserTask {
    /// Resolve the task with `err` without running it.
    pub(crate) fn fail(self, err: TaskError) {
        // The caller may have stopped waiting; a closed reply is fine.
        match self {
            Self::Read { reply, .. }
            | Self::Freeze { reply, .. }
            | Self::Unsolicited { reply, .. }
            | Self::ReadAttributes { reply, .. }
            | Self::WriteAttribute { reply, .. }
            | Self::LinkStatus { reply } => {
                let _ = reply.send(Err(err));
            }
            Self::Command { reply, .. } => {
                let _ = reply.send(Err(err.into()));
            }
            Self::TimeSync { reply, .. } => {
                let _ = reply.send(Err(err.into()));
            }
            Self::Restart { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::OpenFile { reply, .. } => {
                let _ = reply.send(Err(err.into()));
            }
            Self::ReadFile { reply, .. } => {
                let _ = reply.send(Err(err.into()));
            }
            Self::WriteFile { reply, .. } | Self::CloseFile { reply, .. } => {
                let _ = reply.send(Err(err.into()));
            }
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Command { .. } => "command",
            Self::TimeSync { .. } => "time sync",
            Self::Restart { .. } => "restart",
            Self::Freeze { .. } => "freeze",
            Self::Unsolicited { .. } => "unsolicited config",
            Self::OpenFile { .. } => "open file",
            Self::ReadFile { .. } => "read file",
            Self::WriteFile { .. } => "write file",
            Self::CloseFile { .. } => "close file",
            Self::ReadAttributes { .. } => "read attributes",
            Self::WriteAttribute { .. } => "write attribute",
            Self::LinkStatus { .. } => "link status",
        }
    }
}

/// Messages from handles to the association task.
#[derive(Debug)]
pub(crate) enum AssociationMessage {
    Task(UserTask),
    AddPoll {
        request: ReadRequest,
        period: Duration,
        reply: oneshot::Sender<u64>,
    },
    DemandPoll(u64),
    RemovePoll(u64),
    Enable,
    Disable,
    Remove,
}

/// A periodic read.
#[derive(Debug)]
pub(crate) struct Poll {
    pub(crate) id: u64,
    pub(crate) request: ReadRequest,
    pub(crate) period: Duration,
    pub(crate) next: Instant,
    pub(crate) demanded: bool,
}

impl Poll {
    /// Schedule the next run after one completed at `now`.
    pub(crate) fn completed(&mut self, now: Instant) {
        if self.next <= now {
            self.next += self.period;
            if self.next <= now {
                self.next = now + self.period;
            }
        }
        self.demanded = false;
    }
}

/// Work the association schedules for itself from response IIN bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AutoTasks {
    pub(crate) clear_restart: bool,
    pub(crate) time_sync: Option<TimeSyncMode>,
    pub(crate) integrity: bool,
    pub(crate) event_scan: EventClasses,
}

/// Next automatic task in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AutoTask {
    ClearRestart,
    TimeSync(TimeSyncMode),
    Integrity,
    EventScan(EventClasses),
}

impl AutoTasks {
    pub(crate) fn next(&self) -> Option<AutoTask> {
        if self.clear_restart {
            Some(AutoTask::ClearRestart)
        } else if let Some(mode) = self.time_sync {
            Some(AutoTask::TimeSync(mode))
        } else if self.integrity {
            Some(AutoTask::Integrity)
        } else if !self.event_scan.is_empty() {
            Some(AutoTask::EventScan(self.event_scan))
        } else {
            None
        }
    }

    pub(crate) fn clear(&mut self, task: AutoTask) {
        match task {
            AutoTask::ClearRestart => self.clear_restart = false,
            AutoTask::TimeSync(_) => self.time_sync = None,
            AutoTask::Integrity => {
                self.integrity = false;
                self.event_scan = EventClasses::NONE;
            }
            AutoTask::EventScan(_) => self.event_scan = EventClasses::NONE,
        }
    }
}

/// Request objects for a command.
pub(crate) fn command_objects(headers: &CommandHeaders) -> Vec<ObjectHeader> {
    headers
        .headers()
        .iter()
        .map(|header| match header {
            CommandHeader::Crob(items) => ObjectHeader::Crob(items.clone()),
            CommandHeader::AnalogOutput(items) => ObjectHeader::AnalogOutput(items.clone()),
        })
        .collect()
}

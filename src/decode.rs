//! Protocol trace output.
//!
//! The decode level only controls what is logged; it never changes what is
//! sent or how received fragments are processed.

use tracing::info;

use crate::types::{ObjectHeader, Request, Response};

/// How much of each fragment to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DecodeLevel {
    /// Log nothing
    #[default]
    Nothing,
    /// Control, function code and IIN
    Header,
    /// Header plus one line per object header
    ObjectHeaders,
    /// Object headers plus every value
    ObjectValues,
}

/// Direction of a logged fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Tx,
    Rx,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tx => f.write_str("TX"),
            Self::Rx => f.write_str("RX"),
        }
    }
}

pub(crate) fn log_request(level: DecodeLevel, direction: Direction, request: &Request) {
    if level == DecodeLevel::Nothing {
        return;
    }
    info!("{direction} {request}");
    log_objects(level, &request.objects);
}

pub(crate) fn log_response(level: DecodeLevel, direction: Direction, response: &Response) {
    if level == DecodeLevel::Nothing {
        return;
    }
    info!("{direction} {response}");
    log_objects(level, &response.objects);
}

fn log_objects(level: DecodeLevel, objects: &[ObjectHeader]) {
    if level < DecodeLevel::ObjectHeaders {
        return;
    }
    for header in objects {
        info!("  {header}");
        if level < DecodeLevel::ObjectValues {
            continue;
        }
        match header {
            ObjectHeader::Static { values, .. } | ObjectHeader::Events { values, .. } => {
                for (index, m) in values {
                    match m.time {
                        Some(time) => info!(
                            "    index: {index} value: {} flags: {} time: {}",
                            m.value, m.flags, time.timestamp
                        ),
                        None => info!("    index: {index} value: {} flags: {}", m.value, m.flags),
                    }
                }
            }
            ObjectHeader::Crob(items) => {
                for item in items {
                    info!(
                        "    index: {} {:?} status: {}",
                        item.index, item.command.op_type, item.status
                    );
                }
            }
            ObjectHeader::AnalogOutput(items) => {
                for item in items {
                    info!(
                        "    index: {} value: {} status: {}",
                        item.index, item.command.value, item.status
                    );
                }
            }
            ObjectHeader::Time(ts) | ObjectHeader::LastRecordedTime(ts) => info!("    {ts}"),
            ObjectHeader::Attribute(attr) => info!("    {}: {}", attr.id, attr.value),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(DecodeLevel::Nothing < DecodeLevel::Header);
        assert!(DecodeLevel::ObjectHeaders < DecodeLevel::ObjectValues);
        assert_eq!(DecodeLevel::default(), DecodeLevel::Nothing);
    }
}

//! # voltage_dnp3
//!
//! DNP3 (IEEE 1815) master and outstation protocol engine for Rust.
//!
//! This crate implements the application layer of DNP3 over a simplified
//! link framing, with both roles built on tokio tasks driven through
//! cloneable handles.
//!
//! ## Features
//!
//! - **Outstation**: Point database with event buffering, solicited and
//!   unsolicited reporting, select-before-operate, time, files, attributes
//! - **Master**: Associations with startup sequencing, periodic polls,
//!   commands, time synchronization and automatic IIN driven tasks
//! - **Transports**: TCP client and server, in-memory pairs for tests
//! - **Type Safe**: Strong typing for function codes, IIN bits, variations
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use voltage_dnp3::master::{spawn_master, AssociationConfig, AssociationHandlers, MasterChannelConfig};
//! use voltage_dnp3::{CommandHeaders, CommandMode, Crob, NullListener, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> voltage_dnp3::Result<()> {
//!     let channel = spawn_master(
//!         MasterChannelConfig::new(1),
//!         TcpTransport::client("192.168.1.100:20000"),
//!         NullListener,
//!     );
//!     let outstation = channel
//!         .add_association(1024, AssociationConfig::default(), AssociationHandlers::default())
//!         .await?;
//!     channel.enable().await?;
//!
//!     // Latch on relay 3 with select-before-operate
//!     let headers = CommandHeaders::new().add_crob(3, Crob::latch_on());
//!     if let Err(e) = outstation.operate(CommandMode::SelectBeforeOperate, headers).await {
//!         eprintln!("Command failed: {}", e);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Protocol Overview
//!
//! Every message is one application fragment carried in one link frame:
//!
//! ```text
//! Link frame:
//! +------+------+-----------+----------+-----------+-----------+---------+
//! | 0x05 | 0x64 | len (u16) | function | dest (u16)| src (u16) | payload |
//! +------+------+-----------+----------+-----------+-----------+---------+
//!
//! Request fragment:  | AC | FC | object headers ...      |
//! Response fragment: | AC | FC | IIN1 | IIN2 | objects ... |
//! ```
//!
//! AC is the application control octet (FIR, FIN, CON, UNS, SEQ) and FC
//! the function code.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod clock;
pub mod codec;
pub mod decode;
pub mod error;
pub mod master;
pub mod outstation;
pub mod parser;
pub mod retry;
pub mod tcp;
pub mod transport;
pub mod types;

// Re-export main types
pub use clock::{Clock, FixedClock, SystemClock};
pub use codec::{LinkCodec, LinkFrame};
pub use decode::DecodeLevel;
pub use error::{CommandError, Dnp3Error, FileError, Result, TaskError, TimeSyncError};
pub use master::{
    spawn_master, AssociationHandle, ChannelState, Listener, MasterChannel, NullListener,
};
pub use outstation::{spawn_outstation, OutstationHandle};
pub use parser::{parse_request, parse_response};
pub use retry::RetryStrategy;
pub use tcp::{TcpServer, TcpTransport};
pub use transport::{MemoryTransport, Transport};
pub use types::*;

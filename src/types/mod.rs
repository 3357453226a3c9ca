//! DNP3 type definitions.
//!
//! This module contains the core types shared by the master and outstation:
//!
//! - `Control`, `Sequence`, `Iin` - Application header fields
//! - `FunctionCode` - Application function codes
//! - `Measurement`, `Value`, `Flags` - Point values
//! - `ObjectHeader` - Object headers and their encoding
//! - `Request`, `Response` - Application fragments
//! - `Crob`, `CommandStatus` - Control objects
//! - `FileOpen`, `FileTransport` - File transfer objects
//! - `Attribute` - Device attributes

mod attribute;
mod control;
mod data;
mod file;
mod fragment;
mod function;
mod header;
mod object;

pub use attribute::*;
pub use control::*;
pub use data::*;
pub use file::*;
pub use fragment::*;
pub use function::*;
pub use header::*;
pub use object::*;

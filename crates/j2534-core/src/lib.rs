//! j2534-core - Core types and status codes for J2534 passthrough channels
//!
//! This crate provides the value types shared by the connection layer and
//! any host-facing surface built on top of it: frame records, protocol and
//! parameter identifiers, and the error taxonomy with its numeric status
//! mapping.

pub mod error;
pub mod frame;
pub mod ids;
pub mod protocol;

pub use error::{status_of, PassThruError, PassThruResult, TransmitError};
pub use frame::{ConnectFlags, Frame, RxStatus, TxFlags};
pub use protocol::ProtocolId;

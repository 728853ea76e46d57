//! Transport device layer
//!
//! This module provides the device side of a connection:
//! - The [`TransportDevice`] contract connections call into
//! - [`SharedDevice`], a device multiplexing channels over one bus port
//! - [`BusPort`] and the in-memory [`VirtualBus`]
//! - [`MockDevice`] for testing connections in isolation

mod adapter;
pub mod bus;
pub mod error;
pub mod mock;
mod shared;

pub use adapter::{ChannelId, Direction, TransportDevice};
pub use bus::{BusFrame, BusPort, VirtualBus};
pub use error::DeviceError;
pub use mock::{DeviceCall, MockDevice};
pub use shared::SharedDevice;

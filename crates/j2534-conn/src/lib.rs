//! j2534-conn - Connection management for a J2534 passthrough adapter
//!
//! This crate multiplexes one CAN-capable transport across several logical
//! channels. Each channel buffers, filters and schedules its own traffic; the
//! shared device arbitrates between channels.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Connection                           │
//! │  receive / transmit / filters / periodic / config           │
//! │                                                             │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌──────────┐  │
//! │  │ RxBuffer  │  │ TxBuffer  │  │ Periodic  │  │ Filter   │  │
//! │  │ (frames)  │  │ (actions) │  │ Scheduler │  │ Chain    │  │
//! │  └─────▲─────┘  └─────┬─────┘  └─────┬─────┘  └──────────┘  │
//! │        │              │              │                      │
//! └────────┼──────────────┼──────────────┼──────────────────────┘
//!          │ deliver      │ register     │ schedule
//!          │        ┌─────┴──────────────┴─────┐
//!          └────────┤     TransportDevice      │  (weak link)
//!                   │  SharedDevice / Mock     │
//!                   └────────────┬─────────────┘
//!                                │
//!                        ┌───────┴───────┐
//!                        │    BusPort    │
//!                        │ (VirtualBus)  │
//!                        └───────────────┘
//! ```

pub mod action;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod connection;
pub mod device;
pub mod filter;
pub mod ioctl;
pub mod periodic;

pub use action::{PeriodicMessage, SharedAction, TransmitAction};
pub use codec::{codec_for, CanCodec, Iso15765Codec, ProtocolCodec, UnsupportedCodec};
pub use config::{ChannelConfig, ConfigError, ConnectionOptions, FilterConfig, PeriodicConfig};
pub use connection::Connection;
pub use device::{
    BusFrame, BusPort, ChannelId, DeviceCall, DeviceError, Direction, MockDevice, SharedDevice,
    TransportDevice, VirtualBus,
};
pub use filter::{FilterChain, FilterKind, FilterResult, MessageFilter, FILTER_SLOTS};
pub use ioctl::{Ioctl, IoctlOutput, LinkSettings, SConfig};
pub use periodic::{PeriodicScheduler, MAX_INTERVAL_MS, MIN_INTERVAL_MS, PERIODIC_SLOTS};

// Re-export for convenience
pub use j2534_core::{
    status_of, ConnectFlags, Frame, PassThruError, PassThruResult, ProtocolId, RxStatus,
    TransmitError, TxFlags,
};

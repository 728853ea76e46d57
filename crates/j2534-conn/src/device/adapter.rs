//! Transport device contract

use std::fmt;
use std::sync::Arc;

use crate::action::PeriodicMessage;
use crate::connection::Connection;

/// Identifier of an open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Buffer direction for hardware-level discards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

/// The shared transport device as seen by a connection
///
/// One device is shared by every channel opened on it. Connections hold only a
/// weak reference; each call here is a hint the device may act on later, and
/// none of them block.
pub trait TransportDevice: Send + Sync {
    /// The connection has outbound work queued.
    ///
    /// Registering a connection that is already pending has no further effect.
    fn register_pending_write(&self, connection: &Arc<Connection>);

    /// Reconsider a connection whose outbound work stalled earlier
    fn release_stalled_write(&self, channel: ChannelId);

    /// Drop any frames buffered in hardware for this direction
    fn discard_buffer(&self, direction: Direction);

    /// Install a periodic message into the device's timing loop
    fn schedule_recurring(&self, message: Arc<PeriodicMessage>);

    /// Remove a periodic message from the device's timing loop
    fn cancel_recurring(&self, message: &Arc<PeriodicMessage>);
}

//! Transmit actions and the periodic wrapper
//!
//! A transmit action is the protocol-encoded form of one outbound message.
//! The connection's TX buffer (or a periodic slot) and the device's task list
//! share ownership of it through an `Arc`; cancelling flags it so whichever
//! holder sees it next drops it instead of executing it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use j2534_core::Frame;
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::device::{BusPort, ChannelId, DeviceError};

/// Protocol-encoded unit of outbound work
pub trait TransmitAction: Send + Sync + fmt::Debug {
    /// Put the message on the bus
    ///
    /// Returns the frame as it was transmitted, used for loopback echoes.
    fn execute(&self, port: &dyn BusPort) -> Result<Frame, DeviceError>;

    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

pub type SharedAction = Arc<dyn TransmitAction>;

/// A transmit action re-fired on a fixed interval until cancelled
pub struct PeriodicMessage {
    channel: ChannelId,
    slot: u32,
    interval: Duration,
    action: SharedAction,
    origin: Weak<Connection>,
    next_due: Mutex<Instant>,
    cancelled: AtomicBool,
    fired: AtomicU64,
}

impl PeriodicMessage {
    /// Create a disarmed periodic message; the first firing is one interval out
    pub fn new(
        channel: ChannelId,
        slot: u32,
        interval: Duration,
        action: SharedAction,
        origin: Weak<Connection>,
    ) -> Self {
        Self {
            channel,
            slot,
            interval,
            action,
            origin,
            next_due: Mutex::new(Instant::now() + interval),
            cancelled: AtomicBool::new(false),
            fired: AtomicU64::new(0),
        }
    }

    /// Arm for a firing as soon as the device looks at it
    pub fn schedule_immediate(&self) {
        *self.next_due.lock() = Instant::now();
    }

    pub fn is_due(&self, now: Instant) -> bool {
        !self.is_cancelled() && *self.next_due.lock() <= now
    }

    pub fn next_due(&self) -> Instant {
        *self.next_due.lock()
    }

    /// Execute once and re-arm for the next interval
    ///
    /// Re-arming keeps the established cadence unless the device fell behind by a
    /// whole interval, in which case the schedule restarts from `now`.
    pub fn fire(&self, port: &dyn BusPort, now: Instant) -> Result<Frame, DeviceError> {
        if self.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }

        {
            let mut due = self.next_due.lock();
            let next = *due + self.interval;
            *due = if next <= now { now + self.interval } else { next };
        }

        let result = self.action.execute(port);
        if result.is_ok() {
            self.fired.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Stop all future firings
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.action.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Slot index on the owning connection (the host's message id)
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn action(&self) -> &SharedAction {
        &self.action
    }

    pub fn origin(&self) -> &Weak<Connection> {
        &self.origin
    }

    /// Number of successful firings so far
    pub fn fire_count(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for PeriodicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicMessage")
            .field("channel", &self.channel)
            .field("slot", &self.slot)
            .field("interval", &self.interval)
            .field("cancelled", &self.is_cancelled())
            .field("fired", &self.fire_count())
            .finish()
    }
}

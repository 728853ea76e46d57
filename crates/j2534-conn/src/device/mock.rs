//! Mock transport device for testing
//!
//! Records every call a connection makes and keeps just enough state
//! (pending writers, recurring messages) for tests to drive a connection by
//! hand.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{ChannelId, Direction, TransportDevice};
use crate::action::{PeriodicMessage, SharedAction};
use crate::connection::Connection;

/// One call received by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCall {
    RegisterPendingWrite(ChannelId),
    ReleaseStalledWrite(ChannelId),
    DiscardBuffer(Direction),
    ScheduleRecurring { channel: ChannelId, slot: u32 },
    CancelRecurring { channel: ChannelId, slot: u32 },
}

#[derive(Default)]
pub struct MockDevice {
    calls: Mutex<Vec<DeviceCall>>,
    /// Connections with outbound work, each at most once
    pending: Mutex<Vec<Arc<Connection>>>,
    recurring: Mutex<Vec<Arc<PeriodicMessage>>>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Weak handle to pass to `Connection::open`
    pub fn as_weak(self: &Arc<Self>) -> Weak<dyn TransportDevice> {
        let device: Arc<dyn TransportDevice> = self.clone();
        Arc::downgrade(&device)
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn pending_writers(&self) -> Vec<ChannelId> {
        self.pending.lock().iter().map(|c| c.id()).collect()
    }

    pub fn discard_count(&self, direction: Direction) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| **call == DeviceCall::DiscardBuffer(direction))
            .count()
    }

    /// Recurring messages still live on the device
    pub fn recurring(&self) -> Vec<Arc<PeriodicMessage>> {
        self.recurring
            .lock()
            .iter()
            .filter(|m| !m.is_cancelled())
            .cloned()
            .collect()
    }

    /// Take every queued action from the pending writers, in FIFO order per
    /// connection, and forget the registrations
    pub fn drain_pending(&self) -> Vec<SharedAction> {
        let writers: Vec<_> = self.pending.lock().drain(..).collect();
        let mut actions = Vec::new();
        for connection in writers {
            while let Some(action) = connection.take_tx() {
                actions.push(action);
            }
        }
        actions
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().push(call);
    }
}

impl TransportDevice for MockDevice {
    fn register_pending_write(&self, connection: &Arc<Connection>) {
        self.record(DeviceCall::RegisterPendingWrite(connection.id()));
        let mut pending = self.pending.lock();
        if !pending.iter().any(|c| c.id() == connection.id()) {
            pending.push(connection.clone());
        }
    }

    fn release_stalled_write(&self, channel: ChannelId) {
        self.record(DeviceCall::ReleaseStalledWrite(channel));
    }

    fn discard_buffer(&self, direction: Direction) {
        self.record(DeviceCall::DiscardBuffer(direction));
    }

    fn schedule_recurring(&self, message: Arc<PeriodicMessage>) {
        self.record(DeviceCall::ScheduleRecurring {
            channel: message.channel(),
            slot: message.slot(),
        });
        self.recurring.lock().push(message);
    }

    fn cancel_recurring(&self, message: &Arc<PeriodicMessage>) {
        self.record(DeviceCall::CancelRecurring {
            channel: message.channel(),
            slot: message.slot(),
        });
        self.recurring.lock().retain(|m| !Arc::ptr_eq(m, message));
    }
}

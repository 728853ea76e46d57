//! Physical bus boundary and an in-memory bus for simulation and tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{DeviceError, Direction};

/// One raw CAN frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    /// Arbitration id (11 or 29 bit)
    pub id: u32,
    /// Whether `id` is a 29-bit extended identifier
    pub extended: bool,
    /// Up to 8 data bytes
    pub data: Bytes,
}

impl BusFrame {
    pub fn standard(id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            id: id & 0x7FF,
            extended: false,
            data: data.into(),
        }
    }

    pub fn extended(id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            id: id & 0x1FFF_FFFF,
            extended: true,
            data: data.into(),
        }
    }
}

/// Low-level send/receive access to the physical transport
pub trait BusPort: Send + Sync {
    /// Put one frame on the bus
    ///
    /// `DeviceError::Busy` means the frame was not sent and should be retried
    /// once the port has room again.
    fn send(&self, frame: &BusFrame) -> Result<(), DeviceError>;

    /// Discard frames buffered in hardware for one direction
    fn clear(&self, direction: Direction);

    /// Subscribe to frames received from the bus
    fn subscribe(&self) -> broadcast::Receiver<BusFrame>;
}

/// In-memory CAN bus
///
/// Frames sent by the device are published to observers; frames injected by
/// simulated nodes are published to the device.
pub struct VirtualBus {
    outbound_tx: broadcast::Sender<BusFrame>,
    inbound_tx: broadcast::Sender<BusFrame>,
    busy: AtomicBool,
    sent: AtomicU64,
    clears: Mutex<HashMap<Direction, u64>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        let (outbound_tx, _) = broadcast::channel(1024);
        let (inbound_tx, _) = broadcast::channel(1024);
        Self {
            outbound_tx,
            inbound_tx,
            busy: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            clears: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate another node putting a frame on the bus
    pub fn inject(&self, frame: BusFrame) {
        tracing::trace!(id = format!("0x{:X}", frame.id), data = %hex::encode(&frame.data), "Virtual bus: frame injected");
        let _ = self.inbound_tx.send(frame);
    }

    /// Observe frames the device puts on the bus
    pub fn observe(&self) -> broadcast::Receiver<BusFrame> {
        self.outbound_tx.subscribe()
    }

    /// While busy, every send fails with `DeviceError::Busy`
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Number of frames successfully sent
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Number of hardware discards requested for a direction
    pub fn clear_count(&self, direction: Direction) -> u64 {
        self.clears.lock().get(&direction).copied().unwrap_or(0)
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusPort for VirtualBus {
    fn send(&self, frame: &BusFrame) -> Result<(), DeviceError> {
        if self.busy.load(Ordering::SeqCst) {
            return Err(DeviceError::Busy);
        }

        self.sent.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(id = format!("0x{:X}", frame.id), data = %hex::encode(&frame.data), "Virtual bus: frame sent");
        // No observers is fine
        let _ = self.outbound_tx.send(frame.clone());
        Ok(())
    }

    fn clear(&self, direction: Direction) {
        *self.clears.lock().entry(direction).or_insert(0) += 1;
    }

    fn subscribe(&self) -> broadcast::Receiver<BusFrame> {
        self.inbound_tx.subscribe()
    }
}

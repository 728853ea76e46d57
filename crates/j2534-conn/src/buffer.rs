//! Per-connection RX/TX queues
//!
//! Each queue has its own lock so a reader polling the RX side never holds up
//! a writer staging TX work, and the other way round.

use std::collections::VecDeque;
use std::sync::Arc;

use j2534_core::{Frame, ProtocolId};
use parking_lot::Mutex;

use crate::action::SharedAction;

/// Inbound frames in arrival order
#[derive(Debug, Default)]
pub struct RxBuffer {
    frames: Mutex<VecDeque<Frame>>,
}

impl RxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Frame) {
        self.frames.lock().push_back(frame);
    }

    /// Move up to `max` frames into `out`, re-stamped with `protocol`
    ///
    /// Returns how many frames were moved.
    pub fn pop_into(&self, out: &mut Vec<Frame>, max: usize, protocol: ProtocolId) -> usize {
        let mut frames = self.frames.lock();
        let count = max.min(frames.len());
        out.extend(frames.drain(..count).map(|f| f.restamped(protocol)));
        count
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Drop every queued frame, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut frames = self.frames.lock();
        let dropped = frames.len();
        frames.clear();
        dropped
    }
}

/// Outbound actions waiting for the device
///
/// The action most recently handed to the device is remembered until it is
/// restaged or the next one is taken, so a clear can cancel work that is
/// already on its way to the bus.
#[derive(Debug, Default)]
pub struct TxBuffer {
    inner: Mutex<TxQueue>,
}

#[derive(Debug, Default)]
struct TxQueue {
    actions: VecDeque<SharedAction>,
    in_flight: Option<SharedAction>,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an action, returning the new queue depth
    pub fn push(&self, action: SharedAction) -> usize {
        let mut inner = self.inner.lock();
        inner.actions.push_back(action);
        inner.actions.len()
    }

    pub fn pop(&self) -> Option<SharedAction> {
        let mut inner = self.inner.lock();
        let action = inner.actions.pop_front();
        inner.in_flight = action.clone();
        action
    }

    /// Put an action the device could not send back at the head of the queue
    ///
    /// Returns `false`, leaving the queue untouched, when the buffer was
    /// cleared after the action was taken.
    pub fn restage(&self, action: SharedAction) -> bool {
        let mut inner = self.inner.lock();
        let current = inner
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| Arc::ptr_eq(in_flight, &action));
        if !current || action.is_cancelled() {
            return false;
        }
        inner.in_flight = None;
        inner.actions.push_front(action);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().actions.is_empty()
    }

    /// Remove every queued action
    ///
    /// The in-flight action is cancelled here. The drained actions are
    /// returned so the caller can cancel them after the lock is released.
    pub fn clear(&self) -> Vec<SharedAction> {
        let mut inner = self.inner.lock();
        if let Some(in_flight) = inner.in_flight.take() {
            in_flight.cancel();
        }
        inner.actions.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CanCodec, ProtocolCodec};
    use j2534_core::ConnectFlags;
    use pretty_assertions::assert_eq;

    fn frame(n: u8) -> Frame {
        Frame::can(ProtocolId::CAN, 0x7E8, &[n])
    }

    #[test]
    fn test_rx_fifo_order_and_partial_pop() {
        let rx = RxBuffer::new();
        for n in 0..5 {
            rx.push(frame(n));
        }

        let mut out = Vec::new();
        assert_eq!(rx.pop_into(&mut out, 3, ProtocolId::CAN), 3);
        assert_eq!(rx.len(), 2);

        let payloads: Vec<u8> = out.iter().map(|f| f.can_payload()[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2]);

        assert_eq!(rx.pop_into(&mut out, 10, ProtocolId::CAN), 2);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_rx_pop_restamps_protocol() {
        let rx = RxBuffer::new();
        rx.push(Frame::new(ProtocolId(0x99), vec![0, 0, 0, 1]));

        let mut out = Vec::new();
        rx.pop_into(&mut out, 1, ProtocolId::CAN);
        assert_eq!(out[0].protocol(), ProtocolId::CAN);
    }

    #[test]
    fn test_rx_clear_reports_dropped() {
        let rx = RxBuffer::new();
        rx.push(frame(1));
        rx.push(frame(2));

        assert_eq!(rx.clear(), 2);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_tx_restage_goes_to_front() {
        let codec = CanCodec::new(ConnectFlags::empty());
        let tx = TxBuffer::new();
        let first = codec.encode_transmit(&frame(1)).unwrap();
        let second = codec.encode_transmit(&frame(2)).unwrap();

        assert_eq!(tx.push(first.clone()), 1);
        assert_eq!(tx.push(second), 2);

        let popped = tx.pop().unwrap();
        assert!(tx.restage(popped));

        let head = tx.pop().unwrap();
        assert!(Arc::ptr_eq(&head, &first));
        assert_eq!(tx.clear().len(), 1);
        assert!(tx.is_empty());
    }

    #[test]
    fn test_clear_cancels_in_flight_action() {
        let codec = CanCodec::new(ConnectFlags::empty());
        let tx = TxBuffer::new();
        tx.push(codec.encode_transmit(&frame(1)).unwrap());
        tx.push(codec.encode_transmit(&frame(2)).unwrap());

        let in_flight = tx.pop().unwrap();
        let dropped = tx.clear();

        assert_eq!(dropped.len(), 1);
        assert!(in_flight.is_cancelled());
        assert!(!tx.restage(in_flight));
        assert!(tx.is_empty());
    }

    #[test]
    fn test_restage_only_accepts_the_last_taken_action() {
        let codec = CanCodec::new(ConnectFlags::empty());
        let tx = TxBuffer::new();
        let stranger = codec.encode_transmit(&frame(9)).unwrap();
        tx.push(codec.encode_transmit(&frame(1)).unwrap());

        assert!(!tx.restage(stranger));
        let taken = tx.pop().unwrap();
        assert!(tx.restage(taken.clone()));
        // Already back in the queue
        assert!(!tx.restage(taken));
        assert_eq!(tx.len(), 1);
    }
}

//! Periodic message slots

use std::sync::Arc;
use std::time::Duration;

use j2534_core::{PassThruError, PassThruResult};
use parking_lot::Mutex;

use crate::action::PeriodicMessage;

/// Number of periodic slots per connection
pub const PERIODIC_SLOTS: usize = 10;

/// Shortest accepted repeat interval
pub const MIN_INTERVAL_MS: u32 = 5;

/// Longest accepted repeat interval
pub const MAX_INTERVAL_MS: u32 = 65535;

pub fn validate_interval(interval_ms: u32) -> PassThruResult<Duration> {
    if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
        return Err(PassThruError::InvalidTimeInterval(interval_ms));
    }
    Ok(Duration::from_millis(u64::from(interval_ms)))
}

/// The connection's table of active periodic messages
///
/// A slot index doubles as the message id handed back to the host.
#[derive(Debug)]
pub struct PeriodicScheduler {
    slots: Mutex<[Option<Arc<PeriodicMessage>>; PERIODIC_SLOTS]>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    /// Claim the first free slot and fill it with the message `build` makes
    ///
    /// `build` runs under the slot lock, so two concurrent installs can never
    /// end up in the same slot. If it fails, the slot stays free.
    pub fn install<F>(&self, build: F) -> PassThruResult<Arc<PeriodicMessage>>
    where
        F: FnOnce(u32) -> PassThruResult<Arc<PeriodicMessage>>,
    {
        let mut slots = self.slots.lock();
        let free = slots
            .iter()
            .position(Option::is_none)
            .ok_or(PassThruError::LimitExceeded {
                resource: "periodic messages",
                limit: PERIODIC_SLOTS,
            })?;

        let message = build(free as u32)?;
        slots[free] = Some(message.clone());
        Ok(message)
    }

    /// Vacate a slot, cancelling its message
    pub fn remove(&self, id: u32) -> PassThruResult<Arc<PeriodicMessage>> {
        let message = self
            .slots
            .lock()
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(PassThruError::InvalidMessageId(id))?;

        message.cancel();
        Ok(message)
    }

    /// Vacate every slot, returning the cancelled messages
    pub fn clear(&self) -> Vec<Arc<PeriodicMessage>> {
        let drained: Vec<_> = self
            .slots
            .lock()
            .iter_mut()
            .filter_map(Option::take)
            .collect();

        for message in &drained {
            message.cancel();
        }
        drained
    }

    pub fn get(&self, id: u32) -> Option<Arc<PeriodicMessage>> {
        self.slots.lock().get(id as usize).cloned().flatten()
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }
}

impl Default for PeriodicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::SharedAction;
    use crate::codec::{CanCodec, ProtocolCodec};
    use crate::device::ChannelId;
    use j2534_core::{ConnectFlags, Frame, ProtocolId};
    use rstest::rstest;
    use std::sync::Weak;

    fn builder(slot: u32) -> PassThruResult<Arc<PeriodicMessage>> {
        let frame = Frame::can(ProtocolId::CAN, 0x7DF, &[0x02, 0x3E, 0x80]);
        let action: SharedAction = CanCodec::new(ConnectFlags::empty())
            .encode_transmit(&frame)
            .unwrap();
        Ok(Arc::new(PeriodicMessage::new(
            ChannelId(1),
            slot,
            Duration::from_millis(100),
            action,
            Weak::new(),
        )))
    }

    #[rstest]
    #[case(4, false)]
    #[case(5, true)]
    #[case(65535, true)]
    #[case(65536, false)]
    #[case(0, false)]
    fn test_interval_bounds(#[case] interval_ms: u32, #[case] valid: bool) {
        let result = validate_interval(interval_ms);
        assert_eq!(result.is_ok(), valid);
        if !valid {
            assert_eq!(result, Err(PassThruError::InvalidTimeInterval(interval_ms)));
        }
    }

    #[test]
    fn test_slots_fill_in_order_then_exhaust() {
        let scheduler = PeriodicScheduler::new();
        for expected in 0..PERIODIC_SLOTS as u32 {
            assert_eq!(scheduler.install(builder).unwrap().slot(), expected);
        }

        let err = scheduler.install(builder).unwrap_err();
        assert!(matches!(err, PassThruError::LimitExceeded { limit: PERIODIC_SLOTS, .. }));
    }

    #[test]
    fn test_remove_frees_slot_for_reuse() {
        let scheduler = PeriodicScheduler::new();
        for _ in 0..PERIODIC_SLOTS {
            scheduler.install(builder).unwrap();
        }

        let removed = scheduler.remove(3).unwrap();
        assert!(removed.is_cancelled());
        assert_eq!(scheduler.active_count(), PERIODIC_SLOTS - 1);
        assert_eq!(scheduler.install(builder).unwrap().slot(), 3);
    }

    #[test]
    fn test_remove_unknown_id() {
        let scheduler = PeriodicScheduler::new();
        assert!(matches!(scheduler.remove(0), Err(PassThruError::InvalidMessageId(0))));
        assert!(matches!(scheduler.remove(42), Err(PassThruError::InvalidMessageId(42))));
    }

    #[test]
    fn test_failed_build_leaves_slot_free() {
        let scheduler = PeriodicScheduler::new();
        let err = scheduler
            .install(|_| Err(PassThruError::NotSupported("no encoder".to_string())))
            .unwrap_err();

        assert!(matches!(err, PassThruError::NotSupported(_)));
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.install(builder).unwrap().slot(), 0);
    }

    #[test]
    fn test_clear_cancels_everything() {
        let scheduler = PeriodicScheduler::new();
        scheduler.install(builder).unwrap();
        scheduler.install(builder).unwrap();

        let cleared = scheduler.clear();
        assert_eq!(cleared.len(), 2);
        assert!(cleared.iter().all(|m| m.is_cancelled()));
        assert_eq!(scheduler.active_count(), 0);
        assert!(scheduler.get(0).is_none());
    }
}

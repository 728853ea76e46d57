//! Inbound message filters
//!
//! A frame reaches the RX buffer only when the chain admits it:
//!
//! - any active filter reporting `Block` drops the frame, no matter what the
//!   other filters say;
//! - otherwise any filter reporting `Pass` admits it;
//! - otherwise (every filter neutral, or no filters at all) it is dropped.

use bytes::Bytes;
use j2534_core::ids::filter_type;
use j2534_core::{Frame, PassThruError, PassThruResult, ProtocolId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Number of filter slots per connection
pub const FILTER_SLOTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Pass,
    Block,
    /// ISO 15765 filter that also carries the flow-control response frame
    FlowControl,
}

impl FilterKind {
    pub fn from_raw(raw: u32) -> PassThruResult<Self> {
        match raw {
            filter_type::PASS_FILTER => Ok(Self::Pass),
            filter_type::BLOCK_FILTER => Ok(Self::Block),
            filter_type::FLOW_CONTROL_FILTER => Ok(Self::FlowControl),
            other => Err(PassThruError::InvalidMessage(format!(
                "unknown filter type 0x{:X}",
                other
            ))),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Pass => filter_type::PASS_FILTER,
            Self::Block => filter_type::BLOCK_FILTER,
            Self::FlowControl => filter_type::FLOW_CONTROL_FILTER,
        }
    }
}

/// Verdict of a single filter, or of the whole chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Block,
    Pass,
    /// The filter's mask/pattern did not match; it abstains
    Neutral,
}

/// Channel properties a filter is validated against
#[derive(Debug, Clone, Copy)]
pub struct FilterScope {
    pub protocol: ProtocolId,
    pub max_len: usize,
}

/// One mask/pattern rule
///
/// Equality is semantic: two filters are equal when kind, mask, masked pattern
/// and flow-control payload all match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilter {
    kind: FilterKind,
    mask: Bytes,
    /// Stored pre-masked (`pattern & mask`)
    pattern: Bytes,
    flow_control: Option<Bytes>,
}

impl MessageFilter {
    pub fn new(
        kind: FilterKind,
        mask: &Frame,
        pattern: &Frame,
        flow_control: Option<&Frame>,
        scope: FilterScope,
    ) -> PassThruResult<Self> {
        match kind {
            FilterKind::Pass | FilterKind::Block => {
                if flow_control.is_some() {
                    return Err(PassThruError::InvalidMessage(
                        "flow control frame given for a pass/block filter".to_string(),
                    ));
                }
            }
            FilterKind::FlowControl => {
                if scope.protocol != ProtocolId::ISO15765 {
                    return Err(PassThruError::InvalidFilterId(format!(
                        "flow control filters need an ISO15765 channel, not {}",
                        scope.protocol
                    )));
                }
                let fc = flow_control.ok_or(PassThruError::NullParameter("flow control frame"))?;
                if !matches!(mask.len(), 4 | 5) || fc.len() != mask.len() {
                    return Err(PassThruError::InvalidMessage(format!(
                        "flow control filter frames must be 4 or 5 bytes (mask {}, flow control {})",
                        mask.len(),
                        fc.len()
                    )));
                }
            }
        }

        if mask.len() != pattern.len() {
            return Err(PassThruError::InvalidMessage(format!(
                "mask length {} differs from pattern length {}",
                mask.len(),
                pattern.len()
            )));
        }
        if mask.is_empty() || mask.len() > scope.max_len {
            return Err(PassThruError::InvalidMessage(format!(
                "filter length {} outside 1..={}",
                mask.len(),
                scope.max_len
            )));
        }

        for frame in [Some(mask), Some(pattern), flow_control].into_iter().flatten() {
            if frame.protocol() != scope.protocol {
                return Err(PassThruError::ProtocolMismatch {
                    expected: scope.protocol,
                    found: frame.protocol(),
                });
            }
        }

        let masked: Vec<u8> = mask
            .data()
            .iter()
            .zip(pattern.data().iter())
            .map(|(m, p)| m & p)
            .collect();

        Ok(Self {
            kind,
            mask: mask.data().clone(),
            pattern: Bytes::from(masked),
            flow_control: flow_control.map(|f| f.data().clone()),
        })
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn flow_control(&self) -> Option<&Bytes> {
        self.flow_control.as_ref()
    }

    /// Whether the frame's leading bytes match the pattern under the mask
    pub fn matches(&self, frame: &Frame) -> bool {
        let data = frame.data();
        data.len() >= self.mask.len()
            && self
                .mask
                .iter()
                .zip(self.pattern.iter())
                .zip(data.iter())
                .all(|((m, p), d)| m & d == *p)
    }

    pub fn check(&self, frame: &Frame) -> FilterResult {
        match (self.matches(frame), self.kind) {
            (false, _) => FilterResult::Neutral,
            (true, FilterKind::Block) => FilterResult::Block,
            (true, FilterKind::Pass | FilterKind::FlowControl) => FilterResult::Pass,
        }
    }
}

/// Fixed-capacity set of filters on one connection
#[derive(Debug)]
pub struct FilterChain {
    slots: RwLock<[Option<MessageFilter>; FILTER_SLOTS]>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    /// Install a filter in the first free slot, returning the slot index
    ///
    /// Scan and install happen under one write lock, so concurrent callers
    /// never claim the same slot.
    pub fn add(&self, filter: MessageFilter) -> PassThruResult<u32> {
        let mut slots = self.slots.write();

        let free = slots
            .iter()
            .position(Option::is_none)
            .ok_or(PassThruError::LimitExceeded {
                resource: "filters",
                limit: FILTER_SLOTS,
            })?;

        if slots.iter().flatten().any(|existing| *existing == filter) {
            debug!(kind = ?filter.kind, "Rejected duplicate filter");
            return Err(PassThruError::NotUnique);
        }

        debug!(slot = free, kind = ?filter.kind, mask = %hex::encode(&filter.mask), "Filter installed");
        slots[free] = Some(filter);
        Ok(free as u32)
    }

    pub fn remove(&self, id: u32) -> PassThruResult<()> {
        let mut slots = self.slots.write();
        match slots.get_mut(id as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                debug!(slot = id, "Filter removed");
                Ok(())
            }
            _ => Err(PassThruError::InvalidFilterId(format!(
                "filter {} is not active",
                id
            ))),
        }
    }

    pub fn clear(&self) {
        let mut slots = self.slots.write();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }

    /// Evaluate every active filter in ascending slot order
    pub fn evaluate(&self, frame: &Frame) -> FilterResult {
        let slots = self.slots.read();
        let mut verdict = FilterResult::Neutral;

        for filter in slots.iter().flatten() {
            match filter.check(frame) {
                FilterResult::Block => return FilterResult::Block,
                FilterResult::Pass => verdict = FilterResult::Pass,
                FilterResult::Neutral => {}
            }
        }
        verdict
    }

    pub fn admits(&self, frame: &Frame) -> bool {
        self.evaluate(frame) == FilterResult::Pass
    }

    pub fn get(&self, id: u32) -> Option<MessageFilter> {
        self.slots.read().get(id as usize).cloned().flatten()
    }

    pub fn active_count(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const CAN_SCOPE: FilterScope = FilterScope {
        protocol: ProtocolId::CAN,
        max_len: 12,
    };

    fn can(bytes: &[u8]) -> Frame {
        Frame::new(ProtocolId::CAN, bytes.to_vec())
    }

    fn id_filter(kind: FilterKind, id: u32) -> MessageFilter {
        MessageFilter::new(
            kind,
            &can(&[0xFF, 0xFF, 0xFF, 0xFF]),
            &can(&id.to_be_bytes()),
            None,
            CAN_SCOPE,
        )
        .unwrap()
    }

    #[rstest]
    #[case(&[0x00, 0x00, 0x07, 0xE8, 0x02], true)]
    #[case(&[0x00, 0x00, 0x07, 0xE8], true)]
    #[case(&[0x00, 0x00, 0x07, 0xE9, 0x02], false)]
    #[case(&[0x00, 0x00, 0x07], false)]
    fn test_filter_matching(#[case] data: &[u8], #[case] expected: bool) {
        let filter = id_filter(FilterKind::Pass, 0x7E8);
        assert_eq!(filter.matches(&can(data)), expected);
    }

    #[test]
    fn test_pattern_is_stored_masked() {
        let a = MessageFilter::new(
            FilterKind::Pass,
            &can(&[0x00, 0x00, 0x07, 0xF0]),
            &can(&[0xAB, 0xCD, 0x07, 0xE8]),
            None,
            CAN_SCOPE,
        )
        .unwrap();
        let b = MessageFilter::new(
            FilterKind::Pass,
            &can(&[0x00, 0x00, 0x07, 0xF0]),
            &can(&[0x00, 0x00, 0x07, 0xE0]),
            None,
            CAN_SCOPE,
        )
        .unwrap();

        assert_eq!(a, b);
        assert!(a.matches(&can(&[0x12, 0x34, 0x07, 0xE5])));
    }

    #[test]
    fn test_check_verdicts_by_kind() {
        let frame = can(&[0x00, 0x00, 0x07, 0xE8, 0x01]);
        let other = can(&[0x00, 0x00, 0x01, 0x00, 0x01]);

        assert_eq!(id_filter(FilterKind::Pass, 0x7E8).check(&frame), FilterResult::Pass);
        assert_eq!(id_filter(FilterKind::Block, 0x7E8).check(&frame), FilterResult::Block);
        assert_eq!(id_filter(FilterKind::Pass, 0x7E8).check(&other), FilterResult::Neutral);
        assert_eq!(id_filter(FilterKind::Block, 0x7E8).check(&other), FilterResult::Neutral);
    }

    #[test]
    fn test_empty_chain_drops_everything() {
        let chain = FilterChain::new();
        let frame = can(&[0x00, 0x00, 0x07, 0xE8]);

        assert_eq!(chain.evaluate(&frame), FilterResult::Neutral);
        assert!(!chain.admits(&frame));
    }

    #[test]
    fn test_block_wins_regardless_of_slot_order() {
        let frame = can(&[0x00, 0x00, 0x07, 0xE8, 0x01]);

        let pass_first = FilterChain::new();
        pass_first.add(id_filter(FilterKind::Pass, 0x7E8)).unwrap();
        pass_first.add(id_filter(FilterKind::Block, 0x7E8)).unwrap();

        let block_first = FilterChain::new();
        block_first.add(id_filter(FilterKind::Block, 0x7E8)).unwrap();
        block_first.add(id_filter(FilterKind::Pass, 0x7E8)).unwrap();

        assert_eq!(pass_first.evaluate(&frame), FilterResult::Block);
        assert_eq!(block_first.evaluate(&frame), FilterResult::Block);
    }

    #[test]
    fn test_any_pass_admits_among_neutrals() {
        let chain = FilterChain::new();
        chain.add(id_filter(FilterKind::Block, 0x100)).unwrap();
        chain.add(id_filter(FilterKind::Pass, 0x200)).unwrap();
        chain.add(id_filter(FilterKind::Pass, 0x7E8)).unwrap();

        assert!(chain.admits(&can(&[0x00, 0x00, 0x07, 0xE8])));
        assert!(!chain.admits(&can(&[0x00, 0x00, 0x03, 0x00])));
        assert!(!chain.admits(&can(&[0x00, 0x00, 0x01, 0x00])));
    }

    #[test]
    fn test_duplicate_rejected_without_consuming_slot() {
        let chain = FilterChain::new();
        assert_eq!(chain.add(id_filter(FilterKind::Pass, 0x7E8)).unwrap(), 0);

        let err = chain.add(id_filter(FilterKind::Pass, 0x7E8)).unwrap_err();
        assert_eq!(err, PassThruError::NotUnique);
        assert_eq!(chain.active_count(), 1);

        // Same mask/pattern but different kind is a different filter
        assert_eq!(chain.add(id_filter(FilterKind::Block, 0x7E8)).unwrap(), 1);
    }

    #[test]
    fn test_duplicate_check_sees_later_slots() {
        let chain = FilterChain::new();
        chain.add(id_filter(FilterKind::Pass, 0x100)).unwrap();
        chain.add(id_filter(FilterKind::Pass, 0x200)).unwrap();
        chain.remove(0).unwrap();

        // Slot 0 is free again, but the duplicate lives in slot 1
        let err = chain.add(id_filter(FilterKind::Pass, 0x200)).unwrap_err();
        assert_eq!(err, PassThruError::NotUnique);
        assert!(chain.get(0).is_none());
    }

    #[test]
    fn test_slot_exhaustion_and_reuse() {
        let chain = FilterChain::new();
        for id in 0..FILTER_SLOTS as u32 {
            assert_eq!(chain.add(id_filter(FilterKind::Pass, id)).unwrap(), id);
        }

        let err = chain.add(id_filter(FilterKind::Pass, 0x7FF)).unwrap_err();
        assert!(matches!(err, PassThruError::LimitExceeded { limit: FILTER_SLOTS, .. }));

        chain.remove(4).unwrap();
        assert_eq!(chain.add(id_filter(FilterKind::Pass, 0x7FF)).unwrap(), 4);
    }

    #[rstest]
    #[case(10)]
    #[case(99)]
    fn test_remove_out_of_range(#[case] id: u32) {
        let chain = FilterChain::new();
        let err = chain.remove(id).unwrap_err();
        assert!(matches!(err, PassThruError::InvalidFilterId(_)));
    }

    #[test]
    fn test_remove_unoccupied_slot() {
        let chain = FilterChain::new();
        assert!(matches!(chain.remove(0), Err(PassThruError::InvalidFilterId(_))));
    }

    #[test]
    fn test_clear_empties_every_slot() {
        let chain = FilterChain::new();
        chain.add(id_filter(FilterKind::Pass, 0x7E8)).unwrap();
        chain.add(id_filter(FilterKind::Block, 0x7E0)).unwrap();

        chain.clear();
        assert_eq!(chain.active_count(), 0);
    }

    #[test]
    fn test_validation_errors() {
        let mask = can(&[0xFF, 0xFF, 0xFF, 0xFF]);

        let mismatched_len = MessageFilter::new(
            FilterKind::Pass,
            &mask,
            &can(&[0x00, 0x00, 0x07]),
            None,
            CAN_SCOPE,
        );
        assert!(matches!(mismatched_len, Err(PassThruError::InvalidMessage(_))));

        let wrong_protocol = MessageFilter::new(
            FilterKind::Pass,
            &mask,
            &Frame::new(ProtocolId::ISO15765, vec![0, 0, 7, 0xE8]),
            None,
            CAN_SCOPE,
        );
        assert!(matches!(wrong_protocol, Err(PassThruError::ProtocolMismatch { .. })));

        let fc_on_pass = MessageFilter::new(FilterKind::Pass, &mask, &mask, Some(&mask), CAN_SCOPE);
        assert!(matches!(fc_on_pass, Err(PassThruError::InvalidMessage(_))));

        let fc_on_can = MessageFilter::new(FilterKind::FlowControl, &mask, &mask, Some(&mask), CAN_SCOPE);
        assert!(matches!(fc_on_can, Err(PassThruError::InvalidFilterId(_))));

        let too_long = MessageFilter::new(
            FilterKind::Block,
            &can(&[0xFF; 13]),
            &can(&[0x00; 13]),
            None,
            CAN_SCOPE,
        );
        assert!(matches!(too_long, Err(PassThruError::InvalidMessage(_))));
    }

    #[test]
    fn test_flow_control_filter() {
        let scope = FilterScope {
            protocol: ProtocolId::ISO15765,
            max_len: 12,
        };
        let iso = |bytes: &[u8]| Frame::new(ProtocolId::ISO15765, bytes.to_vec());
        let mask = iso(&[0xFF, 0xFF, 0xFF, 0xFF]);
        let pattern = iso(&[0x00, 0x00, 0x07, 0xE8]);
        let fc = iso(&[0x00, 0x00, 0x07, 0xE0]);

        let missing = MessageFilter::new(FilterKind::FlowControl, &mask, &pattern, None, scope);
        assert!(matches!(missing, Err(PassThruError::NullParameter(_))));

        let filter = MessageFilter::new(FilterKind::FlowControl, &mask, &pattern, Some(&fc), scope).unwrap();
        assert_eq!(filter.flow_control().map(|b| b.as_ref()), Some(&[0x00, 0x00, 0x07, 0xE0][..]));
        assert_eq!(filter.check(&iso(&[0x00, 0x00, 0x07, 0xE8, 0x10])), FilterResult::Pass);
    }

    #[rstest]
    #[case(1, FilterKind::Pass)]
    #[case(2, FilterKind::Block)]
    #[case(3, FilterKind::FlowControl)]
    fn test_kind_from_raw(#[case] raw: u32, #[case] kind: FilterKind) {
        assert_eq!(FilterKind::from_raw(raw).unwrap(), kind);
        assert_eq!(kind.raw(), raw);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(matches!(FilterKind::from_raw(7), Err(PassThruError::InvalidMessage(_))));
    }
}

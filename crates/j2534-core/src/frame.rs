//! Frame records and the flag words that travel with them

use bitflags::bitflags;
use bytes::Bytes;

use crate::protocol::ProtocolId;

bitflags! {
    /// Receive status bits reported with inbound frames
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RxStatus: u32 {
        /// Frame is a loopback echo of something this channel transmitted
        const TX_MSG_TYPE = 0x0000_0001;
        const START_OF_MESSAGE = 0x0000_0002;
        const RX_BREAK = 0x0000_0004;
        const TX_INDICATION = 0x0000_0008;
        const ISO15765_PADDING_ERROR = 0x0000_0010;
        const ISO15765_ADDR_TYPE = 0x0000_0080;
        const CAN_29BIT_ID = 0x0000_0100;

        // Host-defined bits pass through untouched
        const _ = !0;
    }
}

bitflags! {
    /// Transmit flags supplied by the host with outbound frames
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TxFlags: u32 {
        const ISO15765_FRAME_PAD = 0x0000_0040;
        const ISO15765_ADDR_TYPE = 0x0000_0080;
        const CAN_29BIT_ID = 0x0000_0100;
        const WAIT_P3_MIN_ONLY = 0x0000_0200;
        const SW_CAN_HV_TX = 0x0000_0400;
        const SCI_MODE = 0x0040_0000;
        const SCI_TX_VOLTAGE = 0x0080_0000;

        const _ = !0;
    }
}

bitflags! {
    /// Behavioural flags given when a channel is opened
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnectFlags: u32 {
        const CAN_29BIT_ID = 0x0000_0100;
        const ISO9141_NO_CHECKSUM = 0x0000_0200;
        const CAN_ID_BOTH = 0x0000_0800;
        const ISO9141_K_LINE_ONLY = 0x0000_1000;

        const _ = !0;
    }
}

/// One diagnostic message flowing in or out of a channel
///
/// Frames are immutable values. The `with_*` methods return a modified copy;
/// the payload is reference counted so copies are cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    protocol: ProtocolId,
    data: Bytes,
    timestamp: u32,
    rx_status: RxStatus,
    tx_flags: TxFlags,
    extra_data_index: usize,
}

impl Frame {
    /// Create a frame with no status bits and no trailing extra data
    pub fn new(protocol: ProtocolId, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            protocol,
            extra_data_index: data.len(),
            data,
            timestamp: 0,
            rx_status: RxStatus::empty(),
            tx_flags: TxFlags::empty(),
        }
    }

    /// Build a CAN-family frame from an arbitration id and payload bytes
    pub fn can(protocol: ProtocolId, can_id: u32, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(4 + payload.len());
        data.extend_from_slice(&can_id.to_be_bytes());
        data.extend_from_slice(payload);
        Self::new(protocol, data)
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_rx_status(mut self, rx_status: RxStatus) -> Self {
        self.rx_status = rx_status;
        self
    }

    #[must_use]
    pub fn with_tx_flags(mut self, tx_flags: TxFlags) -> Self {
        self.tx_flags = tx_flags;
        self
    }

    /// Mark where trailing extra data (checksums, address info) starts
    #[must_use]
    pub fn with_extra_data_index(mut self, index: usize) -> Self {
        self.extra_data_index = index.min(self.data.len());
        self
    }

    /// Copy of this frame carrying a different protocol identifier
    #[must_use]
    pub fn restamped(&self, protocol: ProtocolId) -> Self {
        Self {
            protocol,
            ..self.clone()
        }
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Microsecond timestamp, wrapping at 32 bits
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn rx_status(&self) -> RxStatus {
        self.rx_status
    }

    pub fn tx_flags(&self) -> TxFlags {
        self.tx_flags
    }

    pub fn extra_data_index(&self) -> usize {
        self.extra_data_index
    }

    /// Trailing bytes after the extra data index
    pub fn extra_data(&self) -> &[u8] {
        &self.data[self.extra_data_index.min(self.data.len())..]
    }

    /// Big-endian CAN identifier in the first four payload bytes
    pub fn can_id(&self) -> Option<u32> {
        let head: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(head))
    }

    /// Payload after the 4-byte CAN identifier
    pub fn can_payload(&self) -> &[u8] {
        self.data.get(4..).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_can_frame_layout() {
        let frame = Frame::can(ProtocolId::CAN, 0x7E0, &[0x02, 0x10, 0x03]);

        assert_eq!(frame.data().as_ref(), &[0x00, 0x00, 0x07, 0xE0, 0x02, 0x10, 0x03]);
        assert_eq!(frame.can_id(), Some(0x7E0));
        assert_eq!(frame.can_payload(), &[0x02, 0x10, 0x03]);
        assert_eq!(frame.extra_data_index(), frame.len());
        assert!(frame.extra_data().is_empty());
    }

    #[test]
    fn test_short_frame_has_no_can_id() {
        let frame = Frame::new(ProtocolId::CAN, vec![0x01, 0x02]);
        assert_eq!(frame.can_id(), None);
        assert!(frame.can_payload().is_empty());
    }

    #[test]
    fn test_restamp_keeps_everything_else() {
        let frame = Frame::new(ProtocolId(0x42), vec![1, 2, 3])
            .with_timestamp(1234)
            .with_rx_status(RxStatus::START_OF_MESSAGE)
            .with_extra_data_index(2);

        let restamped = frame.restamped(ProtocolId::CAN);

        assert_eq!(restamped.protocol(), ProtocolId::CAN);
        assert_eq!(restamped.timestamp(), 1234);
        assert_eq!(restamped.rx_status(), RxStatus::START_OF_MESSAGE);
        assert_eq!(restamped.extra_data(), &[3]);
        assert_eq!(frame.protocol(), ProtocolId(0x42));
    }

    #[test]
    fn test_extra_data_index_is_clamped() {
        let frame = Frame::new(ProtocolId::CAN, vec![1, 2]).with_extra_data_index(10);
        assert_eq!(frame.extra_data_index(), 2);
    }

    #[test]
    fn test_flag_words() {
        let status = RxStatus::TX_MSG_TYPE | RxStatus::CAN_29BIT_ID;
        assert!(status.contains(RxStatus::TX_MSG_TYPE));
        assert!(status.contains(RxStatus::CAN_29BIT_ID));
        assert!(!status.contains(RxStatus::RX_BREAK));
        assert_eq!(status.bits(), 0x101);
        assert_eq!(TxFlags::from_bits_retain(0x100), TxFlags::CAN_29BIT_ID);

        // Vendor bits survive a round trip through the flag word
        let vendor = ConnectFlags::from_bits_retain(0x8000_0100);
        assert!(vendor.contains(ConnectFlags::CAN_29BIT_ID));
        assert_eq!(vendor.bits(), 0x8000_0100);
    }
}

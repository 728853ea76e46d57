//! Per-protocol message bounds and encoding
//!
//! Each channel owns one codec. The codec decides the valid message lengths
//! for its protocol and turns host frames into transmit actions. A codec may
//! decline to encode (`None`), which the connection treats as "not
//! implemented for this protocol variant" rather than an error.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use j2534_core::{ConnectFlags, Frame, PassThruError, PassThruResult, ProtocolId, RxStatus, TxFlags};

use crate::action::{SharedAction, TransmitAction};
use crate::device::{BusFrame, BusPort, DeviceError};

/// Length of the CAN identifier prefix in CAN-family frames
pub const CAN_ID_LEN: usize = 4;

/// Maximum CAN data bytes
pub const CAN_MAX_DATA: usize = 8;

/// Largest 11-bit CAN identifier
pub const CAN_STANDARD_ID_MAX: u32 = 0x7FF;

/// Protocol-specific encoding collaborator
pub trait ProtocolCodec: Send + Sync + fmt::Debug {
    fn protocol(&self) -> ProtocolId;

    /// Minimum accepted message length in bytes
    fn min_msg_len(&self) -> usize;

    /// Maximum accepted message length in bytes
    fn max_msg_len(&self) -> usize;

    /// Maximum length that fits a single frame without multi-frame assembly
    fn max_single_frame_len(&self) -> usize;

    /// Protocol rules a host frame must satisfy beyond its length
    fn validate_transmit(&self, _frame: &Frame) -> PassThruResult<()> {
        Ok(())
    }

    /// Encode a validated frame, or `None` when this protocol variant cannot
    /// transmit
    fn encode_transmit(&self, frame: &Frame) -> Option<SharedAction>;

    /// Turn a raw bus frame into a frame record for this channel, if the
    /// channel wants it
    fn decode_inbound(&self, _frame: &BusFrame) -> Option<Frame> {
        None
    }
}

/// Pick the codec for a protocol
pub fn codec_for(protocol: ProtocolId, flags: ConnectFlags) -> PassThruResult<Arc<dyn ProtocolCodec>> {
    match protocol {
        ProtocolId::CAN => Ok(Arc::new(CanCodec::new(flags))),
        ProtocolId::ISO15765 => Ok(Arc::new(Iso15765Codec)),
        p if p.name().is_some() => Ok(Arc::new(UnsupportedCodec::new(p))),
        p => Err(PassThruError::InvalidProtocolId(p)),
    }
}

// =============================================================================
// Raw CAN
// =============================================================================

/// Raw CAN: 4-byte identifier followed by up to 8 data bytes
#[derive(Debug, Clone)]
pub struct CanCodec {
    flags: ConnectFlags,
}

impl CanCodec {
    pub fn new(flags: ConnectFlags) -> Self {
        Self { flags }
    }

    fn accepts(&self, extended: bool) -> bool {
        self.flags.contains(ConnectFlags::CAN_ID_BOTH)
            || extended == self.flags.contains(ConnectFlags::CAN_29BIT_ID)
    }
}

impl ProtocolCodec for CanCodec {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::CAN
    }

    fn min_msg_len(&self) -> usize {
        CAN_ID_LEN
    }

    fn max_msg_len(&self) -> usize {
        CAN_ID_LEN + CAN_MAX_DATA
    }

    fn max_single_frame_len(&self) -> usize {
        CAN_ID_LEN + CAN_MAX_DATA
    }

    fn validate_transmit(&self, frame: &Frame) -> PassThruResult<()> {
        let extended = frame.tx_flags().contains(TxFlags::CAN_29BIT_ID);
        if !self.accepts(extended) {
            return Err(PassThruError::InvalidMessage(format!(
                "{}-bit identifier on a {}-bit channel",
                if extended { 29 } else { 11 },
                if extended { 11 } else { 29 }
            )));
        }
        match frame.can_id() {
            Some(id) if !extended && id > CAN_STANDARD_ID_MAX => Err(PassThruError::InvalidMessage(
                format!("CAN id 0x{:X} needs CAN_29BIT_ID", id),
            )),
            _ => Ok(()),
        }
    }

    fn encode_transmit(&self, frame: &Frame) -> Option<SharedAction> {
        let can_id = frame.can_id()?;
        let payload = frame.data().slice(CAN_ID_LEN..);
        let bus_frame = if frame.tx_flags().contains(TxFlags::CAN_29BIT_ID) {
            BusFrame::extended(can_id, payload)
        } else {
            BusFrame::standard(can_id, payload)
        };
        Some(Arc::new(CanTransmit::new(frame.clone(), bus_frame)))
    }

    fn decode_inbound(&self, frame: &BusFrame) -> Option<Frame> {
        if !self.accepts(frame.extended) {
            return None;
        }

        let status = if frame.extended {
            RxStatus::CAN_29BIT_ID
        } else {
            RxStatus::empty()
        };
        Some(Frame::can(ProtocolId::CAN, frame.id, &frame.data).with_rx_status(status))
    }
}

/// One raw CAN frame waiting for the bus
pub struct CanTransmit {
    frame: Frame,
    bus_frame: BusFrame,
    cancelled: AtomicBool,
}

impl CanTransmit {
    pub fn new(frame: Frame, bus_frame: BusFrame) -> Self {
        Self {
            frame,
            bus_frame,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn bus_frame(&self) -> &BusFrame {
        &self.bus_frame
    }
}

impl TransmitAction for CanTransmit {
    fn execute(&self, port: &dyn BusPort) -> Result<Frame, DeviceError> {
        if self.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        port.send(&self.bus_frame)?;

        let status = if self.bus_frame.extended {
            RxStatus::CAN_29BIT_ID
        } else {
            RxStatus::empty()
        };
        Ok(self.frame.clone().with_rx_status(status))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CanTransmit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanTransmit")
            .field("id", &format_args!("0x{:X}", self.bus_frame.id))
            .field("extended", &self.bus_frame.extended)
            .field("data", &hex::encode(&self.bus_frame.data))
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// =============================================================================
// ISO 15765
// =============================================================================

/// ISO 15765 message bounds
///
/// Segmented transfer and flow control are handled by a protocol layer outside
/// this crate, so encoding always declines.
#[derive(Debug, Clone, Copy)]
pub struct Iso15765Codec;

impl ProtocolCodec for Iso15765Codec {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::ISO15765
    }

    fn min_msg_len(&self) -> usize {
        CAN_ID_LEN
    }

    fn max_msg_len(&self) -> usize {
        4099
    }

    fn max_single_frame_len(&self) -> usize {
        12
    }

    fn encode_transmit(&self, _frame: &Frame) -> Option<SharedAction> {
        None
    }
}

// =============================================================================
// Legacy protocols
// =============================================================================

/// Known protocol without a transmit path on this adapter
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedCodec {
    protocol: ProtocolId,
}

impl UnsupportedCodec {
    pub fn new(protocol: ProtocolId) -> Self {
        Self { protocol }
    }
}

impl ProtocolCodec for UnsupportedCodec {
    fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    fn min_msg_len(&self) -> usize {
        1
    }

    fn max_msg_len(&self) -> usize {
        4128
    }

    fn max_single_frame_len(&self) -> usize {
        12
    }

    fn encode_transmit(&self, _frame: &Frame) -> Option<SharedAction> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VirtualBus;

    #[test]
    fn test_codec_selection() {
        let can = codec_for(ProtocolId::CAN, ConnectFlags::empty()).unwrap();
        assert_eq!(can.protocol(), ProtocolId::CAN);
        assert_eq!((can.min_msg_len(), can.max_msg_len()), (4, 12));

        let iso = codec_for(ProtocolId::ISO15765, ConnectFlags::empty()).unwrap();
        assert_eq!(iso.max_msg_len(), 4099);
        assert_eq!(iso.max_single_frame_len(), 12);

        let vpw = codec_for(ProtocolId::J1850VPW, ConnectFlags::empty()).unwrap();
        assert_eq!(vpw.protocol(), ProtocolId::J1850VPW);

        let err = codec_for(ProtocolId(0x1234), ConnectFlags::empty()).unwrap_err();
        assert!(matches!(err, PassThruError::InvalidProtocolId(ProtocolId(0x1234))));
    }

    #[test]
    fn test_can_encode_and_execute() {
        let codec = CanCodec::new(ConnectFlags::empty());
        let frame = Frame::can(ProtocolId::CAN, 0x7E0, &[0x02, 0x10, 0x03]);
        let action = codec.encode_transmit(&frame).unwrap();

        let bus = VirtualBus::new();
        let mut observer = bus.observe();
        let echo = action.execute(&bus).unwrap();

        let sent = observer.try_recv().unwrap();
        assert_eq!(sent.id, 0x7E0);
        assert_eq!(sent.data.as_ref(), &[0x02, 0x10, 0x03]);
        assert_eq!(echo.data(), frame.data());
        assert!(!echo.rx_status().contains(RxStatus::CAN_29BIT_ID));
    }

    #[test]
    fn test_can_encode_extended_id() {
        let codec = CanCodec::new(ConnectFlags::CAN_29BIT_ID);
        let frame = Frame::can(ProtocolId::CAN, 0x18DA_10F1, &[0x01])
            .with_tx_flags(TxFlags::CAN_29BIT_ID);
        let action = codec.encode_transmit(&frame).unwrap();

        let bus = VirtualBus::new();
        let echo = action.execute(&bus).unwrap();
        assert!(echo.rx_status().contains(RxStatus::CAN_29BIT_ID));
    }

    #[test]
    fn test_cancelled_action_is_not_sent() {
        let codec = CanCodec::new(ConnectFlags::empty());
        let action = codec
            .encode_transmit(&Frame::can(ProtocolId::CAN, 0x7E0, &[]))
            .unwrap();
        action.cancel();

        let bus = VirtualBus::new();
        assert_eq!(action.execute(&bus), Err(DeviceError::Cancelled));
        assert_eq!(bus.sent_count(), 0);
    }

    #[test]
    fn test_can_decode_respects_id_width() {
        let standard_only = CanCodec::new(ConnectFlags::empty());
        let extended_only = CanCodec::new(ConnectFlags::CAN_29BIT_ID);
        let both = CanCodec::new(ConnectFlags::CAN_ID_BOTH);

        let short = BusFrame::standard(0x7E8, vec![0x02, 0x50, 0x03]);
        let long = BusFrame::extended(0x18DA_F110, vec![0x02, 0x50, 0x03]);

        assert!(standard_only.decode_inbound(&short).is_some());
        assert!(standard_only.decode_inbound(&long).is_none());
        assert!(extended_only.decode_inbound(&short).is_none());
        assert!(both.decode_inbound(&long).is_some());

        let decoded = extended_only.decode_inbound(&long).unwrap();
        assert_eq!(decoded.can_id(), Some(0x18DA_F110));
        assert!(decoded.rx_status().contains(RxStatus::CAN_29BIT_ID));
    }

    #[test]
    fn test_transmit_id_width_rules() {
        let standard_only = CanCodec::new(ConnectFlags::empty());
        let extended_only = CanCodec::new(ConnectFlags::CAN_29BIT_ID);
        let both = CanCodec::new(ConnectFlags::CAN_ID_BOTH);

        let short = Frame::can(ProtocolId::CAN, 0x7DF, &[0x01]);
        let wide_unflagged = Frame::can(ProtocolId::CAN, 0x18DA_10F1, &[0x01]);
        let long = wide_unflagged.clone().with_tx_flags(TxFlags::CAN_29BIT_ID);

        assert!(standard_only.validate_transmit(&short).is_ok());
        assert!(matches!(
            standard_only.validate_transmit(&wide_unflagged),
            Err(PassThruError::InvalidMessage(_))
        ));
        assert!(matches!(
            standard_only.validate_transmit(&long),
            Err(PassThruError::InvalidMessage(_))
        ));

        assert!(extended_only.validate_transmit(&long).is_ok());
        assert!(extended_only.validate_transmit(&short).is_err());

        assert!(both.validate_transmit(&short).is_ok());
        assert!(both.validate_transmit(&long).is_ok());
        assert!(both.validate_transmit(&wide_unflagged).is_err());
    }

    #[test]
    fn test_iso15765_declines_to_encode() {
        let frame = Frame::can(ProtocolId::ISO15765, 0x7E0, &[0x02, 0x10, 0x03]);
        assert!(Iso15765Codec.encode_transmit(&frame).is_none());
    }
}

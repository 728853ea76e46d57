//! Connection aggregate
//!
//! A connection is one protocol-bound channel on the shared transport device.
//! It owns its RX/TX buffers, periodic slots and filter chain, and holds only
//! a weak reference to the device: every device call is skipped silently when
//! the device has already gone away.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use j2534_core::{
    ConnectFlags, Frame, PassThruError, PassThruResult, ProtocolId, TransmitError,
};
use tracing::{debug, info, trace};

use crate::action::{PeriodicMessage, SharedAction};
use crate::buffer::{RxBuffer, TxBuffer};
use crate::codec::{codec_for, ProtocolCodec};
use crate::config::{ChannelConfig, ConnectionOptions};
use crate::device::{ChannelId, Direction, TransportDevice};
use crate::filter::{FilterChain, FilterKind, FilterScope, MessageFilter};
use crate::ioctl::{Ioctl, IoctlOutput, LinkSettings, SConfig};
use crate::periodic::{validate_interval, PeriodicScheduler};

static NEXT_CHANNEL_ID: AtomicU32 = AtomicU32::new(1);

/// First sleep of a blocking read
const POLL_BACKOFF_BASE: Duration = Duration::from_micros(250);

/// Sleep before poll attempt `attempt` (0-based) of a blocking read
///
/// Doubles from `POLL_BACKOFF_BASE` and never exceeds `cap`.
pub fn poll_backoff(attempt: u32, cap: Duration) -> Duration {
    let shift = attempt.min(16);
    POLL_BACKOFF_BASE.saturating_mul(1 << shift).min(cap)
}

pub struct Connection {
    id: ChannelId,
    protocol: ProtocolId,
    flags: ConnectFlags,
    settings: LinkSettings,
    codec: Arc<dyn ProtocolCodec>,
    device: Weak<dyn TransportDevice>,
    self_ref: Weak<Connection>,
    rx: RxBuffer,
    tx: TxBuffer,
    periodic: PeriodicScheduler,
    filters: FilterChain,
    options: ConnectionOptions,
    closed: AtomicBool,
}

impl Connection {
    /// Open a channel with the codec for its protocol
    pub fn open(config: &ChannelConfig, device: Weak<dyn TransportDevice>) -> PassThruResult<Arc<Self>> {
        let codec = codec_for(config.protocol, config.connect_flags())?;
        Self::open_with_options(config, codec, device, ConnectionOptions::default())
    }

    pub fn open_with_codec(
        config: &ChannelConfig,
        codec: Arc<dyn ProtocolCodec>,
        device: Weak<dyn TransportDevice>,
    ) -> PassThruResult<Arc<Self>> {
        Self::open_with_options(config, codec, device, ConnectionOptions::default())
    }

    pub fn open_with_options(
        config: &ChannelConfig,
        codec: Arc<dyn ProtocolCodec>,
        device: Weak<dyn TransportDevice>,
        options: ConnectionOptions,
    ) -> PassThruResult<Arc<Self>> {
        if codec.protocol() != config.protocol {
            return Err(PassThruError::InvalidProtocolId(config.protocol));
        }

        let id = ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed));
        let connection = Arc::new_cyclic(|self_ref| Self {
            id,
            protocol: config.protocol,
            flags: config.connect_flags(),
            settings: LinkSettings::new(config.baud_rate),
            codec,
            device,
            self_ref: self_ref.clone(),
            rx: RxBuffer::new(),
            tx: TxBuffer::new(),
            periodic: PeriodicScheduler::new(),
            filters: FilterChain::new(),
            options,
            closed: AtomicBool::new(false),
        });

        info!(
            channel = %id,
            protocol = %config.protocol,
            baud_rate = config.baud_rate,
            flags = format!("0x{:X}", config.flags),
            "Channel opened"
        );
        Ok(connection)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn flags(&self) -> ConnectFlags {
        self.flags
    }

    pub fn baud_rate(&self) -> u32 {
        self.settings.baud_rate()
    }

    pub fn loopback(&self) -> bool {
        self.settings.loopback()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn codec(&self) -> &Arc<dyn ProtocolCodec> {
        &self.codec
    }

    fn ensure_open(&self) -> PassThruResult<()> {
        if self.is_closed() {
            return Err(PassThruError::InvalidChannelId(self.id.0));
        }
        Ok(())
    }

    fn device(&self) -> Option<Arc<dyn TransportDevice>> {
        self.device.upgrade()
    }

    fn check_frame(&self, frame: &Frame, min: usize, max: usize) -> PassThruResult<()> {
        if frame.protocol() != self.protocol {
            return Err(PassThruError::ProtocolMismatch {
                expected: self.protocol,
                found: frame.protocol(),
            });
        }
        check_length(frame, min, max)
    }

    // =========================================================================
    // Read / write
    // =========================================================================

    /// Read up to `max_count` frames
    ///
    /// With a zero timeout only what is already queued is returned. Otherwise
    /// the RX buffer is polled with short sleeps until `max_count` frames have
    /// been collected or `timeout` has elapsed. Zero frames is always
    /// `BufferEmpty`; fewer than `max_count` is success.
    pub fn receive(&self, max_count: usize, timeout: Duration) -> PassThruResult<Vec<Frame>> {
        self.ensure_open()?;

        // A timeout too large to represent never expires
        let deadline = Instant::now().checked_add(timeout);
        let cap = self.options.rx_poll_interval();
        let mut frames = Vec::with_capacity(max_count.min(64));
        let mut attempt = 0;

        loop {
            let wanted = max_count - frames.len();
            self.rx.pop_into(&mut frames, wanted, self.protocol);

            if frames.len() >= max_count || timeout.is_zero() || self.is_closed() {
                break;
            }
            let mut pause = poll_backoff(attempt, cap);
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                pause = pause.min(deadline - now);
            }
            std::thread::sleep(pause);
            attempt += 1;
        }

        if frames.is_empty() {
            return Err(PassThruError::BufferEmpty);
        }
        trace!(channel = %self.id, count = frames.len(), "Frames read");
        Ok(frames)
    }

    /// Queue frames for transmission
    ///
    /// Frames are checked and queued one at a time. On the first invalid frame
    /// the batch stops; frames before it stay queued and their count is carried
    /// in the error. Frames the codec cannot encode are skipped.
    pub fn transmit(&self, frames: &[Frame]) -> Result<usize, TransmitError> {
        self.ensure_open()
            .map_err(|source| TransmitError { accepted: 0, source })?;

        for (index, frame) in frames.iter().enumerate() {
            self.check_frame(frame, self.codec.min_msg_len(), self.codec.max_msg_len())
                .and_then(|_| self.codec.validate_transmit(frame))
                .map_err(|source| TransmitError {
                    accepted: index,
                    source,
                })?;

            match self.codec.encode_transmit(frame) {
                Some(action) => {
                    let depth = self.tx.push(action);
                    trace!(channel = %self.id, depth, data = %hex::encode(frame.data()), "Frame queued");
                    self.notify_pending_write();
                }
                None => {
                    trace!(channel = %self.id, protocol = %self.protocol, "No encoder for frame, skipped");
                }
            }
        }
        Ok(frames.len())
    }

    fn notify_pending_write(&self) {
        if let (Some(device), Some(me)) = (self.device(), self.self_ref.upgrade()) {
            device.register_pending_write(&me);
        }
    }

    /// Ask the device to reconsider this connection's stalled TX work
    pub fn release_stalled_tx(&self) {
        if let Some(device) = self.device() {
            device.release_stalled_write(self.id);
        }
    }

    /// Next queued action, for the device
    pub fn take_tx(&self) -> Option<SharedAction> {
        self.tx.pop()
    }

    /// Return an action the device could not send to the head of the queue
    ///
    /// Returns `false` when the TX buffer was cleared while the action was
    /// with the device; the action is then dropped.
    pub fn restage_tx(&self, action: SharedAction) -> bool {
        self.tx.restage(action)
    }

    pub fn has_pending_tx(&self) -> bool {
        !self.tx.is_empty()
    }

    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    pub fn tx_len(&self) -> usize {
        self.tx.len()
    }

    /// Inbound frame from the device
    ///
    /// The frame lands in the RX buffer only if the filter chain admits it.
    pub fn deliver(&self, frame: Frame) {
        if self.is_closed() {
            return;
        }
        if self.filters.admits(&frame) {
            trace!(channel = %self.id, data = %hex::encode(frame.data()), "Frame accepted");
            self.rx.push(frame);
        } else {
            trace!(channel = %self.id, data = %hex::encode(frame.data()), "Frame filtered out");
        }
    }

    // =========================================================================
    // Periodic messages
    // =========================================================================

    /// Start sending `frame` every `interval_ms`, returning the message id
    ///
    /// A protocol whose codec cannot encode transmits fails with
    /// `NotSupported` and no slot is taken, instead of handing out an id for
    /// a message that would never reach the bus.
    pub fn start_periodic(&self, frame: &Frame, interval_ms: u32) -> PassThruResult<u32> {
        self.ensure_open()?;
        check_length(frame, self.codec.min_msg_len(), self.codec.max_single_frame_len())?;
        self.check_frame(frame, 0, usize::MAX)?;
        self.codec.validate_transmit(frame)?;
        let interval = validate_interval(interval_ms)?;

        let message = self.periodic.install(|slot| {
            let action = self.codec.encode_transmit(frame).ok_or_else(|| {
                PassThruError::NotSupported(format!("periodic messages on {}", self.protocol))
            })?;
            Ok(Arc::new(PeriodicMessage::new(
                self.id,
                slot,
                interval,
                action,
                self.self_ref.clone(),
            )))
        })?;

        message.schedule_immediate();
        if let Some(device) = self.device() {
            device.schedule_recurring(message.clone());
        }

        debug!(
            channel = %self.id,
            slot = message.slot(),
            interval_ms,
            data = %hex::encode(frame.data()),
            "Periodic message started"
        );
        Ok(message.slot())
    }

    pub fn stop_periodic(&self, id: u32) -> PassThruResult<()> {
        self.ensure_open()?;
        let message = self.periodic.remove(id)?;
        if let Some(device) = self.device() {
            device.cancel_recurring(&message);
        }
        debug!(channel = %self.id, slot = id, fired = message.fire_count(), "Periodic message stopped");
        Ok(())
    }

    pub fn periodic_count(&self) -> usize {
        self.periodic.active_count()
    }

    pub fn periodic_message(&self, id: u32) -> Option<Arc<PeriodicMessage>> {
        self.periodic.get(id)
    }

    // =========================================================================
    // Filters
    // =========================================================================

    /// Install a message filter, returning its id
    pub fn add_filter(
        &self,
        kind: FilterKind,
        mask: &Frame,
        pattern: &Frame,
        flow_control: Option<&Frame>,
    ) -> PassThruResult<u32> {
        self.ensure_open()?;
        let scope = FilterScope {
            protocol: self.protocol,
            max_len: self.codec.max_single_frame_len(),
        };
        let filter = MessageFilter::new(kind, mask, pattern, flow_control, scope)?;
        let id = self.filters.add(filter)?;
        debug!(channel = %self.id, filter = id, ?kind, "Filter added");
        Ok(id)
    }

    pub fn remove_filter(&self, id: u32) -> PassThruResult<()> {
        self.ensure_open()?;
        self.filters.remove(id)
    }

    pub fn filter_count(&self) -> usize {
        self.filters.active_count()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn set_config(&self, param: u32, value: u32) -> PassThruResult<()> {
        self.ensure_open()?;
        self.settings.set(param, value)
    }

    pub fn get_config(&self, param: u32) -> PassThruResult<u32> {
        self.ensure_open()?;
        Ok(self.settings.get(param))
    }

    pub fn ioctl(&self, request: Ioctl) -> PassThruResult<IoctlOutput> {
        self.ensure_open()?;
        trace!(channel = %self.id, ioctl = format!("0x{:02X}", request.id()), "Ioctl");

        match request {
            Ioctl::GetConfig(params) => Ok(IoctlOutput::Config(
                params
                    .into_iter()
                    .map(|parameter| SConfig {
                        parameter,
                        value: self.settings.get(parameter),
                    })
                    .collect(),
            )),
            Ioctl::SetConfig(entries) => {
                for entry in entries {
                    self.settings.set(entry.parameter, entry.value)?;
                }
                Ok(IoctlOutput::None)
            }
            Ioctl::ClearTxBuffer => self.clear_tx().map(|_| IoctlOutput::None),
            Ioctl::ClearRxBuffer => self.clear_rx().map(|_| IoctlOutput::None),
            Ioctl::ClearPeriodicMsgs => self.clear_periodic().map(|_| IoctlOutput::None),
            Ioctl::ClearMsgFilters => self.clear_filters().map(|_| IoctlOutput::None),
            Ioctl::FiveBaudInit(address) => self.five_baud_init(&address).map(IoctlOutput::Bytes),
            Ioctl::FastInit(request) => self.fast_init(&request).map(IoctlOutput::Frame),
            Ioctl::Other(id) => {
                debug!(channel = %self.id, ioctl = format!("0x{:02X}", id), "Unhandled ioctl accepted");
                Ok(IoctlOutput::None)
            }
        }
    }

    /// ISO 9141 / 14230 five-baud initialisation; no K-line on this adapter
    pub fn five_baud_init(&self, _address: &[u8]) -> PassThruResult<Bytes> {
        Err(PassThruError::Failed("five-baud init is not supported".to_string()))
    }

    /// ISO 14230 fast initialisation; no K-line on this adapter
    pub fn fast_init(&self, _request: &Frame) -> PassThruResult<Frame> {
        Err(PassThruError::Failed("fast init is not supported".to_string()))
    }

    // =========================================================================
    // Clearing and shutdown
    // =========================================================================

    pub fn clear_tx(&self) -> PassThruResult<()> {
        self.ensure_open()?;
        self.drop_tx();
        if let Some(device) = self.device() {
            device.discard_buffer(Direction::Tx);
        }
        Ok(())
    }

    pub fn clear_rx(&self) -> PassThruResult<()> {
        self.ensure_open()?;
        let dropped = self.rx.clear();
        if let Some(device) = self.device() {
            device.discard_buffer(Direction::Rx);
        }
        debug!(channel = %self.id, dropped, "RX buffer cleared");
        Ok(())
    }

    pub fn clear_periodic(&self) -> PassThruResult<()> {
        self.ensure_open()?;
        self.drop_periodic();
        Ok(())
    }

    pub fn clear_filters(&self) -> PassThruResult<()> {
        self.ensure_open()?;
        self.filters.clear();
        debug!(channel = %self.id, "Filters cleared");
        Ok(())
    }

    fn drop_tx(&self) {
        let dropped = self.tx.clear();
        for action in &dropped {
            action.cancel();
        }
        debug!(channel = %self.id, dropped = dropped.len(), "TX buffer cleared");
    }

    fn drop_periodic(&self) {
        let cancelled = self.periodic.clear();
        if let Some(device) = self.device() {
            for message in &cancelled {
                device.cancel_recurring(message);
            }
        }
        debug!(channel = %self.id, cancelled = cancelled.len(), "Periodic messages cleared");
    }

    /// Close the channel
    ///
    /// Cancels every periodic message, removes all filters and flushes both
    /// buffers. Later host calls fail with `InvalidChannelId`. Closing twice
    /// is harmless.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.drop_periodic();
        self.filters.clear();
        self.drop_tx();
        self.rx.clear();
        if let Some(device) = self.device() {
            device.discard_buffer(Direction::Tx);
            device.discard_buffer(Direction::Rx);
        }
        info!(channel = %self.id, protocol = %self.protocol, "Channel closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Cancelled messages are dropped from the device's recurring list
        self.periodic.clear();
        for action in self.tx.clear() {
            action.cancel();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("baud_rate", &self.baud_rate())
            .field("loopback", &self.loopback())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn check_length(frame: &Frame, min: usize, max: usize) -> PassThruResult<()> {
    if frame.len() < min || frame.len() > max {
        return Err(PassThruError::InvalidMessage(format!(
            "length {} outside {}..={}",
            frame.len(),
            min,
            max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;
    use j2534_core::ids::config_param;

    fn detached() -> Weak<dyn TransportDevice> {
        Weak::<MockDevice>::new()
    }

    fn can_channel() -> Arc<Connection> {
        Connection::open(&ChannelConfig::new(ProtocolId::CAN), detached()).unwrap()
    }

    #[test]
    fn test_poll_backoff_doubles_up_to_cap() {
        let cap = Duration::from_millis(2);
        assert_eq!(poll_backoff(0, cap), Duration::from_micros(250));
        assert_eq!(poll_backoff(1, cap), Duration::from_micros(500));
        assert_eq!(poll_backoff(3, cap), Duration::from_millis(2));
        assert_eq!(poll_backoff(40, cap), Duration::from_millis(2));
    }

    #[test]
    fn test_channel_ids_are_unique() {
        let a = can_channel();
        let b = can_channel();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_open_rejects_unknown_protocol() {
        let err = Connection::open(&ChannelConfig::new(ProtocolId(0x77)), detached()).unwrap_err();
        assert_eq!(err, PassThruError::InvalidProtocolId(ProtocolId(0x77)));
    }

    #[test]
    fn test_open_rejects_mismatched_codec() {
        let codec = codec_for(ProtocolId::ISO15765, ConnectFlags::empty()).unwrap();
        let err = Connection::open_with_codec(&ChannelConfig::new(ProtocolId::CAN), codec, detached())
            .unwrap_err();
        assert!(matches!(err, PassThruError::InvalidProtocolId(_)));
    }

    #[test]
    fn test_operations_without_device_are_silent() {
        let conn = can_channel();
        let frame = Frame::can(ProtocolId::CAN, 0x7E0, &[0x02, 0x3E, 0x00]);

        assert_eq!(conn.transmit(&[frame.clone()]), Ok(1));
        assert_eq!(conn.tx_len(), 1);
        assert!(conn.start_periodic(&frame, 100).is_ok());
        assert!(conn.clear_tx().is_ok());
        assert_eq!(conn.tx_len(), 0);
        assert!(conn.stop_periodic(0).is_ok());
    }

    #[test]
    fn test_receive_partial_read_is_success() {
        let conn = can_channel();
        conn.add_filter(
            FilterKind::Pass,
            &Frame::new(ProtocolId::CAN, vec![0, 0, 0, 0]),
            &Frame::new(ProtocolId::CAN, vec![0, 0, 0, 0]),
            None,
        )
        .unwrap();
        conn.deliver(Frame::can(ProtocolId::CAN, 0x7E8, &[0x01]));

        let frames = conn.receive(5, Duration::from_millis(10)).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_receive_times_out_as_buffer_empty() {
        let conn = can_channel();
        let started = Instant::now();
        let err = conn.receive(1, Duration::from_millis(20)).unwrap_err();

        assert_eq!(err, PassThruError::BufferEmpty);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_periodic_length_checked_against_single_frame() {
        let codec = codec_for(ProtocolId::ISO15765, ConnectFlags::empty()).unwrap();
        let conn = Connection::open_with_codec(&ChannelConfig::new(ProtocolId::ISO15765), codec, detached())
            .unwrap();

        let long = Frame::new(ProtocolId::ISO15765, vec![0u8; 20]);
        assert!(matches!(
            conn.start_periodic(&long, 100),
            Err(PassThruError::InvalidMessage(_))
        ));

        // Valid but not encodable on this protocol
        let short = Frame::can(ProtocolId::ISO15765, 0x7E0, &[0x3E, 0x80]);
        assert!(matches!(
            conn.start_periodic(&short, 100),
            Err(PassThruError::NotSupported(_))
        ));
        assert_eq!(conn.periodic_count(), 0);
    }

    #[test]
    fn test_config_through_ioctl() {
        let conn = can_channel();
        let out = conn
            .ioctl(Ioctl::SetConfig(vec![
                SConfig { parameter: config_param::DATA_RATE, value: 250000 },
                SConfig { parameter: config_param::LOOPBACK, value: 1 },
            ]))
            .unwrap();
        assert_eq!(out, IoctlOutput::None);
        assert_eq!(conn.baud_rate(), 250000);
        assert!(conn.loopback());

        let out = conn
            .ioctl(Ioctl::GetConfig(vec![config_param::DATA_RATE, config_param::SYNC_JUMP_WIDTH]))
            .unwrap();
        assert_eq!(
            out,
            IoctlOutput::Config(vec![
                SConfig { parameter: config_param::DATA_RATE, value: 250000 },
                SConfig { parameter: config_param::SYNC_JUMP_WIDTH, value: 15 },
            ])
        );
    }

    #[test]
    fn test_set_config_list_stops_at_reserved() {
        let conn = can_channel();
        let err = conn
            .ioctl(Ioctl::SetConfig(vec![
                SConfig { parameter: config_param::DATA_BITS, value: 8 },
                SConfig { parameter: config_param::LOOPBACK, value: 1 },
            ]))
            .unwrap_err();

        assert!(matches!(err, PassThruError::NotSupported(_)));
        assert!(!conn.loopback());
    }

    #[test]
    fn test_legacy_init_fails() {
        let conn = can_channel();
        assert!(matches!(conn.five_baud_init(&[0x33]), Err(PassThruError::Failed(_))));
        assert!(matches!(
            conn.ioctl(Ioctl::FastInit(Frame::new(ProtocolId::CAN, vec![0xC1]))),
            Err(PassThruError::Failed(_))
        ));
        assert_eq!(conn.ioctl(Ioctl::Other(0x0E)), Ok(IoctlOutput::None));
    }

    #[test]
    fn test_closed_channel_rejects_calls() {
        let conn = can_channel();
        conn.close();
        conn.close();

        assert!(conn.is_closed());
        assert_eq!(
            conn.receive(1, Duration::ZERO),
            Err(PassThruError::InvalidChannelId(conn.id().0))
        );
        let err = conn.transmit(&[Frame::can(ProtocolId::CAN, 0x7E0, &[])]).unwrap_err();
        assert_eq!(err.accepted, 0);
        assert!(matches!(err.source, PassThruError::InvalidChannelId(_)));
        assert!(matches!(conn.get_config(config_param::DATA_RATE), Err(PassThruError::InvalidChannelId(_))));
    }
}

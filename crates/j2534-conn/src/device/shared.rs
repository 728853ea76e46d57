//! Shared transport device
//!
//! One device serves every channel opened on a bus port. Connections talk to
//! it only through [`TransportDevice`]; those calls become requests on an
//! unbounded channel read by a single worker task, which owns the outbound
//! schedule:
//!
//! ```text
//!  Connection ──register/unstall/schedule──▶ mpsc ──▶ worker ──send──▶ BusPort
//!      ▲                                                 │
//!      └──────────── deliver (loopback echo) ◀───────────┘
//!
//!  BusPort ──subscribe──▶ listener ──route_inbound──▶ Connection::deliver
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use j2534_core::{PassThruError, PassThruResult, RxStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{BusFrame, BusPort, ChannelId, DeviceError, Direction, TransportDevice};
use crate::action::PeriodicMessage;
use crate::codec::codec_for;
use crate::config::{ChannelConfig, ConnectionOptions};
use crate::connection::Connection;

/// Longest the worker sleeps with nothing scheduled
const IDLE_TICK: Duration = Duration::from_millis(100);

/// Most TX actions sent in one pass before the worker looks at requests again
const MAX_SENDS_PER_PASS: usize = 64;

enum DeviceRequest {
    RegisterWrite(ChannelId, Weak<Connection>),
    ReleaseStalled(ChannelId),
    ScheduleRecurring(Arc<PeriodicMessage>),
    CancelRecurring(Arc<PeriodicMessage>),
}

/// Transport device multiplexing channels over one bus port
pub struct SharedDevice {
    port: Arc<dyn BusPort>,
    channels: RwLock<HashMap<ChannelId, Arc<Connection>>>,
    requests: mpsc::UnboundedSender<DeviceRequest>,
    options: ConnectionOptions,
    started: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SharedDevice {
    /// Start the device's worker and listener tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(port: Arc<dyn BusPort>, options: ConnectionOptions) -> Arc<Self> {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let inbound = port.subscribe();

        let device = Arc::new(Self {
            port: port.clone(),
            channels: RwLock::new(HashMap::new()),
            requests,
            options,
            started,
            tasks: Mutex::new(Vec::new()),
        });

        let worker = Worker {
            port,
            requests: request_rx,
            registered: HashMap::new(),
            ready: VecDeque::new(),
            recurring: Vec::new(),
            started,
        };
        let worker_handle = tokio::spawn(worker.run());
        let listener_handle = tokio::spawn(listen(inbound, Arc::downgrade(&device)));
        device.tasks.lock().extend([worker_handle, listener_handle]);

        info!("Shared device started");
        device
    }

    /// Open a channel on this device
    pub fn open_channel(self: &Arc<Self>, config: &ChannelConfig) -> PassThruResult<Arc<Connection>> {
        let codec = codec_for(config.protocol, config.connect_flags())?;
        let device: Arc<dyn TransportDevice> = self.clone();
        let connection =
            Connection::open_with_options(config, codec, Arc::downgrade(&device), self.options.clone())?;

        self.channels.write().insert(connection.id(), connection.clone());
        Ok(connection)
    }

    /// Close a channel and forget it
    pub fn close_channel(&self, id: ChannelId) -> PassThruResult<()> {
        let connection = self
            .channels
            .write()
            .remove(&id)
            .ok_or(PassThruError::InvalidChannelId(id.0))?;
        connection.close();
        Ok(())
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<Connection>> {
        self.channels.read().get(&id).filter(|c| !c.is_closed()).cloned()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.prune_closed();
        let mut ids: Vec<_> = self.channels.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Forget channels the host closed directly on the connection
    fn prune_closed(&self) -> usize {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|_, c| !c.is_closed());
        let pruned = before - channels.len();
        if pruned > 0 {
            debug!(pruned, "Closed channels forgotten");
        }
        pruned
    }

    pub fn port(&self) -> &Arc<dyn BusPort> {
        &self.port
    }

    /// Microseconds since the device started, wrapping at 32 bits
    pub fn timestamp_us(&self) -> u32 {
        elapsed_us(self.started)
    }

    /// Hand a received bus frame to every channel whose codec decodes it
    ///
    /// Returns how many channels were offered the frame.
    pub fn route_inbound(&self, bus_frame: &BusFrame) -> usize {
        let timestamp = self.timestamp_us();
        let mut channels: Vec<_> = self.channels.read().values().cloned().collect();
        if channels.iter().any(|c| c.is_closed()) {
            self.prune_closed();
            channels.retain(|c| !c.is_closed());
        }
        channels.sort_by_key(|c| c.id());

        let mut offered = 0;
        for connection in channels {
            if let Some(frame) = connection.codec().decode_inbound(bus_frame) {
                connection.deliver(frame.with_timestamp(timestamp));
                offered += 1;
            }
        }
        trace!(id = format!("0x{:X}", bus_frame.id), offered, "Inbound frame routed");
        offered
    }

    /// Close every channel and stop the device's tasks
    pub fn shutdown(&self) {
        let channels: Vec<_> = self.channels.write().drain().map(|(_, c)| c).collect();
        for connection in &channels {
            connection.close();
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        info!(closed = channels.len(), "Shared device stopped");
    }

    fn request(&self, request: DeviceRequest) {
        // The worker only goes away with the device itself
        let _ = self.requests.send(request);
    }
}

impl TransportDevice for SharedDevice {
    fn register_pending_write(&self, connection: &Arc<Connection>) {
        self.request(DeviceRequest::RegisterWrite(
            connection.id(),
            Arc::downgrade(connection),
        ));
    }

    fn release_stalled_write(&self, channel: ChannelId) {
        self.request(DeviceRequest::ReleaseStalled(channel));
    }

    fn discard_buffer(&self, direction: Direction) {
        self.port.clear(direction);
    }

    fn schedule_recurring(&self, message: Arc<PeriodicMessage>) {
        self.request(DeviceRequest::ScheduleRecurring(message));
    }

    fn cancel_recurring(&self, message: &Arc<PeriodicMessage>) {
        self.request(DeviceRequest::CancelRecurring(message.clone()));
    }
}

impl Drop for SharedDevice {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

fn elapsed_us(started: Instant) -> u32 {
    // J2534 timestamps wrap at 32 bits
    started.elapsed().as_micros() as u32
}

async fn listen(mut inbound: broadcast::Receiver<BusFrame>, device: Weak<SharedDevice>) {
    loop {
        match inbound.recv().await {
            Ok(frame) => {
                let Some(device) = device.upgrade() else { break };
                device.route_inbound(&frame);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Inbound listener lagged, frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Inbound listener stopped");
}

/// State owned by the worker task
struct Worker {
    port: Arc<dyn BusPort>,
    requests: mpsc::UnboundedReceiver<DeviceRequest>,
    /// Connections with outbound work, stalled or not
    registered: HashMap<ChannelId, Weak<Connection>>,
    /// Registered connections that may send now, in service order
    ready: VecDeque<ChannelId>,
    recurring: Vec<Arc<PeriodicMessage>>,
    started: Instant,
}

impl Worker {
    async fn run(mut self) {
        loop {
            self.fire_periodic(Instant::now());
            self.drain_tx();

            let wake = tokio::time::Instant::from_std(self.next_wake());
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
        debug!("Device worker stopped");
    }

    fn handle(&mut self, request: DeviceRequest) {
        match request {
            DeviceRequest::RegisterWrite(id, connection) => {
                if !self.registered.contains_key(&id) {
                    self.registered.insert(id, connection);
                    self.ready.push_back(id);
                    trace!(channel = %id, "Writer registered");
                }
            }
            DeviceRequest::ReleaseStalled(id) => {
                if self.registered.contains_key(&id) && !self.ready.contains(&id) {
                    self.ready.push_back(id);
                    debug!(channel = %id, "Writer unstalled");
                }
            }
            DeviceRequest::ScheduleRecurring(message) => {
                debug!(channel = %message.channel(), slot = message.slot(), "Recurring message scheduled");
                self.recurring.push(message);
            }
            DeviceRequest::CancelRecurring(message) => {
                self.recurring.retain(|m| !Arc::ptr_eq(m, &message));
            }
        }
    }

    fn next_wake(&self) -> Instant {
        let now = Instant::now();
        if !self.ready.is_empty() {
            return now;
        }
        self.recurring
            .iter()
            .filter(|m| !m.is_cancelled())
            .map(|m| m.next_due())
            .fold(now + IDLE_TICK, Instant::min)
    }

    fn fire_periodic(&mut self, now: Instant) {
        self.recurring
            .retain(|m| !m.is_cancelled() && m.origin().strong_count() > 0);

        for message in &self.recurring {
            if !message.is_due(now) {
                continue;
            }
            match message.fire(self.port.as_ref(), now) {
                Ok(echo) => {
                    trace!(channel = %message.channel(), slot = message.slot(), "Periodic message sent");
                    if let Some(origin) = message.origin().upgrade() {
                        self.loopback(&origin, echo);
                    }
                }
                Err(DeviceError::Busy) => {
                    trace!(channel = %message.channel(), slot = message.slot(), "Bus busy, periodic firing skipped");
                }
                Err(DeviceError::Cancelled) => {}
                Err(e) => {
                    warn!(channel = %message.channel(), slot = message.slot(), %e, "Periodic send failed");
                }
            }
        }
    }

    /// Send queued actions, one per ready connection per round
    fn drain_tx(&mut self) {
        let mut sent = 0;
        while sent < MAX_SENDS_PER_PASS {
            let Some(id) = self.ready.pop_front() else { break };
            let Some(connection) = self.registered.get(&id).and_then(Weak::upgrade) else {
                self.registered.remove(&id);
                continue;
            };
            let Some(action) = connection.take_tx() else {
                self.registered.remove(&id);
                continue;
            };

            match action.execute(self.port.as_ref()) {
                Ok(echo) => {
                    sent += 1;
                    self.loopback(&connection, echo);
                }
                Err(DeviceError::Busy) => {
                    if connection.restage_tx(action) {
                        // Stays registered but waits for an unstall
                        debug!(channel = %id, "Bus busy, writer stalled");
                        continue;
                    }
                    debug!(channel = %id, "Bus busy, cleared frame dropped");
                }
                Err(DeviceError::Cancelled) => {}
                Err(e) => {
                    warn!(channel = %id, %e, "Transmit failed");
                }
            }

            if connection.has_pending_tx() {
                self.ready.push_back(id);
            } else {
                self.registered.remove(&id);
            }
        }
    }

    fn loopback(&self, connection: &Connection, echo: j2534_core::Frame) {
        if connection.loopback() {
            let status = echo.rx_status() | RxStatus::TX_MSG_TYPE;
            connection.deliver(
                echo.with_timestamp(elapsed_us(self.started))
                    .with_rx_status(status),
            );
        }
    }
}

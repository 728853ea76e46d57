//! j2534d - J2534 passthrough bench simulator
//!
//! Opens channels on a shared device over an in-memory CAN bus, installs the
//! configured filters and periodic messages, and logs everything the channels
//! receive until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! j2534d                              # built-in OBD-II bench
//! j2534d --config config/bench.toml
//! RUST_LOG=j2534_conn=trace j2534d    # per-frame tracing
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use j2534_conn::{BusPort, Connection, PassThruError, SharedDevice, VirtualBus};
use j2534_core::ids::config_param;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod responder;

use config::{BenchChannel, BenchConfig};
use responder::Responder;

/// Frames taken from a channel per read
const READ_BATCH: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "j2534d")]
#[command(about = "J2534 passthrough bench simulator over a virtual CAN bus")]
struct Args {
    /// Bench configuration file (TOML format)
    /// If omitted, a built-in OBD-II bench is used
    #[arg(short, long)]
    config: Option<String>,

    /// Read timeout per poll of each channel, in milliseconds
    #[arg(long, default_value_t = 100)]
    read_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "j2534d=info,j2534_conn=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let bench = match &args.config {
        Some(path) => {
            info!("Loading bench from: {}", path);
            BenchConfig::load(path).map_err(|e| anyhow::anyhow!("Failed to load bench: {}", e))?
        }
        None => {
            info!("No bench file given, using built-in OBD-II bench");
            BenchConfig::default_bench()
        }
    };

    let bus = Arc::new(VirtualBus::new());
    let port: Arc<dyn BusPort> = bus.clone();
    let device = SharedDevice::start(port, bench.device.clone());

    let responders = bench
        .responders
        .iter()
        .map(Responder::from_config)
        .collect::<Result<Vec<_>>>()?;
    info!(count = responders.len(), "Simulated nodes attached");
    let mut tasks = vec![responder::spawn(bus.clone(), responders), spawn_bus_monitor(&bus)];

    let running = Arc::new(AtomicBool::new(true));
    let mut readers = Vec::new();
    for channel in &bench.channels {
        let connection = open_channel(&device, channel)?;
        readers.push(spawn_reader(
            channel.name.clone(),
            connection,
            running.clone(),
            Duration::from_millis(args.read_timeout_ms),
        ));
    }

    info!(channels = bench.channels.len(), "Bench ready");
    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    running.store(false, Ordering::SeqCst);
    device.shutdown();
    for reader in readers {
        let _ = reader.await;
    }
    for task in tasks.drain(..) {
        task.abort();
    }

    info!("Bench stopped");
    Ok(())
}

/// Open a channel and apply its bench settings
fn open_channel(device: &Arc<SharedDevice>, bench: &BenchChannel) -> Result<Arc<Connection>> {
    let connection = device.open_channel(&bench.channel)?;
    let protocol = connection.protocol();

    if bench.loopback {
        connection.set_config(config_param::LOOPBACK, 1)?;
    }

    for filter in &bench.filters {
        let (mask, pattern, flow_control) = filter.frames(protocol)?;
        let id = connection.add_filter(filter.kind, &mask, &pattern, flow_control.as_ref())?;
        debug!(channel = %bench.name, filter = id, "Bench filter installed");
    }

    for periodic in &bench.periodic {
        let frame = periodic.frame(protocol)?;
        let id = connection.start_periodic(&frame, periodic.interval_ms)?;
        debug!(channel = %bench.name, slot = id, interval_ms = periodic.interval_ms, "Bench periodic started");
    }

    info!(
        channel = %bench.name,
        id = %connection.id(),
        protocol = %protocol,
        baud_rate = connection.baud_rate(),
        "Bench channel open"
    );
    Ok(connection)
}

/// Log every frame a channel receives until the bench stops
fn spawn_reader(
    name: String,
    connection: Arc<Connection>,
    running: Arc<AtomicBool>,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while running.load(Ordering::SeqCst) {
            match connection.receive(READ_BATCH, timeout) {
                Ok(frames) => {
                    for frame in frames {
                        info!(
                            channel = %name,
                            timestamp_us = frame.timestamp(),
                            can_id = ?frame.can_id().map(|id| format!("0x{:X}", id)),
                            data = %hex::encode(frame.can_payload()),
                            rx_status = ?frame.rx_status(),
                            "RX"
                        );
                    }
                }
                Err(PassThruError::BufferEmpty) => {}
                Err(PassThruError::InvalidChannelId(_)) => break,
                Err(e) => {
                    warn!(channel = %name, %e, "Read failed");
                    break;
                }
            }
        }
        debug!(channel = %name, "Reader stopped");
    })
}

/// Log every frame the device puts on the bus
fn spawn_bus_monitor(bus: &VirtualBus) -> JoinHandle<()> {
    let mut sent = bus.observe();
    tokio::spawn(async move {
        loop {
            match sent.recv().await {
                Ok(frame) => debug!(
                    id = format!("0x{:X}", frame.id),
                    extended = frame.extended,
                    data = %hex::encode(&frame.data),
                    "TX"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Bus monitor lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

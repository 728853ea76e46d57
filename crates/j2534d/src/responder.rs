//! Simulated nodes on the virtual bus

use std::sync::Arc;

use j2534_conn::config::parse_hex_bytes;
use j2534_conn::{BusFrame, VirtualBus};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ResponderConfig;

/// Answers one request with a fixed response
#[derive(Debug, Clone)]
pub struct Responder {
    request_id: u32,
    extended: bool,
    request: Vec<u8>,
    response: BusFrame,
}

impl Responder {
    pub fn from_config(config: &ResponderConfig) -> anyhow::Result<Self> {
        let request_id = parse_can_id(&config.request_id)?;
        let response_id = parse_can_id(&config.response_id)?;
        let request = match &config.request {
            Some(hex) => parse_hex_bytes(hex)
                .map_err(|e| anyhow::anyhow!("Invalid responder request: {}", e))?,
            None => Vec::new(),
        };
        let payload = parse_hex_bytes(&config.response)
            .map_err(|e| anyhow::anyhow!("Invalid responder response: {}", e))?;

        let response = if config.extended {
            BusFrame::extended(response_id, payload)
        } else {
            BusFrame::standard(response_id, payload)
        };

        Ok(Self {
            request_id,
            extended: config.extended,
            request,
            response,
        })
    }

    /// Response for `frame`, if it is this responder's request
    pub fn respond(&self, frame: &BusFrame) -> Option<BusFrame> {
        let matches = frame.id == self.request_id
            && frame.extended == self.extended
            && frame.data.starts_with(&self.request);
        matches.then(|| self.response.clone())
    }
}

/// Watch frames sent on the bus and inject responses
pub fn spawn(bus: Arc<VirtualBus>, responders: Vec<Responder>) -> JoinHandle<()> {
    let mut sent = bus.observe();
    tokio::spawn(async move {
        loop {
            match sent.recv().await {
                Ok(frame) => {
                    for response in responders.iter().filter_map(|r| r.respond(&frame)) {
                        debug!(
                            request_id = format!("0x{:X}", frame.id),
                            response_id = format!("0x{:X}", response.id),
                            data = %hex::encode(&response.data),
                            "Responder answered"
                        );
                        bus.inject(response);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Responder lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn parse_can_id(s: &str) -> anyhow::Result<u32> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16).map_err(|e| anyhow::anyhow!("Invalid CAN ID: {}", e))
}

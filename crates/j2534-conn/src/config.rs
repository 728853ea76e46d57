//! Channel configuration
//!
//! Frame payloads in configuration files are written as hex strings, either
//! packed (`"000007E0"`) or separated (`"00 00 07 E0"`, `"00:00:07:e0"`).

use std::time::Duration;

use j2534_core::{ConnectFlags, Frame, ProtocolId, TxFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::FilterKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid hex string '{0}'")]
    InvalidHex(String),

    #[error("Empty frame data")]
    Empty,
}

/// Parameters for opening one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Protocol name or numeric id
    pub protocol: ProtocolId,
    /// Raw connect flags (CAN_29BIT_ID, CAN_ID_BOTH, ...)
    #[serde(default)]
    pub flags: u32,
    /// Initial data rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    500000
}

impl ChannelConfig {
    pub fn new(protocol: ProtocolId) -> Self {
        Self {
            protocol,
            flags: 0,
            baud_rate: default_baud_rate(),
        }
    }

    pub fn with_flags(mut self, flags: ConnectFlags) -> Self {
        self.flags = flags.bits();
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn connect_flags(&self) -> ConnectFlags {
        ConnectFlags::from_bits_retain(self.flags)
    }
}

/// Connection tuning shared by every channel on a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Upper bound on one sleep of a blocking read
    #[serde(default = "default_rx_poll_interval_ms")]
    pub rx_poll_interval_ms: u64,
}

fn default_rx_poll_interval_ms() -> u64 {
    2
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            rx_poll_interval_ms: default_rx_poll_interval_ms(),
        }
    }
}

impl ConnectionOptions {
    pub fn rx_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rx_poll_interval_ms.max(1))
    }
}

/// A filter to install when a channel opens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub kind: FilterKind,
    pub mask: String,
    pub pattern: String,
    /// Flow-control response, only for `flow_control` filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_control: Option<String>,
    #[serde(default)]
    pub tx_flags: u32,
}

/// Mask, pattern and optional flow-control frame of a filter
pub type FilterFrames = (Frame, Frame, Option<Frame>);

impl FilterConfig {
    pub fn frames(&self, protocol: ProtocolId) -> Result<FilterFrames, ConfigError> {
        let flags = TxFlags::from_bits_retain(self.tx_flags);
        let frame = |hex: &str| -> Result<Frame, ConfigError> {
            Ok(Frame::new(protocol, parse_hex_bytes(hex)?).with_tx_flags(flags))
        };

        let flow_control = self.flow_control.as_deref().map(frame).transpose()?;
        Ok((frame(&self.mask)?, frame(&self.pattern)?, flow_control))
    }
}

/// A periodic message to start when a channel opens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConfig {
    /// Full frame bytes, CAN id first
    pub data: String,
    pub interval_ms: u32,
    #[serde(default)]
    pub tx_flags: u32,
}

impl PeriodicConfig {
    pub fn frame(&self, protocol: ProtocolId) -> Result<Frame, ConfigError> {
        Ok(Frame::new(protocol, parse_hex_bytes(&self.data)?)
            .with_tx_flags(TxFlags::from_bits_retain(self.tx_flags)))
    }
}

/// Parse a hex byte string, ignoring separators and an optional `0x` prefix
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, ConfigError> {
    let trimmed = s.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    let digits: String = body
        .chars()
        .filter(|c| !matches!(c, ' ' | ':' | '-' | '_'))
        .collect();

    if digits.is_empty() {
        return Err(ConfigError::Empty);
    }
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return Err(ConfigError::InvalidHex(s.to_string()));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| ConfigError::InvalidHex(s.to_string()))
        })
        .collect()
}

//! Error taxonomy and SAE J2534-1 status codes

use thiserror::Error;

use crate::protocol::ProtocolId;

/// Result type for passthrough operations
pub type PassThruResult<T> = Result<T, PassThruError>;

/// Numeric status codes returned over the host boundary
pub mod status {
    pub const STATUS_NOERROR: u32 = 0x00;
    pub const ERR_NOT_SUPPORTED: u32 = 0x01;
    pub const ERR_INVALID_CHANNEL_ID: u32 = 0x02;
    pub const ERR_INVALID_PROTOCOL_ID: u32 = 0x03;
    pub const ERR_NULL_PARAMETER: u32 = 0x04;
    pub const ERR_INVALID_IOCTL_VALUE: u32 = 0x05;
    pub const ERR_INVALID_FLAGS: u32 = 0x06;
    pub const ERR_FAILED: u32 = 0x07;
    pub const ERR_DEVICE_NOT_CONNECTED: u32 = 0x08;
    pub const ERR_TIMEOUT: u32 = 0x09;
    pub const ERR_INVALID_MSG: u32 = 0x0A;
    pub const ERR_INVALID_TIME_INTERVAL: u32 = 0x0B;
    pub const ERR_EXCEEDED_LIMIT: u32 = 0x0C;
    pub const ERR_INVALID_MSG_ID: u32 = 0x0D;
    pub const ERR_DEVICE_IN_USE: u32 = 0x0E;
    pub const ERR_INVALID_IOCTL_ID: u32 = 0x0F;
    pub const ERR_BUFFER_EMPTY: u32 = 0x10;
    pub const ERR_BUFFER_FULL: u32 = 0x11;
    pub const ERR_BUFFER_OVERFLOW: u32 = 0x12;
    pub const ERR_PIN_INVALID: u32 = 0x13;
    pub const ERR_CHANNEL_IN_USE: u32 = 0x14;
    pub const ERR_MSG_PROTOCOL_ID: u32 = 0x15;
    pub const ERR_INVALID_FILTER_ID: u32 = 0x16;
    pub const ERR_NO_FLOW_CONTROL: u32 = 0x17;
    pub const ERR_NOT_UNIQUE: u32 = 0x18;
    pub const ERR_INVALID_BAUDRATE: u32 = 0x19;
    pub const ERR_INVALID_DEVICE_ID: u32 = 0x1A;
}

/// Errors reported by channel operations
///
/// All of these are caller-correctable; none of them invalidate the channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PassThruError {
    /// Message length outside the protocol's bounds, or malformed filter
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Frame protocol differs from the channel protocol
    #[error("Message protocol {found} does not match channel protocol {expected}")]
    ProtocolMismatch {
        expected: ProtocolId,
        found: ProtocolId,
    },

    #[error("Operation timed out")]
    Timeout,

    /// No frames were read
    #[error("Receive buffer empty")]
    BufferEmpty,

    /// No free periodic or filter slot
    #[error("Exceeded limit of {limit} {resource}")]
    LimitExceeded {
        resource: &'static str,
        limit: usize,
    },

    #[error("Invalid time interval: {0} ms")]
    InvalidTimeInterval(u32),

    #[error("Invalid periodic message id: {0}")]
    InvalidMessageId(u32),

    #[error("Invalid filter id: {0}")]
    InvalidFilterId(String),

    /// An identical filter is already active
    #[error("Filter is not unique")]
    NotUnique,

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("Required parameter missing: {0}")]
    NullParameter(&'static str),

    #[error("Invalid protocol id: {0}")]
    InvalidProtocolId(ProtocolId),

    /// Channel was closed
    #[error("Invalid channel id: {0}")]
    InvalidChannelId(u32),

    #[error("Device not connected")]
    DeviceNotConnected,
}

impl PassThruError {
    /// SAE J2534-1 status code for this error
    pub fn status_code(&self) -> u32 {
        match self {
            PassThruError::InvalidMessage(_) => status::ERR_INVALID_MSG,
            PassThruError::ProtocolMismatch { .. } => status::ERR_MSG_PROTOCOL_ID,
            PassThruError::Timeout => status::ERR_TIMEOUT,
            PassThruError::BufferEmpty => status::ERR_BUFFER_EMPTY,
            PassThruError::LimitExceeded { .. } => status::ERR_EXCEEDED_LIMIT,
            PassThruError::InvalidTimeInterval(_) => status::ERR_INVALID_TIME_INTERVAL,
            PassThruError::InvalidMessageId(_) => status::ERR_INVALID_MSG_ID,
            PassThruError::InvalidFilterId(_) => status::ERR_INVALID_FILTER_ID,
            PassThruError::NotUnique => status::ERR_NOT_UNIQUE,
            PassThruError::NotSupported(_) => status::ERR_NOT_SUPPORTED,
            PassThruError::Failed(_) => status::ERR_FAILED,
            PassThruError::NullParameter(_) => status::ERR_NULL_PARAMETER,
            PassThruError::InvalidProtocolId(_) => status::ERR_INVALID_PROTOCOL_ID,
            PassThruError::InvalidChannelId(_) => status::ERR_INVALID_CHANNEL_ID,
            PassThruError::DeviceNotConnected => status::ERR_DEVICE_NOT_CONNECTED,
        }
    }
}

/// Host status for any operation result
pub fn status_of<T>(result: &PassThruResult<T>) -> u32 {
    match result {
        Ok(_) => status::STATUS_NOERROR,
        Err(e) => e.status_code(),
    }
}

/// A transmit batch stopped at an invalid frame
///
/// Frames before the failing index were accepted and stay queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{source} (accepted {accepted} frame(s))")]
pub struct TransmitError {
    /// Number of frames accepted before the failure
    pub accepted: usize,
    pub source: PassThruError,
}

impl TransmitError {
    pub fn status_code(&self) -> u32 {
        self.source.status_code()
    }
}

//! Device-level errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The bus cannot accept more frames right now
    #[error("Bus busy")]
    Busy,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Action cancelled")]
    Cancelled,

    #[error("Device closed")]
    Closed,
}

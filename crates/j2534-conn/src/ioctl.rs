//! Configuration parameters and ioctl requests
//!
//! Only the data rate and loopback carry state. The timing parameters of the
//! K-line, J1850 and SCI protocols are accepted and dropped so hosts that
//! set them during setup keep going.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use j2534_core::ids::{config_param, ioctl_id};
use j2534_core::{Frame, PassThruError, PassThruResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Nominal CAN bit sample point, percent
pub const BIT_SAMPLE_POINT_NOMINAL: u32 = 80;

/// Nominal CAN synchronisation jump width, percent
pub const SYNC_JUMP_WIDTH_NOMINAL: u32 = 15;

/// Value reported for parameters without a defined reading
pub const UNKNOWN_PARAM_VALUE: u32 = 0;

/// How a parameter id is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamClass {
    DataRate,
    Loopback,
    /// Fixed electrical characteristic; reads return the constant
    ReadOnly(u32),
    /// Legacy protocol timing, accepted and dropped
    Ignored,
    /// At or above the reserved threshold
    Reserved,
    Unknown,
}

pub fn classify(param: u32) -> ParamClass {
    use config_param::*;

    if param >= RESERVED_THRESHOLD {
        return ParamClass::Reserved;
    }
    match param {
        DATA_RATE => ParamClass::DataRate,
        LOOPBACK => ParamClass::Loopback,
        BIT_SAMPLE_POINT => ParamClass::ReadOnly(BIT_SAMPLE_POINT_NOMINAL),
        SYNC_JUMP_WIDTH => ParamClass::ReadOnly(SYNC_JUMP_WIDTH_NOMINAL),
        NODE_ADDRESS | NETWORK_LINE | P1_MIN | P1_MAX | P2_MIN | P2_MAX | P3_MIN | P3_MAX
        | P4_MIN | P4_MAX | W0 | W1 | W2 | W3 | W4 | W5 | TIDLE | TINIL | TWUP | PARITY
        | T1_MAX | T2_MAX | T4_MAX | T5_MAX => ParamClass::Ignored,
        _ => ParamClass::Unknown,
    }
}

/// Live link parameters of one connection
#[derive(Debug)]
pub struct LinkSettings {
    baud_rate: AtomicU32,
    loopback: AtomicBool,
}

impl LinkSettings {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate: AtomicU32::new(baud_rate),
            loopback: AtomicBool::new(false),
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::Relaxed)
    }

    pub fn loopback(&self) -> bool {
        self.loopback.load(Ordering::Relaxed)
    }

    pub fn set(&self, param: u32, value: u32) -> PassThruResult<()> {
        match classify(param) {
            ParamClass::DataRate => {
                self.baud_rate.store(value, Ordering::Relaxed);
                debug!(baud_rate = value, "Data rate set");
            }
            ParamClass::Loopback => {
                self.loopback.store(value != 0, Ordering::Relaxed);
                debug!(loopback = value != 0, "Loopback set");
            }
            ParamClass::Ignored | ParamClass::ReadOnly(_) => {
                debug!(param = format!("0x{:02X}", param), value, "Config parameter accepted and ignored");
            }
            ParamClass::Reserved => {
                return Err(PassThruError::NotSupported(format!(
                    "config parameter 0x{:02X}",
                    param
                )));
            }
            ParamClass::Unknown => {
                warn!(param = format!("0x{:02X}", param), value, "Unknown SET_CONFIG parameter");
            }
        }
        Ok(())
    }

    pub fn get(&self, param: u32) -> u32 {
        match classify(param) {
            ParamClass::DataRate => self.baud_rate(),
            ParamClass::Loopback => u32::from(self.loopback()),
            ParamClass::ReadOnly(value) => value,
            ParamClass::Ignored | ParamClass::Reserved | ParamClass::Unknown => {
                warn!(param = format!("0x{:02X}", param), "Unknown GET_CONFIG parameter");
                UNKNOWN_PARAM_VALUE
            }
        }
    }
}

/// One parameter/value pair of a GET_CONFIG or SET_CONFIG list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SConfig {
    pub parameter: u32,
    pub value: u32,
}

/// A decoded ioctl request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ioctl {
    GetConfig(Vec<u32>),
    SetConfig(Vec<SConfig>),
    ClearTxBuffer,
    ClearRxBuffer,
    ClearPeriodicMsgs,
    ClearMsgFilters,
    FiveBaudInit(Vec<u8>),
    FastInit(Frame),
    /// Any other ioctl id; accepted without effect
    Other(u32),
}

impl Ioctl {
    pub fn id(&self) -> u32 {
        match self {
            Ioctl::GetConfig(_) => ioctl_id::GET_CONFIG,
            Ioctl::SetConfig(_) => ioctl_id::SET_CONFIG,
            Ioctl::ClearTxBuffer => ioctl_id::CLEAR_TX_BUFFER,
            Ioctl::ClearRxBuffer => ioctl_id::CLEAR_RX_BUFFER,
            Ioctl::ClearPeriodicMsgs => ioctl_id::CLEAR_PERIODIC_MSGS,
            Ioctl::ClearMsgFilters => ioctl_id::CLEAR_MSG_FILTERS,
            Ioctl::FiveBaudInit(_) => ioctl_id::FIVE_BAUD_INIT,
            Ioctl::FastInit(_) => ioctl_id::FAST_INIT,
            Ioctl::Other(id) => *id,
        }
    }
}

/// What an ioctl hands back to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlOutput {
    None,
    Config(Vec<SConfig>),
    Bytes(Bytes),
    Frame(Frame),
}

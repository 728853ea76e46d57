//! Raw identifiers used across the host boundary

/// Configuration parameter identifiers (SET_CONFIG / GET_CONFIG)
pub mod config_param {
    pub const DATA_RATE: u32 = 0x01;
    pub const LOOPBACK: u32 = 0x03;
    pub const NODE_ADDRESS: u32 = 0x04;
    pub const NETWORK_LINE: u32 = 0x05;
    pub const P1_MIN: u32 = 0x06;
    pub const P1_MAX: u32 = 0x07;
    pub const P2_MIN: u32 = 0x08;
    pub const P2_MAX: u32 = 0x09;
    pub const P3_MIN: u32 = 0x0A;
    pub const P3_MAX: u32 = 0x0B;
    pub const P4_MIN: u32 = 0x0C;
    pub const P4_MAX: u32 = 0x0D;
    pub const W1: u32 = 0x0E;
    pub const W2: u32 = 0x0F;
    pub const W3: u32 = 0x10;
    pub const W4: u32 = 0x11;
    pub const W5: u32 = 0x12;
    pub const TIDLE: u32 = 0x13;
    pub const TINIL: u32 = 0x14;
    pub const TWUP: u32 = 0x15;
    pub const PARITY: u32 = 0x16;
    pub const BIT_SAMPLE_POINT: u32 = 0x17;
    pub const SYNC_JUMP_WIDTH: u32 = 0x18;
    pub const W0: u32 = 0x19;
    pub const T1_MAX: u32 = 0x1A;
    pub const T2_MAX: u32 = 0x1B;
    pub const T4_MAX: u32 = 0x1C;
    pub const T5_MAX: u32 = 0x1D;
    pub const ISO15765_BS: u32 = 0x1E;
    pub const ISO15765_STMIN: u32 = 0x1F;
    pub const DATA_BITS: u32 = 0x20;
    pub const FIVE_BAUD_MOD: u32 = 0x21;
    pub const BS_TX: u32 = 0x22;
    pub const STMIN_TX: u32 = 0x23;
    pub const T3_MAX: u32 = 0x24;
    pub const ISO15765_WFT_MAX: u32 = 0x25;

    /// Identifiers at or above this value need special equipment
    pub const RESERVED_THRESHOLD: u32 = 0x20;
}

/// Ioctl identifiers
pub mod ioctl_id {
    pub const GET_CONFIG: u32 = 0x01;
    pub const SET_CONFIG: u32 = 0x02;
    pub const READ_VBATT: u32 = 0x03;
    pub const FIVE_BAUD_INIT: u32 = 0x04;
    pub const FAST_INIT: u32 = 0x05;
    pub const CLEAR_TX_BUFFER: u32 = 0x07;
    pub const CLEAR_RX_BUFFER: u32 = 0x08;
    pub const CLEAR_PERIODIC_MSGS: u32 = 0x09;
    pub const CLEAR_MSG_FILTERS: u32 = 0x0A;
    pub const CLEAR_FUNCT_MSG_LOOKUP_TABLE: u32 = 0x0B;
    pub const ADD_TO_FUNCT_MSG_LOOKUP_TABLE: u32 = 0x0C;
    pub const DELETE_FROM_FUNCT_MSG_LOOKUP_TABLE: u32 = 0x0D;
    pub const READ_PROG_VOLTAGE: u32 = 0x0E;
}

/// Filter type identifiers
pub mod filter_type {
    pub const PASS_FILTER: u32 = 0x01;
    pub const BLOCK_FILTER: u32 = 0x02;
    pub const FLOW_CONTROL_FILTER: u32 = 0x03;
}

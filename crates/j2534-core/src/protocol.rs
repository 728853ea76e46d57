//! Protocol identifiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Diagnostic protocol a channel is bound to
///
/// Hosts pass raw numeric identifiers, so this is an open newtype rather than
/// a closed enum. Unknown values are representable and rejected later, when a
/// channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(pub u32);

impl ProtocolId {
    pub const J1850VPW: Self = Self(0x01);
    pub const J1850PWM: Self = Self(0x02);
    pub const ISO9141: Self = Self(0x03);
    pub const ISO14230: Self = Self(0x04);
    pub const CAN: Self = Self(0x05);
    pub const ISO15765: Self = Self(0x06);
    pub const SCI_A_ENGINE: Self = Self(0x07);
    pub const SCI_A_TRANS: Self = Self(0x08);
    pub const SCI_B_ENGINE: Self = Self(0x09);
    pub const SCI_B_TRANS: Self = Self(0x0A);

    const NAMES: [(Self, &'static str); 10] = [
        (Self::J1850VPW, "J1850VPW"),
        (Self::J1850PWM, "J1850PWM"),
        (Self::ISO9141, "ISO9141"),
        (Self::ISO14230, "ISO14230"),
        (Self::CAN, "CAN"),
        (Self::ISO15765, "ISO15765"),
        (Self::SCI_A_ENGINE, "SCI_A_ENGINE"),
        (Self::SCI_A_TRANS, "SCI_A_TRANS"),
        (Self::SCI_B_ENGINE, "SCI_B_ENGINE"),
        (Self::SCI_B_TRANS, "SCI_B_TRANS"),
    ];

    /// Raw identifier as passed over the host boundary
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Standard name, if this is one of the SAE J2534-1 protocols
    pub fn name(self) -> Option<&'static str> {
        Self::NAMES
            .iter()
            .find(|(id, _)| *id == self)
            .map(|(_, name)| *name)
    }

    /// Whether frames of this protocol start with a 4-byte CAN identifier
    pub fn is_can_family(self) -> bool {
        self == Self::CAN || self == Self::ISO15765
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:X}", self.0),
        }
    }
}

impl FromStr for ProtocolId {
    type Err = String;

    /// Accepts a standard name (case-insensitive), a decimal id or a `0x` hex id
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((id, _)) = Self::NAMES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(s))
        {
            return Ok(*id);
        }

        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse::<u32>(),
        };
        parsed
            .map(Self)
            .map_err(|_| format!("Unknown protocol '{}'", s))
    }
}

impl Serialize for ProtocolId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.name() {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_u32(self.0),
        }
    }
}

impl<'de> Deserialize<'de> for ProtocolId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Id(u32),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Id(id) => Ok(Self(id)),
            Repr::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

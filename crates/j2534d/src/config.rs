//! Bench configuration
//!
//! A bench describes the channels to open on the virtual bus and the
//! simulated nodes answering on it.

use j2534_conn::config::{ChannelConfig, ConnectionOptions, FilterConfig, PeriodicConfig};
use j2534_conn::{FilterKind, ProtocolId};
use serde::{Deserialize, Serialize};

/// Complete bench configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Device tuning shared by all channels
    #[serde(default)]
    pub device: ConnectionOptions,

    #[serde(default, rename = "channel")]
    pub channels: Vec<BenchChannel>,

    /// Simulated ECUs
    #[serde(default, rename = "responder")]
    pub responders: Vec<ResponderConfig>,
}

/// One channel opened at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchChannel {
    /// Name used in log output
    pub name: String,

    #[serde(flatten)]
    pub channel: ChannelConfig,

    /// Echo transmitted frames back into the channel
    #[serde(default)]
    pub loopback: bool,

    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterConfig>,

    #[serde(default)]
    pub periodic: Vec<PeriodicConfig>,
}

/// A simulated node answering one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    /// CAN ID the request arrives on (e.g., "0x7DF")
    pub request_id: String,

    /// Leading payload bytes the request must carry; any payload if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,

    /// CAN ID the response is sent from
    pub response_id: String,

    /// Response payload bytes
    pub response: String,

    /// Use 29-bit identifiers
    #[serde(default)]
    pub extended: bool,
}

impl BenchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// OBD-II bench: one CAN channel polling engine speed from a simulated ECM
    pub fn default_bench() -> Self {
        let mut channel = ChannelConfig::new(ProtocolId::CAN);
        channel.baud_rate = 500000;

        Self {
            device: ConnectionOptions::default(),
            channels: vec![BenchChannel {
                name: "obd".to_string(),
                channel,
                loopback: false,
                filters: vec![FilterConfig {
                    kind: FilterKind::Pass,
                    mask: "FFFFFFFF".to_string(),
                    pattern: "000007E8".to_string(),
                    flow_control: None,
                    tx_flags: 0,
                }],
                periodic: vec![PeriodicConfig {
                    // Service 01 PID 0C, engine speed
                    data: "000007DF 02 01 0C".to_string(),
                    interval_ms: 1000,
                    tx_flags: 0,
                }],
            }],
            responders: vec![ResponderConfig {
                request_id: "0x7DF".to_string(),
                request: Some("02 01 0C".to_string()),
                response_id: "0x7E8".to_string(),
                // 0x1AF8 / 4 = 1726 rpm
                response: "04 41 0C 1A F8".to_string(),
                extended: false,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_bench_file() {
        let toml = r#"
[device]
rx_poll_interval_ms = 5

[[channel]]
name = "body"
protocol = "CAN"
baud_rate = 250000
loopback = true

[[channel.filter]]
kind = "block"
mask = "FFFFFFFF"
pattern = "00000100"

[[channel.periodic]]
data = "000007E0 02 3E 80"
interval_ms = 2000

[[channel]]
name = "isotp"
protocol = 6
flags = 0x100

[[responder]]
request_id = "0x7E0"
response_id = "0x7E8"
response = "02 7E 00"
"#;
        let bench: BenchConfig = toml::from_str(toml).unwrap();

        assert_eq!(bench.device.rx_poll_interval_ms, 5);
        assert_eq!(bench.channels.len(), 2);

        let body = &bench.channels[0];
        assert_eq!(body.name, "body");
        assert_eq!(body.channel.protocol, ProtocolId::CAN);
        assert_eq!(body.channel.baud_rate, 250000);
        assert!(body.loopback);
        assert_eq!(body.filters[0].kind, FilterKind::Block);
        assert_eq!(body.periodic[0].interval_ms, 2000);

        let isotp = &bench.channels[1];
        assert_eq!(isotp.channel.protocol, ProtocolId::ISO15765);
        assert_eq!(isotp.channel.flags, 0x100);
        assert_eq!(isotp.channel.baud_rate, 500000);
        assert!(isotp.filters.is_empty());

        assert_eq!(bench.responders[0].request, None);
        assert!(!bench.responders[0].extended);
    }

    #[test]
    fn test_empty_bench_file() {
        let bench: BenchConfig = toml::from_str("").unwrap();
        assert!(bench.channels.is_empty());
        assert_eq!(bench.device.rx_poll_interval_ms, 2);
    }

    #[test]
    fn test_default_bench_frames_parse() {
        let bench = BenchConfig::default_bench();
        let obd = &bench.channels[0];

        let (_, pattern, _) = obd.filters[0].frames(ProtocolId::CAN).unwrap();
        assert_eq!(pattern.can_id(), Some(0x7E8));

        let frame = obd.periodic[0].frame(ProtocolId::CAN).unwrap();
        assert_eq!(frame.can_id(), Some(0x7DF));
    }
}

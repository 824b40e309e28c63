//! ISO-TP and UDS client configuration

use serde::{Deserialize, Serialize};

/// Per-endpoint ISO-TP parameters.
///
/// `tx_id`/`rx_id` must differ, and within one core each `rx_id` binds at
/// most one endpoint. Timer defaults follow ISO 15765-2 common practice
/// (1000 ms each); the padding byte is OEM-dependent and defaults to 0xCC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoTpConfig {
    /// CAN ID we transmit on (tester → ECU)
    pub tx_id: u32,
    /// CAN ID we receive on (ECU → tester)
    pub rx_id: u32,
    /// Block size advertised in our FlowControl (0 = no limit)
    #[serde(default)]
    pub block_size: u8,
    /// STmin advertised in our FlowControl (raw byte: 0..=0x7F ms,
    /// 0xF1..=0xF9 for 100..900 µs)
    #[serde(default)]
    pub st_min: u8,
    /// Padding byte for classic CAN frames
    #[serde(default = "default_padding")]
    pub padding: u8,
    /// Use CAN-FD frame sizes
    #[serde(default)]
    pub fd: bool,
    /// Frame transmit timeout (N_As), milliseconds
    #[serde(default = "default_timer_ms")]
    pub n_as_ms: u64,
    /// FlowControl wait timeout (N_Bs), milliseconds
    #[serde(default = "default_timer_ms")]
    pub n_bs_ms: u64,
    /// Consecutive frame timeout (N_Cr), milliseconds
    #[serde(default = "default_timer_ms")]
    pub n_cr_ms: u64,
    /// Consecutive FC(WAIT) frames tolerated before aborting
    #[serde(default = "default_wait_limit")]
    pub wait_limit: u8,
}

impl IsoTpConfig {
    /// Endpoint config with default timers and padding.
    pub fn new(tx_id: u32, rx_id: u32) -> Self {
        Self {
            tx_id,
            rx_id,
            block_size: 0,
            st_min: 0,
            padding: default_padding(),
            fd: false,
            n_as_ms: default_timer_ms(),
            n_bs_ms: default_timer_ms(),
            n_cr_ms: default_timer_ms(),
            wait_limit: default_wait_limit(),
        }
    }
}

fn default_padding() -> u8 {
    0xCC
}

fn default_timer_ms() -> u64 {
    1000
}

fn default_wait_limit() -> u8 {
    8
}

/// UDS client timing and keepalive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdsClientConfig {
    /// Normal response window (P2), milliseconds
    #[serde(default = "default_p2_ms")]
    pub p2_ms: u64,
    /// Extended window after NRC 0x78 (P2*), milliseconds
    #[serde(default = "default_p2_ext_ms")]
    pub p2_ext_ms: u64,
    /// Pending request queue depth; overflow rejects synchronously
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Tester-present keepalive
    #[serde(default)]
    pub tester_present: TesterPresentConfig,
}

impl Default for UdsClientConfig {
    fn default() -> Self {
        Self {
            p2_ms: default_p2_ms(),
            p2_ext_ms: default_p2_ext_ms(),
            queue_depth: default_queue_depth(),
            tester_present: TesterPresentConfig::default(),
        }
    }
}

fn default_p2_ms() -> u64 {
    1000
}

fn default_p2_ext_ms() -> u64 {
    5000
}

fn default_queue_depth() -> usize {
    32
}

/// Tester-present (0x3E) keepalive configuration. Always sent with
/// sub-function 0x80 (suppress positive response) to avoid response
/// traffic on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesterPresentConfig {
    /// Start keepalive automatically when leaving the default session
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Keepalive interval, milliseconds; the timer resets on any
    /// successful request
    #[serde(default = "default_tp_interval_ms")]
    pub interval_ms: u64,
}

impl Default for TesterPresentConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_tp_interval_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tp_interval_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isotp_defaults_match_iso_practice() {
        let cfg = IsoTpConfig::new(0x7E0, 0x7E8);
        assert_eq!(cfg.padding, 0xCC);
        assert_eq!(cfg.block_size, 0);
        assert_eq!(cfg.st_min, 0);
        assert_eq!((cfg.n_as_ms, cfg.n_bs_ms, cfg.n_cr_ms), (1000, 1000, 1000));
        assert_eq!(cfg.wait_limit, 8);
    }

    #[test]
    fn uds_defaults_match_documented_timers() {
        let cfg = UdsClientConfig::default();
        assert_eq!(cfg.p2_ms, 1000);
        assert_eq!(cfg.p2_ext_ms, 5000);
        assert_eq!(cfg.queue_depth, 32);
        assert!(cfg.tester_present.enabled);
        assert_eq!(cfg.tester_present.interval_ms, 2000);
    }

    #[test]
    fn isotp_config_deserializes_with_defaults() {
        let cfg: IsoTpConfig =
            serde_json::from_str(r#"{ "tx_id": 2016, "rx_id": 2024, "st_min": 5 }"#).unwrap();
        assert_eq!(cfg.tx_id, 0x7E0);
        assert_eq!(cfg.rx_id, 0x7E8);
        assert_eq!(cfg.st_min, 5);
        assert_eq!(cfg.padding, 0xCC);
    }
}

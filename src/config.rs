//! Board capability configuration.
//!
//! One [`BoardConfig`] value is selected at startup (a named preset or a JSON
//! board file) and handed to every component that needs pin numbers, hub
//! addresses or timing constants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PORTS_PER_HUB: usize = 4;
pub const MAX_HUB_SLOTS: usize = 8;
/// Hub N (1-based) answers at `HUB_BASE_ADDRESS + N`.
pub const HUB_BASE_ADDRESS: u8 = 0x17;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown board preset '{0}'")]
    UnknownBoard(String),
    #[error("invalid board file: {0}")]
    Parse(String),
    #[error("board must define 1..=8 hubs, got {0}")]
    HubCount(usize),
    #[error("hub address 0x{0:02x} is not a 7-bit address")]
    BadAddress(u8),
    #[error("hub address 0x{0:02x} listed twice")]
    DuplicateAddress(u8),
    #[error("timing value '{0}' must be non-zero")]
    ZeroTiming(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinMap {
    pub boot: u8,
    pub reset: u8,
    pub status_led: u8,
    pub activity_led: u8,
    pub error_led: u8,
    pub estop_input: Option<u8>,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            boot: 4,
            reset: 5,
            status_led: 38,
            activity_led: 39,
            error_led: 40,
            estop_input: Some(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub estop_hold_ms: u32,
    pub broadcast_interval_ms: u32,
    pub heartbeat_interval_ms: u32,
    pub activity_pulse_ms: u32,
    pub watchdog_timeout_ms: u32,
    pub alloff_reset_pulse_ms: u32,
    pub log_export_budget_ms: u32,
    pub log_export_max: u16,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            estop_hold_ms: 500,
            broadcast_interval_ms: 2000,
            heartbeat_interval_ms: 1000,
            activity_pulse_ms: 50,
            watchdog_timeout_ms: 5000,
            alloff_reset_pulse_ms: 100,
            log_export_budget_ms: 200,
            log_export_max: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub name: String,
    pub hub_addresses: Vec<u8>,
    pub pins: PinMap,
    pub timing: TimingConfig,
    /// Current-limit bit written as part of the safe default.
    pub default_current_high: bool,
    /// Light the hub LED once the hub has been initialised.
    pub led_on_connect: bool,
    pub max_pulse_ms: u32,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            name: "s3-devkit".into(),
            hub_addresses: default_hub_addresses(MAX_HUB_SLOTS),
            pins: PinMap::default(),
            timing: TimingConfig::default(),
            default_current_high: true,
            led_on_connect: false,
            max_pulse_ms: 5000,
        }
    }
}

fn default_hub_addresses(count: usize) -> Vec<u8> {
    (1..=count as u8).map(|hub| HUB_BASE_ADDRESS + hub).collect()
}

impl BoardConfig {
    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "s3-devkit" => Ok(Self::default()),
            "c3-mini" => Ok(Self {
                name: "c3-mini".into(),
                hub_addresses: default_hub_addresses(2),
                pins: PinMap {
                    boot: 9,
                    reset: 10,
                    status_led: 2,
                    activity_led: 3,
                    error_led: 4,
                    estop_input: None,
                },
                led_on_connect: true,
                ..Self::default()
            }),
            other => Err(ConfigError::UnknownBoard(other.to_string())),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let count = self.hub_addresses.len();
        if count == 0 || count > MAX_HUB_SLOTS {
            return Err(ConfigError::HubCount(count));
        }

        for (i, &address) in self.hub_addresses.iter().enumerate() {
            if address > 0x7F {
                return Err(ConfigError::BadAddress(address));
            }
            if self.hub_addresses[..i].contains(&address) {
                return Err(ConfigError::DuplicateAddress(address));
            }
        }

        let timing = &self.timing;
        let required = [
            ("estop_hold_ms", timing.estop_hold_ms),
            ("broadcast_interval_ms", timing.broadcast_interval_ms),
            ("heartbeat_interval_ms", timing.heartbeat_interval_ms),
            ("activity_pulse_ms", timing.activity_pulse_ms),
            ("watchdog_timeout_ms", timing.watchdog_timeout_ms),
        ];
        if let Some((name, _)) = required.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroTiming(*name));
        }

        Ok(())
    }

    pub fn max_hubs(&self) -> usize {
        self.hub_addresses.len()
    }

    pub fn total_ports(&self) -> usize {
        self.max_hubs() * PORTS_PER_HUB
    }
}

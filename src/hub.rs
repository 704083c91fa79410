//! Register-level control of the GPIO-expander hubs.
//!
//! Each hub is one expander whose 8-bit output register drives the port power
//! switches, the hub LED and the current-limit select. The controller keeps a
//! shadow copy of every output register and always writes the full byte; the
//! devices are never read back, so the shadow is the ground truth.

use crate::config::{BoardConfig, PORTS_PER_HUB};
use crate::hal::{wait_serviced, I2cBus, Platform};
use crate::health::I2cHealth;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use tracing::{debug, info, warn};

pub const REG_OUTPUT: u8 = 0x01;
pub const REG_POLARITY: u8 = 0x02;
pub const REG_CONFIG: u8 = 0x03;

pub const BIT_CURRENT_LIMIT: u8 = 0;
pub const BIT_VBUS_PATH: u8 = 1;
pub const BIT_LED: u8 = 3;
pub const PORT_BIT_BASE: u8 = 4;

const_assert_eq!(PORT_BIT_BASE as usize + PORTS_PER_HUB, 8);

pub const DEFAULT_MAX_RETRIES: u8 = 3;
const BACKOFF_STEP_MS: u32 = 10;

const PORT_MASK: u8 = 0xF0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerLevel {
    Off,
    Low,
    High,
}

impl PowerLevel {
    /// Wire literal. Matching is case-sensitive.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(Self::Off),
            "low" => Some(Self::Low),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

#[inline]
fn port_bit(index: usize) -> u8 {
    1 << (PORT_BIT_BASE as usize + index)
}

/// Zero-based hub for an absolute 1-based port number.
#[inline]
pub fn port_to_hub(port: usize) -> usize {
    (port - 1) / PORTS_PER_HUB
}

/// Zero-based position of a port on its hub.
#[inline]
pub fn port_to_index(port: usize) -> usize {
    (port - 1) % PORTS_PER_HUB
}

/// Inverse of [`port_to_hub`] / [`port_to_index`].
#[inline]
pub fn port_number(hub: usize, index: usize) -> usize {
    hub * PORTS_PER_HUB + index + 1
}

#[derive(Debug, Clone)]
pub struct Hub {
    index: usize,
    address: u8,
    connected: bool,
    register: u8,
    desired: [PowerLevel; PORTS_PER_HUB],
}

impl Hub {
    fn new(index: usize, address: u8, register: u8) -> Self {
        Self {
            index,
            address,
            connected: false,
            register,
            desired: [PowerLevel::Off; PORTS_PER_HUB],
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Shadow of the last output byte written (or about to be written).
    pub fn register(&self) -> u8 {
        self.register
    }

    pub fn led(&self) -> bool {
        self.bit(BIT_LED)
    }

    pub fn current_high(&self) -> bool {
        self.bit(BIT_CURRENT_LIMIT)
    }

    pub fn vbus(&self) -> bool {
        self.bit(BIT_VBUS_PATH)
    }

    pub fn port_enabled(&self, index: usize) -> bool {
        index < PORTS_PER_HUB && self.register & port_bit(index) != 0
    }

    pub fn desired(&self, index: usize) -> PowerLevel {
        self.desired.get(index).copied().unwrap_or(PowerLevel::Off)
    }

    fn bit(&self, bit: u8) -> bool {
        self.register & (1 << bit) != 0
    }

    fn assign(&mut self, bit: u8, on: bool) {
        if on {
            self.register |= 1 << bit;
        } else {
            self.register &= !(1 << bit);
        }
    }

    /// Select the shared current limit. Every enabled port follows it.
    fn set_limit(&mut self, high: bool) {
        self.assign(BIT_CURRENT_LIMIT, high);
        let level = self.limit_level();
        for index in 0..PORTS_PER_HUB {
            if self.port_enabled(index) {
                self.desired[index] = level;
            }
        }
    }

    fn limit_level(&self) -> PowerLevel {
        if self.current_high() {
            PowerLevel::High
        } else {
            PowerLevel::Low
        }
    }

    pub fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            hub: self.index + 1,
            address: self.address,
            connected: self.connected,
            register: self.register,
            led: self.led(),
            power: self.limit_level(),
            usbc: self.vbus(),
            ports: (0..PORTS_PER_HUB)
                .map(|i| PortSnapshot {
                    port: port_number(self.index, i),
                    enabled: self.port_enabled(i),
                    power: self.desired[i],
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortSnapshot {
    pub port: usize,
    pub enabled: bool,
    pub power: PowerLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubSnapshot {
    pub hub: usize,
    pub address: u8,
    pub connected: bool,
    pub register: u8,
    pub led: bool,
    pub power: PowerLevel,
    pub usbc: bool,
    pub ports: Vec<PortSnapshot>,
}

/// Owner of the I2C bus and of every hub's shadow register.
#[derive(Debug)]
pub struct HubController<B: I2cBus> {
    bus: B,
    hubs: Vec<Hub>,
    health: I2cHealth,
    safe_default: u8,
    led_on_connect: bool,
}

impl<B: I2cBus> HubController<B> {
    pub fn new(bus: B, config: &BoardConfig) -> Self {
        let safe_default = if config.default_current_high {
            1 << BIT_CURRENT_LIMIT
        } else {
            0
        };

        Self {
            bus,
            hubs: config
                .hub_addresses
                .iter()
                .enumerate()
                .map(|(i, &address)| Hub::new(i, address, safe_default))
                .collect(),
            health: I2cHealth::new(),
            safe_default,
            led_on_connect: config.led_on_connect,
        }
    }

    /// Output byte with every port and the LED off.
    pub fn safe_default(&self) -> u8 {
        self.safe_default
    }

    /// Probe every configured address once and initialise the hubs that answer.
    ///
    /// Hubs that do not answer stay absent for the rest of the run.
    pub fn probe_and_init<P: Platform + ?Sized>(&mut self, platform: &mut P) -> Vec<usize> {
        let mut connected = Vec::new();

        for i in 0..self.hubs.len() {
            let address = self.hubs[i].address;
            platform.feed_watchdog();

            if let Err(e) = self.bus.write(address, &[]) {
                info!("hub {} (0x{:02x}) not present: {}", i + 1, address, e);
                continue;
            }

            let mut initial = self.safe_default;
            if self.led_on_connect {
                initial |= 1 << BIT_LED;
            }

            let ready = self.write_register(platform, address, REG_CONFIG, 0x00, DEFAULT_MAX_RETRIES)
                && self.write_register(platform, address, REG_POLARITY, 0x00, DEFAULT_MAX_RETRIES)
                && self.write_register(platform, address, REG_OUTPUT, initial, DEFAULT_MAX_RETRIES);

            let hub = &mut self.hubs[i];
            hub.register = initial;
            hub.desired = [PowerLevel::Off; PORTS_PER_HUB];
            if ready {
                hub.connected = true;
                connected.push(i);
                info!("hub {} initialised at 0x{:02x}", i + 1, address);
            } else {
                warn!("hub {} answered probe but init writes failed", i + 1);
            }
        }

        connected
    }

    /// Write one register, retrying with a growing backoff.
    ///
    /// Makes exactly `max_retries` attempts, so `0` fails without touching the
    /// bus. Returns `false` once every attempt has failed; the health tracker
    /// then records exactly one failure for the whole operation.
    pub fn write_register<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        address: u8,
        register: u8,
        value: u8,
        max_retries: u8,
    ) -> bool {
        for attempt in 1..=max_retries {
            match self.bus.write(address, &[register, value]) {
                Ok(()) => {
                    self.health.record_success(platform.millis());
                    return true;
                }
                Err(e) => {
                    debug!(
                        "write 0x{:02x}[0x{:02x}]=0x{:02x} attempt {}/{} failed: {}",
                        address, register, value, attempt, max_retries, e
                    );
                    if attempt < max_retries {
                        wait_serviced(platform, BACKOFF_STEP_MS * u32::from(attempt));
                    }
                }
            }
        }

        warn!(
            "write 0x{:02x}[0x{:02x}] gave up after {} attempts",
            address, register, max_retries
        );
        self.health.record_failure(platform.millis());
        false
    }

    /// Apply `mutate` to the shadow register, then push the whole byte.
    fn commit<P, F>(&mut self, hub: usize, platform: &mut P, mutate: F) -> bool
    where
        P: Platform + ?Sized,
        F: FnOnce(&mut Hub),
    {
        let Some(entry) = self.hubs.get_mut(hub) else {
            return false;
        };
        if !entry.connected {
            return false;
        }

        mutate(entry);
        let (address, value) = (entry.address, entry.register);
        self.write_register(platform, address, REG_OUTPUT, value, DEFAULT_MAX_RETRIES)
    }

    pub fn set_port<P: Platform + ?Sized>(
        &mut self,
        hub: usize,
        index: usize,
        enable: bool,
        platform: &mut P,
    ) -> bool {
        if index >= PORTS_PER_HUB {
            return false;
        }
        self.commit(hub, platform, |h| {
            h.assign(PORT_BIT_BASE + index as u8, enable);
            h.desired[index] = if enable { h.limit_level() } else { PowerLevel::Off };
        })
    }

    /// `Low`/`High` also select the hub-wide current limit, which the four
    /// ports of a hub share, so every other enabled port moves to the same level.
    pub fn set_port_power<P: Platform + ?Sized>(
        &mut self,
        hub: usize,
        index: usize,
        level: PowerLevel,
        platform: &mut P,
    ) -> bool {
        if index >= PORTS_PER_HUB {
            return false;
        }
        self.commit(hub, platform, |h| {
            match level {
                PowerLevel::Off => {
                    h.assign(PORT_BIT_BASE + index as u8, false);
                    h.desired[index] = PowerLevel::Off;
                }
                PowerLevel::Low | PowerLevel::High => {
                    h.assign(PORT_BIT_BASE + index as u8, true);
                    h.set_limit(level == PowerLevel::High);
                }
            }
        })
    }

    pub fn set_hub_led<P: Platform + ?Sized>(&mut self, hub: usize, on: bool, platform: &mut P) -> bool {
        self.commit(hub, platform, |h| h.assign(BIT_LED, on))
    }

    pub fn set_hub_power<P: Platform + ?Sized>(&mut self, hub: usize, high: bool, platform: &mut P) -> bool {
        self.commit(hub, platform, |h| h.set_limit(high))
    }

    pub fn set_hub_vbus<P: Platform + ?Sized>(&mut self, hub: usize, on: bool, platform: &mut P) -> bool {
        self.commit(hub, platform, |h| h.assign(BIT_VBUS_PATH, on))
    }

    /// Switch all four ports of a hub at once.
    pub fn set_hub_ports<P: Platform + ?Sized>(&mut self, hub: usize, on: bool, platform: &mut P) -> bool {
        self.commit(hub, platform, |h| {
            let level = if on { h.limit_level() } else { PowerLevel::Off };
            if on {
                h.register |= PORT_MASK;
            } else {
                h.register &= !PORT_MASK;
            }
            h.desired = [level; PORTS_PER_HUB];
        })
    }

    /// Drive every connected hub to the safe default. Returns `false` if any
    /// write failed; the shadows are reset either way.
    pub fn all_off<P: Platform + ?Sized>(&mut self, platform: &mut P) -> bool {
        let safe = self.safe_default;
        let mut all_ok = true;

        for hub in 0..self.hubs.len() {
            self.hubs[hub].desired = [PowerLevel::Off; PORTS_PER_HUB];
            if !self.hubs[hub].connected {
                continue;
            }
            all_ok &= self.commit(hub, platform, |h| h.register = safe);
        }

        all_ok
    }

    pub fn hubs(&self) -> &[Hub] {
        &self.hubs
    }

    pub fn hub(&self, hub: usize) -> Option<&Hub> {
        self.hubs.get(hub)
    }

    pub fn is_connected(&self, hub: usize) -> bool {
        self.hubs.get(hub).is_some_and(Hub::is_connected)
    }

    pub fn connected_count(&self) -> usize {
        self.hubs.iter().filter(|h| h.connected).count()
    }

    /// Desired level of an absolute port, `None` when out of range.
    pub fn port_power(&self, port: usize) -> Option<PowerLevel> {
        if port == 0 {
            return None;
        }
        self.hubs
            .get(port_to_hub(port))
            .map(|h| h.desired(port_to_index(port)))
    }

    pub fn health(&self) -> &I2cHealth {
        &self.health
    }

    pub fn snapshot(&self) -> Vec<HubSnapshot> {
        self.hubs.iter().map(Hub::snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_mapping_round_trip() {
        for port in 1..=32 {
            let hub = port_to_hub(port);
            let index = port_to_index(port);
            assert!(hub < 8);
            assert!(index < PORTS_PER_HUB);
            assert_eq!(port_number(hub, index), port);
        }
        assert_eq!((port_to_hub(5), port_to_index(5)), (1, 0));
        assert_eq!((port_to_hub(4), port_to_index(4)), (0, 3));
    }

    #[test]
    fn test_power_level_literals() {
        assert_eq!(PowerLevel::parse("high"), Some(PowerLevel::High));
        assert_eq!(PowerLevel::parse("HIGH"), None);
        assert_eq!(PowerLevel::Low.as_str(), "low");
    }
}

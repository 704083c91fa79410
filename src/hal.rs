//! Hardware seams used by the controller core.
//!
//! The core never touches a peripheral directly. Everything it needs from the
//! board goes through the traits below so the same code drives real hardware
//! and the [`crate::sim`] fakes used by the simulator and the tests.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Waits longer than this are split so the watchdog is fed in between.
pub const WAIT_CHUNK_MS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("device 0x{0:02x} did not acknowledge")]
    Nack(u8),
    #[error("bus arbitration lost")]
    ArbitrationLost,
    #[error("bus timeout")]
    Timeout,
}

/// I2C bus master.
///
/// Only writes are required: the expander outputs are treated as write-only
/// and a zero-length write is used as the presence probe.
pub trait I2cBus {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusError>;
}

/// Digital output pin.
pub trait OutputPin {
    fn set_level(&mut self, high: bool);

    fn level(&self) -> bool;

    fn set_high(&mut self) {
        self.set_level(true);
    }

    fn set_low(&mut self) {
        self.set_level(false);
    }

    fn toggle(&mut self) {
        let level = self.level();
        self.set_level(!level);
    }
}

/// Time, delays and the liveness supervisor.
pub trait Platform {
    /// Monotonic millisecond tick. Wraps at `u32::MAX`.
    fn millis(&self) -> u32;

    /// Seconds since the Unix epoch, `None` while the clock is unsynchronized.
    fn wall_clock_secs(&self) -> Option<u64>;

    /// Busy wait. Callers keep individual waits short, see [`wait_serviced`].
    fn delay_ms(&mut self, ms: u32);

    fn feed_watchdog(&mut self);
}

/// Rollover-safe elapsed time between two ticks.
#[inline]
pub fn elapsed_ms(now: u32, start: u32) -> u32 {
    now.wrapping_sub(start)
}

#[inline]
pub fn interval_elapsed(now: u32, start: u32, interval_ms: u32) -> bool {
    elapsed_ms(now, start) >= interval_ms
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub value: u64,
    /// True when `value` is wall-clock seconds, false when it is the tick.
    pub synced: bool,
}

pub fn timestamp<P: Platform + ?Sized>(platform: &P) -> Timestamp {
    match platform.wall_clock_secs() {
        Some(secs) => Timestamp { value: secs, synced: true },
        None => Timestamp { value: u64::from(platform.millis()), synced: false },
    }
}

/// Blocking wait that keeps the watchdog serviced.
pub fn wait_serviced<P: Platform + ?Sized>(platform: &mut P, ms: u32) {
    let mut remaining = ms;
    while remaining > WAIT_CHUNK_MS {
        platform.delay_ms(WAIT_CHUNK_MS);
        platform.feed_watchdog();
        remaining -= WAIT_CHUNK_MS;
    }
    if remaining > 0 {
        platform.delay_ms(remaining);
    }
    platform.feed_watchdog();
}

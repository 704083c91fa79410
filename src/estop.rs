//! Emergency stop.
//!
//! The asynchronous side (an interrupt on real boards, a signal handler in the
//! simulator) only ever calls [`EmergencyTrigger::fire`]. Everything else runs
//! from the main tick through [`EmergencyStop::advance`].

use crate::hal::interval_elapsed;
use core::convert::Infallible;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyState {
    Idle,
    Tripped,
    Releasing,
}

/// Single-slot flag shared with the asynchronous trigger.
#[derive(Debug, Clone, Default)]
pub struct EmergencyTrigger {
    flag: Arc<AtomicBool>,
}

impl EmergencyTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Safe to call from any context. Does nothing but set the flag.
    pub fn fire(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// What the caller must do to the hardware this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstopEvent {
    None,
    /// Cut every hub and assert the reset line.
    Tripped,
    /// Release the reset line.
    Released,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EstopStatus {
    pub state: EmergencyState,
    pub trip_time_ms: Option<u32>,
    pub hold_ms: u32,
    pub trips: u32,
}

#[derive(Debug)]
pub struct EmergencyStop {
    trigger: EmergencyTrigger,
    state: EmergencyState,
    trip_time: u32,
    hold_ms: u32,
    trips: u32,
}

impl EmergencyStop {
    pub fn new(hold_ms: u32) -> Self {
        Self {
            trigger: EmergencyTrigger::new(),
            state: EmergencyState::Idle,
            trip_time: 0,
            hold_ms,
            trips: 0,
        }
    }

    /// Handle to give to the asynchronous side.
    pub fn trigger(&self) -> EmergencyTrigger {
        self.trigger.clone()
    }

    pub fn state(&self) -> EmergencyState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != EmergencyState::Idle
    }

    /// Step the machine once. Never blocks.
    ///
    /// A trigger seen while releasing trips again and restarts the hold. On
    /// [`EstopEvent::Tripped`] the machine stays `Tripped` until the caller has
    /// cut the hubs, asserted reset and called [`EmergencyStop::begin_hold`].
    pub fn advance(&mut self, now: u32) -> EstopEvent {
        if self.trigger.take() {
            self.state = EmergencyState::Tripped;
            self.trip_time = now;
            self.trips = self.trips.wrapping_add(1);
            warn!("emergency stop tripped at {} ms", now);
            return EstopEvent::Tripped;
        }

        if self.state == EmergencyState::Releasing && self.poll_release(now).is_ok() {
            self.state = EmergencyState::Idle;
            info!("emergency stop released after {} ms", self.hold_ms);
            return EstopEvent::Released;
        }

        EstopEvent::None
    }

    /// Hubs are cut and reset is asserted; start counting the hold.
    pub fn begin_hold(&mut self) {
        if self.state == EmergencyState::Tripped {
            self.state = EmergencyState::Releasing;
        }
    }

    /// `WouldBlock` while the hold time is still running.
    pub fn poll_release(&self, now: u32) -> nb::Result<(), Infallible> {
        if self.state == EmergencyState::Idle || interval_elapsed(now, self.trip_time, self.hold_ms) {
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    pub fn status(&self) -> EstopStatus {
        EstopStatus {
            state: self.state,
            trip_time_ms: (self.trips > 0).then_some(self.trip_time),
            hold_ms: self.hold_ms,
            trips: self.trips,
        }
    }
}

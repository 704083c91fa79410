//! Board control lines and indicator LEDs.

use crate::hal::{interval_elapsed, OutputPin};
use crate::protocol::IndicatorId;

pub type DynPin = Box<dyn OutputPin + Send>;

/// The five output lines the core drives directly.
pub struct BoardPins {
    pub boot: DynPin,
    pub reset: DynPin,
    pub status_led: DynPin,
    pub activity_led: DynPin,
    pub error_led: DynPin,
}

impl BoardPins {
    pub fn new<T>(boot: T, reset: T, status_led: T, activity_led: T, error_led: T) -> Self
    where
        T: OutputPin + Send + 'static,
    {
        Self {
            boot: Box::new(boot),
            reset: Box::new(reset),
            status_led: Box::new(status_led),
            activity_led: Box::new(activity_led),
            error_led: Box::new(error_led),
        }
    }

    pub fn led_mut(&mut self, id: IndicatorId) -> &mut dyn OutputPin {
        match id {
            IndicatorId::Status => self.status_led.as_mut(),
            IndicatorId::Activity => self.activity_led.as_mut(),
            IndicatorId::Error => self.error_led.as_mut(),
        }
    }
}

impl core::fmt::Debug for BoardPins {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BoardPins")
            .field("boot", &self.boot.level())
            .field("reset", &self.reset.level())
            .field("status_led", &self.status_led.level())
            .field("activity_led", &self.activity_led.level())
            .field("error_led", &self.error_led.level())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Pulse {
    started: u32,
    length_ms: u32,
}

/// Non-blocking LED pulses. An LED is lit by [`Indicators::pulse`] and put out
/// by a later [`Indicators::service`] call.
#[derive(Debug, Default)]
pub struct Indicators {
    pulses: [Option<Pulse>; 3],
}

fn slot(id: IndicatorId) -> usize {
    match id {
        IndicatorId::Status => 0,
        IndicatorId::Activity => 1,
        IndicatorId::Error => 2,
    }
}

const ALL: [IndicatorId; 3] = [IndicatorId::Status, IndicatorId::Activity, IndicatorId::Error];

impl Indicators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Light `id` now; a new pulse on a lit LED restarts its timer.
    pub fn pulse(&mut self, pins: &mut BoardPins, id: IndicatorId, now: u32, length_ms: u32) {
        pins.led_mut(id).set_high();
        self.pulses[slot(id)] = Some(Pulse {
            started: now,
            length_ms,
        });
    }

    /// Forget a pending pulse without touching the LED.
    pub fn cancel(&mut self, id: IndicatorId) {
        self.pulses[slot(id)] = None;
    }

    pub fn is_pulsing(&self, id: IndicatorId) -> bool {
        self.pulses[slot(id)].is_some()
    }

    pub fn service(&mut self, pins: &mut BoardPins, now: u32) {
        for id in ALL {
            let entry = &mut self.pulses[slot(id)];
            if let Some(pulse) = entry {
                if interval_elapsed(now, pulse.started, pulse.length_ms) {
                    pins.led_mut(id).set_low();
                    *entry = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPin;

    fn sim_pins() -> (BoardPins, [SimPin; 5]) {
        let handles: [SimPin; 5] = Default::default();
        let [boot, reset, status, activity, error] = handles.clone();
        (BoardPins::new(boot, reset, status, activity, error), handles)
    }

    #[test]
    fn test_pulse_expires_on_service() {
        let (mut pins, handles) = sim_pins();
        let mut indicators = Indicators::new();

        indicators.pulse(&mut pins, IndicatorId::Activity, 1000, 50);
        assert!(handles[3].is_high());

        indicators.service(&mut pins, 1049);
        assert!(handles[3].is_high());
        indicators.service(&mut pins, 1050);
        assert!(!handles[3].is_high());
        assert!(!indicators.is_pulsing(IndicatorId::Activity));
    }

    #[test]
    fn test_pulse_across_rollover() {
        let (mut pins, handles) = sim_pins();
        let mut indicators = Indicators::new();

        indicators.pulse(&mut pins, IndicatorId::Error, u32::MAX - 10, 50);
        indicators.service(&mut pins, 20);
        assert!(handles[4].is_high());
        indicators.service(&mut pins, 39);
        assert!(!handles[4].is_high());
    }
}

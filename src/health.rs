use serde::{Deserialize, Serialize};

/// Passive I2C transaction counters.
///
/// Updated once per register-write operation by the hub controller. A write
/// that succeeds after retries counts as one success, a write that exhausts its
/// retries counts as one failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct I2cHealth {
    total: u32,
    failed: u32,
    last_success_ms: Option<u32>,
    last_failure_ms: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub total: u32,
    pub failed: u32,
    pub error_rate: f32,
    pub last_success_ms: Option<u32>,
    pub last_failure_ms: Option<u32>,
}

impl I2cHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, now_ms: u32) {
        self.total = self.total.wrapping_add(1);
        self.last_success_ms = Some(now_ms);
    }

    pub fn record_failure(&mut self, now_ms: u32) {
        self.total = self.total.wrapping_add(1);
        self.failed = self.failed.wrapping_add(1);
        self.last_failure_ms = Some(now_ms);
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    /// Percentage of failed operations, 0.0 before the first transaction.
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.failed as f32 / self.total as f32 * 100.0
    }

    pub fn last_success_ms(&self) -> Option<u32> {
        self.last_success_ms
    }

    pub fn last_failure_ms(&self) -> Option<u32> {
        self.last_failure_ms
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            total: self.total,
            failed: self.failed,
            error_rate: self.error_rate(),
            last_success_ms: self.last_success_ms,
            last_failure_ms: self.last_failure_ms,
        }
    }
}

//! Simulated board hardware.
//!
//! Every handle here is cheap to clone and shares its state, so a test (or the
//! simulator binary) can keep one copy for inspection while the agent owns the
//! other.

use crate::activity::{primary_block, BulkStorageProvider, LogEntry, StorageError};
use crate::hal::{elapsed_ms, BusError, I2cBus, OutputPin, Platform};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const REGISTER_COUNT: usize = 4;

#[derive(Debug, Default)]
struct BusState {
    devices: BTreeMap<u8, [u8; REGISTER_COUNT]>,
    fail_next: u32,
    fail_always: bool,
    transactions: u32,
    failures: u32,
}

/// GPIO-expander bus with injectable failures.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(addresses: &[u8]) -> Self {
        let bus = Self::new();
        for &address in addresses {
            bus.attach(address);
        }
        bus
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, address: u8) {
        self.lock().devices.entry(address).or_insert([0; REGISTER_COUNT]);
    }

    pub fn detach(&self, address: u8) {
        self.lock().devices.remove(&address);
    }

    /// Fail the next `count` transactions regardless of address.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    pub fn set_fail_always(&self, fail: bool) {
        self.lock().fail_always = fail;
    }

    /// Register contents as last written. Only the simulator looks at this.
    pub fn register(&self, address: u8, register: u8) -> Option<u8> {
        self.lock()
            .devices
            .get(&address)
            .and_then(|regs| regs.get(usize::from(register)).copied())
    }

    /// Flip bits behind the controller's back, modelling a bus glitch.
    pub fn corrupt(&self, address: u8, register: u8, value: u8) {
        if let Some(regs) = self.lock().devices.get_mut(&address) {
            if let Some(slot) = regs.get_mut(usize::from(register)) {
                *slot = value;
            }
        }
    }

    pub fn transactions(&self) -> u32 {
        self.lock().transactions
    }

    pub fn failures(&self) -> u32 {
        self.lock().failures
    }
}

impl I2cBus for SimBus {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusError> {
        let mut state = self.lock();
        state.transactions = state.transactions.wrapping_add(1);

        if state.fail_always || state.fail_next > 0 {
            state.fail_next = state.fail_next.saturating_sub(1);
            state.failures = state.failures.wrapping_add(1);
            return Err(BusError::Timeout);
        }

        if !state.devices.contains_key(&address) {
            state.failures = state.failures.wrapping_add(1);
            return Err(BusError::Nack(address));
        }

        if let [register, value, ..] = bytes {
            if let Some(slot) = state
                .devices
                .get_mut(&address)
                .and_then(|regs| regs.get_mut(usize::from(*register)))
            {
                *slot = *value;
            }
        }
        Ok(())
    }
}

/// Output pin that remembers its level and how often it changed.
#[derive(Debug, Clone, Default)]
pub struct SimPin {
    level: Arc<AtomicBool>,
    transitions: Arc<AtomicU32>,
}

impl SimPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_high(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    pub fn transitions(&self) -> u32 {
        self.transitions.load(Ordering::SeqCst)
    }
}

impl OutputPin for SimPin {
    fn set_level(&mut self, high: bool) {
        if self.level.swap(high, Ordering::SeqCst) != high {
            self.transitions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn level(&self) -> bool {
        self.is_high()
    }
}

/// Shared fake clock and watchdog.
#[derive(Debug, Clone, Default)]
pub struct SimPlatform {
    clock: Arc<AtomicU32>,
    auto_advance: Arc<AtomicU32>,
    // (epoch seconds, tick at which it was set)
    wall: Arc<Mutex<Option<(u64, u32)>>>,
    feeds: Arc<AtomicU32>,
    last_feed: Arc<AtomicU32>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock starting at an arbitrary tick, e.g. just below the wrap.
    pub fn starting_at(ms: u32) -> Self {
        let platform = Self::new();
        platform.clock.store(ms, Ordering::SeqCst);
        platform.last_feed.store(ms, Ordering::SeqCst);
        platform
    }

    pub fn advance(&self, ms: u32) {
        self.clock.fetch_add(ms, Ordering::SeqCst);
    }

    /// Every `millis()` read moves the clock forward by `ms`.
    pub fn set_auto_advance(&self, ms: u32) {
        self.auto_advance.store(ms, Ordering::SeqCst);
    }

    pub fn set_wall_clock(&self, epoch_secs: Option<u64>) {
        let now = self.now();
        let mut wall = self.wall.lock().unwrap_or_else(PoisonError::into_inner);
        *wall = epoch_secs.map(|secs| (secs, now));
    }

    /// Current tick without triggering auto advance.
    pub fn now(&self) -> u32 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn watchdog_feeds(&self) -> u32 {
        self.feeds.load(Ordering::SeqCst)
    }

    pub fn watchdog_expired(&self, timeout_ms: u32) -> bool {
        elapsed_ms(self.now(), self.last_feed.load(Ordering::SeqCst)) > timeout_ms
    }
}

impl Platform for SimPlatform {
    fn millis(&self) -> u32 {
        let step = self.auto_advance.load(Ordering::SeqCst);
        self.clock.fetch_add(step, Ordering::SeqCst)
    }

    fn wall_clock_secs(&self) -> Option<u64> {
        let wall = self.wall.lock().unwrap_or_else(PoisonError::into_inner);
        wall.map(|(secs, set_at)| secs + u64::from(elapsed_ms(self.now(), set_at) / 1000))
    }

    fn delay_ms(&mut self, ms: u32) {
        self.advance(ms);
    }

    fn feed_watchdog(&mut self) {
        self.feeds.fetch_add(1, Ordering::SeqCst);
        self.last_feed.store(self.now(), Ordering::SeqCst);
    }
}

/// Bulk (PSRAM-like) memory that hands out log blocks and checks they come back.
#[derive(Debug)]
pub struct SimBulkMemory {
    size_bytes: usize,
    reserved_bytes: usize,
    // start address and length of every block handed out and not yet returned
    live: Vec<(usize, usize)>,
    foreign_releases: u32,
}

impl SimBulkMemory {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            size_bytes,
            reserved_bytes: 0,
            live: Vec::new(),
            foreign_releases: 0,
        }
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// Number of blocks currently handed out.
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    /// Blocks given back that this provider never handed out.
    pub fn foreign_releases(&self) -> u32 {
        self.foreign_releases
    }
}

fn block_bytes(capacity: usize) -> usize {
    capacity * std::mem::size_of::<LogEntry>()
}

impl BulkStorageProvider for SimBulkMemory {
    fn is_available(&self) -> bool {
        self.size_bytes > 0
    }

    fn available_bytes(&self) -> usize {
        self.size_bytes - self.reserved_bytes
    }

    fn allocate(&mut self, capacity: usize) -> Result<Box<[LogEntry]>, StorageError> {
        let bytes = block_bytes(capacity);
        if bytes > self.available_bytes() {
            return Err(StorageError::Exhausted {
                requested: bytes,
                available: self.available_bytes(),
            });
        }
        let block = primary_block(capacity);
        self.reserved_bytes += bytes;
        self.live.push((block.as_ptr() as usize, block.len()));
        Ok(block)
    }

    fn release(&mut self, block: Box<[LogEntry]>) {
        let key = (block.as_ptr() as usize, block.len());
        match self.live.iter().position(|&live| live == key) {
            Some(i) => {
                self.live.swap_remove(i);
                self.reserved_bytes = self.reserved_bytes.saturating_sub(block_bytes(block.len()));
            }
            None => self.foreign_releases = self.foreign_releases.wrapping_add(1),
        }
    }
}

/// Board without bulk memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBulkMemory;

impl BulkStorageProvider for NoBulkMemory {
    fn is_available(&self) -> bool {
        false
    }

    fn available_bytes(&self) -> usize {
        0
    }

    fn allocate(&mut self, _capacity: usize) -> Result<Box<[LogEntry]>, StorageError> {
        Err(StorageError::Unavailable)
    }

    fn release(&mut self, _block: Box<[LogEntry]>) {}
}

//! Activity log: a fixed-capacity ring of recent actions.
//!
//! The ring is sized once at [`ActivityLogger::init`] from whatever bulk memory
//! the board reports, falling back to a small block of primary memory. Once
//! full, each append overwrites the oldest entry. The log is volatile and does
//! not survive a restart.

use crate::hal::{elapsed_ms, Platform, Timestamp};
use heapless::String as FixedString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const ACTION_LEN: usize = 16;
pub const DETAIL_LEN: usize = 48;

/// Upper bound on entries regardless of how much bulk memory is free.
pub const MAX_BULK_ENTRIES: usize = 10_000;
/// Ring size when no bulk memory is available.
pub const PRIMARY_ENTRIES: usize = 100;
/// Share of the reported bulk memory the log may claim, in percent.
pub const BULK_SHARE_PERCENT: usize = 75;
/// Export feeds the watchdog after this many entries.
pub const EXPORT_YIELD_EVERY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("bulk memory not present")]
    Unavailable,
    #[error("requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },
}

/// Source of large, slow memory (PSRAM on the real boards).
pub trait BulkStorageProvider {
    fn is_available(&self) -> bool;

    fn available_bytes(&self) -> usize;

    /// Hand out a zeroed block of exactly `capacity` entries.
    fn allocate(&mut self, capacity: usize) -> Result<Box<[LogEntry]>, StorageError>;

    /// Take back a block previously returned by `allocate`.
    fn release(&mut self, block: Box<[LogEntry]>);
}

/// Zeroed block of `capacity` entries from the ordinary heap.
pub fn primary_block(capacity: usize) -> Box<[LogEntry]> {
    vec![LogEntry::default(); capacity].into_boxed_slice()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Bulk,
    Primary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub synced: bool,
    pub action: FixedString<ACTION_LEN>,
    pub target: u16,
    pub detail: FixedString<DETAIL_LEN>,
}

impl LogEntry {
    pub fn new(ts: Timestamp, action: &str, target: u16, detail: &str) -> Self {
        Self {
            timestamp: ts.value,
            synced: ts.synced,
            action: truncated(action),
            target,
            detail: truncated(detail),
        }
    }
}

/// Copy as much of `text` as fits, cutting on a char boundary.
fn truncated<const N: usize>(text: &str) -> FixedString<N> {
    let mut out = FixedString::new();
    for ch in text.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogStats {
    pub count: usize,
    pub capacity: usize,
    pub storage: Option<StorageKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogExport {
    pub total: usize,
    pub returned: usize,
    pub partial: bool,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug)]
struct Ring {
    entries: Box<[LogEntry]>,
    kind: StorageKind,
}

#[derive(Debug, Default)]
pub struct ActivityLogger {
    ring: Option<Ring>,
    write_index: usize,
    count: usize,
}

impl ActivityLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size and allocate the ring. Any previously held bulk block is given
    /// back to `bulk` first.
    pub fn init(&mut self, bulk: &mut dyn BulkStorageProvider) -> LogStats {
        if let Some(old) = self.ring.take() {
            if old.kind == StorageKind::Bulk {
                bulk.release(old.entries);
            }
        }
        self.write_index = 0;
        self.count = 0;

        let entry_size = core::mem::size_of::<LogEntry>();
        let mut ring = None;

        if bulk.is_available() {
            let budget = bulk.available_bytes() / 100 * BULK_SHARE_PERCENT;
            let capacity = (budget / entry_size).min(MAX_BULK_ENTRIES);

            if capacity == 0 {
                warn!("bulk memory too small for the activity log");
            } else {
                match bulk.allocate(capacity) {
                    Ok(entries) => {
                        ring = Some(Ring {
                            entries,
                            kind: StorageKind::Bulk,
                        });
                    }
                    Err(e) => warn!("bulk allocation failed: {}", e),
                }
            }
        }

        let ring = ring.unwrap_or_else(|| Ring {
            entries: primary_block(PRIMARY_ENTRIES),
            kind: StorageKind::Primary,
        });
        info!(
            "activity log: {} entries in {:?} memory",
            ring.entries.len(),
            ring.kind
        );
        self.ring = Some(ring);

        self.stats()
    }

    pub fn capacity(&self) -> usize {
        self.ring.as_ref().map_or(0, |r| r.entries.len())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            count: self.count,
            capacity: self.capacity(),
            storage: self.ring.as_ref().map(|r| r.kind),
        }
    }

    /// O(1), no allocation. Dropped silently before `init`.
    pub fn append(&mut self, ts: Timestamp, action: &str, target: u16, detail: &str) {
        let Some(ring) = self.ring.as_mut() else {
            return;
        };
        let capacity = ring.entries.len();

        ring.entries[self.write_index] = LogEntry::new(ts, action, target, detail);

        self.write_index = (self.write_index + 1) % capacity;
        if self.count < capacity {
            self.count += 1;
        }
    }

    /// Entries from newest to oldest.
    pub fn entries_newest_first(&self) -> impl Iterator<Item = &LogEntry> + '_ {
        let entries: &[LogEntry] = match &self.ring {
            Some(ring) => &ring.entries,
            None => &[],
        };
        let capacity = entries.len();
        let newest = self.write_index;

        (1..=self.count).map(move |back| &entries[(newest + capacity - back) % capacity])
    }

    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries_newest_first().next()
    }

    /// Copy out up to `max_entries`, newest first.
    ///
    /// The watchdog is fed every [`EXPORT_YIELD_EVERY`] entries. If more than
    /// `budget_ms` pass the export stops early and is marked partial.
    pub fn export<P: Platform + ?Sized>(
        &self,
        platform: &mut P,
        max_entries: usize,
        budget_ms: u32,
    ) -> LogExport {
        let started = platform.millis();
        let wanted = max_entries.min(self.count);
        let mut entries = Vec::with_capacity(wanted);
        let mut partial = false;

        for (i, entry) in self.entries_newest_first().take(wanted).enumerate() {
            if i > 0 && i % EXPORT_YIELD_EVERY == 0 {
                platform.feed_watchdog();
                if elapsed_ms(platform.millis(), started) > budget_ms {
                    warn!("log export stopped after {} of {} entries", i, wanted);
                    partial = true;
                    break;
                }
            }
            entries.push(entry.clone());
        }

        LogExport {
            total: self.count,
            returned: entries.len(),
            partial,
            entries,
        }
    }

    pub fn clear(&mut self) {
        self.write_index = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::NoBulkMemory;

    fn ts(value: u64) -> Timestamp {
        Timestamp { value, synced: false }
    }

    #[test]
    fn test_truncation_on_char_boundary() {
        let text: FixedString<4> = truncated("ab\u{e9}cd");
        assert_eq!(text.as_str(), "ab\u{e9}");
    }

    #[test]
    fn test_uninitialised_logger_drops_appends() {
        let mut logger = ActivityLogger::new();
        logger.append(ts(1), "port", 1, "on");
        assert_eq!(logger.len(), 0);
        assert_eq!(logger.capacity(), 0);
        assert!(logger.latest().is_none());
    }

    #[test]
    fn test_newest_first_order_before_wrap() {
        let mut logger = ActivityLogger::new();
        logger.init(&mut NoBulkMemory);
        logger.append(ts(1), "a", 0, "");
        logger.append(ts(2), "b", 0, "");
        logger.append(ts(3), "c", 0, "");

        let actions: Vec<&str> = logger.entries_newest_first().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["c", "b", "a"]);
    }
}

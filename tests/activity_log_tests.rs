use flashhub::activity::*;
use flashhub::hal::{Platform, Timestamp};
use flashhub::sim::{NoBulkMemory, SimBulkMemory, SimPlatform};

fn tick(value: u64) -> Timestamp {
    Timestamp { value, synced: false }
}

fn entry_size() -> usize {
    std::mem::size_of::<LogEntry>()
}

#[test]
fn test_overflow_keeps_newest_capacity_entries() {
    let mut logger = ActivityLogger::new();
    logger.init(&mut NoBulkMemory);
    let capacity = logger.capacity();
    assert_eq!(capacity, PRIMARY_ENTRIES);

    let appended = 250u16;
    for n in 1..=appended {
        logger.append(tick(u64::from(n)), "port", n, "on");
    }

    assert_eq!(logger.len(), capacity);
    let oldest = logger.entries_newest_first().last().unwrap();
    assert_eq!(usize::from(oldest.target), usize::from(appended) - capacity + 1);
    assert_eq!(logger.latest().unwrap().target, appended);
}

#[test]
fn test_bulk_capacity_from_reported_size() {
    let mut bulk = SimBulkMemory::new(1_000_000);
    let mut logger = ActivityLogger::new();

    let stats = logger.init(&mut bulk);

    let expected = (1_000_000 / 100 * BULK_SHARE_PERCENT / entry_size()).min(MAX_BULK_ENTRIES);
    assert_eq!(stats.capacity, expected);
    assert_eq!(stats.storage, Some(StorageKind::Bulk));
    assert_eq!(bulk.reserved_bytes(), expected * entry_size());
    assert_eq!(bulk.outstanding(), 1);
}

#[test]
fn test_bulk_capacity_is_capped() {
    let mut bulk = SimBulkMemory::new(512 * 1024 * 1024);
    let mut logger = ActivityLogger::new();

    assert_eq!(logger.init(&mut bulk).capacity, MAX_BULK_ENTRIES);
}

#[test]
fn test_fallback_to_primary_memory() {
    let mut logger = ActivityLogger::new();

    let stats = logger.init(&mut SimBulkMemory::new(0));
    assert_eq!(stats.storage, Some(StorageKind::Primary));
    assert_eq!(stats.capacity, PRIMARY_ENTRIES);

    // present but too small for a single entry
    let stats = logger.init(&mut SimBulkMemory::new(entry_size()));
    assert_eq!(stats.storage, Some(StorageKind::Primary));
}

#[test]
fn test_reinit_releases_previous_block() {
    let mut bulk = SimBulkMemory::new(4 * 1024 * 1024);
    let mut logger = ActivityLogger::new();

    logger.init(&mut bulk);
    let first = bulk.reserved_bytes();
    logger.append(tick(1), "boot", 0, "");

    for _ in 0..5 {
        logger.init(&mut bulk);
    }

    assert_eq!(bulk.outstanding(), 1);
    assert_eq!(bulk.reserved_bytes(), first);
    // every release was a block the provider handed out
    assert_eq!(bulk.foreign_releases(), 0);
    assert!(logger.is_empty());
}

/// Provider that counts what passes through it.
#[derive(Default)]
struct Arena {
    handed_out: Vec<usize>,
    returned: Vec<usize>,
}

impl BulkStorageProvider for Arena {
    fn is_available(&self) -> bool {
        true
    }

    fn available_bytes(&self) -> usize {
        64 * 1024
    }

    fn allocate(&mut self, capacity: usize) -> Result<Box<[LogEntry]>, StorageError> {
        let block = vec![LogEntry::default(); capacity].into_boxed_slice();
        self.handed_out.push(block.as_ptr() as usize);
        Ok(block)
    }

    fn release(&mut self, block: Box<[LogEntry]>) {
        self.returned.push(block.as_ptr() as usize);
    }
}

#[test]
fn test_ring_lives_in_provider_block() {
    let mut arena = Arena::default();
    let mut logger = ActivityLogger::new();

    let stats = logger.init(&mut arena);
    assert_eq!(stats.storage, Some(StorageKind::Bulk));
    assert_eq!(stats.capacity, 64 * 1024 / 100 * BULK_SHARE_PERCENT / entry_size());
    for n in 0..10u16 {
        logger.append(tick(u64::from(n)), "port", n, "");
    }

    logger.init(&mut arena);
    assert_eq!(arena.handed_out.len(), 2);
    // the block given back is the one the first ring was built on
    assert_eq!(arena.returned, vec![arena.handed_out[0]]);

    logger.init(&mut arena);
    assert_eq!(arena.returned, arena.handed_out[..2].to_vec());
}

#[test]
fn test_primary_ring_is_not_released_to_provider() {
    let mut arena = Arena::default();
    let mut logger = ActivityLogger::new();

    logger.init(&mut NoBulkMemory);
    logger.init(&mut arena);

    assert!(arena.returned.is_empty());
    assert_eq!(arena.handed_out.len(), 1);
}

#[test]
fn test_export_newest_first_with_watchdog_yield() {
    let mut platform = SimPlatform::new();
    let mut logger = ActivityLogger::new();
    logger.init(&mut NoBulkMemory);
    for n in 1..=30u16 {
        logger.append(tick(u64::from(n)), "hub", n, "led on");
    }
    let feeds_before = platform.watchdog_feeds();

    let export = logger.export(&mut platform, 12, 200);

    assert_eq!(export.total, 30);
    assert_eq!(export.returned, 12);
    assert!(!export.partial);
    let targets: Vec<u16> = export.entries.iter().map(|e| e.target).collect();
    assert_eq!(targets, (19..=30).rev().collect::<Vec<u16>>());
    // fed before entries 5 and 10
    assert_eq!(platform.watchdog_feeds() - feeds_before, 2);
}

#[test]
fn test_export_stops_when_over_budget() {
    let mut platform = SimPlatform::new();
    let mut logger = ActivityLogger::new();
    logger.init(&mut NoBulkMemory);
    for n in 1..=40u16 {
        logger.append(tick(u64::from(n)), "port", n, "");
    }

    platform.set_auto_advance(50);
    let export = logger.export(&mut platform, 40, 40);

    assert!(export.partial);
    assert_eq!(export.returned, EXPORT_YIELD_EVERY);
    assert_eq!(export.total, 40);
    assert!(platform.millis() > 0);
}

#[test]
fn test_text_is_truncated_to_fixed_fields() {
    let mut logger = ActivityLogger::new();
    logger.init(&mut NoBulkMemory);

    logger.append(tick(5), "a-very-long-action-name", 3, &"d".repeat(100));

    let entry = logger.latest().unwrap();
    assert_eq!(entry.action.len(), ACTION_LEN);
    assert_eq!(entry.detail.len(), DETAIL_LEN);
    assert_eq!(entry.timestamp, 5);
    assert!(!entry.synced);
}

#[test]
fn test_clear_keeps_capacity() {
    let mut logger = ActivityLogger::new();
    logger.init(&mut NoBulkMemory);
    logger.append(tick(1), "ping", 0, "");

    logger.clear();

    assert!(logger.is_empty());
    assert_eq!(logger.capacity(), PRIMARY_ENTRIES);
    assert_eq!(logger.entries_newest_first().count(), 0);
}

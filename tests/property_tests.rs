//! Property-based tests for the heap allocator and the event table.
//!
//! Both are driven through the host emulated device so that native handles
//! are real and their release can be observed.

use std::sync::Arc;

use accelrt::{
    CommandQueue, EventDescription, EventId, EventTable, HostDeviceSpec, HostDriver,
    MemoryManager, RuntimeError, HEAP_ALIGNMENT,
};
use proptest::prelude::*;

fn queue() -> (Arc<HostDriver>, CommandQueue) {
    let driver = Arc::new(HostDriver::new(HostDeviceSpec::default()));
    let queue = CommandQueue::new(driver.clone());
    (driver, queue)
}

fn aligned(bytes: u64) -> u64 {
    bytes.div_ceil(HEAP_ALIGNMENT) * HEAP_ALIGNMENT
}

// ── Strategies ──────────────────────────────────────────────────────────────

/// Heap capacity and a run of allocation requests against it.
fn arb_allocations() -> impl Strategy<Value = (u64, Vec<u64>)> {
    (1u64..=4096, prop::collection::vec(0u64..=700, 0..32))
}

/// Window size, number of registrations, and which of the first window's
/// events get retained.
fn arb_window_run() -> impl Strategy<Value = (usize, usize, Vec<bool>)> {
    (2usize..=8).prop_flat_map(|window| {
        (
            Just(window),
            0usize..48,
            prop::collection::vec(any::<bool>(), window),
        )
    })
}

fn register(table: &mut EventTable, queue: &CommandQueue) -> EventId {
    let native = queue.enqueue_marker(&[]);
    table.register_event(native, EventDescription::SyncMarker, 0, queue)
}

// ── Property tests ───────────────────────────────────────────────────────────

proptest! {
    /// An allocation succeeds exactly when the running aligned total still
    /// fits, and a failure leaves the bump pointer where it was.
    #[test]
    fn allocation_succeeds_iff_it_fits((capacity, sizes) in arb_allocations()) {
        let (_driver, queue) = queue();
        let mut memory = MemoryManager::new();
        memory.allocate_region(&queue, capacity).unwrap();

        let mut used = 0u64;
        for size in sizes {
            let fits = used + aligned(size) <= capacity;
            match memory.allocate(size) {
                Ok(offset) => {
                    prop_assert!(fits);
                    prop_assert_eq!(offset, used);
                    prop_assert_eq!(offset % HEAP_ALIGNMENT, 0);
                    used += aligned(size);
                }
                Err(RuntimeError::OutOfMemory { requested, available, capacity: cap }) => {
                    prop_assert!(!fits);
                    prop_assert_eq!(requested, size);
                    prop_assert_eq!(available, capacity - used);
                    prop_assert_eq!(cap, capacity);
                }
                Err(other) => prop_assert!(false, "unexpected error {other:?}"),
            }
            prop_assert_eq!(memory.used(), used);
        }
    }

    /// Resetting the heap and replaying the same requests yields the same
    /// offsets.
    #[test]
    fn reset_replays_offsets((capacity, sizes) in arb_allocations()) {
        let (_driver, queue) = queue();
        let mut memory = MemoryManager::new();
        memory.allocate_region(&queue, capacity).unwrap();

        let first: Vec<Option<u64>> = sizes.iter().map(|&s| memory.allocate(s).ok()).collect();
        memory.reset();
        prop_assert_eq!(memory.used(), 0);
        let second: Vec<Option<u64>> = sizes.iter().map(|&s| memory.allocate(s).ok()).collect();
        prop_assert_eq!(first, second);
    }

    /// Without retains the table keeps exactly the most recent `window`
    /// events and releases the native handle of everything older.
    #[test]
    fn eviction_is_fifo(window in 1usize..=8, count in 0usize..48) {
        let (driver, queue) = queue();
        let mut table = EventTable::new(window);
        let ids: Vec<EventId> = (0..count).map(|_| register(&mut table, &queue)).collect();

        let live = count.min(window);
        prop_assert_eq!(table.len(), live);
        prop_assert_eq!(driver.live_events(), live);
        for (i, &id) in ids.iter().enumerate() {
            let expected_live = i + window >= count;
            prop_assert_eq!(table.record(id).is_some(), expected_live, "event #{}", i);
        }
    }

    /// Retained events are never evicted, whatever comes after them.
    #[test]
    fn retained_events_are_never_evicted((window, extra, pins) in arb_window_run()) {
        let (driver, queue) = queue();
        let mut table = EventTable::new(window);
        let first: Vec<EventId> = (0..window).map(|_| register(&mut table, &queue)).collect();

        // Keep at least one slot free so registration can proceed.
        let mut pinned = Vec::new();
        for (&id, &pin) in first.iter().zip(&pins).take(window - 1) {
            if pin {
                prop_assert!(table.retain_event(id));
                pinned.push(id);
            }
        }

        for _ in 0..extra {
            prop_assert!(register(&mut table, &queue) >= 0);
        }

        for &id in &pinned {
            prop_assert!(table.is_retained(id));
            let native = table.record(id).map(|r| r.native);
            prop_assert!(native.is_some());
            prop_assert!(native.is_some_and(|n| driver.is_event_live(n)));
        }
        prop_assert!(table.len() <= window);
    }

    /// An evicted id never resolves to the event that took its slot.
    #[test]
    fn stale_ids_stay_stale(window in 1usize..=4, rounds in 1usize..6) {
        let (_driver, queue) = queue();
        let mut table = EventTable::new(window);
        let first: Vec<EventId> = (0..window).map(|_| register(&mut table, &queue)).collect();
        for _ in 0..rounds * window {
            register(&mut table, &queue);
        }
        for id in first {
            prop_assert!(table.record(id).is_none());
            prop_assert!(table.try_resolve(id, &queue).is_none());
        }
    }
}

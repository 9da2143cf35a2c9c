//! Sharded counters for hot-path metrics.
//!
//! A [`CounterGroup`] packs up to 16 counters into per-thread shards so
//! that I/O workers incrementing different counters (or the same counter
//! from different threads) never contend on a cache line. A [`Counter`]
//! references one slot of a group and implements [`metriken::Metric`] for
//! exposition.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const CACHE_LINE: usize = 128;
const SLOTS: usize = CACHE_LINE / 8;
const NUM_SHARDS: usize = 32;

thread_local! {
    static SHARD_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pin the current thread to a shard. Worker threads call this once at
/// startup for deterministic assignment; unpinned threads fall back to a
/// hash of their TLS address.
pub fn set_thread_shard(id: usize) {
    SHARD_ID.set(Some(id % NUM_SHARDS));
}

#[repr(C, align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Sharded storage for up to 16 counters.
pub struct CounterGroup {
    shards: [Shard; NUM_SHARDS],
}

impl CounterGroup {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const SHARD: Shard = Shard { slots: [ZERO; SLOTS] };
        Self {
            shards: [SHARD; NUM_SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS);
        self.shards[shard_index()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self, slot: usize) -> u64 {
        debug_assert!(slot < SLOTS);
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One counter slot within a [`CounterGroup`].
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        Self { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.group.add(self.slot, 1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Aggregated value across all shards. Eventually consistent.
    pub fn value(&self) -> u64 {
        self.group.value(self.slot)
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

#[inline]
fn shard_index() -> usize {
    SHARD_ID.get().unwrap_or_else(|| {
        thread_local! {
            static MARKER: u8 = const { 0 };
        }
        MARKER.with(|m| m as *const u8 as usize) % NUM_SHARDS
    })
}

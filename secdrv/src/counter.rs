//! Per-thread sharded counters for pool metrics.
//!
//! The producer role (acquire, release) and the consumer role (completion
//! delivery) bump counters from different threads. Each thread writes into
//! its own cache-line-aligned shard of a [`CounterGroup`]; readers sum the
//! shards. A [`Counter`] names one slot in a group and implements
//! [`metriken::Metric`].

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const SLOTS: usize = 8;
const NUM_SHARDS: usize = 32;

thread_local! {
    static SHARD: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pin the calling thread to a shard.
///
/// Driver threads call this once at start-up (for example the ring polling
/// thread and the application thread) so they never share a shard.
pub fn set_thread_shard(id: usize) {
    SHARD.set(Some(id % NUM_SHARDS));
}

#[repr(C, align(64))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Storage for up to eight counters, sharded by thread.
pub struct CounterGroup {
    shards: [Shard; NUM_SHARDS],
}

impl CounterGroup {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const EMPTY: Shard = Shard {
            slots: [ZERO; SLOTS],
        };
        CounterGroup {
            shards: [EMPTY; NUM_SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS);
        self.shards[shard_index()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn sum(&self, slot: usize) -> u64 {
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

/// One slot of a [`CounterGroup`].
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        assert!(slot < SLOTS, "counter slot out of range");
        Counter { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.group.add(self.slot, 1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Sum over all shards.
    pub fn value(&self) -> u64 {
        self.group.sum(self.slot)
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
    SHARD.get().unwrap_or_else(|| {
        thread_local! {
            static ANCHOR: u8 = const { 0 };
        }
        // Threads that never pinned a shard hash their TLS address.
        let shard = ANCHOR.with(|a| a as *const u8 as usize) / 64 % NUM_SHARDS;
        SHARD.set(Some(shard));
        shard
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_independent() {
        static GROUP: CounterGroup = CounterGroup::new();
        let acquired = Counter::new(&GROUP, 0);
        let freed = Counter::new(&GROUP, 1);

        acquired.increment();
        acquired.increment();
        freed.add(7);

        assert_eq!(acquired.value(), 2);
        assert_eq!(freed.value(), 7);
    }

    #[test]
    fn producer_and_consumer_threads_sum() {
        use std::thread;

        static GROUP: CounterGroup = CounterGroup::new();
        static COMPLETED: Counter = Counter::new(&GROUP, 2);

        let handles: Vec<_> = (0..2)
            .map(|role| {
                thread::spawn(move || {
                    set_thread_shard(role);
                    for _ in 0..500 {
                        COMPLETED.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(COMPLETED.value(), 1000);
    }

    #[test]
    fn metric_value() {
        use metriken::Metric;

        static GROUP: CounterGroup = CounterGroup::new();
        let counter = Counter::new(&GROUP, 3);
        counter.add(5);
        assert!(matches!(
            Metric::value(&counter),
            Some(metriken::Value::Counter(5))
        ));
    }
}

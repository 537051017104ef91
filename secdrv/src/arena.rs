//! Process-wide budget of crypto contexts.
//!
//! Every [`ContextPool`](crate::ContextPool) draws its contexts from a
//! [`ContextArena`]. The arena owns the shared state cells (usage tag and
//! in-flight packet count) for all contexts it can ever hand out, so the
//! total across pools is bounded by the arena's fixed capacity.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::config::Config;
use crate::context::{ContextState, PacketCounter};
use crate::error::Error;

/// Capacity of the global arena.
pub const MAX_CONTEXTS: usize = 4096;

/// Fixed-capacity store of context state cells.
pub struct ContextArena {
    cells: Box<[ContextState]>,
    book: Mutex<Book>,
}

struct Book {
    taken: Vec<bool>,
    available: usize,
}

impl ContextArena {
    /// Create an arena with room for `capacity` contexts.
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(
            capacity < u32::MAX as usize,
            "arena capacity must fit in 32 bits"
        );
        let cells = (0..capacity).map(|_| ContextState::new()).collect();
        Arc::new(ContextArena {
            cells,
            book: Mutex::new(Book {
                taken: vec![false; capacity],
                available: capacity,
            }),
        })
    }

    /// Validate `config` and create an arena of `config.arena_capacity`.
    pub fn from_config(config: &Config) -> Result<Arc<Self>, Error> {
        config.validate()?;
        Ok(Self::new(config.arena_capacity))
    }

    /// The shared arena of [`MAX_CONTEXTS`] contexts, created on first use.
    pub fn global() -> &'static Arc<ContextArena> {
        static GLOBAL: OnceLock<Arc<ContextArena>> = OnceLock::new();
        GLOBAL.get_or_init(|| ContextArena::new(MAX_CONTEXTS))
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Contexts not reserved by any pool.
    pub fn available(&self) -> usize {
        self.book().available
    }

    /// Reserve `count` contexts, all reset to `Unused` with no packets.
    ///
    /// The check and the reservation happen under the arena lock, so pools
    /// created concurrently never oversubscribe the arena.
    pub fn reserve(self: &Arc<Self>, count: usize) -> Result<ArenaSlice, Error> {
        let mut book = self.book();
        if count > book.available {
            return Err(Error::OutOfCapacity {
                requested: count,
                available: book.available,
            });
        }

        let mut cells = Vec::with_capacity(count);
        for (i, taken) in book.taken.iter_mut().enumerate() {
            if cells.len() == count {
                break;
            }
            if !*taken {
                *taken = true;
                self.cells[i].reset();
                cells.push(i as u32);
            }
        }
        debug_assert_eq!(cells.len(), count);
        book.available -= count;
        log::debug!(
            "context arena: reserved {count}, {} of {} left",
            book.available,
            self.cells.len()
        );

        Ok(ArenaSlice {
            arena: Arc::clone(self),
            cells: cells.into_boxed_slice(),
        })
    }

    /// Return a reservation. Equivalent to dropping the slice.
    pub fn release(&self, slice: ArenaSlice) {
        debug_assert!(std::ptr::eq(self, Arc::as_ptr(&slice.arena)));
        drop(slice);
    }

    #[inline]
    pub(crate) fn cell(&self, index: u32) -> &ContextState {
        &self.cells[index as usize]
    }

    fn give_back(&self, cells: &[u32]) {
        let mut book = self.book();
        for &cell in cells {
            let taken = &mut book.taken[cell as usize];
            assert!(*taken, "arena cell {cell} released twice");
            *taken = false;
            self.cells[cell as usize].reset();
        }
        book.available += cells.len();
        log::debug!(
            "context arena: released {}, {} of {} left",
            cells.len(),
            book.available,
            self.cells.len()
        );
    }

    fn book(&self) -> std::sync::MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A pool's share of an arena. Dropping it hands the contexts back.
pub struct ArenaSlice {
    arena: Arc<ContextArena>,
    cells: Box<[u32]>,
}

impl ArenaSlice {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn arena(&self) -> &Arc<ContextArena> {
        &self.arena
    }

    /// State cell of the pool-local context `index`.
    #[inline]
    pub(crate) fn state(&self, index: usize) -> &ContextState {
        self.arena.cell(self.cells[index])
    }

    pub(crate) fn counter(&self, index: usize) -> PacketCounter {
        PacketCounter::new(Arc::clone(&self.arena), self.cells[index])
    }
}

impl Drop for ArenaSlice {
    fn drop(&mut self) {
        self.arena.give_back(&self.cells);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Usage;

    #[test]
    fn reserve_and_release() {
        let arena = ContextArena::new(8);
        let a = arena.reserve(5).unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(arena.available(), 3);

        let err = arena.reserve(4).err().unwrap();
        assert!(matches!(
            err,
            Error::OutOfCapacity {
                requested: 4,
                available: 3
            }
        ));

        arena.release(a);
        assert_eq!(arena.available(), 8);
        assert!(arena.reserve(8).is_ok());
        // The slice above is dropped at the end of the statement.
        assert_eq!(arena.available(), 8);
    }

    #[test]
    fn released_cells_are_reused_and_reset() {
        let arena = ContextArena::new(2);
        let a = arena.reserve(2).unwrap();
        a.state(0).acquire();
        a.state(0).packet_submitted(a.state(0).generation());
        drop(a);

        let b = arena.reserve(2).unwrap();
        for i in 0..2 {
            assert_eq!(b.state(i).load(), (Usage::Unused, 0));
        }
    }

    #[test]
    fn slices_do_not_overlap() {
        let arena = ContextArena::new(6);
        let a = arena.reserve(3).unwrap();
        let b = arena.reserve(3).unwrap();
        let mut cells: Vec<u32> = a.cells.iter().chain(b.cells.iter()).copied().collect();
        cells.sort_unstable();
        cells.dedup();
        assert_eq!(cells.len(), 6);
    }

    #[test]
    fn concurrent_reservations_never_oversubscribe() {
        use std::thread;

        let arena = ContextArena::new(64);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || arena.reserve(10).ok())
            })
            .collect();
        let slices: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(slices.len(), 6);
        assert_eq!(arena.available(), 4);
    }

    #[test]
    fn from_config_uses_arena_capacity() {
        let config = Config {
            contexts: 4,
            arena_capacity: 12,
            ..Config::default()
        };
        let arena = ContextArena::from_config(&config).unwrap();
        assert_eq!(arena.capacity(), 12);
        assert_eq!(arena.available(), 12);

        let bad = Config {
            contexts: 20,
            arena_capacity: 12,
            ..Config::default()
        };
        assert!(matches!(
            ContextArena::from_config(&bad),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn counter_tracks_cell() {
        let arena = ContextArena::new(1);
        let slice = arena.reserve(1).unwrap();
        slice.state(0).acquire();
        let counter = slice.counter(0);
        assert_eq!(counter.packet_submitted(), 1);
        assert_eq!(slice.state(0).load(), (Usage::Used, 1));
        assert_eq!(counter.packet_completed(), 0);
        assert_eq!(counter.usage(), Usage::Used);
    }
}

//! Crypto context pool with deferred reclamation.
//!
//! Every context of a pool sits on exactly one of three lists, matching its
//! usage tag:
//!
//! ```text
//! free_list    <-> Usage::Unused
//! in_use_list  <-> Usage::Used
//! retire_list  <-> Usage::Retiring
//! ```
//!
//! A context released while hardware still holds packets for it moves to the
//! retire list. The garbage collector runs inline on every acquire and free
//! and moves retiring contexts whose packet count has dropped to zero back to
//! the free list, so the releasing caller never has to poll.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::arena::{ArenaSlice, ContextArena};
use crate::config::{Config, ThreadMode};
use crate::context::{
    Context, ContextToken, JobRingHandle, NotifyCallback, PacketCounter, Release, Usage,
    next_pool_id,
};
use crate::error::Error;
use crate::list::{IntrusiveList, NodeId};
use crate::metrics;

/// Sizes of a pool's three lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub in_use: usize,
    pub retiring: usize,
}

impl PoolStats {
    /// `free + in_use + retiring`; equals `capacity` for a consistent pool.
    pub fn total(&self) -> usize {
        self.free + self.in_use + self.retiring
    }
}

/// A context waiting for its in-flight packets, as seen by the ring layer
/// when it issues overdue notifications.
pub struct RetiringContext<'a> {
    pub index: usize,
    pub context: &'a Context,
    pub outstanding: u32,
}

/// Fixed-capacity pool of crypto contexts, owned by a single thread.
///
/// Completions may be reported from any thread through a
/// [`PacketCounter`]; everything else needs `&mut` access to the pool.
pub struct ContextPool {
    id: u32,
    contexts: Vec<Context>,
    cells: ArenaSlice,
    free_list: IntrusiveList,
    in_use_list: IntrusiveList,
    retire_list: IntrusiveList,
}

impl ContextPool {
    /// Create a pool of `capacity` contexts drawn from the global arena.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        Self::with_arena(ContextArena::global(), capacity)
    }

    /// Create a pool of `capacity` contexts drawn from `arena`.
    ///
    /// Fails with [`Error::OutOfCapacity`] if the arena cannot supply them.
    pub fn with_arena(arena: &Arc<ContextArena>, capacity: usize) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidConfig(
                "context pool capacity must be > 0".into(),
            ));
        }
        let cells = arena.reserve(capacity)?;

        let mut contexts: Vec<Context> = (0..capacity)
            .map(|i| Context::new(NodeId::new(i)))
            .collect();
        let mut free_list = IntrusiveList::new();
        for i in 0..capacity {
            free_list.add_tail(&mut contexts, NodeId::new(i));
        }

        let id = next_pool_id();
        log::info!(
            "context pool {id}: {capacity} contexts, arena has {} left",
            arena.available()
        );
        Ok(ContextPool {
            id,
            contexts,
            cells,
            free_list,
            in_use_list: IntrusiveList::new(),
            retire_list: IntrusiveList::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.contexts.len()
    }

    /// Hand out a free context, or `None` if every context is in use or
    /// still retiring.
    ///
    /// `None` is transient exhaustion: apply backpressure and retry later.
    pub fn get_free_context(&mut self) -> Option<ContextToken> {
        let id = match self.free_list.remove_first(&mut self.contexts) {
            Some(id) => {
                self.take(id);
                // Keep the retire list short during allocation bursts.
                self.collect();
                id
            }
            None => {
                self.collect();
                let Some(id) = self.free_list.remove_first(&mut self.contexts) else {
                    metrics::CONTEXT_POOL_EXHAUSTED.increment();
                    log::debug!(
                        "context pool {}: exhausted ({} in use, {} retiring)",
                        self.id,
                        self.in_use_list.len(),
                        self.retire_list.len()
                    );
                    return None;
                };
                self.take(id);
                id
            }
        };

        metrics::CONTEXTS_ACQUIRED.increment();
        metrics::CONTEXTS_IN_USE.increment();
        Some(ContextToken {
            pool: self.id,
            index: id.index() as u32,
        })
    }

    /// Release a context.
    ///
    /// With no packets in flight the context goes straight back to the free
    /// list. Otherwise it is parked on the retire list and reclaimed by a
    /// later garbage collection pass once the completion path has reported
    /// every outstanding packet.
    ///
    /// # Panics
    ///
    /// Panics if `token` was issued by another pool.
    pub fn free_or_retire_context(&mut self, token: ContextToken) -> Release {
        self.check(&token);
        let id = token.node();
        let outcome = self.cells.state(id.index()).free_or_retire();

        self.in_use_list.delete(&mut self.contexts, id);
        metrics::CONTEXTS_IN_USE.decrement();
        match outcome {
            Release::Retiring => {
                self.retire_list.add_tail(&mut self.contexts, id);
                metrics::CONTEXTS_RETIRED.increment();
                metrics::CONTEXTS_RETIRING.increment();
            }
            Release::Freed => {
                self.contexts[id.index()].clear();
                self.free_list.add_tail(&mut self.contexts, id);
                metrics::CONTEXTS_FREED.increment();
                self.collect();
            }
        }
        outcome
    }

    /// One pass over the retire list, reclaiming every context whose packets
    /// have all been reported. Returns how many were reclaimed.
    pub fn collect(&mut self) -> usize {
        let mut reclaimed = 0;
        let mut cursor = self.retire_list.first();
        while let Some(id) = cursor {
            cursor = self.retire_list.next(&self.contexts, id);
            if !self.cells.state(id.index()).try_collect() {
                continue;
            }
            self.retire_list.delete(&mut self.contexts, id);
            self.contexts[id.index()].clear();
            self.free_list.add_tail(&mut self.contexts, id);
            reclaimed += 1;
        }
        if reclaimed > 0 {
            metrics::CONTEXTS_COLLECTED.add(reclaimed as u64);
            metrics::CONTEXTS_RETIRING.sub(reclaimed as i64);
        }
        reclaimed
    }

    /// The context behind `token`.
    pub fn context(&self, token: &ContextToken) -> &Context {
        self.check(token);
        &self.contexts[token.index()]
    }

    pub fn context_mut(&mut self, token: &ContextToken) -> &mut Context {
        self.check(token);
        &mut self.contexts[token.index()]
    }

    /// Shortcut for `context_mut(token).bind(..)`.
    pub fn bind(
        &mut self,
        token: &ContextToken,
        jr_handle: JobRingHandle,
        notify_cbk: NotifyCallback,
    ) {
        self.context_mut(token).bind(jr_handle, notify_cbk);
    }

    /// Handle for the submit and completion paths of this context.
    pub fn packet_counter(&self, token: &ContextToken) -> PacketCounter {
        self.check(token);
        self.cells.counter(token.index())
    }

    /// Usage tag of the context at `index`.
    pub fn usage(&self, index: usize) -> Usage {
        self.cells.state(index).load().0
    }

    /// Contexts on the retire list, oldest first.
    pub fn retiring(&self) -> impl Iterator<Item = RetiringContext<'_>> + '_ {
        self.retire_list.iter(&self.contexts).map(|id| RetiringContext {
            index: id.index(),
            context: &self.contexts[id.index()],
            outstanding: self.cells.state(id.index()).load().1,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.contexts.len(),
            free: self.free_list.len(),
            in_use: self.in_use_list.len(),
            retiring: self.retire_list.len(),
        }
    }

    /// Tear the pool down and return its contexts to the arena.
    ///
    /// Returns the list sizes at the time of destruction.
    pub fn destroy(self) -> PoolStats {
        self.stats()
    }

    fn take(&mut self, id: NodeId) {
        self.cells.state(id.index()).acquire();
        self.in_use_list.add_tail(&mut self.contexts, id);
    }

    fn check(&self, token: &ContextToken) {
        assert_eq!(
            token.pool, self.id,
            "context token from pool {} used with pool {}",
            token.pool, self.id
        );
    }
}

impl Drop for ContextPool {
    fn drop(&mut self) {
        let stats = self.stats();
        if stats.in_use > 0 || stats.retiring > 0 {
            log::warn!(
                "context pool {}: destroyed with {} in use, {} retiring",
                self.id,
                stats.in_use,
                stats.retiring
            );
        }
        metrics::CONTEXTS_IN_USE.sub(stats.in_use as i64);
        metrics::CONTEXTS_RETIRING.sub(stats.retiring as i64);

        let lists = [
            std::mem::take(&mut self.free_list),
            std::mem::take(&mut self.in_use_list),
            std::mem::take(&mut self.retire_list),
        ];
        for list in lists {
            list.destroy(&mut self.contexts);
        }
        for ctx in &mut self.contexts {
            ctx.clear();
        }
        log::info!(
            "context pool {}: released {} contexts",
            self.id,
            stats.capacity
        );
        // `cells` drops after this and hands the contexts back to the arena.
    }
}

/// A context pool usable from several producer threads.
///
/// The whole pool sits behind one lock; list operations stay single-threaded
/// inside it. Completion reporting still goes through [`PacketCounter`] and
/// never takes the lock.
pub struct SharedContextPool {
    inner: Mutex<ContextPool>,
}

impl SharedContextPool {
    pub fn new(capacity: usize) -> Result<Self, Error> {
        Ok(Self::from(ContextPool::new(capacity)?))
    }

    pub fn with_arena(arena: &Arc<ContextArena>, capacity: usize) -> Result<Self, Error> {
        Ok(Self::from(ContextPool::with_arena(arena, capacity)?))
    }

    pub fn get_free_context(&self) -> Option<ContextToken> {
        self.lock().get_free_context()
    }

    pub fn free_or_retire_context(&self, token: ContextToken) -> Release {
        self.lock().free_or_retire_context(token)
    }

    pub fn collect(&self) -> usize {
        self.lock().collect()
    }

    pub fn bind(&self, token: &ContextToken, jr_handle: JobRingHandle, notify_cbk: NotifyCallback) {
        self.lock().bind(token, jr_handle, notify_cbk);
    }

    /// Run `f` on the context behind `token` with the pool locked.
    pub fn with_context<R>(&self, token: &ContextToken, f: impl FnOnce(&mut Context) -> R) -> R {
        f(self.lock().context_mut(token))
    }

    pub fn packet_counter(&self, token: &ContextToken) -> PacketCounter {
        self.lock().packet_counter(token)
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats()
    }

    pub fn into_inner(self) -> ContextPool {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, ContextPool> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl From<ContextPool> for SharedContextPool {
    fn from(pool: ContextPool) -> Self {
        SharedContextPool {
            inner: Mutex::new(pool),
        }
    }
}

/// Operations common to both pool flavours.
///
/// Implemented for [`ContextPool`] and for `&SharedContextPool`, so code
/// driving a pool can be written once for either thread mode.
pub trait ContextAllocator {
    fn get_free_context(&mut self) -> Option<ContextToken>;
    fn free_or_retire_context(&mut self, token: ContextToken) -> Release;
    fn bind(&mut self, token: &ContextToken, jr_handle: JobRingHandle, notify_cbk: NotifyCallback);
    fn packet_counter(&mut self, token: &ContextToken) -> PacketCounter;
    fn stats(&self) -> PoolStats;
}

impl ContextAllocator for ContextPool {
    fn get_free_context(&mut self) -> Option<ContextToken> {
        ContextPool::get_free_context(self)
    }

    fn free_or_retire_context(&mut self, token: ContextToken) -> Release {
        ContextPool::free_or_retire_context(self, token)
    }

    fn bind(&mut self, token: &ContextToken, jr_handle: JobRingHandle, notify_cbk: NotifyCallback) {
        ContextPool::bind(self, token, jr_handle, notify_cbk);
    }

    fn packet_counter(&mut self, token: &ContextToken) -> PacketCounter {
        ContextPool::packet_counter(self, token)
    }

    fn stats(&self) -> PoolStats {
        ContextPool::stats(self)
    }
}

impl ContextAllocator for &SharedContextPool {
    fn get_free_context(&mut self) -> Option<ContextToken> {
        SharedContextPool::get_free_context(self)
    }

    fn free_or_retire_context(&mut self, token: ContextToken) -> Release {
        SharedContextPool::free_or_retire_context(self, token)
    }

    fn bind(&mut self, token: &ContextToken, jr_handle: JobRingHandle, notify_cbk: NotifyCallback) {
        SharedContextPool::bind(self, token, jr_handle, notify_cbk);
    }

    fn packet_counter(&mut self, token: &ContextToken) -> PacketCounter {
        SharedContextPool::packet_counter(self, token)
    }

    fn stats(&self) -> PoolStats {
        SharedContextPool::stats(self)
    }
}

/// A context pool in the thread mode chosen by [`Config::thread_mode`].
pub enum ConfiguredPool {
    Exclusive(ContextPool),
    Shared(Arc<SharedContextPool>),
}

impl ConfiguredPool {
    /// Validate `config` and build a pool of `config.contexts` contexts from
    /// the global arena.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_with_arena(config, ContextArena::global())
    }

    pub fn from_config_with_arena(
        config: &Config,
        arena: &Arc<ContextArena>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let pool = ContextPool::with_arena(arena, config.contexts)?;
        Ok(match config.thread_mode {
            ThreadMode::Exclusive => ConfiguredPool::Exclusive(pool),
            ThreadMode::Shared => ConfiguredPool::Shared(Arc::new(pool.into())),
        })
    }

    pub fn thread_mode(&self) -> ThreadMode {
        match self {
            ConfiguredPool::Exclusive(_) => ThreadMode::Exclusive,
            ConfiguredPool::Shared(_) => ThreadMode::Shared,
        }
    }
}

impl ContextAllocator for ConfiguredPool {
    fn get_free_context(&mut self) -> Option<ContextToken> {
        match self {
            ConfiguredPool::Exclusive(pool) => pool.get_free_context(),
            ConfiguredPool::Shared(pool) => pool.get_free_context(),
        }
    }

    fn free_or_retire_context(&mut self, token: ContextToken) -> Release {
        match self {
            ConfiguredPool::Exclusive(pool) => pool.free_or_retire_context(token),
            ConfiguredPool::Shared(pool) => pool.free_or_retire_context(token),
        }
    }

    fn bind(&mut self, token: &ContextToken, jr_handle: JobRingHandle, notify_cbk: NotifyCallback) {
        match self {
            ConfiguredPool::Exclusive(pool) => pool.bind(token, jr_handle, notify_cbk),
            ConfiguredPool::Shared(pool) => pool.bind(token, jr_handle, notify_cbk),
        }
    }

    fn packet_counter(&mut self, token: &ContextToken) -> PacketCounter {
        match self {
            ConfiguredPool::Exclusive(pool) => pool.packet_counter(token),
            ConfiguredPool::Shared(pool) => pool.packet_counter(token),
        }
    }

    fn stats(&self) -> PoolStats {
        match self {
            ConfiguredPool::Exclusive(pool) => pool.stats(),
            ConfiguredPool::Shared(pool) => pool.stats(),
        }
    }
}

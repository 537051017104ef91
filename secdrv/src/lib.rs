//! secdrv — resource lifecycle core of a user-space SEC crypto driver.
//!
//! The driver hands applications crypto contexts that stay alive until every
//! packet submitted through them has completed, and builds hardware
//! scatter-gather tables for packets that span several buffers. Both pools
//! are fixed-capacity and allocate nothing after init.
//!
//! # Quick Start
//!
//! ```rust
//! use secdrv::{
//!     ContextPool, Direction, DmaRegion, FragmentDescriptor, Release, SgContextPool,
//! };
//!
//! fn main() -> Result<(), secdrv::Error> {
//!     let mut pool = ContextPool::new(16)?;
//!     let ctx = pool.get_free_context().expect("pool has room");
//!
//!     // The completion path holds a counter, not the context.
//!     let packets = pool.packet_counter(&ctx);
//!     packets.packet_submitted();
//!
//!     // Still one packet in flight, so the context retires instead of freeing.
//!     assert_eq!(pool.free_or_retire_context(ctx), Release::Retiring);
//!     packets.packet_completed();
//!     assert_eq!(pool.collect(), 1);
//!
//!     let region = DmaRegion::anonymous(4 * secdrv::SgContext::DMA_BYTES)?;
//!     let mut sg = SgContextPool::new(4, &mut region.cursor())?;
//!     let token = sg.get_free_context().expect("pool has room");
//!     let frags = [
//!         FragmentDescriptor { address: 0x1000, offset: 0, length: 64, total_length: 96, num_fragments: 1 },
//!         FragmentDescriptor { address: 0x2000, offset: 0, length: 32, ..Default::default() },
//!     ];
//!     sg.build_table(&token, &frags, Direction::Input)?;
//!     assert_eq!(sg.context(&token).table(Direction::Input).len(), 2);
//!     sg.free_context(token);
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. DMA memory is either mapped anonymously (identity-mapped
//! IOMMU) or supplied by the caller from a UIO map.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod counter;
pub(crate) mod metrics;

// ── Public modules ──────────────────────────────────────────────────────
pub mod arena;
pub mod config;
pub mod context;
pub mod context_pool;
pub mod dma;
pub mod error;
pub mod list;
pub mod sg;

// ── Re-exports: Crypto contexts ─────────────────────────────────────────

/// Process-wide store of per-context usage and packet counts.
pub use arena::ContextArena;
/// A pool's reservation in a [`ContextArena`].
pub use arena::ArenaSlice;
/// Capacity of the global [`ContextArena`].
pub use arena::MAX_CONTEXTS;
/// A crypto context: job ring binding and completion callback.
pub use context::Context;
/// Proof of ownership of one in-use context.
pub use context::ContextToken;
/// Job ring a context submits to.
pub use context::JobRingHandle;
/// What the notify callback asks the poller to do next.
pub use context::NotifyAction;
/// Per-packet completion callback.
pub use context::NotifyCallback;
/// Packet accounting handle for the submit and completion paths.
pub use context::PacketCounter;
/// Outcome of releasing a context.
pub use context::Release;
/// Completion status passed to the notify callback.
pub use context::Status;
/// Lifecycle state of a context.
pub use context::Usage;
/// Allocation interface shared by every pool flavour.
pub use context_pool::ContextAllocator;
/// Fixed-capacity pool of crypto contexts with deferred reclamation.
pub use context_pool::ContextPool;
/// A pool chosen by [`ThreadMode`].
pub use context_pool::ConfiguredPool;
/// Snapshot of a pool's list sizes.
pub use context_pool::PoolStats;
/// A context waiting for its packets to drain.
pub use context_pool::RetiringContext;
/// A [`ContextPool`] behind a lock, for several producer threads.
pub use context_pool::SharedContextPool;

// ── Re-exports: Scatter-gather ──────────────────────────────────────────

/// Which of an SG context's two tables.
pub use sg::Direction;
/// One packet fragment as described by the application.
pub use sg::FragmentDescriptor;
/// Entries per SG table.
pub use sg::MAX_SG_ENTRIES;
/// Input and output SG tables for one packet.
pub use sg::SgContext;
/// Fixed-capacity pool of SG contexts.
pub use sg::SgContextPool;
/// One 16-byte hardware SG entry.
pub use sg::SgEntry;
/// Sizes of an SG pool's lists.
pub use sg::SgPoolStats;
/// Whether an SG context is handed out.
pub use sg::SgState;
/// One DMA-resident SG table.
pub use sg::SgTable;
/// Proof of ownership of one in-use SG context.
pub use sg::SgToken;

// ── Re-exports: Shared types ────────────────────────────────────────────

/// Pool sizing and threading configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// How a context pool may be shared between threads.
pub use config::ThreadMode;
/// Chunk of DMA memory carved from a region.
pub use dma::DmaChunk;
/// Bump allocator over a DMA region.
pub use dma::DmaCursor;
/// Mapped DMA-visible memory.
pub use dma::DmaRegion;
/// Errors returned by the pools.
pub use error::Error;
/// Intrusive doubly linked list over an arena of nodes.
pub use list::{IntrusiveList, Linked, ListNode, NodeArena, NodeId};
/// Pin the calling thread's metric counters to a shard.
pub use counter::set_thread_shard;

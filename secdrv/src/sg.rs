//! Scatter-gather tables for multi-fragment packets.
//!
//! Each [`SgContext`] owns one input and one output table carved from DMA
//! memory at pool init. [`SgContextPool::build_table`] turns an array of
//! [`FragmentDescriptor`]s into the hardware table layout: one 16-byte
//! [`SgEntry`] per fragment, the last one flagged `FINAL`.

use std::mem;

use crate::config::Config;
use crate::context::next_pool_id;
use crate::dma::{DmaChunk, DmaCursor};
use crate::error::Error;
use crate::list::{IntrusiveList, Linked, ListNode, NodeId};
use crate::metrics;

/// Entries per SG table.
pub const MAX_SG_ENTRIES: usize = 16;

const SG_TABLE_ALIGN: usize = 16;

const GUARD_START: u32 = 0x5EC5_6A7E;
const GUARD_END: u32 = 0x6A7E_5EC5;

/// One hardware scatter-gather entry, stored big-endian.
///
/// ```text
/// Bytes 0..8:   fragment bus address
/// Bytes 8..12:  bit 31 EXTENSION, bit 30 FINAL, bits 29..0 length
/// Bytes 12..16: bits 12..0 offset into the fragment
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgEntry {
    addr: u64,
    len_flags: u32,
    offset: u32,
}

const _: () = assert!(mem::size_of::<SgEntry>() == 16);

impl SgEntry {
    /// Entry points at another table rather than data.
    pub const EXTENSION: u32 = 1 << 31;
    /// Last entry of the table.
    pub const FINAL: u32 = 1 << 30;
    pub const LENGTH_MASK: u32 = Self::FINAL - 1;
    pub const OFFSET_MASK: u32 = (1 << 13) - 1;

    pub fn new(addr: u64, offset: u32, length: u32) -> Self {
        debug_assert!(length <= Self::LENGTH_MASK);
        debug_assert!(offset <= Self::OFFSET_MASK);
        SgEntry {
            addr: addr.to_be(),
            len_flags: (length & Self::LENGTH_MASK).to_be(),
            offset: (offset & Self::OFFSET_MASK).to_be(),
        }
    }

    pub fn addr(&self) -> u64 {
        u64::from_be(self.addr)
    }

    pub fn length(&self) -> u32 {
        u32::from_be(self.len_flags) & Self::LENGTH_MASK
    }

    pub fn offset(&self) -> u32 {
        u32::from_be(self.offset) & Self::OFFSET_MASK
    }

    pub fn is_final(&self) -> bool {
        u32::from_be(self.len_flags) & Self::FINAL != 0
    }

    pub fn is_extension(&self) -> bool {
        u32::from_be(self.len_flags) & Self::EXTENSION != 0
    }

    fn set_final(&mut self) {
        self.len_flags = (u32::from_be(self.len_flags) | Self::FINAL).to_be();
    }

    /// The entry exactly as hardware reads it.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.addr().to_be_bytes());
        out[8..12].copy_from_slice(&u32::from_be(self.len_flags).to_be_bytes());
        out[12..16].copy_from_slice(&u32::from_be(self.offset).to_be_bytes());
        out
    }
}

/// One buffer fragment of a packet, as described by the application.
///
/// `total_length` and `num_fragments` are only read from the first
/// descriptor of an array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentDescriptor {
    /// Bus address of the fragment buffer. Zero is null.
    pub address: u64,
    /// Where the packet data starts inside the buffer.
    pub offset: u32,
    /// Bytes of the buffer that belong to the packet.
    pub length: u32,
    /// Length of the whole packet.
    pub total_length: u32,
    /// Fragments beyond this one; zero means the packet is contiguous.
    pub num_fragments: u32,
}

impl FragmentDescriptor {
    /// A single-buffer packet.
    pub fn contiguous(address: u64, offset: u32, length: u32) -> Self {
        FragmentDescriptor {
            address,
            offset,
            length,
            total_length: length,
            num_fragments: 0,
        }
    }
}

/// Which of an SG context's two tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input = 0,
    Output = 1,
}

/// A fixed table of [`MAX_SG_ENTRIES`] entries in DMA memory.
pub struct SgTable {
    chunk: DmaChunk,
}

impl SgTable {
    /// DMA bytes per table.
    pub const BYTES: usize = MAX_SG_ENTRIES * mem::size_of::<SgEntry>();

    fn carve(cursor: &mut DmaCursor) -> Result<Self, Error> {
        let mut chunk = cursor.carve(Self::BYTES, SG_TABLE_ALIGN)?;
        chunk.zero();
        Ok(SgTable { chunk })
    }

    pub fn entries(&self) -> &[SgEntry] {
        // Safety: the chunk is BYTES long, SG_TABLE_ALIGN-aligned and only
        // ever holds SgEntry values (all-zero is a valid SgEntry).
        unsafe {
            std::slice::from_raw_parts(self.chunk.as_ptr() as *const SgEntry, MAX_SG_ENTRIES)
        }
    }

    fn entries_mut(&mut self) -> &mut [SgEntry] {
        // Safety: see `entries`; `&mut self` gives exclusive access.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.chunk.as_mut_ptr() as *mut SgEntry,
                MAX_SG_ENTRIES,
            )
        }
    }

    /// Bus address programmed into the job descriptor.
    pub fn phys_addr(&self) -> u64 {
        self.chunk.phys_addr()
    }

    /// Entries up to and including the `FINAL` one; zero if none is final.
    pub fn len(&self) -> usize {
        self.entries()
            .iter()
            .position(SgEntry::is_final)
            .map_or(0, |i| i + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) {
        self.chunk.zero();
    }

    fn commit(&mut self, staged: &[SgEntry]) {
        let entries = self.entries_mut();
        entries[..staged.len()].copy_from_slice(staged);
        entries[staged.len()..].fill(SgEntry::default());
    }
}

/// Whether an SG context is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgState {
    Unused,
    Used,
}

/// Input and output SG tables for one packet.
pub struct SgContext {
    start_guard: u32,
    node: ListNode,
    state: SgState,
    pool: u32,
    tables: [SgTable; 2],
    enabled: [bool; 2],
    total_length: [u32; 2],
    end_guard: u32,
}

impl SgContext {
    /// DMA bytes carved per context.
    pub const DMA_BYTES: usize = 2 * SgTable::BYTES;

    fn new(id: NodeId, pool: u32, cursor: &mut DmaCursor) -> Result<Self, Error> {
        Ok(SgContext {
            start_guard: GUARD_START,
            node: ListNode::detached(id),
            state: SgState::Unused,
            pool,
            tables: [SgTable::carve(cursor)?, SgTable::carve(cursor)?],
            enabled: [false; 2],
            total_length: [0; 2],
            end_guard: GUARD_END,
        })
    }

    pub fn state(&self) -> SgState {
        self.state
    }

    pub fn table(&self, dir: Direction) -> &SgTable {
        &self.tables[dir as usize]
    }

    /// Whether a table was built for `dir`. False for contiguous buffers.
    pub fn is_enabled(&self, dir: Direction) -> bool {
        self.enabled[dir as usize]
    }

    /// Packet length recorded by the last successful build for `dir`,
    /// contiguous buffers included.
    pub fn total_length(&self, dir: Direction) -> u32 {
        self.total_length[dir as usize]
    }

    /// Whether both guard values are untouched.
    pub fn is_intact(&self) -> bool {
        self.start_guard == GUARD_START && self.end_guard == GUARD_END
    }

    fn reset(&mut self) {
        for table in &mut self.tables {
            table.clear();
        }
        self.enabled = [false; 2];
        self.total_length = [0; 2];
    }

    fn build_table(
        &mut self,
        fragments: &[FragmentDescriptor],
        dir: Direction,
    ) -> Result<(), Error> {
        let first = fragments
            .first()
            .ok_or(Error::InvalidInput("empty fragment list"))?;
        let d = dir as usize;
        if first.num_fragments == 0 {
            self.tables[d].clear();
            self.enabled[d] = false;
            self.total_length[d] = first.total_length;
            return Ok(());
        }

        let count = first.num_fragments as usize + 1;
        if count > MAX_SG_ENTRIES {
            return Err(Error::InvalidInput("more fragments than SG table entries"));
        }
        if fragments.len() < count {
            return Err(Error::InvalidInput(
                "fragment list shorter than num_fragments + 1",
            ));
        }

        let total = first.total_length as u64;
        let mut staged = [SgEntry::default(); MAX_SG_ENTRIES];
        let mut sum = 0u64;
        for (slot, frag) in staged.iter_mut().zip(&fragments[..count]) {
            if sum > total {
                return Err(Error::InvalidInput(
                    "fragment lengths exceed packet total length",
                ));
            }
            if frag.address == 0 {
                return Err(Error::InvalidInput("null fragment address"));
            }
            if frag.offset >= frag.length {
                return Err(Error::InvalidInput("fragment offset not below its length"));
            }
            if frag.length > SgEntry::LENGTH_MASK || frag.offset > SgEntry::OFFSET_MASK {
                return Err(Error::InvalidInput("fragment does not fit an SG entry"));
            }
            *slot = SgEntry::new(frag.address, frag.offset, frag.length);
            sum += frag.length as u64;
        }
        if sum != total {
            return Err(Error::InvalidInput(
                "fragment lengths do not add up to packet total length",
            ));
        }

        staged[count - 1].set_final();
        self.tables[d].commit(&staged[..count]);
        self.total_length[d] = first.total_length;
        self.enabled[d] = true;
        Ok(())
    }
}

impl Linked for SgContext {
    fn node(&self) -> &ListNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut ListNode {
        &mut self.node
    }
}

/// Proof of ownership of one in-use SG context.
#[must_use = "an SG context must be handed back to its pool"]
#[derive(Debug, PartialEq, Eq)]
pub struct SgToken {
    pool: u32,
    index: u32,
}

impl SgToken {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    fn node(&self) -> NodeId {
        NodeId::new(self.index as usize)
    }
}

/// Sizes of an SG pool's two lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgPoolStats {
    pub capacity: usize,
    pub free: usize,
    pub in_use: usize,
}

/// Fixed-capacity pool of [`SgContext`]s.
///
/// SG contexts serve a single packet and have no asynchronous tail, so
/// release is immediate.
pub struct SgContextPool {
    id: u32,
    contexts: Vec<SgContext>,
    free_list: IntrusiveList,
    in_use_list: IntrusiveList,
}

impl SgContextPool {
    /// Carve `2 * capacity` tables from `cursor` and put every context on the
    /// free list.
    ///
    /// The cursor is checked up front, so on failure it has not moved.
    pub fn new(capacity: usize, cursor: &mut DmaCursor) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("SG pool capacity must be > 0".into()));
        }
        let needed = capacity * SgContext::DMA_BYTES;
        let pad = cursor.padding(SG_TABLE_ALIGN);
        if cursor.remaining() < pad + needed {
            return Err(Error::DmaExhausted {
                requested: pad + needed,
                remaining: cursor.remaining(),
            });
        }

        let id = next_pool_id();
        let mut contexts = Vec::with_capacity(capacity);
        let mut free_list = IntrusiveList::new();
        for i in 0..capacity {
            contexts.push(SgContext::new(NodeId::new(i), id, cursor)?);
            free_list.add_tail(&mut contexts, NodeId::new(i));
        }

        log::info!(
            "sg pool {id}: {capacity} contexts, {needed} DMA bytes, {} left",
            cursor.remaining()
        );
        Ok(SgContextPool {
            id,
            contexts,
            free_list,
            in_use_list: IntrusiveList::new(),
        })
    }

    /// Validate `config` and build a pool of `config.sg_contexts`.
    pub fn from_config(config: &Config, cursor: &mut DmaCursor) -> Result<Self, Error> {
        config.validate()?;
        Self::new(config.sg_contexts, cursor)
    }

    pub fn capacity(&self) -> usize {
        self.contexts.len()
    }

    /// Hand out a free context with both tables zeroed, or `None` if all are
    /// in use.
    pub fn get_free_context(&mut self) -> Option<SgToken> {
        let Some(id) = self.free_list.remove_first(&mut self.contexts) else {
            metrics::SG_POOL_EXHAUSTED.increment();
            log::debug!("sg pool {}: exhausted", self.id);
            return None;
        };
        let ctx = &mut self.contexts[id.index()];
        assert!(ctx.is_intact(), "SG context {} guard values corrupted", id.index());
        debug_assert_eq!(ctx.state, SgState::Unused);
        ctx.reset();
        ctx.state = SgState::Used;
        self.in_use_list.add_tail(&mut self.contexts, id);
        metrics::SG_ACQUIRED.increment();
        Some(SgToken {
            pool: self.id,
            index: id.index() as u32,
        })
    }

    /// Return a context to the free list.
    ///
    /// # Panics
    ///
    /// Panics if `token` was issued by another pool.
    pub fn free_context(&mut self, token: SgToken) {
        self.check(&token);
        let id = token.node();
        let ctx = &mut self.contexts[id.index()];
        assert!(ctx.is_intact(), "SG context {} guard values corrupted", id.index());
        assert_eq!(ctx.pool, self.id, "SG context {} not owned by pool", id.index());
        assert_eq!(ctx.state, SgState::Used, "SG context released twice");
        ctx.state = SgState::Unused;
        self.in_use_list.delete(&mut self.contexts, id);
        self.free_list.add_tail(&mut self.contexts, id);
        metrics::SG_RELEASED.increment();
    }

    /// Fill the `dir` table of the context behind `token` from `fragments`.
    ///
    /// `fragments[0].num_fragments == 0` means the buffer is contiguous: the
    /// table is cleared and the direction disabled. Otherwise
    /// `num_fragments + 1` descriptors are consumed. The table is only
    /// written once every fragment has been validated and the lengths add up
    /// to `total_length`; on error it keeps its previous contents.
    pub fn build_table(
        &mut self,
        token: &SgToken,
        fragments: &[FragmentDescriptor],
        dir: Direction,
    ) -> Result<(), Error> {
        self.check(token);
        let ctx = &mut self.contexts[token.index()];
        match ctx.build_table(fragments, dir) {
            Ok(()) => {
                if ctx.is_enabled(dir) {
                    metrics::SG_TABLES_BUILT.increment();
                }
                Ok(())
            }
            Err(e) => {
                metrics::SG_TABLES_REJECTED.increment();
                log::warn!("sg pool {}: {dir:?} table rejected: {e}", self.id);
                Err(e)
            }
        }
    }

    pub fn context(&self, token: &SgToken) -> &SgContext {
        self.check(token);
        &self.contexts[token.index()]
    }

    pub fn stats(&self) -> SgPoolStats {
        SgPoolStats {
            capacity: self.contexts.len(),
            free: self.free_list.len(),
            in_use: self.in_use_list.len(),
        }
    }

    /// Tear the pool down. The DMA memory stays with its region.
    pub fn destroy(self) -> SgPoolStats {
        self.stats()
    }

    fn check(&self, token: &SgToken) {
        assert_eq!(
            token.pool, self.id,
            "SG token from pool {} used with pool {}",
            token.pool, self.id
        );
    }
}

impl Drop for SgContextPool {
    fn drop(&mut self) {
        let in_use = self.in_use_list.len();
        if in_use > 0 {
            log::warn!("sg pool {}: destroyed with {in_use} in use", self.id);
        }
        mem::take(&mut self.free_list).destroy(&mut self.contexts);
        mem::take(&mut self.in_use_list).destroy(&mut self.contexts);
        for ctx in &mut self.contexts {
            ctx.reset();
            ctx.state = SgState::Unused;
        }
        log::info!("sg pool {}: released {} contexts", self.id, self.contexts.len());
    }
}

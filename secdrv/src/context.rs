//! Per-flow crypto context and its packed usage/packet state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::arena::ContextArena;
use crate::list::{Linked, ListNode, NodeId};
use crate::sg::FragmentDescriptor;

/// Lifecycle tag of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Usage {
    /// On the free list.
    Unused = 0,
    /// Handed out to the application.
    Used = 1,
    /// Released by the application with packets still in hardware.
    Retiring = 2,
}

impl Usage {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Usage::Unused,
            1 => Usage::Used,
            2 => Usage::Retiring,
            _ => unreachable!("corrupt context usage tag {bits}"),
        }
    }
}

/// Outcome of [`ContextPool::free_or_retire_context`](crate::ContextPool::free_or_retire_context).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// No packets outstanding; the context is back on the free list.
    Freed,
    /// Packets are still in flight; the context is reclaimed once they drain.
    Retiring,
}

/// Completion status handed to a [`NotifyCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    /// Hardware reported an error; details in `error_info`.
    Error,
    /// Packet belonged to a context being deleted.
    Overdue,
    /// Last overdue packet for a context being deleted.
    LastOverdue,
    /// Hyper frame number crossed the configured threshold.
    HfnThresholdReached,
}

/// Whether the ring layer should keep delivering completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    Continue,
    Stop,
}

/// Per-packet completion callback, invoked by the ring layer.
pub type NotifyCallback = fn(
    in_packet: &[FragmentDescriptor],
    out_packet: &[FragmentDescriptor],
    ua_handle: u64,
    status: Status,
    error_info: u32,
) -> NotifyAction;

/// Opaque reference to the job ring a context is affined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobRingHandle(pub u16);

/// Usage tag, generation and outstanding packet count packed into one word.
///
/// ```text
/// Bits 63..48: Usage
/// Bits 47..32: generation
/// Bits 31..0:  packets in flight
/// ```
///
/// The producer (release) and consumer (completion) roles race on this word,
/// so every transition is a single compare-and-swap. The generation moves on
/// every transition to `Unused`; a [`PacketCounter`] taken before that no
/// longer matches and panics instead of touching the next owner's count.
pub(crate) struct ContextState(AtomicU64);

impl ContextState {
    const USAGE_SHIFT: u32 = 48;
    const GENERATION_SHIFT: u32 = 32;
    const GENERATION_MASK: u64 = 0xFFFF;
    const PACKETS_MASK: u64 = 0xFFFF_FFFF;

    pub const fn new() -> Self {
        ContextState(AtomicU64::new(0))
    }

    #[inline]
    fn pack(usage: Usage, generation: u16, packets: u32) -> u64 {
        ((usage as u64) << Self::USAGE_SHIFT)
            | ((generation as u64) << Self::GENERATION_SHIFT)
            | packets as u64
    }

    #[inline]
    fn unpack(word: u64) -> (Usage, u16, u32) {
        (
            Usage::from_bits((word >> Self::USAGE_SHIFT) as u8),
            ((word >> Self::GENERATION_SHIFT) & Self::GENERATION_MASK) as u16,
            (word & Self::PACKETS_MASK) as u32,
        )
    }

    pub fn load(&self) -> (Usage, u32) {
        let (usage, _, packets) = Self::unpack(self.0.load(Ordering::Acquire));
        (usage, packets)
    }

    pub fn generation(&self) -> u16 {
        Self::unpack(self.0.load(Ordering::Acquire)).1
    }

    /// Back to `Unused` with no packets, whatever the current state.
    pub fn reset(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (_, generation, _) = Self::unpack(word);
                Some(Self::pack(Usage::Unused, generation.wrapping_add(1), 0))
            });
    }

    /// `Unused -> Used`.
    pub fn acquire(&self) {
        let result = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                match Self::unpack(word) {
                    (Usage::Unused, generation, 0) => {
                        Some(Self::pack(Usage::Used, generation, 0))
                    }
                    _ => None,
                }
            });
        if let Err(actual) = result {
            panic!("acquiring context in state {:?}", Self::unpack(actual));
        }
    }

    /// `Used -> Unused` when idle, `Used -> Retiring` otherwise.
    pub fn free_or_retire(&self) -> Release {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let (usage, generation, packets) = Self::unpack(current);
            assert_eq!(usage, Usage::Used, "releasing a context that is not in use");
            let (next, outcome) = if packets == 0 {
                (
                    Self::pack(Usage::Unused, generation.wrapping_add(1), 0),
                    Release::Freed,
                )
            } else {
                (
                    Self::pack(Usage::Retiring, generation, packets),
                    Release::Retiring,
                )
            };
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return outcome,
                Err(actual) => current = actual,
            }
        }
    }

    /// `Retiring -> Unused` once the last packet has been reported.
    pub fn try_collect(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                match Self::unpack(word) {
                    (Usage::Retiring, generation, 0) => Some(Self::pack(
                        Usage::Unused,
                        generation.wrapping_add(1),
                        0,
                    )),
                    _ => None,
                }
            })
            .is_ok()
    }

    /// Count a packet for the owner of `generation`. Returns the new
    /// outstanding count.
    pub fn packet_submitted(&self, generation: u16) -> u32 {
        let result = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (usage, current, packets) = Self::unpack(word);
                if usage != Usage::Used || current != generation {
                    return None;
                }
                packets.checked_add(1).map(|p| Self::pack(usage, current, p))
            });
        match result {
            Ok(prev) => Self::unpack(prev).2 + 1,
            Err(word) => {
                Self::stale_check(word, generation);
                panic!(
                    "packet submitted on context in state {:?}",
                    Self::unpack(word)
                )
            }
        }
    }

    /// Count a completion for the owner of `generation`. Returns the new
    /// outstanding count.
    pub fn packet_completed(&self, generation: u16) -> u32 {
        let result = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (usage, current, packets) = Self::unpack(word);
                if usage == Usage::Unused || current != generation || packets == 0 {
                    return None;
                }
                Some(Self::pack(usage, current, packets - 1))
            });
        match result {
            Ok(prev) => Self::unpack(prev).2 - 1,
            Err(word) => {
                Self::stale_check(word, generation);
                panic!(
                    "completion reported on context in state {:?}",
                    Self::unpack(word)
                )
            }
        }
    }

    fn stale_check(word: u64, generation: u16) {
        let current = Self::unpack(word).1;
        assert_eq!(
            current, generation,
            "stale packet counter: context generation {current}, counter generation {generation}"
        );
    }
}

/// Shared handle on a context's outstanding packet count.
///
/// The submitting path calls [`packet_submitted`](Self::packet_submitted)
/// before handing a packet to hardware; the completion path calls
/// [`packet_completed`](Self::packet_completed) once per packet reported to
/// the application, overdue notifications included. The handle stays valid
/// while the context is retiring, which is what lets a deleted context drain.
///
/// Once the context has been reclaimed the handle is stale: it reads as
/// `Unused` with nothing outstanding, and counting through it panics.
#[derive(Clone)]
pub struct PacketCounter {
    arena: Arc<ContextArena>,
    cell: u32,
    generation: u16,
}

impl PacketCounter {
    pub(crate) fn new(arena: Arc<ContextArena>, cell: u32) -> Self {
        let generation = arena.cell(cell).generation();
        PacketCounter {
            arena,
            cell,
            generation,
        }
    }

    #[inline]
    fn state(&self) -> &ContextState {
        self.arena.cell(self.cell)
    }

    /// Count one packet handed to hardware. Returns the new outstanding count.
    ///
    /// # Panics
    ///
    /// Panics if the context is not in use or the handle is stale.
    pub fn packet_submitted(&self) -> u32 {
        self.state().packet_submitted(self.generation)
    }

    /// Count one packet reported back. Returns the new outstanding count.
    ///
    /// # Panics
    ///
    /// Panics if no packet is outstanding or the handle is stale.
    pub fn packet_completed(&self) -> u32 {
        self.state().packet_completed(self.generation)
    }

    /// Whether the context this handle was taken for has been reclaimed.
    pub fn is_stale(&self) -> bool {
        self.state().generation() != self.generation
    }

    pub fn outstanding(&self) -> u32 {
        if self.is_stale() {
            return 0;
        }
        self.state().load().1
    }

    pub fn usage(&self) -> Usage {
        if self.is_stale() {
            return Usage::Unused;
        }
        self.state().load().0
    }
}

impl std::fmt::Debug for PacketCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCounter")
            .field("cell", &self.cell)
            .field("generation", &self.generation)
            .field("usage", &self.usage())
            .field("packets", &self.outstanding())
            .finish()
    }
}

/// Proof of ownership of one in-use context.
///
/// Returned by `get_free_context` and consumed by `free_or_retire_context`,
/// so a context cannot be released twice. Tokens are bound to the pool that
/// issued them.
#[must_use = "a context must be handed back to its pool"]
#[derive(Debug, PartialEq, Eq)]
pub struct ContextToken {
    pub(crate) pool: u32,
    pub(crate) index: u32,
}

impl ContextToken {
    /// Index of the context within its pool.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn node(&self) -> NodeId {
        NodeId::new(self.index as usize)
    }
}

/// Pool-local part of a crypto context.
///
/// The usage tag and packet count live in the shared arena cell; see
/// [`PacketCounter`].
pub struct Context {
    node: ListNode,
    jr_handle: Option<JobRingHandle>,
    notify_cbk: Option<NotifyCallback>,
}

impl Context {
    pub(crate) fn new(id: NodeId) -> Self {
        Context {
            node: ListNode::detached(id),
            jr_handle: None,
            notify_cbk: None,
        }
    }

    /// Affine the context to a job ring and install its completion callback.
    pub fn bind(&mut self, jr_handle: JobRingHandle, notify_cbk: NotifyCallback) {
        self.jr_handle = Some(jr_handle);
        self.notify_cbk = Some(notify_cbk);
    }

    pub fn jr_handle(&self) -> Option<JobRingHandle> {
        self.jr_handle
    }

    pub fn notify_cbk(&self) -> Option<NotifyCallback> {
        self.notify_cbk
    }

    pub(crate) fn clear(&mut self) {
        self.jr_handle = None;
        self.notify_cbk = None;
    }
}

impl Linked for Context {
    fn node(&self) -> &ListNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut ListNode {
        &mut self.node
    }
}

/// Allocate a process-unique pool id for token binding.
pub(crate) fn next_pool_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_layout() {
        let word = ContextState::pack(Usage::Retiring, 0x1234, 0xDEAD_BEEF);
        assert_eq!(word >> 48, 2);
        assert_eq!((word >> 32) & 0xFFFF, 0x1234);
        assert_eq!(word & 0xFFFF_FFFF, 0xDEAD_BEEF);
        assert_eq!(
            ContextState::unpack(word),
            (Usage::Retiring, 0x1234, 0xDEAD_BEEF)
        );
    }

    #[test]
    fn free_when_idle() {
        let state = ContextState::new();
        state.acquire();
        assert_eq!(state.load(), (Usage::Used, 0));
        assert_eq!(state.generation(), 0);
        assert_eq!(state.free_or_retire(), Release::Freed);
        assert_eq!(state.load(), (Usage::Unused, 0));
        assert_eq!(state.generation(), 1);
    }

    #[test]
    fn retire_then_collect() {
        let state = ContextState::new();
        state.acquire();
        let generation = state.generation();
        assert_eq!(state.packet_submitted(generation), 1);
        assert_eq!(state.packet_submitted(generation), 2);
        assert_eq!(state.free_or_retire(), Release::Retiring);
        assert_eq!(state.load(), (Usage::Retiring, 2));
        assert_eq!(state.generation(), generation);

        assert!(!state.try_collect());
        assert_eq!(state.packet_completed(generation), 1);
        assert!(!state.try_collect());
        assert_eq!(state.packet_completed(generation), 0);
        assert!(state.try_collect());
        assert_eq!(state.load(), (Usage::Unused, 0));
        assert_eq!(state.generation(), generation.wrapping_add(1));
    }

    #[test]
    #[should_panic(expected = "acquiring context")]
    fn double_acquire_panics() {
        let state = ContextState::new();
        state.acquire();
        state.acquire();
    }

    #[test]
    #[should_panic(expected = "packet submitted")]
    fn submit_on_retiring_panics() {
        let state = ContextState::new();
        state.acquire();
        state.packet_submitted(0);
        state.free_or_retire();
        state.packet_submitted(0);
    }

    #[test]
    #[should_panic(expected = "completion reported")]
    fn completion_underflow_panics() {
        let state = ContextState::new();
        state.acquire();
        state.packet_completed(0);
    }

    #[test]
    fn reset_moves_generation_on() {
        let state = ContextState::new();
        state.acquire();
        state.packet_submitted(0);
        state.reset();
        assert_eq!(state.load(), (Usage::Unused, 0));
        assert_eq!(state.generation(), 1);
        state.acquire();
        assert_eq!(state.packet_submitted(1), 1);
    }

    #[test]
    fn generation_wraps() {
        let state = ContextState(AtomicU64::new(ContextState::pack(
            Usage::Used,
            u16::MAX,
            0,
        )));
        assert_eq!(state.free_or_retire(), Release::Freed);
        assert_eq!(state.generation(), 0);
        state.acquire();
        assert_eq!(state.packet_submitted(0), 1);
    }

    #[test]
    #[should_panic(expected = "stale packet counter")]
    fn completion_from_old_generation_panics() {
        let state = ContextState::new();
        state.acquire();
        state.free_or_retire();
        state.acquire();
        state.packet_submitted(1);
        state.packet_completed(0);
    }

    #[test]
    fn context_bind_and_clear() {
        fn cbk(
            _: &[FragmentDescriptor],
            _: &[FragmentDescriptor],
            _: u64,
            _: Status,
            _: u32,
        ) -> NotifyAction {
            NotifyAction::Continue
        }

        let mut ctx = Context::new(NodeId::new(0));
        ctx.bind(JobRingHandle(3), cbk);
        assert_eq!(ctx.jr_handle(), Some(JobRingHandle(3)));
        let f = ctx.notify_cbk().unwrap();
        assert_eq!(f(&[], &[], 7, Status::Success, 0), NotifyAction::Continue);

        ctx.clear();
        assert!(ctx.jr_handle().is_none());
        assert!(ctx.notify_cbk().is_none());
    }
}

//! Circular doubly-linked list over nodes embedded in owner records.
//!
//! Owners live in an arena (normally a `Vec` owned by a pool) and embed a
//! [`ListNode`]. Lists never hold addresses: links are [`NodeId`]s into the
//! arena, and the sentinel head lives inside the [`IntrusiveList`] itself.
//! Recovering the owner from a node is plain indexing.
//!
//! A node whose `next` and `prev` both point at itself is detached.
//!
//! Mutation requires `&mut` access to both the list and the arena, so a list
//! is only ever changed by the one thread that owns its pool. Pools that must
//! be shared between threads put the whole pool behind a lock instead (see
//! [`SharedContextPool`](crate::SharedContextPool)).

/// Index of a node (and its owner) inside an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Build an id from an arena index.
    #[inline]
    pub const fn new(index: usize) -> Self {
        debug_assert!(index < u32::MAX as usize);
        NodeId(index as u32)
    }

    /// Arena index of this node.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// The sentinel head of whichever list the node is linked into.
    Head,
    Node(NodeId),
}

/// Two links embedded in an owner record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListNode {
    next: Link,
    prev: Link,
}

impl ListNode {
    /// A node linked only to itself.
    pub const fn detached(id: NodeId) -> Self {
        ListNode {
            next: Link::Node(id),
            prev: Link::Node(id),
        }
    }

    /// Whether the node is outside every list.
    pub fn is_detached(&self, id: NodeId) -> bool {
        self.next == Link::Node(id) && self.prev == Link::Node(id)
    }
}

/// An owner record carrying a [`ListNode`].
pub trait Linked {
    fn node(&self) -> &ListNode;
    fn node_mut(&mut self) -> &mut ListNode;
}

/// Storage that resolves a [`NodeId`] to its embedded node.
pub trait NodeArena {
    fn node(&self, id: NodeId) -> &ListNode;
    fn node_mut(&mut self, id: NodeId) -> &mut ListNode;
}

impl<T: Linked> NodeArena for [T] {
    #[inline]
    fn node(&self, id: NodeId) -> &ListNode {
        self[id.index()].node()
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut ListNode {
        self[id.index()].node_mut()
    }
}

impl<T: Linked> NodeArena for Vec<T> {
    #[inline]
    fn node(&self, id: NodeId) -> &ListNode {
        self[id.index()].node()
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut ListNode {
        self[id.index()].node_mut()
    }
}

/// Sentinel head plus a member count.
///
/// All operations are O(1) except [`destroy`](Self::destroy) and iteration.
#[derive(Debug)]
pub struct IntrusiveList {
    head: ListNode,
    len: usize,
}

impl Default for IntrusiveList {
    fn default() -> Self {
        Self::new()
    }
}

impl IntrusiveList {
    /// Create an empty list (head linked to itself).
    pub const fn new() -> Self {
        IntrusiveList {
            head: ListNode {
                next: Link::Head,
                prev: Link::Head,
            },
            len: 0,
        }
    }

    /// Detach every member and consume the list.
    pub fn destroy<A: NodeArena + ?Sized>(mut self, arena: &mut A) {
        while self.remove_first(arena).is_some() {}
    }

    pub fn is_empty(&self) -> bool {
        debug_assert_eq!(self.head.next == Link::Head, self.len == 0);
        self.head.next == Link::Head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether `id` is the last member of this list.
    pub fn is_end<A: NodeArena + ?Sized>(&self, arena: &A, id: NodeId) -> bool {
        arena.node(id).next == Link::Head
    }

    /// Link a detached node at the tail.
    ///
    /// The caller guarantees the node is not a member of any list; debug
    /// builds check that it is detached.
    pub fn add_tail<A: NodeArena + ?Sized>(&mut self, arena: &mut A, id: NodeId) {
        debug_assert!(
            arena.node(id).is_detached(id),
            "node {id:?} is already linked"
        );
        let prev = self.head.prev;
        {
            let node = arena.node_mut(id);
            node.next = Link::Head;
            node.prev = prev;
        }
        self.set_next(arena, prev, Link::Node(id));
        self.head.prev = Link::Node(id);
        self.len += 1;
    }

    /// Unlink and return the first member, leaving it detached.
    pub fn remove_first<A: NodeArena + ?Sized>(&mut self, arena: &mut A) -> Option<NodeId> {
        let id = self.first()?;
        self.delete(arena, id);
        Some(id)
    }

    /// Unlink `id` from wherever it sits in this list, leaving it detached.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already detached. Unlinking a node that belongs to
    /// a different list corrupts both lists; callers track membership.
    pub fn delete<A: NodeArena + ?Sized>(&mut self, arena: &mut A, id: NodeId) {
        let ListNode { next, prev } = *arena.node(id);
        assert!(
            next != Link::Node(id) || prev != Link::Node(id),
            "node {id:?} is not linked"
        );
        self.set_next(arena, prev, next);
        self.set_prev(arena, next, prev);
        *arena.node_mut(id) = ListNode::detached(id);
        self.len -= 1;
    }

    /// First member, or `None` when empty.
    pub fn first(&self) -> Option<NodeId> {
        match self.head.next {
            Link::Head => None,
            Link::Node(id) => Some(id),
        }
    }

    /// Member following `id`, or `None` when `id` is the end.
    pub fn next<A: NodeArena + ?Sized>(&self, arena: &A, id: NodeId) -> Option<NodeId> {
        match arena.node(id).next {
            Link::Head => None,
            Link::Node(next) => Some(next),
        }
    }

    /// Walk the members from head to tail.
    pub fn iter<'a, A: NodeArena + ?Sized>(&'a self, arena: &'a A) -> Iter<'a, A> {
        Iter {
            list: self,
            arena,
            cursor: self.first(),
        }
    }

    fn set_next<A: NodeArena + ?Sized>(&mut self, arena: &mut A, at: Link, to: Link) {
        match at {
            Link::Head => self.head.next = to,
            Link::Node(id) => arena.node_mut(id).next = to,
        }
    }

    fn set_prev<A: NodeArena + ?Sized>(&mut self, arena: &mut A, at: Link, to: Link) {
        match at {
            Link::Head => self.head.prev = to,
            Link::Node(id) => arena.node_mut(id).prev = to,
        }
    }
}

/// Iterator returned by [`IntrusiveList::iter`].
pub struct Iter<'a, A: NodeArena + ?Sized> {
    list: &'a IntrusiveList,
    arena: &'a A,
    cursor: Option<NodeId>,
}

impl<A: NodeArena + ?Sized> Iterator for Iter<'_, A> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cursor?;
        self.cursor = self.list.next(self.arena, id);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        node: ListNode,
        value: u32,
    }

    impl Linked for Item {
        fn node(&self) -> &ListNode {
            &self.node
        }
        fn node_mut(&mut self) -> &mut ListNode {
            &mut self.node
        }
    }

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item {
                node: ListNode::detached(NodeId::new(i)),
                value: i as u32 * 10,
            })
            .collect()
    }

    #[test]
    fn new_list_is_empty() {
        let list = IntrusiveList::new();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert_eq!(list.first(), None);
    }

    #[test]
    fn fifo_order() {
        let mut arena = items(5);
        let mut list = IntrusiveList::new();
        for i in 0..5 {
            list.add_tail(&mut arena, NodeId::new(i));
        }
        assert_eq!(list.len(), 5);
        for i in 0..5 {
            assert_eq!(list.remove_first(&mut arena), Some(NodeId::new(i)));
            assert!(arena.node(NodeId::new(i)).is_detached(NodeId::new(i)));
        }
        assert!(list.is_empty());
        assert_eq!(list.remove_first(&mut arena), None);
    }

    #[test]
    fn delete_middle_head_and_tail() {
        let mut arena = items(4);
        let mut list = IntrusiveList::new();
        for i in 0..4 {
            list.add_tail(&mut arena, NodeId::new(i));
        }

        list.delete(&mut arena, NodeId::new(2));
        let order: Vec<_> = list.iter(&arena).map(NodeId::index).collect();
        assert_eq!(order, vec![0, 1, 3]);

        list.delete(&mut arena, NodeId::new(0));
        list.delete(&mut arena, NodeId::new(3));
        let order: Vec<_> = list.iter(&arena).map(NodeId::index).collect();
        assert_eq!(order, vec![1]);
        assert!(list.is_end(&arena, NodeId::new(1)));

        list.delete(&mut arena, NodeId::new(1));
        assert!(list.is_empty());
    }

    #[test]
    fn is_end_and_next() {
        let mut arena = items(3);
        let mut list = IntrusiveList::new();
        for i in 0..3 {
            list.add_tail(&mut arena, NodeId::new(i));
        }
        let first = list.first().unwrap();
        assert_eq!(first, NodeId::new(0));
        assert!(!list.is_end(&arena, first));
        let second = list.next(&arena, first).unwrap();
        let third = list.next(&arena, second).unwrap();
        assert!(list.is_end(&arena, third));
        assert_eq!(list.next(&arena, third), None);
        assert_eq!(arena[third.index()].value, 20);
    }

    #[test]
    fn move_between_lists() {
        let mut arena = items(3);
        let mut a = IntrusiveList::new();
        let mut b = IntrusiveList::new();
        for i in 0..3 {
            a.add_tail(&mut arena, NodeId::new(i));
        }
        let id = NodeId::new(1);
        a.delete(&mut arena, id);
        b.add_tail(&mut arena, id);

        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert_eq!(b.first(), Some(id));
        assert!(b.is_end(&arena, id));
        let rest: Vec<_> = a.iter(&arena).map(NodeId::index).collect();
        assert_eq!(rest, vec![0, 2]);
    }

    #[test]
    fn destroy_detaches_members() {
        let mut arena = items(3);
        let mut list = IntrusiveList::new();
        for i in 0..3 {
            list.add_tail(&mut arena, NodeId::new(i));
        }
        list.destroy(&mut arena);
        for i in 0..3 {
            assert!(arena.node(NodeId::new(i)).is_detached(NodeId::new(i)));
        }
    }

    #[test]
    #[should_panic(expected = "is not linked")]
    fn delete_detached_panics() {
        let mut arena = items(1);
        let mut list = IntrusiveList::new();
        list.add_tail(&mut arena, NodeId::new(0));
        list.delete(&mut arena, NodeId::new(0));
        list.delete(&mut arena, NodeId::new(0));
    }
}

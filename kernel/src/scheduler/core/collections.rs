//! Intrusive collections - list and ordered tree
//!
//! Nodes carry their own link and are boxed once on insertion. Inserting
//! moves the value into the collection, popping or removing moves it back
//! out: a value is never in two collections at once and never aliased by
//! one while the caller holds it.
//!
//! The tree is ordered by [`RbLess`]. Elements that compare equal keep their
//! insertion order.

use alloc::boxed::Box;
use core::cmp::Ordering;
use intrusive_collections::{
    intrusive_adapter, Bound, KeyAdapter, LinkedList, LinkedListLink, RBTree, RBTreeLink,
};

/// List node
pub struct ListNode<T> {
    link: LinkedListLink,
    value: T,
}

intrusive_adapter!(pub ListAdapter<T> = Box<ListNode<T>>: ListNode<T> { link: LinkedListLink });

/// Doubly-linked list. All pushes and pops are O(1).
pub struct List<T> {
    inner: LinkedList<ListAdapter<T>>,
    len: usize,
}

impl<T> List<T> {
    pub fn new() -> Self {
        Self { inner: LinkedList::new(ListAdapter::new()), len: 0 }
    }

    fn node(value: T) -> Box<ListNode<T>> {
        Box::new(ListNode { link: LinkedListLink::new(), value })
    }

    pub fn push_front(&mut self, value: T) {
        self.inner.push_front(Self::node(value));
        self.len += 1;
    }

    pub fn push_back(&mut self, value: T) {
        self.inner.push_back(Self::node(value));
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let node = self.inner.pop_front()?;
        self.len -= 1;
        Some(node.value)
    }

    pub fn pop_back(&mut self) -> Option<T> {
        let node = self.inner.pop_back()?;
        self.len -= 1;
        Some(node.value)
    }

    pub fn front(&self) -> Option<&T> {
        self.inner.front().get().map(|n| &n.value)
    }

    pub fn back(&self) -> Option<&T> {
        self.inner.back().get().map(|n| &n.value)
    }

    /// Detach the first element matching `pred`. O(n).
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let mut cursor = self.inner.front_mut();
        while let Some(node) = cursor.get() {
            if pred(&node.value) {
                let node = cursor.remove()?;
                self.len -= 1;
                return Some(node.value);
            }
            cursor.move_next();
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter().map(|n| &n.value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Strict weak ordering for tree elements. Must be pure: the result for two
/// elements may not change while either is in a tree.
pub trait RbLess {
    fn less(&self, other: &Self) -> bool;
}

/// Tree node
pub struct RbNode<T> {
    link: RBTreeLink,
    /// Insertion counter, orders elements that compare equal
    order: u64,
    value: T,
}

intrusive_adapter!(pub RbAdapter<T> = Box<RbNode<T>>: RbNode<T> { link: RBTreeLink });

/// Tree key: the element under [`RbLess`], then insertion order
pub struct RbKey<'a, T> {
    value: &'a T,
    order: u64,
}

impl<T: RbLess> Ord for RbKey<'_, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value.less(other.value) {
            Ordering::Less
        } else if other.value.less(self.value) {
            Ordering::Greater
        } else {
            self.order.cmp(&other.order)
        }
    }
}

impl<T: RbLess> PartialOrd for RbKey<'_, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: RbLess> PartialEq for RbKey<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: RbLess> Eq for RbKey<'_, T> {}

impl<'a, T: RbLess + 'static> KeyAdapter<'a> for RbAdapter<T> {
    type Key = RbKey<'a, T>;

    fn get_key(&self, node: &'a RbNode<T>) -> RbKey<'a, T> {
        RbKey { value: &node.value, order: node.order }
    }
}

/// Ordered tree. `add` and `remove` are O(log n), `first` is O(log n).
pub struct RbTree<T: RbLess + 'static> {
    inner: RBTree<RbAdapter<T>>,
    next_order: u64,
    len: usize,
}

impl<T: RbLess + 'static> RbTree<T> {
    pub fn new() -> Self {
        Self { inner: RBTree::new(RbAdapter::new()), next_order: 0, len: 0 }
    }

    /// Insert keeping order
    pub fn add(&mut self, value: T) {
        let order = self.next_order;
        self.next_order += 1;
        self.inner.insert(Box::new(RbNode { link: RBTreeLink::new(), order, value }));
        self.len += 1;
    }

    /// Minimum element, left in place
    pub fn first(&self) -> Option<&T> {
        self.inner.front().get().map(|n| &n.value)
    }

    /// Detach the minimum element
    pub fn pop_first(&mut self) -> Option<T> {
        let node = self.inner.front_mut().remove()?;
        self.len -= 1;
        Some(node.value)
    }

    /// Detach the smallest element matching `pred`. O(n) worst case.
    pub fn pop_first_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let mut cursor = self.inner.front_mut();
        while let Some(node) = cursor.get() {
            if pred(&node.value) {
                let node = cursor.remove()?;
                self.len -= 1;
                return Some(node.value);
            }
            cursor.move_next();
        }
        None
    }

    /// Detach the element that compares equal to `key` and satisfies
    /// `is_target`. Only the run of elements equal to `key` is scanned.
    pub fn remove(&mut self, key: &T, mut is_target: impl FnMut(&T) -> bool) -> Option<T> {
        let start = RbKey { value: key, order: 0 };
        let mut cursor = self.inner.lower_bound_mut(Bound::Included(&start));
        while let Some(node) = cursor.get() {
            if key.less(&node.value) {
                break;
            }
            if is_target(&node.value) {
                let node = cursor.remove()?;
                self.len -= 1;
                return Some(node.value);
            }
            cursor.move_next();
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter().map(|n| &n.value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T: RbLess + 'static> Default for RbTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Item {
        key: u32,
        id: u32,
    }

    impl RbLess for Item {
        fn less(&self, other: &Self) -> bool {
            self.key < other.key
        }
    }

    #[test]
    fn test_list_order() {
        let mut l = List::new();
        l.push_back(2);
        l.push_front(1);
        l.push_back(3);
        assert_eq!(l.len(), 3);
        assert_eq!(l.front(), Some(&1));
        assert_eq!(l.back(), Some(&3));
        assert_eq!(l.pop_back(), Some(3));
        assert_eq!(l.pop_front(), Some(1));
        assert_eq!(l.pop_front(), Some(2));
        assert_eq!(l.pop_front(), None);
        assert!(l.is_empty());
    }

    #[test]
    fn test_list_remove_where() {
        let mut l = List::new();
        for i in 0..5 {
            l.push_back(i);
        }
        assert_eq!(l.remove_where(|&v| v == 3), Some(3));
        assert_eq!(l.remove_where(|&v| v == 3), None);
        assert_eq!(l.iter().copied().collect::<Vec<_>>(), [0, 1, 2, 4]);
        assert_eq!(l.len(), 4);
    }

    #[test]
    fn test_tree_ties_keep_insertion_order() {
        let mut t = RbTree::new();
        t.add(Item { key: 5, id: 0 });
        t.add(Item { key: 1, id: 1 });
        t.add(Item { key: 5, id: 2 });
        t.add(Item { key: 5, id: 3 });
        let ids: Vec<u32> = t.iter().map(|i| i.id).collect();
        assert_eq!(ids, [1, 0, 2, 3]);

        let removed = t.remove(&Item { key: 5, id: 2 }, |i| i.id == 2).unwrap();
        assert_eq!(removed.id, 2);
        assert!(t.remove(&Item { key: 5, id: 2 }, |i| i.id == 2).is_none());
        assert_eq!(t.pop_first().map(|i| i.id), Some(1));
        assert_eq!(t.first().map(|i| i.id), Some(0));
        assert_eq!(t.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_tree_first_is_minimum(ops in proptest::collection::vec((any::<bool>(), 0u32..32), 1..64)) {
            let mut tree = RbTree::new();
            let mut model: Vec<Item> = Vec::new();
            for (i, (add, key)) in ops.into_iter().enumerate() {
                if add || model.is_empty() {
                    let item = Item { key, id: i as u32 };
                    tree.add(item);
                    model.push(item);
                } else {
                    let victim = model.remove(key as usize % model.len());
                    let got = tree.remove(&victim, |it| it.id == victim.id);
                    prop_assert_eq!(got, Some(victim));
                }
                prop_assert_eq!(tree.len(), model.len());
                let min = model.iter().map(|it| it.key).min();
                prop_assert_eq!(tree.first().map(|it| it.key), min);
            }
        }
    }
}

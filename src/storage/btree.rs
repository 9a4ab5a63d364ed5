//! Ordered in-memory B-tree used beneath every index of the store.
//!
//! Elements are opaque to the tree; ordering comes entirely from the
//! comparator handed to [`BTreeIndex::new`]. Cursors are [`Position`]s: the
//! child indices from the root down to a node plus a slot within that node.
//! A position is only valid until the next structural mutation.

use std::cmp::Ordering;

/// Maximum number of elements in a node. Must be even.
pub const MAX_ELEMENTS: usize = 32;

/// Minimum number of elements in any non-root node.
pub const MIN_ELEMENTS: usize = MAX_ELEMENTS / 2;

/// Default ordering for length-prefixed byte keys: the first byte is the key
/// length, shorter keys sort first, then bytewise.
pub fn compare_prefixed_keys(a: &[u8], b: &[u8]) -> Ordering {
    let len_a = a.first().copied().unwrap_or(0);
    let len_b = b.first().copied().unwrap_or(0);
    len_a.cmp(&len_b).then_with(|| a.get(1..).cmp(&b.get(1..)))
}

#[derive(Debug, Clone)]
struct Node<T> {
    elements: Vec<T>,
    /// Empty for leaves, otherwise `elements.len() + 1` children.
    children: Vec<Node<T>>,
}

impl<T> Node<T> {
    fn leaf() -> Self {
        Node { elements: Vec::with_capacity(MAX_ELEMENTS), children: Vec::new() }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Location of a node slot inside the tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Position {
    path: Vec<usize>,
    index: usize,
}

/// Result of a lookup: where the element is, or where it would be inserted.
#[derive(Debug, Clone)]
pub struct FindResult {
    pub position: Position,
    pub found: bool,
}

/// A balanced search tree of opaque elements.
#[derive(Clone)]
pub struct BTreeIndex<T, C> {
    root: Node<T>,
    compare: C,
    len: usize,
}

impl<T: std::fmt::Debug, C> std::fmt::Debug for BTreeIndex<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeIndex")
            .field("len", &self.len)
            .field("root_elements", &self.root.elements.len())
            .finish()
    }
}

impl<T, C> BTreeIndex<T, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    pub fn new(compare: C) -> Self {
        BTreeIndex { root: Node::leaf(), compare, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.root = Node::leaf();
        self.len = 0;
    }

    /// Order two elements with the tree's comparator.
    pub fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.compare)(a, b)
    }

    // ─── Lookup ─────────────────────────────────────────────────────

    pub fn find(&self, probe: &T) -> FindResult {
        self.find_by(|element| (self.compare)(element, probe))
    }

    /// Binary search each level with `f(element)`, which must report how the
    /// element orders relative to the wanted key.
    pub fn find_by<F>(&self, f: F) -> FindResult
    where
        F: Fn(&T) -> Ordering,
    {
        let mut path = Vec::new();
        let mut node = &self.root;
        loop {
            match node.elements.binary_search_by(|e| f(e)) {
                Ok(index) => {
                    return FindResult { position: Position { path, index }, found: true };
                }
                Err(index) => {
                    if node.is_leaf() {
                        return FindResult { position: Position { path, index }, found: false };
                    }
                    path.push(index);
                    node = &node.children[index];
                }
            }
        }
    }

    pub fn get(&self, pos: &Position) -> Option<&T> {
        self.node(&pos.path)?.elements.get(pos.index)
    }

    pub fn get_mut(&mut self, pos: &Position) -> Option<&mut T> {
        self.node_mut(&pos.path)?.elements.get_mut(pos.index)
    }

    /// Find an element equal to `probe`.
    pub fn lookup(&self, probe: &T) -> Option<&T> {
        let res = self.find(probe);
        if res.found {
            self.get(&res.position)
        } else {
            None
        }
    }

    pub fn lookup_by<F>(&self, f: F) -> Option<&T>
    where
        F: Fn(&T) -> Ordering,
    {
        let res = self.find_by(f);
        if res.found {
            self.get(&res.position)
        } else {
            None
        }
    }

    /// The i-th element in ascending order.
    pub fn element_at(&self, i: usize) -> Option<&T> {
        self.iter().nth(i)
    }

    fn node(&self, path: &[usize]) -> Option<&Node<T>> {
        let mut node = &self.root;
        for &child in path {
            node = node.children.get(child)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, path: &[usize]) -> Option<&mut Node<T>> {
        let mut node = &mut self.root;
        for &child in path {
            node = node.children.get_mut(child)?;
        }
        Some(node)
    }

    // ─── Insertion ──────────────────────────────────────────────────

    /// Insert keeping order, replacing an equal element. Returns the element
    /// that was replaced.
    pub fn insert_sorted(&mut self, element: T) -> Option<T> {
        let res = self.find(&element);
        if res.found {
            let slot = self.get_mut(&res.position)?;
            return Some(std::mem::replace(slot, element));
        }
        self.insert(element, &res.position);
        None
    }

    /// Insert at a position obtained from a failed [`find`](Self::find).
    pub fn insert(&mut self, element: T, pos: &Position) {
        let mut element = element;
        let mut right: Option<Node<T>> = None;
        let mut depth = pos.path.len();
        let mut slot = pos.index;
        self.len += 1;

        loop {
            let Some(node) = self.node_mut(&pos.path[..depth]) else {
                debug_assert!(false, "insert position does not address a node");
                return;
            };
            node.elements.insert(slot, element);
            if let Some(child) = right.take() {
                node.children.insert(slot + 1, child);
            }
            if node.elements.len() <= MAX_ELEMENTS {
                return;
            }

            // Split: lower half stays, the median moves up, upper half becomes a sibling.
            let upper = node.elements.split_off(MIN_ELEMENTS + 1);
            let median = node.elements.remove(MIN_ELEMENTS);
            let upper_children = if node.is_leaf() {
                Vec::new()
            } else {
                node.children.split_off(MIN_ELEMENTS + 1)
            };
            let sibling = Node { elements: upper, children: upper_children };

            if depth == 0 {
                let old_root = std::mem::replace(&mut self.root, Node::leaf());
                self.root.elements.push(median);
                self.root.children.push(old_root);
                self.root.children.push(sibling);
                return;
            }

            element = median;
            right = Some(sibling);
            depth -= 1;
            slot = pos.path[depth];
        }
    }

    // ─── Deletion ───────────────────────────────────────────────────

    /// Remove an element equal to `probe`.
    pub fn remove(&mut self, probe: &T) -> Option<T> {
        let res = self.find(probe);
        if res.found {
            self.delete(&res.position)
        } else {
            None
        }
    }

    /// Delete the element at `pos`, rebalancing as needed.
    pub fn delete(&mut self, pos: &Position) -> Option<T> {
        let is_leaf = self.node(&pos.path)?.is_leaf();
        if pos.index >= self.node(&pos.path)?.elements.len() {
            return None;
        }

        let removed = if is_leaf {
            let node = self.node_mut(&pos.path)?;
            let removed = node.elements.remove(pos.index);
            self.rebalance(pos.path.clone());
            removed
        } else {
            // Replace with the in-order successor, then fix the successor's leaf.
            let mut leaf_path = pos.path.clone();
            leaf_path.push(pos.index + 1);
            while !self.node(&leaf_path)?.is_leaf() {
                leaf_path.push(0);
            }
            let successor = self.node_mut(&leaf_path)?.elements.remove(0);
            let node = self.node_mut(&pos.path)?;
            let removed = std::mem::replace(&mut node.elements[pos.index], successor);
            self.rebalance(leaf_path);
            removed
        };
        self.len -= 1;
        Some(removed)
    }

    fn rebalance(&mut self, mut path: Vec<usize>) {
        loop {
            let Some(child_idx) = path.pop() else {
                // Root: collapse when emptied above a single child.
                if self.root.elements.is_empty() && !self.root.is_leaf() {
                    let child = self.root.children.remove(0);
                    self.root = child;
                }
                return;
            };
            let Some(parent) = self.node_mut(&path) else { return };
            if parent.children[child_idx].elements.len() >= MIN_ELEMENTS {
                return;
            }

            // Borrow from the left sibling.
            if child_idx > 0 && parent.children[child_idx - 1].elements.len() > MIN_ELEMENTS {
                let left = &mut parent.children[child_idx - 1];
                if let Some(borrowed) = left.elements.pop() {
                    let borrowed_child = left.children.pop();
                    let separator = std::mem::replace(&mut parent.elements[child_idx - 1], borrowed);
                    let node = &mut parent.children[child_idx];
                    node.elements.insert(0, separator);
                    if let Some(c) = borrowed_child {
                        node.children.insert(0, c);
                    }
                }
                return;
            }

            // Borrow from the right sibling.
            if child_idx + 1 < parent.children.len()
                && parent.children[child_idx + 1].elements.len() > MIN_ELEMENTS
            {
                let right = &mut parent.children[child_idx + 1];
                let borrowed = right.elements.remove(0);
                let borrowed_child = if right.is_leaf() { None } else { Some(right.children.remove(0)) };
                let separator = std::mem::replace(&mut parent.elements[child_idx], borrowed);
                let node = &mut parent.children[child_idx];
                node.elements.push(separator);
                if let Some(c) = borrowed_child {
                    node.children.push(c);
                }
                return;
            }

            // Merge with a sibling, pulling the separator down.
            if parent.children.len() < 2 {
                return;
            }
            let left_idx = if child_idx > 0 { child_idx - 1 } else { child_idx };
            let right = parent.children.remove(left_idx + 1);
            let separator = parent.elements.remove(left_idx);
            let left = &mut parent.children[left_idx];
            left.elements.push(separator);
            left.elements.extend(right.elements);
            left.children.extend(right.children);
            debug_assert!(left.elements.len() <= MAX_ELEMENTS);
        }
    }

    // ─── Traversal ──────────────────────────────────────────────────

    pub fn first(&self) -> Option<Position> {
        if self.is_empty() {
            return None;
        }
        let mut path = Vec::new();
        let mut node = &self.root;
        while !node.is_leaf() {
            path.push(0);
            node = &node.children[0];
        }
        Some(Position { path, index: 0 })
    }

    pub fn last(&self) -> Option<Position> {
        if self.is_empty() {
            return None;
        }
        let mut path = Vec::new();
        let mut node = &self.root;
        while !node.is_leaf() {
            let last = node.children.len() - 1;
            path.push(last);
            node = &node.children[last];
        }
        Some(Position { path, index: node.elements.len() - 1 })
    }

    /// Step to the in-order successor. Returns true when there is none, in
    /// which case `pos` is left unchanged.
    pub fn iterate(&self, pos: &mut Position) -> bool {
        let Some(node) = self.node(&pos.path) else { return true };
        if !node.is_leaf() {
            pos.path.push(pos.index + 1);
            let mut node = &node.children[pos.index + 1];
            while !node.is_leaf() {
                pos.path.push(0);
                node = &node.children[0];
            }
            pos.index = 0;
            return false;
        }
        if pos.index + 1 < node.elements.len() {
            pos.index += 1;
            return false;
        }
        self.ascend_forward(pos)
    }

    /// Step to the in-order predecessor. Returns true when there is none.
    pub fn iterate_back(&self, pos: &mut Position) -> bool {
        let Some(node) = self.node(&pos.path) else { return true };
        if !node.is_leaf() {
            pos.path.push(pos.index);
            let mut node = &node.children[pos.index];
            while !node.is_leaf() {
                let last = node.children.len() - 1;
                pos.path.push(last);
                node = &node.children[last];
            }
            pos.index = node.elements.len() - 1;
            return false;
        }
        if pos.index > 0 {
            pos.index -= 1;
            return false;
        }
        let mut path = pos.path.clone();
        while let Some(child_idx) = path.pop() {
            if child_idx > 0 {
                pos.path = path;
                pos.index = child_idx - 1;
                return false;
            }
        }
        true
    }

    /// Walk up from a leaf slot past the end of its node to the first
    /// ancestor element on the right.
    fn ascend_forward(&self, pos: &mut Position) -> bool {
        let mut path = pos.path.clone();
        while let Some(child_idx) = path.pop() {
            let Some(parent) = self.node(&path) else { return true };
            if child_idx < parent.elements.len() {
                pos.path = path;
                pos.index = child_idx;
                return false;
            }
        }
        true
    }

    /// Turn an insertion point into the position of the first element at or
    /// after it.
    fn settle_forward(&self, mut pos: Position) -> Option<Position> {
        let node = self.node(&pos.path)?;
        if pos.index < node.elements.len() {
            return Some(pos);
        }
        if self.ascend_forward(&mut pos) {
            None
        } else {
            Some(pos)
        }
    }

    /// Turn an insertion point into the position of the last element before it.
    fn settle_back(&self, mut pos: Position) -> Option<Position> {
        if pos.index > 0 {
            pos.index -= 1;
            return Some(pos);
        }
        let mut path = pos.path.clone();
        while let Some(child_idx) = path.pop() {
            if child_idx > 0 {
                pos.path = path;
                pos.index = child_idx - 1;
                return Some(pos);
            }
        }
        None
    }

    // ─── Range cursors ──────────────────────────────────────────────

    /// Position of the first element in `[min, max]`.
    pub fn range_start(&self, min: &T, max: &T) -> Option<Position> {
        let res = self.find(min);
        let pos = if res.found { res.position } else { self.settle_forward(res.position)? };
        let element = self.get(&pos)?;
        if (self.compare)(element, max) == Ordering::Greater {
            return None;
        }
        Some(pos)
    }

    /// Position of the last element in `[min, max]`.
    pub fn range_last(&self, min: &T, max: &T) -> Option<Position> {
        let res = self.find(max);
        let pos = if res.found { res.position } else { self.settle_back(res.position)? };
        let element = self.get(&pos)?;
        if (self.compare)(element, min) == Ordering::Less {
            return None;
        }
        Some(pos)
    }

    /// Advance within the range. Returns false once the range is exhausted.
    pub fn range_next(&self, pos: &mut Position, max: &T) -> bool {
        let mut next = pos.clone();
        if self.iterate(&mut next) {
            return false;
        }
        match self.get(&next) {
            Some(e) if (self.compare)(e, max) != Ordering::Greater => {
                *pos = next;
                true
            }
            _ => false,
        }
    }

    /// Step backwards within the range. Returns false once exhausted.
    pub fn range_prev(&self, pos: &mut Position, min: &T) -> bool {
        let mut prev = pos.clone();
        if self.iterate_back(&mut prev) {
            return false;
        }
        match self.get(&prev) {
            Some(e) if (self.compare)(e, min) != Ordering::Less => {
                *pos = prev;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> Iter<'_, T, C> {
        Iter { tree: self, next: self.first() }
    }

    /// Ascending iterator over elements within `[min, max]`.
    pub fn range<'a>(&'a self, min: &T, max: &'a T) -> Range<'a, T, C> {
        Range { tree: self, max, next: self.range_start(min, max) }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        fn walk<T, C: Fn(&T, &T) -> Ordering>(node: &Node<T>, is_root: bool, depth: usize, leaf_depth: &mut Option<usize>, cmp: &C) {
            assert!(node.elements.len() <= MAX_ELEMENTS);
            if !is_root {
                assert!(node.elements.len() >= MIN_ELEMENTS, "underfull node: {}", node.elements.len());
            }
            for w in node.elements.windows(2) {
                assert_eq!(cmp(&w[0], &w[1]), Ordering::Less);
            }
            if node.is_leaf() {
                match leaf_depth {
                    Some(d) => assert_eq!(*d, depth),
                    None => *leaf_depth = Some(depth),
                }
            } else {
                assert_eq!(node.children.len(), node.elements.len() + 1);
                for child in &node.children {
                    walk(child, false, depth + 1, leaf_depth, cmp);
                }
            }
        }
        let mut leaf_depth = None;
        walk(&self.root, true, 0, &mut leaf_depth, &self.compare);
    }
}

/// In-order iterator.
pub struct Iter<'a, T, C> {
    tree: &'a BTreeIndex<T, C>,
    next: Option<Position>,
}

impl<'a, T, C> Iterator for Iter<'a, T, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let mut pos = self.next.take()?;
        let item = self.tree.get(&pos)?;
        if !self.tree.iterate(&mut pos) {
            self.next = Some(pos);
        }
        Some(item)
    }
}

/// Bounded in-order iterator.
pub struct Range<'a, T, C> {
    tree: &'a BTreeIndex<T, C>,
    max: &'a T,
    next: Option<Position>,
}

impl<'a, T, C> Iterator for Range<'a, T, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let mut pos = self.next.take()?;
        let item = self.tree.get(&pos)?;
        if self.tree.range_next(&mut pos, self.max) {
            self.next = Some(pos);
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn cmp_u32(a: &u32, b: &u32) -> Ordering {
        a.cmp(b)
    }

    fn tree() -> BTreeIndex<u32, fn(&u32, &u32) -> Ordering> {
        BTreeIndex::new(cmp_u32 as fn(&u32, &u32) -> Ordering)
    }

    #[test]
    fn test_insert_and_find() {
        let mut t = tree();
        for k in [5u32, 1, 9, 3, 7] {
            assert!(t.insert_sorted(k).is_none());
        }
        assert_eq!(t.len(), 5);
        let res = t.find(&7);
        assert!(res.found);
        assert_eq!(t.get(&res.position), Some(&7));
        assert!(!t.find(&4).found);
        assert_eq!(t.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_insert_at_find_position() {
        let mut t = tree();
        for k in (0..200u32).rev() {
            let res = t.find(&k);
            assert!(!res.found);
            t.insert(k, &res.position);
        }
        t.check_invariants();
        assert_eq!(t.iter().copied().collect::<Vec<_>>(), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_creates_new_root() {
        let mut t = tree();
        for k in 0..=MAX_ELEMENTS as u32 {
            t.insert_sorted(k);
        }
        assert_eq!(t.root.elements.len(), 1);
        assert_eq!(t.root.children.len(), 2);
        assert_eq!(t.root.elements[0], MIN_ELEMENTS as u32);
        t.check_invariants();
    }

    #[test]
    fn test_random_insert_delete_keeps_invariants() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut t = tree();
        let mut keys: Vec<u32> = (0..3000).collect();
        keys.shuffle(&mut rng);
        for &k in &keys {
            t.insert_sorted(k);
        }
        t.check_invariants();

        keys.shuffle(&mut rng);
        let (gone, kept) = keys.split_at(2000);
        for k in gone {
            assert_eq!(t.remove(k), Some(*k));
            assert!(!t.find(k).found);
        }
        t.check_invariants();
        for k in kept {
            assert!(t.find(k).found);
        }
        let mut sorted = kept.to_vec();
        sorted.sort();
        assert_eq!(t.iter().copied().collect::<Vec<_>>(), sorted);
        assert_eq!(t.len(), 1000);
    }

    #[test]
    fn test_delete_everything_collapses_root() {
        let mut t = tree();
        for k in 0..500u32 {
            t.insert_sorted(k);
        }
        for k in 0..500u32 {
            t.remove(&k);
            if k % 50 == 0 {
                t.check_invariants();
            }
        }
        assert!(t.is_empty());
        assert!(t.root.is_leaf());
        assert!(t.first().is_none());
    }

    #[test]
    fn test_element_at_matches_iteration() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let mut t = tree();
        for _ in 0..400 {
            t.insert_sorted(rng.gen_range(0..10_000));
        }
        let mut pos = t.first().unwrap();
        let mut i = 0;
        loop {
            assert_eq!(t.element_at(i), t.get(&pos));
            i += 1;
            if t.iterate(&mut pos) {
                break;
            }
        }
        assert_eq!(i, t.len());
    }

    #[test]
    fn test_iterate_back_reverses_order() {
        let mut t = tree();
        for k in 0..300u32 {
            t.insert_sorted(k * 2);
        }
        let mut pos = t.last().unwrap();
        let mut seen = vec![*t.get(&pos).unwrap()];
        while !t.iterate_back(&mut pos) {
            seen.push(*t.get(&pos).unwrap());
        }
        let expected: Vec<u32> = (0..300).rev().map(|k| k * 2).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_range_cursor_matches_filter() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let mut t = tree();
        for _ in 0..1000 {
            t.insert_sorted(rng.gen_range(0..5000));
        }
        let all: Vec<u32> = t.iter().copied().collect();
        for _ in 0..50 {
            let a = rng.gen_range(0..5200);
            let b = rng.gen_range(0..5200);
            let (min, max) = (a.min(b), a.max(b));
            let expected: Vec<u32> = all.iter().copied().filter(|k| *k >= min && *k <= max).collect();

            let mut forward = Vec::new();
            if let Some(mut pos) = t.range_start(&min, &max) {
                forward.push(*t.get(&pos).unwrap());
                while t.range_next(&mut pos, &max) {
                    forward.push(*t.get(&pos).unwrap());
                }
            }
            assert_eq!(forward, expected);

            let mut backward = Vec::new();
            if let Some(mut pos) = t.range_last(&min, &max) {
                backward.push(*t.get(&pos).unwrap());
                while t.range_prev(&mut pos, &min) {
                    backward.push(*t.get(&pos).unwrap());
                }
            }
            backward.reverse();
            assert_eq!(backward, expected);

            assert_eq!(t.range(&min, &max).copied().collect::<Vec<_>>(), expected);
        }
    }

    #[test]
    fn test_empty_range() {
        let mut t = tree();
        for k in [10u32, 20, 30] {
            t.insert_sorted(k);
        }
        assert!(t.range_start(&11, &19).is_none());
        assert!(t.range_last(&11, &19).is_none());
        assert!(t.range_start(&31, &40).is_none());
        assert!(t.range_last(&0, &9).is_none());
    }

    #[test]
    fn test_prefixed_key_order() {
        assert_eq!(compare_prefixed_keys(&[1, 9], &[2, 0, 0]), Ordering::Less);
        assert_eq!(compare_prefixed_keys(&[2, 1, 5], &[2, 1, 4]), Ordering::Greater);
        assert_eq!(compare_prefixed_keys(&[2, 1, 5], &[2, 1, 5]), Ordering::Equal);

        let mut t = BTreeIndex::new(|a: &Vec<u8>, b: &Vec<u8>| compare_prefixed_keys(a, b));
        t.insert_sorted(vec![2, 0, 1]);
        t.insert_sorted(vec![1, 0xFF]);
        t.insert_sorted(vec![2, 0, 0]);
        let keys: Vec<Vec<u8>> = t.iter().cloned().collect();
        assert_eq!(keys, vec![vec![1, 0xFF], vec![2, 0, 0], vec![2, 0, 1]]);
    }

    #[test]
    fn test_find_by_comparator() {
        let mut t = BTreeIndex::new(|a: &(u32, u32), b: &(u32, u32)| a.0.cmp(&b.0));
        t.insert_sorted((4, 40));
        t.insert_sorted((2, 20));
        assert_eq!(t.lookup_by(|e| e.0.cmp(&2)).map(|e| e.1), Some(20));
        assert!(t.lookup_by(|e| e.0.cmp(&3)).is_none());
    }
}

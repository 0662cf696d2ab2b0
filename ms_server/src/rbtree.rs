//! Red-black tree keyed by `u64`, with nodes held in a pool and addressed by
//! stable [`NodeId`] handles.
//!
//! Index 0 of the pool is the sentinel: it is always black and stands in for
//! every absent child and for the root's parent. Nodes are allocated detached
//! with [`RbTree::alloc`] and linked or unlinked any number of times, so callers
//! can recycle them without touching the allocator.
//!
//! The comparison used while descending is a [`KeyOrder`] strategy. Timer
//! deadlines use [`TimerOrder`], which compares keys as signed wrapping
//! differences and therefore keeps working across counter wrap-around.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{Error, Result};

/// Stable handle to a node in an [`RbTree`] pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn idx(self) -> usize {
        self.0 as usize
    }

    /// Handle for pool slot `idx`; the pool is addressed by `u32`.
    fn from_index(idx: usize) -> Result<Self> {
        u32::try_from(idx).map(NodeId).map_err(|_| Error::TimerCapacity {
            limit: u32::MAX as usize,
        })
    }
}

const SENTINEL: NodeId = NodeId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

struct Node<T> {
    left: NodeId,
    right: NodeId,
    parent: NodeId,
    color: Color,
    key: u64,
    data: Option<T>,
    linked: bool,
}

impl<T> Node<T> {
    fn detached(key: u64, data: Option<T>) -> Self {
        Self {
            left: SENTINEL,
            right: SENTINEL,
            parent: SENTINEL,
            color: Color::Black,
            key,
            data,
            linked: false,
        }
    }
}

/// Ordering used to pick the descent direction on insert.
///
/// Keys that compare equal go right, so duplicates keep insertion order.
pub trait KeyOrder {
    fn less(a: u64, b: u64) -> bool;
}

/// Plain unsigned comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainOrder;

impl KeyOrder for PlainOrder {
    fn less(a: u64, b: u64) -> bool {
        a < b
    }
}

/// Wrap-safe comparison for millisecond deadlines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerOrder;

impl KeyOrder for TimerOrder {
    fn less(a: u64, b: u64) -> bool {
        (a.wrapping_sub(b) as i64) < 0
    }
}

/// Red-black tree over a node pool.
pub struct RbTree<T, O: KeyOrder = PlainOrder> {
    nodes: Vec<Node<T>>,
    root: NodeId,
    len: usize,
    _order: PhantomData<O>,
}

impl<T, O: KeyOrder> Default for RbTree<T, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, O: KeyOrder> RbTree<T, O> {
    /// Creates an empty tree whose root is the sentinel.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::detached(0, None)],
            root: SENTINEL,
            len: 0,
            _order: PhantomData,
        }
    }

    /// Creates an empty tree with room for `capacity` nodes before the pool grows.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity + 1);
        nodes.push(Node::detached(0, None));
        Self {
            nodes,
            root: SENTINEL,
            len: 0,
            _order: PhantomData,
        }
    }

    /// Adds a detached node to the pool.
    ///
    /// Fails once the pool outgrows the `u32` handle space.
    pub fn alloc(&mut self, key: u64, value: T) -> Result<NodeId> {
        let id = NodeId::from_index(self.nodes.len())?;
        self.nodes.push(Node::detached(key, Some(value)));
        Ok(id)
    }

    /// Number of linked nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root == SENTINEL
    }

    /// Number of nodes ever allocated, linked or not.
    pub fn allocated(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn key(&self, id: NodeId) -> Option<u64> {
        self.valid(id).then(|| self.nodes[id.idx()].key)
    }

    /// Rekeys a detached node. Linked nodes are left alone and `false` is returned.
    pub fn set_key(&mut self, id: NodeId, key: u64) -> bool {
        if !self.valid(id) || self.nodes[id.idx()].linked {
            return false;
        }
        self.nodes[id.idx()].key = key;
        true
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        if id == SENTINEL {
            return None;
        }
        self.nodes.get(id.idx()).and_then(|n| n.data.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        if id == SENTINEL {
            return None;
        }
        self.nodes.get_mut(id.idx()).and_then(|n| n.data.as_mut())
    }

    pub fn is_linked(&self, id: NodeId) -> bool {
        self.valid(id) && self.nodes[id.idx()].linked
    }

    fn valid(&self, id: NodeId) -> bool {
        id != SENTINEL && id.idx() < self.nodes.len()
    }

    /// Links a detached node into the tree.
    ///
    /// Returns `false` if the node is unknown or already linked.
    pub fn insert(&mut self, id: NodeId) -> bool {
        if !self.valid(id) || self.nodes[id.idx()].linked {
            return false;
        }
        self.len += 1;

        let node = &mut self.nodes[id.idx()];
        node.linked = true;
        node.left = SENTINEL;
        node.right = SENTINEL;

        if self.root == SENTINEL {
            node.parent = SENTINEL;
            node.color = Color::Black;
            self.root = id;
            return true;
        }

        let key = node.key;
        let mut temp = self.root;
        loop {
            let go_left = O::less(key, self.nodes[temp.idx()].key);
            let next = if go_left {
                self.nodes[temp.idx()].left
            } else {
                self.nodes[temp.idx()].right
            };
            if next == SENTINEL {
                if go_left {
                    self.nodes[temp.idx()].left = id;
                } else {
                    self.nodes[temp.idx()].right = id;
                }
                break;
            }
            temp = next;
        }

        let node = &mut self.nodes[id.idx()];
        node.parent = temp;
        node.color = Color::Red;

        self.insert_fixup(id);
        true
    }

    fn insert_fixup(&mut self, mut node: NodeId) {
        while node != self.root && self.is_red(self.parent(node)) {
            let parent = self.parent(node);
            let grand = self.parent(parent);

            if parent == self.left(grand) {
                let uncle = self.right(grand);
                if self.is_red(uncle) {
                    self.paint(parent, Color::Black);
                    self.paint(uncle, Color::Black);
                    self.paint(grand, Color::Red);
                    node = grand;
                } else {
                    if node == self.right(parent) {
                        node = parent;
                        self.rotate_left(node);
                    }
                    let parent = self.parent(node);
                    let grand = self.parent(parent);
                    self.paint(parent, Color::Black);
                    self.paint(grand, Color::Red);
                    self.rotate_right(grand);
                }
            } else {
                let uncle = self.left(grand);
                if self.is_red(uncle) {
                    self.paint(parent, Color::Black);
                    self.paint(uncle, Color::Black);
                    self.paint(grand, Color::Red);
                    node = grand;
                } else {
                    if node == self.left(parent) {
                        node = parent;
                        self.rotate_right(node);
                    }
                    let parent = self.parent(node);
                    let grand = self.parent(parent);
                    self.paint(parent, Color::Black);
                    self.paint(grand, Color::Red);
                    self.rotate_left(grand);
                }
            }
        }

        let root = self.root;
        self.paint(root, Color::Black);
    }

    /// Unlinks a node. It stays in the pool and can be inserted again.
    ///
    /// Returns `false` if the node is not linked.
    pub fn delete(&mut self, node: NodeId) -> bool {
        if !self.is_linked(node) {
            return false;
        }
        self.len -= 1;

        let (subst, temp) = if self.left(node) == SENTINEL {
            (node, self.right(node))
        } else if self.right(node) == SENTINEL {
            (node, self.left(node))
        } else {
            let subst = self.subtree_min(self.right(node));
            (subst, self.right(subst))
        };

        if subst == self.root {
            self.root = temp;
            self.paint(temp, Color::Black);
            self.set_parent(temp, SENTINEL);
            self.detach(node);
            return true;
        }

        let removed_red = self.is_red(subst);
        let subst_parent = self.parent(subst);

        if subst == self.left(subst_parent) {
            self.set_left(subst_parent, temp);
        } else {
            self.set_right(subst_parent, temp);
        }

        if subst == node {
            self.set_parent(temp, subst_parent);
        } else {
            if subst_parent == node {
                self.set_parent(temp, subst);
            } else {
                self.set_parent(temp, subst_parent);
            }

            let (left, right, parent, color) = {
                let n = &self.nodes[node.idx()];
                (n.left, n.right, n.parent, n.color)
            };
            {
                let s = &mut self.nodes[subst.idx()];
                s.left = left;
                s.right = right;
                s.parent = parent;
                s.color = color;
            }

            if node == self.root {
                self.root = subst;
            } else if node == self.left(parent) {
                self.set_left(parent, subst);
            } else {
                self.set_right(parent, subst);
            }

            let (sl, sr) = (self.left(subst), self.right(subst));
            if sl != SENTINEL {
                self.set_parent(sl, subst);
            }
            if sr != SENTINEL {
                self.set_parent(sr, subst);
            }
        }

        self.detach(node);

        if !removed_red {
            self.delete_fixup(temp);
        }
        true
    }

    fn delete_fixup(&mut self, mut temp: NodeId) {
        while temp != self.root && !self.is_red(temp) {
            let parent = self.parent(temp);

            if temp == self.left(parent) {
                let mut w = self.right(parent);
                if self.is_red(w) {
                    self.paint(w, Color::Black);
                    self.paint(parent, Color::Red);
                    self.rotate_left(parent);
                    w = self.right(self.parent(temp));
                }

                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.paint(w, Color::Red);
                    temp = self.parent(temp);
                } else {
                    if !self.is_red(self.right(w)) {
                        self.paint(self.left(w), Color::Black);
                        self.paint(w, Color::Red);
                        self.rotate_right(w);
                        w = self.right(self.parent(temp));
                    }
                    let parent = self.parent(temp);
                    let parent_color = self.nodes[parent.idx()].color;
                    self.paint(w, parent_color);
                    self.paint(parent, Color::Black);
                    self.paint(self.right(w), Color::Black);
                    self.rotate_left(parent);
                    temp = self.root;
                }
            } else {
                let mut w = self.left(parent);
                if self.is_red(w) {
                    self.paint(w, Color::Black);
                    self.paint(parent, Color::Red);
                    self.rotate_right(parent);
                    w = self.left(self.parent(temp));
                }

                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.paint(w, Color::Red);
                    temp = self.parent(temp);
                } else {
                    if !self.is_red(self.left(w)) {
                        self.paint(self.right(w), Color::Black);
                        self.paint(w, Color::Red);
                        self.rotate_left(w);
                        w = self.left(self.parent(temp));
                    }
                    let parent = self.parent(temp);
                    let parent_color = self.nodes[parent.idx()].color;
                    self.paint(w, parent_color);
                    self.paint(parent, Color::Black);
                    self.paint(self.left(w), Color::Black);
                    self.rotate_right(parent);
                    temp = self.root;
                }
            }
        }

        self.paint(temp, Color::Black);
    }

    /// Smallest key under the tree's ordering.
    pub fn min(&self) -> Option<NodeId> {
        (self.root != SENTINEL).then(|| self.subtree_min(self.root))
    }

    /// Largest key under the tree's ordering.
    pub fn max(&self) -> Option<NodeId> {
        if self.root == SENTINEL {
            return None;
        }
        let mut node = self.root;
        while self.right(node) != SENTINEL {
            node = self.right(node);
        }
        Some(node)
    }

    /// In-order successor of a linked node.
    pub fn successor(&self, node: NodeId) -> Option<NodeId> {
        if !self.is_linked(node) {
            return None;
        }
        if self.right(node) != SENTINEL {
            return Some(self.subtree_min(self.right(node)));
        }
        let mut node = node;
        loop {
            if node == self.root {
                return None;
            }
            let parent = self.parent(node);
            if node == self.left(parent) {
                return Some(parent);
            }
            node = parent;
        }
    }

    /// In-order predecessor of a linked node.
    pub fn predecessor(&self, node: NodeId) -> Option<NodeId> {
        if !self.is_linked(node) {
            return None;
        }
        if self.left(node) != SENTINEL {
            let mut node = self.left(node);
            while self.right(node) != SENTINEL {
                node = self.right(node);
            }
            return Some(node);
        }
        let mut node = node;
        loop {
            if node == self.root {
                return None;
            }
            let parent = self.parent(node);
            if node == self.right(parent) {
                return Some(parent);
            }
            node = parent;
        }
    }

    /// Linked nodes in key order.
    pub fn iter(&self) -> Iter<'_, T, O> {
        Iter {
            tree: self,
            next: self.min(),
        }
    }

    fn subtree_min(&self, mut node: NodeId) -> NodeId {
        while self.left(node) != SENTINEL {
            node = self.left(node);
        }
        node
    }

    fn rotate_left(&mut self, node: NodeId) {
        let temp = self.right(node);
        let temp_left = self.left(temp);

        self.set_right(node, temp_left);
        if temp_left != SENTINEL {
            self.set_parent(temp_left, node);
        }

        let parent = self.parent(node);
        self.set_parent(temp, parent);

        if node == self.root {
            self.root = temp;
        } else if node == self.left(parent) {
            self.set_left(parent, temp);
        } else {
            self.set_right(parent, temp);
        }

        self.set_left(temp, node);
        self.set_parent(node, temp);
    }

    fn rotate_right(&mut self, node: NodeId) {
        let temp = self.left(node);
        let temp_right = self.right(temp);

        self.set_left(node, temp_right);
        if temp_right != SENTINEL {
            self.set_parent(temp_right, node);
        }

        let parent = self.parent(node);
        self.set_parent(temp, parent);

        if node == self.root {
            self.root = temp;
        } else if node == self.right(parent) {
            self.set_right(parent, temp);
        } else {
            self.set_left(parent, temp);
        }

        self.set_right(temp, node);
        self.set_parent(node, temp);
    }

    fn detach(&mut self, id: NodeId) {
        let n = &mut self.nodes[id.idx()];
        n.left = SENTINEL;
        n.right = SENTINEL;
        n.parent = SENTINEL;
        n.linked = false;
    }

    fn left(&self, id: NodeId) -> NodeId {
        self.nodes[id.idx()].left
    }

    fn right(&self, id: NodeId) -> NodeId {
        self.nodes[id.idx()].right
    }

    fn parent(&self, id: NodeId) -> NodeId {
        self.nodes[id.idx()].parent
    }

    fn is_red(&self, id: NodeId) -> bool {
        self.nodes[id.idx()].color == Color::Red
    }

    fn set_left(&mut self, id: NodeId, to: NodeId) {
        self.nodes[id.idx()].left = to;
    }

    fn set_right(&mut self, id: NodeId, to: NodeId) {
        self.nodes[id.idx()].right = to;
    }

    // The sentinel's parent is scratch space during delete.
    fn set_parent(&mut self, id: NodeId, to: NodeId) {
        self.nodes[id.idx()].parent = to;
    }

    fn paint(&mut self, id: NodeId, color: Color) {
        if id == SENTINEL {
            return;
        }
        self.nodes[id.idx()].color = color;
    }

    /// Walks the whole tree and returns its black height.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> std::result::Result<usize, String> {
        fn walk<T, O: KeyOrder>(
            tree: &RbTree<T, O>,
            node: NodeId,
            count: &mut usize,
        ) -> std::result::Result<usize, String> {
            if node == SENTINEL {
                return Ok(1);
            }
            *count += 1;
            let (l, r) = (tree.left(node), tree.right(node));
            if tree.is_red(node) && (tree.is_red(l) || tree.is_red(r)) {
                return Err(format!("red node {node:?} has a red child"));
            }
            for child in [l, r] {
                if child != SENTINEL && tree.parent(child) != node {
                    return Err(format!("{child:?} has a stale parent link"));
                }
            }
            if l != SENTINEL && O::less(tree.nodes[node.idx()].key, tree.nodes[l.idx()].key) {
                return Err(format!("left child of {node:?} sorts after it"));
            }
            if r != SENTINEL && O::less(tree.nodes[r.idx()].key, tree.nodes[node.idx()].key) {
                return Err(format!("right child of {node:?} sorts before it"));
            }
            let lh = walk(tree, l, count)?;
            let rh = walk(tree, r, count)?;
            if lh != rh {
                return Err(format!("black heights differ under {node:?}: {lh} vs {rh}"));
            }
            Ok(lh + usize::from(!tree.is_red(node)))
        }

        if self.is_red(SENTINEL) {
            return Err("sentinel is red".into());
        }
        if self.is_red(self.root) {
            return Err("root is red".into());
        }
        let mut count = 0;
        let height = walk(self, self.root, &mut count)?;
        if count != self.len {
            return Err(format!("len {} but {} nodes reachable", self.len, count));
        }
        Ok(height)
    }
}

impl<T: fmt::Debug, O: KeyOrder> fmt::Debug for RbTree<T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(_, key, value)| (key, value)))
            .finish()
    }
}

/// In-order iterator over `(id, key, value)`.
pub struct Iter<'a, T, O: KeyOrder> {
    tree: &'a RbTree<T, O>,
    next: Option<NodeId>,
}

impl<'a, T, O: KeyOrder> Iterator for Iter<'a, T, O> {
    type Item = (NodeId, u64, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.next?;
            self.next = self.tree.successor(id);
            let node = &self.tree.nodes[id.idx()];
            if let Some(data) = node.data.as_ref() {
                return Some((id, node.key, data));
            }
        }
    }
}

use bytemuck::{Pod, Zeroable};
use log::{debug, trace};
use std::cmp::{max, Ordering};
use std::fmt;
use std::iter::FusedIterator;

use crate::error::{Error, Result};

// Constant to represent an empty value.
const SENTINEL: u32 = 0;

// Enum representing the registers of a node.
#[derive(Copy, Clone)]
enum Register {
    Left,
    Right,
    Height,
    Parent,
}

// Enum representing the fields of the arena header.
enum Field {
    Root,
    Size,
    FreeListHead,
}

/// Macro to access an occupied node.
macro_rules! node {
    ( $slots:expr, $index:expr ) => {
        match &$slots[($index - 1) as usize] {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => panic!("{}", Error::VacantSlot { node: $index }),
        }
    };
}

/// Macro to mutably access an occupied node.
macro_rules! node_mut {
    ( $slots:expr, $index:expr ) => {
        match &mut $slots[($index - 1) as usize] {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => panic!("{}", Error::VacantSlot { node: $index }),
        }
    };
}

/// Total order used to arrange the keys of a tree.
///
/// Implemented for [`NaturalOrder`] and for any `Fn(&K, &K) -> Ordering`
/// closure, so a custom ordering can be passed directly to
/// [`BalancedTree::with_comparator`].
pub trait Comparator<K> {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their [`Ord`] implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

impl<K, F: Fn(&K, &K) -> Ordering> Comparator<K> for F {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}

/// The four AVL rotation cases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    /// Single right rotation of a left-heavy node.
    LeftLeft,
    /// Left rotation of the left child followed by a right rotation.
    LeftRight,
    /// Single left rotation of a right-heavy node.
    RightRight,
    /// Right rotation of the right child followed by a left rotation.
    RightLeft,
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Rotation::LeftLeft => "LL",
            Rotation::LeftRight => "LR",
            Rotation::RightRight => "RR",
            Rotation::RightLeft => "RL",
        })
    }
}

/// Reported to the rotation observer after a rotation completes.
#[derive(Debug)]
pub struct RotationEvent<'a, K> {
    pub rotation: Rotation,
    /// Key of the node that was out of balance.
    pub pivot: &'a K,
    /// Key of the node that took the pivot's position.
    pub promoted: &'a K,
}

type RotationObserver<K> = Box<dyn FnMut(&RotationEvent<'_, K>)>;

/// Header of the node arena.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Header {
    /// Header fields:
    ///   [0] - root
    ///   [1] - size
    ///   [2] - free_list_head
    ///   [3] - not in use (padding)
    fields: [u32; 4],
}

impl Header {
    #[inline(always)]
    fn get_field(&self, field: Field) -> u32 {
        self.fields[field as usize]
    }

    #[inline(always)]
    fn set_field(&mut self, field: Field, value: u32) {
        self.fields[field as usize] = value;
    }
}

/// Registers for a node. This is fixed to include:
///   [0] - left child
///   [1] - right child
///   [2] - height
///   [3] - parent
///
/// A zeroed register block describes a detached leaf.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Pod, Zeroable)]
struct Registers([u32; 4]);

struct Node<K, V> {
    registers: Registers,
    key: K,
    value: V,
}

impl<K, V> Node<K, V> {
    #[inline(always)]
    fn get_register(&self, register: Register) -> u32 {
        self.registers.0[register as usize]
    }

    #[inline(always)]
    fn set_register(&mut self, register: Register, value: u32) {
        self.registers.0[register as usize] = value;
    }
}

enum Slot<K, V> {
    Occupied(Node<K, V>),
    /// Free slot holding the index of the next free slot.
    Vacant(u32),
}

/// Growable table of nodes addressed by 1-based `u32` indices.
///
/// Parent, left and right relations are plain indices, so the back-reference
/// to a parent never owns anything. Released slots form a free list that
/// later insertions reuse.
struct Arena<K, V> {
    header: Header,
    slots: Vec<Slot<K, V>>,
}

impl<K, V> Arena<K, V> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            header: Header::zeroed(),
            slots: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    fn root(&self) -> u32 {
        self.header.get_field(Field::Root)
    }

    #[inline]
    fn len(&self) -> usize {
        self.header.get_field(Field::Size) as usize
    }

    #[inline]
    fn register(&self, index: u32, register: Register) -> u32 {
        node!(self.slots, index).get_register(register)
    }

    #[inline]
    fn set_register(&mut self, index: u32, register: Register, value: u32) {
        node_mut!(self.slots, index).set_register(register, value);
    }

    /// Cached height of a subtree; an absent subtree has height -1.
    #[inline]
    fn height(&self, index: u32) -> i32 {
        if index == SENTINEL {
            -1
        } else {
            self.register(index, Register::Height) as i32
        }
    }

    fn update_height(&mut self, index: u32) {
        let left = self.height(self.register(index, Register::Left));
        let right = self.height(self.register(index, Register::Right));

        self.set_register(index, Register::Height, (max(left, right) + 1) as u32);
    }

    /// Stores a new leaf under `parent`, reusing a free slot when available.
    fn add(&mut self, key: K, value: V, parent: u32) -> u32 {
        let size = self.header.get_field(Field::Size);

        if size == u32::MAX {
            panic!("tree is full ({size} nodes)");
        }

        let mut node = Node {
            registers: Registers::zeroed(),
            key,
            value,
        };
        node.set_register(Register::Parent, parent);

        let free_node = self.header.get_field(Field::FreeListHead);

        let index = if free_node == SENTINEL {
            self.slots.push(Slot::Occupied(node));
            self.slots.len() as u32
        } else {
            let slot = &mut self.slots[(free_node - 1) as usize];
            let next = match slot {
                Slot::Vacant(next) => *next,
                Slot::Occupied(_) => panic!("free list references occupied slot {free_node}"),
            };
            *slot = Slot::Occupied(node);

            trace!("reusing slot {free_node}");
            self.header.set_field(Field::FreeListHead, next);
            free_node
        };

        self.header.set_field(Field::Size, size + 1);

        index
    }

    /// Returns the slot to the free list, handing back the node it held.
    fn release(&mut self, index: u32) -> Node<K, V> {
        let free_list_head = self.header.get_field(Field::FreeListHead);
        let slot = std::mem::replace(
            &mut self.slots[(index - 1) as usize],
            Slot::Vacant(free_list_head),
        );

        self.header.set_field(Field::FreeListHead, index);
        self.header
            .set_field(Field::Size, self.header.get_field(Field::Size) - 1);

        match slot {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => panic!("{}", Error::VacantSlot { node: index }),
        }
    }

    /// Points whichever child register of `parent` holds `old` at `new`. A
    /// `parent` of [`SENTINEL`] means `old` is the root.
    fn replace_child(&mut self, parent: u32, old: u32, new: u32) {
        if parent == SENTINEL {
            self.header.set_field(Field::Root, new);
            return;
        }

        let node = node_mut!(self.slots, parent);

        if node.get_register(Register::Left) == old {
            node.set_register(Register::Left, new);
        } else if node.get_register(Register::Right) == old {
            node.set_register(Register::Right, new);
        } else {
            panic!("{}", Error::ParentMismatch { node: old, parent });
        }
    }

    /// Unlinks a node with at most one child, splicing that child into its
    /// place. Returns the former parent of the node.
    fn detach(&mut self, index: u32) -> u32 {
        let left = self.register(index, Register::Left);
        let right = self.register(index, Register::Right);
        let parent = self.register(index, Register::Parent);

        assert!(
            left == SENTINEL || right == SENTINEL,
            "cannot detach node {index} with two children"
        );

        let child = if left != SENTINEL { left } else { right };

        self.replace_child(parent, index, child);

        if child != SENTINEL {
            self.set_register(child, Register::Parent, parent);
            debug!("spliced child {child} into the position of node {index}");
        } else {
            debug!("detached leaf {index}");
        }

        parent
    }

    /// Perform a right rotation, returning the promoted left child.
    ///
    /// # Arguments
    ///
    /// * `index` - index of the node being rotated down.
    fn rotate_right(&mut self, index: u32) -> u32 {
        let left = self.register(index, Register::Left);
        let left_right = self.register(left, Register::Right);
        let parent = self.register(index, Register::Parent);

        self.set_register(index, Register::Left, left_right);
        if left_right != SENTINEL {
            self.set_register(left_right, Register::Parent, index);
        }

        self.replace_child(parent, index, left);
        self.set_register(left, Register::Parent, parent);
        self.set_register(left, Register::Right, index);
        self.set_register(index, Register::Parent, left);

        self.update_height(index);
        self.update_height(left);

        left
    }

    /// Perform a left rotation, returning the promoted right child.
    ///
    /// # Arguments
    ///
    /// * `index` - index of the node being rotated down.
    fn rotate_left(&mut self, index: u32) -> u32 {
        let right = self.register(index, Register::Right);
        let right_left = self.register(right, Register::Left);
        let parent = self.register(index, Register::Parent);

        self.set_register(index, Register::Right, right_left);
        if right_left != SENTINEL {
            self.set_register(right_left, Register::Parent, index);
        }

        self.replace_child(parent, index, right);
        self.set_register(right, Register::Parent, parent);
        self.set_register(right, Register::Left, index);
        self.set_register(index, Register::Parent, right);

        self.update_height(index);
        self.update_height(right);

        right
    }

    fn min_node(&self, mut index: u32) -> u32 {
        loop {
            let left = self.register(index, Register::Left);
            if left == SENTINEL {
                return index;
            }
            index = left;
        }
    }

    fn max_node(&self, mut index: u32) -> u32 {
        loop {
            let right = self.register(index, Register::Right);
            if right == SENTINEL {
                return index;
            }
            index = right;
        }
    }

    /// Returns the in-order successor of a node, or [`SENTINEL`] for the last one.
    fn successor(&self, index: u32) -> u32 {
        let right = self.register(index, Register::Right);

        if right != SENTINEL {
            return self.min_node(right);
        }

        // climb until we arrive from a left child
        let mut current = index;
        let mut parent = self.register(current, Register::Parent);

        while parent != SENTINEL && self.register(parent, Register::Right) == current {
            current = parent;
            parent = self.register(parent, Register::Parent);
        }

        parent
    }

    /// Height of a subtree computed from its structure, or `None` if any node
    /// in it violates the balance rule.
    fn balanced_height(&self, index: u32) -> Option<i32> {
        if index == SENTINEL {
            return Some(-1);
        }

        let left = self.balanced_height(self.register(index, Register::Left))?;
        let right = self.balanced_height(self.register(index, Register::Right))?;

        if (left - right).abs() > 1 {
            None
        } else {
            Some(max(left, right) + 1)
        }
    }
}

/// AVL tree struct, which is a self-balancing binary search tree. Values in the
/// tree are stored as such the height of two sibling subtrees differ by one at
/// most.
///
/// Nodes live in an internal arena and link to their children and parent by
/// index. Keys are arranged by the comparator `C`, which defaults to the
/// key's [`Ord`] implementation.
pub struct BalancedTree<K, V, C = NaturalOrder> {
    /// Node storage.
    arena: Arena<K, V>,

    /// Ordering of the keys.
    comparator: C,

    /// Callback notified of every rotation.
    observer: Option<RotationObserver<K>>,
}

impl<K: Ord, V> BalancedTree<K, V> {
    /// Creates an empty tree ordered by `K: Ord`.
    pub fn new() -> Self {
        Self::with_comparator(NaturalOrder)
    }

    /// Creates an empty tree with room for `capacity` nodes before the arena
    /// reallocates.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_comparator(capacity, NaturalOrder)
    }
}

impl<K: Ord, V> Default for BalancedTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C: Comparator<K>> BalancedTree<K, V, C> {
    /// Creates an empty tree ordered by `comparator`.
    ///
    /// The comparator must be a total order and stay consistent for the life
    /// of the tree.
    pub fn with_comparator(comparator: C) -> Self {
        Self::with_capacity_and_comparator(0, comparator)
    }

    pub fn with_capacity_and_comparator(capacity: usize, comparator: C) -> Self {
        Self {
            arena: Arena::with_capacity(capacity),
            comparator,
            observer: None,
        }
    }

    /// Installs a callback invoked after every rotation, replacing any
    /// previous one.
    pub fn set_rotation_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&RotationEvent<'_, K>) + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    pub fn clear_rotation_observer(&mut self) {
        self.observer = None;
    }

    /// Returns the number of nodes the arena can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.arena.slots.capacity()
    }

    /// Returns the number of entries in the tree.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Indicates whether the tree is empty or not.
    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }

    /// Height of the tree, or `None` when it is empty. A single node has
    /// height 0.
    pub fn height(&self) -> Option<usize> {
        self.root().map(|root| root.height())
    }

    /// Removes every entry, keeping the allocated arena.
    pub fn clear(&mut self) {
        self.arena.slots.clear();
        self.arena.header = Header::zeroed();
    }

    /// Return the value under the specified key, if one is found.
    ///
    /// # Arguments
    ///
    /// * `key` - key to look up the value.
    pub fn find(&self, key: &K) -> Option<&V> {
        let index = self.find_index(key)?;
        Some(&node!(self.arena.slots, index).value)
    }

    /// Return a mutable reference to the value under the specified key, if one is found.
    ///
    /// # Arguments
    ///
    /// * `key` - key to look up the value.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.find_index(key)?;
        Some(&mut node_mut!(self.arena.slots, index).value)
    }

    /// Checks whether a key is present in the tree or not.
    pub fn contains_key(&self, key: &K) -> bool {
        self.find_index(key).is_some()
    }

    /// Returns the entry with the lowest key.
    pub fn first(&self) -> Option<(&K, &V)> {
        let root = self.arena.root();

        if root == SENTINEL {
            return None;
        }

        let index = self.arena.min_node(root);
        let node = node!(self.arena.slots, index);
        Some((&node.key, &node.value))
    }

    /// Returns the entry with the highest key.
    pub fn last(&self) -> Option<(&K, &V)> {
        let root = self.arena.root();

        if root == SENTINEL {
            return None;
        }

        let index = self.arena.max_node(root);
        let node = node!(self.arena.slots, index);
        Some((&node.key, &node.value))
    }

    fn find_index(&self, key: &K) -> Option<u32> {
        let mut reference_node = self.arena.root();

        while reference_node != SENTINEL {
            let node = node!(self.arena.slots, reference_node);

            reference_node = match self.comparator.compare(key, &node.key) {
                Ordering::Less => node.get_register(Register::Left),
                Ordering::Greater => node.get_register(Register::Right),
                Ordering::Equal => return Some(reference_node),
            };
        }

        None
    }

    /// Insert a value on the tree at the specified key.
    ///
    /// Returns `false`, leaving the tree untouched, when the key is already
    /// present; the stored value is not overwritten.
    ///
    /// # Arguments
    ///
    /// * `key` - the key of the node.
    /// * `value` - the value of the node.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let mut reference_node = self.arena.root();

        if reference_node == SENTINEL {
            let root = self.arena.add(key, value, SENTINEL);
            self.arena.header.set_field(Field::Root, root);
            return true;
        }

        loop {
            let parent = reference_node;
            let node = node!(self.arena.slots, parent);

            let branch = match self.comparator.compare(&key, &node.key) {
                Ordering::Less => Register::Left,
                Ordering::Greater => Register::Right,
                Ordering::Equal => return false,
            };

            reference_node = node.get_register(branch);

            if reference_node == SENTINEL {
                let leaf = self.arena.add(key, value, parent);
                self.arena.set_register(parent, branch, leaf);
                self.retrace(parent);

                return true;
            }
        }
    }

    /// Removes the entry under the specified key, returning its value.
    ///
    /// A node with two children keeps its position: the key and value of its
    /// in-order successor are moved into it and the successor's node is the
    /// one unlinked from the tree.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let node_index = self.find_index(key)?;

        let left = self.arena.register(node_index, Register::Left);
        let right = self.arena.register(node_index, Register::Right);

        let detached = if left != SENTINEL && right != SENTINEL {
            self.arena.min_node(right)
        } else {
            node_index
        };

        let parent = self.arena.detach(detached);
        let mut removed = self.arena.release(detached);

        if detached != node_index {
            debug!("moving successor {detached} into node {node_index}");

            let node = node_mut!(self.arena.slots, node_index);
            std::mem::swap(&mut node.key, &mut removed.key);
            std::mem::swap(&mut node.value, &mut removed.value);
        }

        self.retrace(parent);

        Some(removed.value)
    }

    /// Recomputes heights and rebalances from `index` up to the root.
    fn retrace(&mut self, mut index: u32) {
        while index != SENTINEL {
            self.arena.update_height(index);
            let top = self.rebalance(index);
            index = self.arena.register(top, Register::Parent);
        }
    }

    /// Rebalances the subtree at `index` to maintain the AVL rule, returning
    /// the index of the node now occupying its position.
    ///
    /// The rotation is chosen by comparing the inner and outer grandchildren
    /// on the taller side: a double rotation is only used when the inner one
    /// is strictly taller.
    fn rebalance(&mut self, index: u32) -> u32 {
        let left = self.arena.register(index, Register::Left);
        let right = self.arena.register(index, Register::Right);

        let left_height = self.arena.height(left);
        let right_height = self.arena.height(right);
        let balance_factor = left_height - right_height;

        if balance_factor.abs() < 2 {
            return index;
        }

        assert!(
            balance_factor.abs() == 2,
            "{}",
            Error::Unbalanced {
                node: index,
                balance_factor
            }
        );

        match left_height.cmp(&right_height) {
            Ordering::Greater => {
                let outer = self.arena.height(self.arena.register(left, Register::Left));
                let inner = self.arena.height(self.arena.register(left, Register::Right));

                if inner > outer {
                    self.rotate_left_right(index)
                } else {
                    self.rotate_left_left(index)
                }
            }
            Ordering::Less => {
                let outer = self.arena.height(self.arena.register(right, Register::Right));
                let inner = self.arena.height(self.arena.register(right, Register::Left));

                if inner > outer {
                    self.rotate_right_left(index)
                } else {
                    self.rotate_right_right(index)
                }
            }
            Ordering::Equal => panic!("{}", Error::BalanceTie { node: index }),
        }
    }

    fn rotate_left_left(&mut self, index: u32) -> u32 {
        let top = self.arena.rotate_right(index);
        self.notify(Rotation::LeftLeft, index, top);
        top
    }

    fn rotate_left_right(&mut self, index: u32) -> u32 {
        let left = self.arena.register(index, Register::Left);
        self.arena.rotate_left(left);
        let top = self.arena.rotate_right(index);
        self.notify(Rotation::LeftRight, index, top);
        top
    }

    fn rotate_right_right(&mut self, index: u32) -> u32 {
        let top = self.arena.rotate_left(index);
        self.notify(Rotation::RightRight, index, top);
        top
    }

    fn rotate_right_left(&mut self, index: u32) -> u32 {
        let right = self.arena.register(index, Register::Right);
        self.arena.rotate_right(right);
        let top = self.arena.rotate_left(index);
        self.notify(Rotation::RightLeft, index, top);
        top
    }

    fn notify(&mut self, rotation: Rotation, pivot: u32, promoted: u32) {
        trace!("{rotation} rotation: node {promoted} replaces node {pivot}");

        if let Some(observer) = self.observer.as_mut() {
            observer(&RotationEvent {
                rotation,
                pivot: &node!(self.arena.slots, pivot).key,
                promoted: &node!(self.arena.slots, promoted).key,
            });
        }
    }

    /// Returns an iterator over the entries in ascending key order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let root = self.arena.root();

        Iter {
            arena: &self.arena,
            current: if root == SENTINEL {
                SENTINEL
            } else {
                self.arena.min_node(root)
            },
            remaining: self.arena.len(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, value)| value)
    }

    /// Read-only view of the root node, for walking the tree structure.
    pub fn root(&self) -> Option<NodeView<'_, K, V>> {
        NodeView::at(&self.arena, self.arena.root())
    }

    /// Indicates whether every node satisfies the AVL balance rule.
    ///
    /// Heights are recomputed from the structure rather than read from the
    /// cached registers.
    pub fn is_balanced(&self) -> bool {
        self.arena.balanced_height(self.arena.root()).is_some()
    }

    /// Verifies every structural invariant of the tree: key order, cached
    /// heights, balance, parent links and the entry count.
    pub fn check_invariants(&self) -> Result<()> {
        let (_, count) = self.verify(self.arena.root(), SENTINEL, None, None)?;

        if count != self.len() {
            return Err(Error::SizeMismatch {
                expected: self.len(),
                actual: count,
            });
        }

        Ok(())
    }

    /// Returns the height and node count of a subtree whose keys must lie
    /// strictly between `lower` and `upper`.
    fn verify(
        &self,
        index: u32,
        parent: u32,
        lower: Option<&K>,
        upper: Option<&K>,
    ) -> Result<(i32, usize)> {
        if index == SENTINEL {
            return Ok((-1, 0));
        }

        let node = match self.arena.slots.get((index - 1) as usize) {
            Some(Slot::Occupied(node)) => node,
            _ => return Err(Error::VacantSlot { node: index }),
        };

        if node.get_register(Register::Parent) != parent {
            return Err(Error::ParentMismatch {
                node: index,
                parent,
            });
        }

        let above_lower =
            lower.map_or(true, |lower| self.comparator.compare(lower, &node.key) == Ordering::Less);
        let below_upper =
            upper.map_or(true, |upper| self.comparator.compare(&node.key, upper) == Ordering::Less);

        if !above_lower || !below_upper {
            return Err(Error::OrderViolation { node: index });
        }

        let (left_height, left_count) =
            self.verify(node.get_register(Register::Left), index, lower, Some(&node.key))?;
        let (right_height, right_count) =
            self.verify(node.get_register(Register::Right), index, Some(&node.key), upper)?;

        let actual = max(left_height, right_height) + 1;
        let cached = node.get_register(Register::Height) as i32;

        if cached != actual {
            return Err(Error::HeightMismatch {
                node: index,
                cached,
                actual,
            });
        }

        let balance_factor = left_height - right_height;

        if balance_factor.abs() > 1 {
            return Err(Error::Unbalanced {
                node: index,
                balance_factor,
            });
        }

        Ok((actual, left_count + right_count + 1))
    }
}

impl<K: fmt::Debug, V: fmt::Debug, C> fmt::Debug for BalancedTree<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = self.arena.root();
        let mut map = f.debug_map();

        if root != SENTINEL {
            let mut current = self.arena.min_node(root);

            while current != SENTINEL {
                let node = node!(self.arena.slots, current);
                map.entry(&node.key, &node.value);
                current = self.arena.successor(current);
            }
        }

        map.finish()
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for BalancedTree<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tree = Self::new();
        tree.extend(iter);
        tree
    }
}

impl<K, V, C: Comparator<K>> Extend<(K, V)> for BalancedTree<K, V, C> {
    /// Inserts every entry; entries whose key is already present are skipped.
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<'a, K, V, C: Comparator<K>> IntoIterator for &'a BalancedTree<K, V, C> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// In-order iterator over the entries of a [`BalancedTree`].
///
/// Only the position of the current node is kept; each step walks to the
/// in-order successor through the child and parent links.
pub struct Iter<'a, K, V> {
    arena: &'a Arena<K, V>,
    current: u32,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == SENTINEL {
            return None;
        }

        let arena = self.arena;
        let current = self.current;
        let node = node!(arena.slots, current);

        self.current = arena.successor(current);
        self.remaining -= 1;

        Some((&node.key, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

impl<K, V> FusedIterator for Iter<'_, K, V> {}

/// Read-only view of a single node: its entry, its height and its children.
pub struct NodeView<'a, K, V> {
    arena: &'a Arena<K, V>,
    index: u32,
}

impl<K, V> Clone for NodeView<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for NodeView<'_, K, V> {}

impl<'a, K, V> NodeView<'a, K, V> {
    fn at(arena: &'a Arena<K, V>, index: u32) -> Option<Self> {
        (index != SENTINEL).then_some(Self { arena, index })
    }

    fn node(&self) -> &'a Node<K, V> {
        let arena = self.arena;
        let index = self.index;
        node!(arena.slots, index)
    }

    pub fn key(&self) -> &'a K {
        &self.node().key
    }

    pub fn value(&self) -> &'a V {
        &self.node().value
    }

    /// Height of the subtree rooted at this node; a leaf has height 0.
    pub fn height(&self) -> usize {
        self.node().get_register(Register::Height) as usize
    }

    pub fn has_left(&self) -> bool {
        self.node().get_register(Register::Left) != SENTINEL
    }

    pub fn has_right(&self) -> bool {
        self.node().get_register(Register::Right) != SENTINEL
    }

    pub fn left(&self) -> Option<NodeView<'a, K, V>> {
        Self::at(self.arena, self.node().get_register(Register::Left))
    }

    pub fn right(&self) -> Option<NodeView<'a, K, V>> {
        Self::at(self.arena, self.node().get_register(Register::Right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    fn build(keys: &[u64]) -> BalancedTree<u64, u64> {
        let mut tree = BalancedTree::new();

        for (value, key) in keys.iter().enumerate() {
            assert!(tree.insert(*key, value as u64));
        }

        tree.check_invariants().unwrap();
        tree
    }

    fn keys_of<C: Comparator<u64>>(tree: &BalancedTree<u64, u64, C>) -> Vec<u64> {
        tree.keys().copied().collect()
    }

    fn record_rotations(tree: &mut BalancedTree<u64, u64>) -> Rc<RefCell<Vec<(Rotation, u64, u64)>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);

        tree.set_rotation_observer(move |event| {
            sink.borrow_mut()
                .push((event.rotation, *event.pivot, *event.promoted));
        });

        events
    }

    #[test]
    fn test_insert() {
        const CAPACITY: usize = 10;

        let mut tree = BalancedTree::with_capacity(CAPACITY);

        for i in 0..CAPACITY {
            let key = i as u64;
            let value = i as u64;
            assert!(tree.insert(key, value));
        }

        assert_eq!(tree.len(), CAPACITY);

        for i in 0..CAPACITY {
            let key = i as u64;

            assert_eq!(tree.find(&key), Some(&key));
        }

        assert!(tree.is_balanced());
    }

    #[test]
    fn test_insert_duplicate() {
        let mut tree = build(&[5, 3, 8]);

        assert!(!tree.insert(3, 100));
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.find(&3), Some(&1));
    }

    #[test]
    fn test_right_right_rotation() {
        let mut tree = BalancedTree::new();
        let events = record_rotations(&mut tree);

        for key in [10, 20, 30] {
            tree.insert(key, key * 2);
        }

        assert_eq!(keys_of(&tree), vec![10, 20, 30]);
        assert_eq!(*tree.root().unwrap().key(), 20);
        assert_eq!(*events.borrow(), vec![(Rotation::RightRight, 10, 20)]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_left_left_rotation() {
        let mut tree = BalancedTree::new();
        let events = record_rotations(&mut tree);

        for key in [30, 20, 10] {
            tree.insert(key, key);
        }

        assert_eq!(keys_of(&tree), vec![10, 20, 30]);
        assert_eq!(*tree.root().unwrap().key(), 20);
        assert_eq!(*events.borrow(), vec![(Rotation::LeftLeft, 30, 20)]);
    }

    #[test]
    fn test_double_rotations() {
        let mut tree = BalancedTree::new();
        let events = record_rotations(&mut tree);

        for key in [30, 10, 20] {
            tree.insert(key, key);
        }

        assert_eq!(*tree.root().unwrap().key(), 20);
        assert_eq!(*events.borrow(), vec![(Rotation::LeftRight, 30, 20)]);

        let mut tree = BalancedTree::new();
        let events = record_rotations(&mut tree);

        for key in [10, 30, 20] {
            tree.insert(key, key);
        }

        assert_eq!(keys_of(&tree), vec![10, 20, 30]);
        assert_eq!(*tree.root().unwrap().key(), 20);
        assert_eq!(*events.borrow(), vec![(Rotation::RightLeft, 10, 20)]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_rotation_below_root() {
        // 4 and 5 hang to the right of 3, which is not the root
        let mut tree = build(&[2, 1, 3, 4]);
        let events = record_rotations(&mut tree);

        tree.insert(5, 0);

        assert_eq!(*events.borrow(), vec![(Rotation::RightRight, 3, 4)]);
        assert_eq!(*tree.root().unwrap().key(), 2);
        assert_eq!(*tree.root().unwrap().right().unwrap().key(), 4);
        assert_eq!(keys_of(&tree), vec![1, 2, 3, 4, 5]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_root_with_two_children() {
        let mut tree = build(&[30, 20, 40, 10, 25, 35, 50]);
        let root_slot = tree.arena.root();

        assert_eq!(tree.remove(&30), Some(0));

        let root = tree.root().unwrap();
        assert_eq!(*root.key(), 35);
        assert_eq!(*root.value(), 5);
        // the root keeps its slot, the successor's slot is the one released
        assert_eq!(tree.arena.root(), root_slot);

        assert_eq!(tree.find(&30), None);
        assert_eq!(tree.find(&35), Some(&5));
        assert!(tree.is_balanced());
        assert_eq!(tree.len(), 6);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_leaf_and_single_child() {
        let mut tree = build(&[20, 10, 30, 40]);

        // 30 has a single right child
        assert_eq!(tree.remove(&30), Some(2));
        assert_eq!(*tree.root().unwrap().right().unwrap().key(), 40);
        tree.check_invariants().unwrap();

        // 10 is a leaf
        assert_eq!(tree.remove(&10), Some(1));
        assert!(!tree.root().unwrap().has_left());
        tree.check_invariants().unwrap();

        assert_eq!(keys_of(&tree), vec![20, 40]);
    }

    #[test]
    fn test_remove_missing() {
        let mut tree = build(&[2, 1, 3]);

        assert_eq!(tree.remove(&7), None);
        assert_eq!(tree.len(), 3);

        assert_eq!(tree.remove(&1), Some(1));
        assert_eq!(tree.remove(&1), None);
        assert_eq!(tree.find(&1), None);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_remove_last_entry() {
        let mut tree = build(&[1]);

        assert_eq!(tree.remove(&1), Some(0));
        assert!(tree.is_empty());
        assert!(tree.root().is_none());
        assert_eq!(tree.iter().next(), None);
        assert!(tree.is_balanced());
    }

    #[test]
    fn test_remove_rebalances_multiple_levels() {
        // Fibonacci-shaped tree: removing 12 forces rotations at two levels
        let mut tree = build(&[8, 5, 11, 3, 7, 10, 12, 2, 4, 6, 9, 1]);
        let events = record_rotations(&mut tree);

        assert_eq!(tree.remove(&12), Some(6));

        assert_eq!(events.borrow().len(), 2);
        assert_eq!(keys_of(&tree), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_sequential_height_bound() {
        let mut tree = BalancedTree::new();

        for key in 0..20u64 {
            tree.insert(key, key);
            assert!(tree.is_balanced());
        }

        let bound = 1.45 * (22f64).log2();
        assert!((tree.height().unwrap() as f64) <= bound);
    }

    #[test]
    fn test_large_remove_add() {
        const CAPACITY: usize = 10_000;

        let mut tree = BalancedTree::with_capacity(CAPACITY);

        for i in 0..CAPACITY {
            let key = (i + 1) as u64;
            let value = (i + 1) as u64;
            tree.insert(key, value);
        }

        assert_eq!(tree.len(), CAPACITY);
        tree.check_invariants().unwrap();

        for i in 0..CAPACITY {
            let key = (i + 1) as u64;

            assert_eq!(tree.remove(&key), Some(key));
        }

        assert_eq!(tree.len(), 0);

        for i in 0..CAPACITY {
            let key = (i + 1) as u64;
            let value = (i + 1) as u64;
            tree.insert(key, value);
        }

        // released slots are reused
        assert_eq!(tree.arena.slots.len(), CAPACITY);
        assert_eq!(tree.len(), CAPACITY);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_random_operations() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tree = BalancedTree::new();
        let mut expected = BTreeMap::new();

        for step in 0..4_000u64 {
            let key = rng.random_range(0..500u64);

            if rng.random_bool(0.6) {
                assert_eq!(tree.insert(key, step), !expected.contains_key(&key));
                expected.entry(key).or_insert(step);
            } else {
                assert_eq!(tree.remove(&key), expected.remove(&key));
            }

            tree.check_invariants().unwrap();
            assert!(tree.is_balanced());
        }

        assert_eq!(tree.len(), expected.len());
        assert_eq!(tree.iter().count(), expected.len());
        assert!(tree
            .iter()
            .map(|(key, value)| (*key, *value))
            .eq(expected.into_iter()));
    }

    #[test]
    fn test_custom_comparator() {
        let mut tree = BalancedTree::with_comparator(|a: &u64, b: &u64| b.cmp(a));

        for key in [3, 9, 1, 7, 5] {
            tree.insert(key, key);
        }

        assert_eq!(keys_of(&tree), vec![9, 7, 5, 3, 1]);
        assert_eq!(tree.first(), Some((&9, &9)));
        assert_eq!(tree.last(), Some((&1, &1)));
        assert_eq!(tree.remove(&7), Some(7));
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_iter() {
        let tree: BalancedTree<u64, &str> =
            [(2, "b"), (1, "a"), (3, "c")].into_iter().collect();

        let iter = tree.iter();
        assert_eq!(iter.len(), 3);
        assert_eq!(
            iter.collect::<Vec<_>>(),
            vec![(&1, &"a"), (&2, &"b"), (&3, &"c")]
        );

        // restarting yields the same sequence
        assert_eq!(tree.values().copied().collect::<String>(), "abc");
        assert_eq!(format!("{tree:?}"), r#"{1: "a", 2: "b", 3: "c"}"#);
    }

    #[test]
    fn test_get_mut_and_clear() {
        let mut tree = build(&[4, 2, 6]);

        *tree.get_mut(&2).unwrap() = 42;
        assert_eq!(tree.find(&2), Some(&42));
        assert!(tree.get_mut(&5).is_none());

        tree.clear();
        assert!(tree.is_empty());
        assert!(!tree.contains_key(&4));
        assert!(tree.insert(4, 0));
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_node_view() {
        let tree = build(&[2, 1, 3, 4]);
        let root = tree.root().unwrap();

        assert_eq!((*root.key(), root.height()), (2, 2));
        assert!(root.has_left() && root.has_right());

        let left = root.left().unwrap();
        assert_eq!((*left.key(), left.height()), (1, 0));
        assert!(!left.has_left() && !left.has_right());

        let right = root.right().unwrap();
        assert_eq!((*right.key(), *right.value(), right.height()), (3, 2, 1));
        assert!(right.left().is_none());
        assert_eq!(*right.right().unwrap().key(), 4);
    }

    #[test]
    fn test_check_invariants_detects_corruption() {
        let mut tree = build(&[2, 1, 3]);
        let left = tree.arena.register(tree.arena.root(), Register::Left);

        tree.arena.set_register(left, Register::Height, 3);
        assert!(matches!(
            tree.check_invariants(),
            Err(Error::HeightMismatch { cached: 3, actual: 0, .. })
        ));

        tree.arena.set_register(left, Register::Height, 0);
        tree.arena.set_register(left, Register::Parent, SENTINEL);
        assert!(matches!(
            tree.check_invariants(),
            Err(Error::ParentMismatch { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "is unbalanced")]
    fn test_corrupted_height_is_fatal() {
        let mut tree = build(&[2, 1, 3]);
        let left = tree.arena.register(tree.arena.root(), Register::Left);

        tree.arena.set_register(left, Register::Height, 5);
        tree.insert(4, 0);
    }
}

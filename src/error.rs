//! Error types for the balanced tree.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the tree and its renderer.
///
/// Apart from [`Error::Io`], every variant describes a broken structural
/// invariant, which means the tree itself is defective. Mutating operations
/// panic with these messages instead of continuing on a corrupted tree;
/// [`BalancedTree::check_invariants`](crate::collections::BalancedTree::check_invariants)
/// returns them for inspection.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node {node} is out of order with respect to its ancestors")]
    OrderViolation { node: u32 },

    #[error("node {node} caches height {cached}, actual height is {actual}")]
    HeightMismatch { node: u32, cached: i32, actual: i32 },

    #[error("node {node} is unbalanced (balance factor {balance_factor})")]
    Unbalanced { node: u32, balance_factor: i32 },

    #[error("node {node} does not link back to its parent {parent}")]
    ParentMismatch { node: u32, parent: u32 },

    #[error("tree reports {expected} entries, found {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("node {node} reached rotation with equal subtree heights")]
    BalanceTie { node: u32 },

    #[error("slot {node} is referenced but vacant")]
    VacantSlot { node: u32 },
}

//! Arena-backed AVL ordered map.
//!
//! [`BalancedTree`] keeps its nodes in an index-addressed arena with
//! parent links and rebalances with the four AVL rotations after every
//! insertion and removal. The [`render`] module draws the tree shape as a
//! Graphviz digraph.

pub mod collections;
pub mod error;
pub mod render;

pub use collections::BalancedTree;
pub use error::{Error, Result};

//! Graphviz rendering of a tree's shape.
//!
//! The renderer walks the tree through [`NodeView`] only. Each node is
//! labelled `"key: value (height)"`; absent children are drawn as numbered
//! invisible nodes so that `dot` keeps left and right children apart.

use std::fmt::Display;
use std::io::Write;

use crate::collections::{BalancedTree, Comparator, NodeView};
use crate::error::Result;

/// Writes the tree as a `dot` digraph.
pub fn write_dot<K, V, C, W>(tree: &BalancedTree<K, V, C>, out: &mut W) -> Result<()>
where
    K: Display,
    V: Display,
    C: Comparator<K>,
    W: Write,
{
    writeln!(out, "digraph tree {{")?;
    writeln!(out, "\tratio=0.5;")?;
    writeln!(out, "\tsplines=false;")?;

    if let Some(root) = tree.root() {
        let mut invisible = 0;
        write_node(out, root, &mut invisible)?;
    }

    writeln!(out, "}}")?;

    Ok(())
}

/// Renders the tree into a `dot` source string.
pub fn render_to_string<K, V, C>(tree: &BalancedTree<K, V, C>) -> Result<String>
where
    K: Display,
    V: Display,
    C: Comparator<K>,
{
    let mut buffer = Vec::new();
    write_dot(tree, &mut buffer)?;

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn label<K: Display, V: Display>(node: &NodeView<'_, K, V>) -> String {
    let text = format!("{}: {} ({})", node.key(), node.value(), node.height());
    format!("\"{}\"", text.replace('"', "\\\""))
}

fn write_node<K, V, W>(out: &mut W, node: NodeView<'_, K, V>, invisible: &mut usize) -> Result<()>
where
    K: Display,
    V: Display,
    W: Write,
{
    let from = label(&node);

    for (port, child) in [("sw", node.left()), ("se", node.right())] {
        match child {
            Some(child) => writeln!(out, "\t{from}:{port} -> {};", label(&child))?,
            None => {
                writeln!(out, "{invisible} [style=invis];")?;
                writeln!(out, "\t{from}:{port} -> {invisible} [style=invis];")?;
                *invisible += 1;
            }
        }
    }

    if let Some(left) = node.left() {
        write_node(out, left, invisible)?;
    }
    if let Some(right) = node.right() {
        write_node(out, right, invisible)?;
    }

    Ok(())
}

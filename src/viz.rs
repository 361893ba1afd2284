//! ASCII graph visualizer (C10).
//!
//! A trimmed, adapted version of the teacher's `draw_ascii`/`BackpropViz`
//! printers: a pointer-deduplicated recursive walk rendering a graph as a
//! box-drawing ASCII tree, colorized by node kind with `colored`. Debugging
//! aid only, gated behind the demo binary's `--visualize` flag; never on a
//! hot path.

use std::collections::HashSet;

use colored::Colorize;

use crate::node::Node;

/// Renders the graph rooted at `node` as an ASCII tree, one line per node,
/// each annotated with `[value, grad]`. A node already visited elsewhere in
/// the walk (a shared subexpression) is printed once and then referenced by
/// a `(shared)` marker rather than re-expanded, so the printed tree stays
/// finite even over a DAG with heavy sharing.
pub fn draw_ascii(node: &Node) -> String {
    let mut result = String::new();
    let mut visited = HashSet::new();
    draw_recursive(node, &mut result, &mut visited, "", true);
    result
}

fn node_label(node: &Node) -> String {
    let tag = node.op().tag_name();
    let stats = format!("[{:.4}, {:.4}]", node.value(), node.grad());
    let stats = if node.op().is_leaf() {
        stats.green()
    } else {
        stats.normal()
    };
    match node.label() {
        Some(label) => format!("{} {} {}", stats, tag.cyan(), label.dimmed()),
        None => format!("{} {}", stats, tag.cyan()),
    }
}

fn draw_recursive(node: &Node, result: &mut String, visited: &mut HashSet<u64>, prefix: &str, is_last: bool) {
    let id = node.id();
    let connector = if prefix.is_empty() { "" } else if is_last { "└── " } else { "├── " };

    if visited.contains(&id) {
        result.push_str(&format!("{}{}{} {}\n", prefix, connector, node_label(node), "(shared)".yellow()));
        return;
    }
    visited.insert(id);
    result.push_str(&format!("{}{}{}\n", prefix, connector, node_label(node)));

    let parents = node.parents();
    if parents.is_empty() {
        return;
    }
    let child_prefix = format!("{}{}", prefix, if prefix.is_empty() { "" } else if is_last { "    " } else { "│   " });
    for (i, parent) in parents.iter().enumerate() {
        let last = i == parents.len() - 1;
        draw_recursive(parent, result, visited, &child_prefix, last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn renders_without_infinite_recursion_on_shared_subexpression() {
        let a = Node::parameter(1.0).unwrap();
        let shared = a.square();
        let root = Node::add(&shared, &shared);
        let text = draw_ascii(&root);
        assert!(text.contains("(shared)"));
    }

    #[test]
    fn includes_value_and_label_for_leaves() {
        let a = Node::named_parameter(2.0, "x").unwrap();
        let text = draw_ascii(&a);
        assert!(text.contains("2.0000"));
    }
}

//! Value registry (C2): canonical identity and dense integer IDs for inputs.
//!
//! The dense ID space is what lets compiled kernels use a single flat
//! `inputs: &[f64]` array and pure integer indexing on the hot evaluation
//! path — no map lookup once a function set has been compiled.

use std::collections::HashMap;

use crate::node::Node;

/// How a registered node's identity collapses, per spec.md §3's dedup rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    /// Keyed by exact bit-pattern of the value; any two constants sharing a
    /// bit pattern share a registry ID regardless of label.
    Constant,
    /// Keyed by `parameter_name`; two nodes with the same name share an ID.
    NamedVariable,
    /// Each distinct node gets a distinct ID.
    AnonymousWeight,
}

/// Canonical identity and dense integer IDs for every input a compiled
/// function set reads.
#[derive(Default)]
pub struct ValueRegistry {
    nodes: Vec<Node>,
    kinds: Vec<RegistryKind>,
    by_constant_bits: HashMap<u64, usize>,
    by_name: HashMap<String, usize>,
}

impl ValueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registers `node`, returning its (possibly pre-existing) registry ID.
    pub fn register(&mut self, node: &Node) -> usize {
        if let Some(name) = node.param_name() {
            if let Some(&id) = self.by_name.get(name) {
                return id;
            }
            let id = self.push(node.clone(), RegistryKind::NamedVariable);
            self.by_name.insert(name.to_string(), id);
            return id;
        }

        if !node.requires_grad() && node.op().is_leaf() {
            let bits = node.value().to_bits();
            if let Some(&id) = self.by_constant_bits.get(&bits) {
                return id;
            }
            let id = self.push(node.clone(), RegistryKind::Constant);
            self.by_constant_bits.insert(bits, id);
            return id;
        }

        self.push(node.clone(), RegistryKind::AnonymousWeight)
    }

    fn push(&mut self, node: Node, kind: RegistryKind) -> usize {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.kinds.push(kind);
        id
    }

    /// Retrieves the ID of an already-registered node. `None` if it was
    /// never registered.
    pub fn get_id(&self, node: &Node) -> Option<usize> {
        if let Some(name) = node.param_name() {
            return self.by_name.get(name).copied();
        }
        if !node.requires_grad() && node.op().is_leaf() {
            return self.by_constant_bits.get(&node.value().to_bits()).copied();
        }
        self.nodes.iter().position(|n| n == node)
    }

    pub fn kind(&self, id: usize) -> RegistryKind {
        self.kinds[id]
    }

    pub fn node(&self, id: usize) -> &Node {
        &self.nodes[id]
    }

    /// Writes each registered node's current value into `out[0..len()]`.
    pub fn data_snapshot(&self, out: &mut [f64]) {
        for (i, node) in self.nodes.iter().enumerate() {
            out[i] = node.value();
        }
    }

    /// Reads values back from `values[0..len()]` into each registered node.
    /// The sanctioned channel for reflecting optimizer moves into node
    /// values — direct `Node::set_value` on a non-leaf is never used by
    /// this crate.
    pub fn update_from(&self, values: &[f64]) {
        for (i, node) in self.nodes.iter().enumerate() {
            node.set_value(values[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_dedup_by_bit_pattern() {
        let mut reg = ValueRegistry::new();
        let a = Node::constant(5.0).unwrap();
        let b = Node::constant(5.0).unwrap();
        let c = Node::constant(6.0).unwrap();
        let id_a = reg.register(&a);
        let id_b = reg.register(&b);
        let id_c = reg.register(&c);
        assert_eq!(id_a, id_b);
        assert_ne!(id_a, id_c);
    }

    #[test]
    fn named_variables_dedup_by_name() {
        let mut reg = ValueRegistry::new();
        let a = Node::named_parameter(1.0, "x").unwrap();
        let b = Node::named_parameter(2.0, "x").unwrap();
        assert_eq!(reg.register(&a), reg.register(&b));
    }

    #[test]
    fn anonymous_weights_never_dedup() {
        let mut reg = ValueRegistry::new();
        let a = Node::parameter(1.0).unwrap();
        let b = Node::parameter(1.0).unwrap();
        assert_ne!(reg.register(&a), reg.register(&b));
    }

    #[test]
    fn ids_assigned_in_insertion_order_and_stable() {
        let mut reg = ValueRegistry::new();
        let a = Node::parameter(1.0).unwrap();
        let b = Node::parameter(2.0).unwrap();
        let id_a_first = reg.register(&a);
        let id_b = reg.register(&b);
        let id_a_second = reg.register(&a);
        assert_eq!(id_a_first, 0);
        assert_eq!(id_b, 1);
        assert_eq!(id_a_first, id_a_second);
    }
}

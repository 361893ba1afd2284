//! Kernel compiler (C4).
//!
//! Emits, once per distinct [`Signature`](crate::signature::Signature), an
//! imperative procedure that reads operand values by index and accumulates
//! gradient contributions by index. Per spec.md §4.4/§9, this takes the
//! bytecode-plus-interpreter path explicitly sanctioned as equivalent to
//! source-level JIT emission: no runtime-codegen crate appears anywhere in
//! the example pack's dependency stacks, so emitting and `rustc`-compiling
//! source at runtime would be a fabricated dependency. The topological
//! order, local-slot assignment, and instruction selection all happen once
//! at compile time (on a signature miss); only interpretation happens on
//! every dispatch.

use std::collections::HashMap;

use crate::error::{CompileError, Result};
use crate::node::{self, backward_contributions, Node, Op};
use crate::signature::Signature;

/// Where an instruction's operand value comes from: the caller's packed
/// input array (by kernel-local input slot) or a previously computed local.
#[derive(Debug, Clone, Copy)]
enum Operand {
    Input(usize),
    Local(usize),
}

#[derive(Debug, Clone)]
struct Instr {
    op: Op,
    operands: Vec<Operand>,
}

/// A compiled procedure for one canonical signature. Stateless and
/// reentrant: all per-call state lives in the buffers the caller supplies
/// to [`Kernel::dispatch`].
#[derive(Debug, Clone)]
pub struct Kernel {
    signature_text: String,
    num_inputs: usize,
    /// `Some(k)` at input slot `i` if that leaf is grad-bearing, giving its
    /// position `k` among this kernel's `K` gradient slots.
    grad_slot_of_input: Vec<Option<usize>>,
    num_grad_slots: usize,
    instrs: Vec<Instr>,
    /// Set when the whole residual is just a bare leaf (no operators at
    /// all) — a degenerate but legal graph.
    root_is_leaf_input: Option<usize>,
}

impl Kernel {
    pub fn signature_text(&self) -> &str {
        &self.signature_text
    }

    /// Number of input slots (`N` in spec.md §3).
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Number of gradient-accumulating slots (`K` in spec.md §3).
    pub fn num_grad_slots(&self) -> usize {
        self.num_grad_slots
    }

    /// Runs the compiled procedure: reads `values[input_indices[k]]` for
    /// each input slot `k`, returns the forward value, and accumulates
    /// (`+=`) into `gradient_out[gradient_indices[k]]` for each grad-bearing
    /// input. Pure w.r.t. its inputs; never panics on domain violations —
    /// those surface as NaN/Inf, per spec.md §4.4's failure semantics.
    pub fn dispatch(
        &self,
        values: &[f64],
        input_indices: &[usize],
        gradient_indices: &[usize],
        gradient_out: &mut [f64],
    ) -> f64 {
        let input_vals: Vec<f64> = input_indices[..self.num_inputs].iter().map(|&i| values[i]).collect();

        if let Some(idx) = self.root_is_leaf_input {
            if let Some(slot) = self.grad_slot_of_input[idx] {
                gradient_out[gradient_indices[slot]] += 1.0;
            }
            return input_vals[idx];
        }

        let mut locals = vec![0.0_f64; self.instrs.len()];
        for (i, instr) in self.instrs.iter().enumerate() {
            let operand_vals: Vec<f64> = instr
                .operands
                .iter()
                .map(|o| match *o {
                    Operand::Input(k) => input_vals[k],
                    Operand::Local(j) => locals[j],
                })
                .collect();
            locals[i] = forward_unchecked(&instr.op, &operand_vals);
        }

        let mut grad_locals = vec![0.0_f64; self.instrs.len()];
        let mut input_grad_accum = vec![0.0_f64; self.num_inputs];
        *grad_locals.last_mut().unwrap() = 1.0;

        for i in (0..self.instrs.len()).rev() {
            let g = grad_locals[i];
            let instr = &self.instrs[i];
            let operand_vals: Vec<f64> = instr
                .operands
                .iter()
                .map(|o| match *o {
                    Operand::Input(k) => input_vals[k],
                    Operand::Local(j) => locals[j],
                })
                .collect();
            let contributions = backward_contributions(&instr.op, &operand_vals, locals[i], g);
            for (operand, d) in instr.operands.iter().zip(contributions) {
                match *operand {
                    Operand::Input(k) => input_grad_accum[k] += d,
                    Operand::Local(j) => grad_locals[j] += d,
                }
            }
        }

        for (k, slot) in self.grad_slot_of_input.iter().enumerate() {
            if let Some(slot) = slot {
                gradient_out[gradient_indices[*slot]] += input_grad_accum[k];
            }
        }

        *locals.last().unwrap()
    }
}

/// Compiles a kernel for `root`'s canonical `signature`. The signature's
/// leaf order becomes the kernel's input-slot order.
pub fn compile(root: &Node, signature: &Signature) -> Result<Kernel> {
    let mut leaf_input_index: HashMap<Node, usize> = HashMap::with_capacity(signature.leaves.len());
    for (i, leaf) in signature.leaves.iter().enumerate() {
        leaf_input_index.insert(leaf.clone(), i);
    }

    if root.op().is_leaf() {
        let idx = *leaf_input_index.get(root).ok_or_else(|| {
            CompileError::MalformedGraph("residual root leaf missing from its own signature's leaf list".into())
        })?;
        let grad_slot_of_input = assign_grad_slots(signature);
        let num_grad_slots = grad_slot_of_input.iter().filter(|s| s.is_some()).count();
        return Ok(Kernel {
            signature_text: signature.text.clone(),
            num_inputs: signature.leaves.len(),
            grad_slot_of_input,
            num_grad_slots,
            instrs: vec![],
            root_is_leaf_input: Some(idx),
        });
    }

    let mut local_index: HashMap<Node, usize> = HashMap::new();
    let mut instrs = Vec::new();
    for n in node::topo_order(root) {
        if n.op().is_leaf() {
            continue;
        }
        let mut operands = Vec::with_capacity(n.parents().len());
        for p in n.parents() {
            let operand = if let Some(&idx) = leaf_input_index.get(p) {
                Operand::Input(idx)
            } else if let Some(&idx) = local_index.get(p) {
                Operand::Local(idx)
            } else {
                return Err(CompileError::MalformedGraph(format!(
                    "parent of node op={} not found as leaf or prior local",
                    n.op().tag_name()
                ))
                .into());
            };
            operands.push(operand);
        }
        let local_idx = instrs.len();
        instrs.push(Instr { op: n.op().clone(), operands });
        local_index.insert(n.clone(), local_idx);
    }

    let grad_slot_of_input = assign_grad_slots(signature);
    let num_grad_slots = grad_slot_of_input.iter().filter(|s| s.is_some()).count();

    Ok(Kernel {
        signature_text: signature.text.clone(),
        num_inputs: signature.leaves.len(),
        grad_slot_of_input,
        num_grad_slots,
        instrs,
        root_is_leaf_input: None,
    })
}

fn assign_grad_slots(signature: &Signature) -> Vec<Option<usize>> {
    let mut next = 0;
    signature
        .grad_bearing
        .iter()
        .map(|&g| {
            if g {
                let slot = next;
                next += 1;
                Some(slot)
            } else {
                None
            }
        })
        .collect()
}

/// Forward evaluation identical in shape to [`node::eval_op`] but never
/// fails: domain violations produce NaN/Inf through ordinary IEEE-754
/// arithmetic, per the kernel's "kernels do not throw" contract.
fn forward_unchecked(op: &Op, inputs: &[f64]) -> f64 {
    use Op::*;
    match op {
        Parameter | Constant => unreachable!("leaves never appear as kernel instructions"),
        Add => inputs[0] + inputs[1],
        Sub => inputs[0] - inputs[1],
        Mul => inputs[0] * inputs[1],
        Div => inputs[0] / inputs[1],
        Min => inputs[0].min(inputs[1]),
        Max => inputs[0].max(inputs[1]),
        Mod => inputs[0] % inputs[1],
        PowValue => inputs[0].powf(inputs[1]),
        Lt => bool_f64(inputs[0] < inputs[1]),
        Le => bool_f64(inputs[0] <= inputs[1]),
        Gt => bool_f64(inputs[0] > inputs[1]),
        Ge => bool_f64(inputs[0] >= inputs[1]),
        Eq => bool_f64(inputs[0] == inputs[1]),
        Ne => bool_f64(inputs[0] != inputs[1]),
        Neg => -inputs[0],
        Abs => inputs[0].abs(),
        Sign => {
            if inputs[0] > 0.0 {
                1.0
            } else if inputs[0] < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        Reciprocal => 1.0 / inputs[0],
        Square => inputs[0] * inputs[0],
        Cube => inputs[0] * inputs[0] * inputs[0],
        PowConst(n) => inputs[0].powf(*n),
        Sqrt => inputs[0].sqrt(),
        Exp => inputs[0].exp(),
        Log => inputs[0].ln(),
        Floor => inputs[0].floor(),
        Ceil => inputs[0].ceil(),
        Round => inputs[0].round(),
        Clamp(lo, hi) => inputs[0].clamp(*lo, *hi),
        Sin => inputs[0].sin(),
        Cos => inputs[0].cos(),
        Tan => inputs[0].tan(),
        Asin => inputs[0].asin(),
        Acos => inputs[0].acos(),
        Atan => inputs[0].atan(),
        Relu => inputs[0].max(0.0),
        Softplus => (1.0 + inputs[0].exp()).ln(),
        Sigmoid => 1.0 / (1.0 + (-inputs[0]).exp()),
        Tanh => inputs[0].tanh(),
        Sum => inputs.iter().sum(),
        Mean => inputs.iter().sum::<f64>() / inputs.len() as f64,
        IfThenElse => {
            if inputs[0] != 0.0 {
                inputs[1]
            } else {
                inputs[2]
            }
        }
        Custom(c) => (c.forward)(inputs),
    }
}

fn bool_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::canonicalize;

    #[test]
    fn matches_graph_backward_on_value_and_gradient() {
        let p = Node::parameter(3.0).unwrap();
        let c = Node::constant(5.0).unwrap();
        let residual = Node::sub(&p, &c);
        let squared = residual.square();

        node::backward(&squared);
        let expected_value = squared.value();
        let expected_grad = p.grad();

        let sig = canonicalize(&squared, &[p.clone()]);
        let kernel = compile(&squared, &sig).unwrap();
        assert_eq!(kernel.num_inputs(), 1);
        assert_eq!(kernel.num_grad_slots(), 1);

        let values = [3.0_f64];
        let input_indices = [0usize];
        let gradient_indices = [0usize];
        let mut grad_out = [0.0_f64];
        let v = kernel.dispatch(&values, &input_indices, &gradient_indices, &mut grad_out);

        assert!((v - expected_value).abs() < 1e-12);
        assert!((grad_out[0] - expected_grad).abs() < 1e-12);
    }

    #[test]
    fn bare_leaf_residual() {
        let p = Node::parameter(7.0).unwrap();
        let sig = canonicalize(&p, &[p.clone()]);
        let kernel = compile(&p, &sig).unwrap();
        let values = [7.0_f64];
        let mut grad_out = [0.0_f64];
        let v = kernel.dispatch(&values, &[0], &[0], &mut grad_out);
        assert_eq!(v, 7.0);
        assert_eq!(grad_out[0], 1.0);
    }
}

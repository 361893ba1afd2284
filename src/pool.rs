//! Kernel pool / compiled function set (C5).
//!
//! Ties C1 (graph), C2 (registry), C3 (canonicalizer), and C4 (kernel
//! compiler) together: builds one [`FunctionSet`] from a residual builder,
//! caching kernels by signature hash so structurally identical residuals
//! share a single compiled procedure.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{CompileError, Result, ShapeError};
use crate::kernel::{self, Kernel};
use crate::node::Node;
use crate::registry::ValueRegistry;
use crate::signature::canonicalize;

/// Per-residual bundle: which compiled kernel to dispatch, and how its input
/// and gradient slots map onto the registry and the optimizer's parameter
/// vector respectively.
struct FunctionDescriptor {
    kernel: Rc<Kernel>,
    input_indices: Vec<usize>,
    /// One entry per kernel gradient slot. A grad-bearing leaf that isn't
    /// one of the caller's `parameters` maps to the scratch slot at index
    /// `num_parameters` instead of `Option::None`, so [`Kernel::dispatch`]
    /// never has to branch on a sentinel.
    gradient_indices: Vec<usize>,
}

/// The full compiled artifact: a registry, a signature → kernel cache, and
/// one descriptor per residual, plus the dense buffer each evaluation
/// refreshes before dispatch.
pub struct FunctionSet {
    registry: ValueRegistry,
    kernels: HashMap<u64, Rc<Kernel>>,
    descriptors: Vec<FunctionDescriptor>,
    param_registry_ids: Vec<usize>,
    num_parameters: usize,
    data_buffer: Vec<f64>,
}

/// A tiny `Arc<AtomicBool>` cancellation flag, checked at
/// [`compile_async`]'s chunk boundaries. Cheap to clone and share with
/// whatever drives the caller's event loop.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl FunctionSet {
    pub fn num_parameters(&self) -> usize {
        self.num_parameters
    }

    pub fn num_residuals(&self) -> usize {
        self.descriptors.len()
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    /// `residuals / kernels`; 1.0 means no sharing.
    pub fn reuse_factor(&self) -> f64 {
        if self.kernels.is_empty() {
            return 0.0;
        }
        self.descriptors.len() as f64 / self.kernels.len() as f64
    }

    fn refresh_parameters(&mut self, parameter_values: &[f64]) -> Result<()> {
        if parameter_values.len() != self.num_parameters {
            return Err(ShapeError::ParameterCountMismatch {
                expected: self.num_parameters,
                actual: parameter_values.len(),
            }
            .into());
        }
        for (i, &id) in self.param_registry_ids.iter().enumerate() {
            self.registry.node(id).set_value(parameter_values[i]);
        }
        self.registry.data_snapshot(&mut self.data_buffer);
        Ok(())
    }

    /// Refreshes the registry's data buffer from `parameter_values`, then
    /// dispatches every residual's kernel, producing residual values and a
    /// dense `R × P` Jacobian.
    pub fn evaluate_jacobian(&mut self, parameter_values: &[f64]) -> Result<(Vec<f64>, Vec<Vec<f64>>)> {
        self.refresh_parameters(parameter_values)?;
        let p = self.num_parameters;
        let mut values = Vec::with_capacity(self.descriptors.len());
        let mut jacobian = Vec::with_capacity(self.descriptors.len());
        let mut row = vec![0.0_f64; p + 1];
        for descriptor in &self.descriptors {
            row.iter_mut().for_each(|x| *x = 0.0);
            let v = descriptor.kernel.dispatch(
                &self.data_buffer,
                &descriptor.input_indices,
                &descriptor.gradient_indices,
                &mut row,
            );
            values.push(v);
            jacobian.push(row[..p].to_vec());
        }
        trace!(residuals = values.len(), parameters = p, "evaluated jacobian");
        Ok((values, jacobian))
    }

    /// Refreshes the registry's data buffer from `parameter_values`, then
    /// sums every residual's value while accumulating one shared length-`P`
    /// gradient (each kernel writes with `+=`).
    pub fn evaluate_sum_with_gradient(&mut self, parameter_values: &[f64]) -> Result<(f64, Vec<f64>)> {
        self.refresh_parameters(parameter_values)?;
        let p = self.num_parameters;
        let mut grad = vec![0.0_f64; p + 1];
        let mut sum = 0.0;
        for descriptor in &self.descriptors {
            sum += descriptor.kernel.dispatch(
                &self.data_buffer,
                &descriptor.input_indices,
                &descriptor.gradient_indices,
                &mut grad,
            );
        }
        grad.truncate(p);
        trace!(sum, "evaluated sum with gradient");
        Ok((sum, grad))
    }
}

/// Builds or reuses kernels for `roots` against `parameters`, returning the
/// descriptors and the shared kernel cache. Shared by [`compile`] and
/// [`compile_async`] so both paths use exactly one compilation routine.
fn compile_one(
    parameters: &[Node],
    param_position: &HashMap<Node, usize>,
    registry: &mut ValueRegistry,
    kernels: &mut HashMap<u64, Rc<Kernel>>,
    root: &Node,
) -> Result<FunctionDescriptor> {
    let signature = canonicalize(root, parameters);
    let kernel = match kernels.get(&signature.hash) {
        Some(k) => k.clone(),
        None => {
            let compiled = Rc::new(kernel::compile(root, &signature)?);
            kernels.insert(signature.hash, compiled.clone());
            compiled
        }
    };

    let input_indices: Vec<usize> = signature.leaves.iter().map(|leaf| registry.register(leaf)).collect();
    let gradient_indices: Vec<usize> = signature
        .leaves
        .iter()
        .zip(&signature.grad_bearing)
        .filter(|(_, &grad_bearing)| grad_bearing)
        .map(|(leaf, _)| param_position.get(leaf).copied().unwrap_or(parameters.len()))
        .collect();

    Ok(FunctionDescriptor { kernel, input_indices, gradient_indices })
}

fn finish(
    parameters: &[Node],
    registry: ValueRegistry,
    param_registry_ids: Vec<usize>,
    kernels: HashMap<u64, Rc<Kernel>>,
    descriptors: Vec<FunctionDescriptor>,
) -> FunctionSet {
    let num_parameters = parameters.len();
    let data_buffer = vec![0.0_f64; registry.len()];
    FunctionSet { registry, kernels, descriptors, param_registry_ids, num_parameters, data_buffer }
}

/// Invokes `residual_builder` once to produce one root node per residual,
/// compiling (or reusing, by signature hash) a kernel for each and
/// recording its function descriptor.
pub fn compile<F>(parameters: &[Node], residual_builder: F) -> Result<FunctionSet>
where
    F: FnOnce() -> Vec<Node>,
{
    let roots = residual_builder();
    debug!(parameters = parameters.len(), residuals = roots.len(), "compiling function set");

    let mut registry = ValueRegistry::new();
    let param_registry_ids: Vec<usize> = parameters.iter().map(|p| registry.register(p)).collect();
    let param_position: HashMap<Node, usize> =
        parameters.iter().enumerate().map(|(i, p)| (p.clone(), i)).collect();

    let mut kernels: HashMap<u64, Rc<Kernel>> = HashMap::new();
    let mut descriptors = Vec::with_capacity(roots.len());
    for root in &roots {
        descriptors.push(compile_one(parameters, &param_position, &mut registry, &mut kernels, root)?);
    }

    debug!(kernels = kernels.len(), "function set compiled");
    Ok(finish(parameters, registry, param_registry_ids, kernels, descriptors))
}

/// Same contract as [`compile`], but processes residuals in chunks of
/// `chunk_size`, invoking `on_progress(current, total, percent)` and
/// checking `token` after each chunk. Returns [`CompileError::Cancelled`] if
/// the token is observed set at a chunk boundary — per spec, a cancelled
/// build is left in a partially-compiled state the caller must discard.
pub fn compile_async<F, P>(
    parameters: &[Node],
    residual_builder: F,
    chunk_size: usize,
    mut on_progress: P,
    token: &CancellationToken,
) -> Result<FunctionSet>
where
    F: FnOnce() -> Vec<Node>,
    P: FnMut(usize, usize, f64),
{
    compile_async_with_yield(parameters, residual_builder, chunk_size, &mut on_progress, token, &mut || {})
}

/// As [`compile_async`], but also calls `yield_fn` at every chunk boundary
/// (after the progress callback, before resuming), so a caller embedding
/// this in its own event loop can interleave other work without this crate
/// depending on an async runtime.
pub fn compile_async_with_yield<F, P>(
    parameters: &[Node],
    residual_builder: F,
    chunk_size: usize,
    on_progress: &mut P,
    token: &CancellationToken,
    yield_fn: &mut dyn FnMut(),
) -> Result<FunctionSet>
where
    F: FnOnce() -> Vec<Node>,
    P: FnMut(usize, usize, f64),
{
    let chunk_size = chunk_size.max(1);
    let roots = residual_builder();
    let total = roots.len();
    debug!(parameters = parameters.len(), residuals = total, chunk_size, "compiling function set (async)");

    let mut registry = ValueRegistry::new();
    let param_registry_ids: Vec<usize> = parameters.iter().map(|p| registry.register(p)).collect();
    let param_position: HashMap<Node, usize> =
        parameters.iter().enumerate().map(|(i, p)| (p.clone(), i)).collect();

    let mut kernels: HashMap<u64, Rc<Kernel>> = HashMap::new();
    let mut descriptors = Vec::with_capacity(total);

    for chunk in roots.chunks(chunk_size) {
        for root in chunk {
            descriptors.push(compile_one(parameters, &param_position, &mut registry, &mut kernels, root)?);
        }
        let current = descriptors.len();
        let percent = if total == 0 { 100.0 } else { 100.0 * current as f64 / total as f64 };
        on_progress(current, total, percent);
        yield_fn();
        if token.is_cancelled() {
            debug!(current, total, "compile_async cancelled");
            return Err(CompileError::Cancelled.into());
        }
    }

    debug!(kernels = kernels.len(), "function set compiled (async)");
    Ok(finish(parameters, registry, param_registry_ids, kernels, descriptors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn shared_graph_shape_reuses_one_kernel() {
        let params: Vec<Node> = (0..5).map(|i| Node::parameter(i as f64).unwrap()).collect();
        let targets: Vec<Node> = (0..5).map(|i| Node::constant(i as f64 + 10.0).unwrap()).collect();
        let roots: Vec<Node> =
            params.iter().zip(&targets).map(|(p, t)| Node::sub(p, t)).collect();

        let set = compile(&params, || roots.clone()).unwrap();
        assert_eq!(set.kernel_count(), 1);
        assert_eq!(set.num_residuals(), 5);
        assert_eq!(set.reuse_factor(), 5.0);
    }

    #[test]
    fn evaluate_sum_with_gradient_matches_graph_backward() {
        let p = Node::parameter(3.0).unwrap();
        let t = Node::constant(5.0).unwrap();
        let residual = Node::sub(&p, &t);
        let squared = residual.square();

        let mut set = compile(&[p.clone()], || vec![squared.clone()]).unwrap();
        let (sum, grad) = set.evaluate_sum_with_gradient(&[3.0]).unwrap();

        crate::node::backward(&squared);
        assert!((sum - squared.value()).abs() < 1e-12);
        assert!((grad[0] - p.grad()).abs() < 1e-12);
    }

    #[test]
    fn compile_async_reports_full_progress_and_matches_sync() {
        let params: Vec<Node> = (0..10).map(|i| Node::parameter(i as f64).unwrap()).collect();
        let roots: Vec<Node> = params
            .iter()
            .map(|p| Node::sub(p, &Node::constant(1.0).unwrap()))
            .collect();

        let mut seen = Vec::new();
        let token = CancellationToken::new();
        let set = compile_async(&params, || roots.clone(), 3, |cur, total, pct| seen.push((cur, total, pct)), &token)
            .unwrap();

        assert_eq!(set.num_residuals(), 10);
        assert_eq!(set.kernel_count(), 1);
        assert_eq!(seen.last().copied().unwrap().0, 10);
    }

    #[test]
    fn compile_async_honors_cancellation() {
        let params: Vec<Node> = (0..10).map(|i| Node::parameter(i as f64).unwrap()).collect();
        let roots: Vec<Node> = params
            .iter()
            .map(|p| Node::sub(p, &Node::constant(1.0).unwrap()))
            .collect();

        let token = CancellationToken::new();
        token.cancel();
        let result = compile_async(&params, || roots.clone(), 3, |_, _, _| {}, &token);
        assert!(matches!(result, Err(crate::error::Error::Compile(CompileError::Cancelled))));
    }
}

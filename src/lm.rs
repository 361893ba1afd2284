//! Levenberg–Marquardt solver (C6).
//!
//! Nonlinear least squares over a compiled [`FunctionSet`], with adaptive
//! damping and a hand-rolled dense Cholesky (C8) solving the normal
//! equations — appropriate for the single-digit-to-low-tens parameter
//! counts this crate's scenarios use.

use tracing::{debug, trace, warn};

use crate::error::{Result, ShapeError};
use crate::linalg::{cholesky, cholesky_solve, inf_norm, normal_equations, Matrix};
use crate::pool::FunctionSet;

/// Why an LM run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceReason {
    ConvergedCost,
    ConvergedGradient,
    MaxIterations,
    LineSearchFailed,
    SingularJacobian,
}

#[derive(Debug, Clone)]
pub struct LmOptions {
    pub max_iterations: usize,
    pub cost_tolerance: f64,
    pub gradient_tolerance: f64,
    pub adaptive_damping: bool,
    pub initial_damping: f64,
    pub damping_growth: f64,
    pub verbose: bool,
}

impl Default for LmOptions {
    fn default() -> Self {
        LmOptions {
            max_iterations: 100,
            cost_tolerance: 1e-10,
            gradient_tolerance: 1e-8,
            adaptive_damping: true,
            initial_damping: 1e-3,
            damping_growth: 10.0,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmResult {
    pub success: bool,
    pub iterations: usize,
    pub final_cost: f64,
    pub convergence_reason: ConvergenceReason,
    pub parameters: Vec<f64>,
}

fn sum_sq(residuals: &[f64]) -> f64 {
    residuals.iter().map(|r| r * r).sum()
}

/// Attempts `(JᵀJ + λI) δ = −Jᵀr` via Cholesky; if the first diagonal shift
/// isn't enough to make the system positive definite, adds one more
/// `max(λ, 1e-12)` and retries once, per spec.
fn try_cholesky(jtj: &Matrix, lambda: f64) -> Option<Matrix> {
    let mut a = jtj.clone();
    a.add_to_diagonal(lambda);
    if let Some(l) = cholesky(&a) {
        return Some(l);
    }
    let mut a2 = jtj.clone();
    a2.add_to_diagonal(lambda + lambda.max(1e-12));
    cholesky(&a2)
}

/// Runs Levenberg–Marquardt from `parameters` against `function_set` until
/// convergence, a damping-rejection bound, or `max_iterations`. Parameters
/// are left at the best point seen even on non-convergent exit.
pub fn nonlinear_least_squares(
    parameters: &[f64],
    function_set: &mut FunctionSet,
    options: &LmOptions,
) -> Result<LmResult> {
    nonlinear_least_squares_inner(parameters, function_set, options, None)
}

/// As [`nonlinear_least_squares`], but also returns the cost after every
/// accepted step — used by the demo binary's convergence plot, never on a
/// hot path.
pub fn nonlinear_least_squares_with_history(
    parameters: &[f64],
    function_set: &mut FunctionSet,
    options: &LmOptions,
) -> Result<(LmResult, Vec<f64>)> {
    let mut history = Vec::new();
    let mut record = |_: usize, cost: f64| history.push(cost);
    let result = nonlinear_least_squares_inner(parameters, function_set, options, Some(&mut record))?;
    Ok((result, history))
}

fn nonlinear_least_squares_inner(
    parameters: &[f64],
    function_set: &mut FunctionSet,
    options: &LmOptions,
    mut on_accept: Option<&mut dyn FnMut(usize, f64)>,
) -> Result<LmResult> {
    if parameters.len() != function_set.num_parameters() {
        return Err(ShapeError::ParameterCountMismatch {
            expected: function_set.num_parameters(),
            actual: parameters.len(),
        }
        .into());
    }

    let mut p_current = parameters.to_vec();
    let mut lambda = options.initial_damping;

    let (mut residuals, mut jacobian) = function_set.evaluate_jacobian(&p_current)?;
    let mut cost = sum_sq(&residuals);
    let mut best_params = p_current.clone();
    let mut best_cost = cost;

    debug!(parameters = p_current.len(), residuals = residuals.len(), cost, "lm start");

    let mut iterations = 0usize;
    let reason;

    'outer: loop {
        let (jtj, jtr) = normal_equations(&jacobian, &residuals);
        let grad_norm = inf_norm(&jtr);
        if grad_norm < options.gradient_tolerance {
            reason = ConvergenceReason::ConvergedGradient;
            break 'outer;
        }
        if iterations >= options.max_iterations {
            reason = ConvergenceReason::MaxIterations;
            break 'outer;
        }

        let mut inner_rejections = 0usize;
        loop {
            let l = match try_cholesky(&jtj, lambda) {
                Some(l) => l,
                None => {
                    warn!(lambda, "normal equations not positive definite after damping retry");
                    reason = ConvergenceReason::SingularJacobian;
                    break 'outer;
                }
            };
            let neg_jtr: Vec<f64> = jtr.iter().map(|&x| -x).collect();
            let delta = cholesky_solve(&l, &neg_jtr);
            let trial: Vec<f64> = p_current.iter().zip(&delta).map(|(p, d)| p + d).collect();

            let (trial_residuals, trial_jacobian) = function_set.evaluate_jacobian(&trial)?;
            let trial_cost = sum_sq(&trial_residuals);

            if trial_cost < cost {
                let decrease = cost - trial_cost;
                p_current = trial;
                residuals = trial_residuals;
                jacobian = trial_jacobian;
                cost = trial_cost;
                if cost < best_cost {
                    best_cost = cost;
                    best_params = p_current.clone();
                }
                lambda = (lambda / options.damping_growth).max(1e-12);
                iterations += 1;
                if let Some(cb) = on_accept.as_deref_mut() {
                    cb(iterations, cost);
                }
                trace!(iterations, lambda, cost, "lm step accepted");

                if decrease < options.cost_tolerance {
                    reason = ConvergenceReason::ConvergedCost;
                    break 'outer;
                }
                break;
            } else if options.adaptive_damping {
                lambda *= options.damping_growth;
                inner_rejections += 1;
                trace!(inner_rejections, lambda, "lm step rejected, growing damping");
                if inner_rejections > 10 {
                    reason = ConvergenceReason::LineSearchFailed;
                    break 'outer;
                }
            } else {
                reason = ConvergenceReason::LineSearchFailed;
                break 'outer;
            }
        }
    }

    let success = matches!(reason, ConvergenceReason::ConvergedCost | ConvergenceReason::ConvergedGradient);
    debug!(?reason, iterations, final_cost = best_cost, success, "lm finished");

    Ok(LmResult { success, iterations, final_cost: best_cost, convergence_reason: reason, parameters: best_params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::pool::compile;

    #[test]
    fn quadratic_minimum_converges_within_two_iterations() {
        let targets = [3.0, -7.5, 2.25];
        let params: Vec<Node> = targets.iter().map(|_| Node::parameter(0.0).unwrap()).collect();
        let roots: Vec<Node> = params
            .iter()
            .zip(targets.iter())
            .map(|(p, &t)| Node::sub(p, &Node::constant(t).unwrap()))
            .collect();

        let mut set = compile(&params, || roots.clone()).unwrap();
        let start = vec![100.0, -50.0, 0.0];
        let result = nonlinear_least_squares(&start, &mut set, &LmOptions::default()).unwrap();

        assert!(result.success);
        assert!(result.iterations <= 2);
        assert!(result.final_cost < 1e-16);
        for (p, &t) in result.parameters.iter().zip(targets.iter()) {
            assert!((p - t).abs() < 1e-6);
        }
    }

    #[test]
    fn rosenbrock_converges_to_global_minimum() {
        let x = Node::parameter(-1.2).unwrap();
        let y = Node::parameter(1.0).unwrap();
        let params = vec![x.clone(), y.clone()];

        let r1 = Node::sub(&Node::constant(1.0).unwrap(), &x);
        let r2 = {
            let x_sq = x.square();
            let diff = Node::sub(&y, &x_sq);
            Node::mul(&Node::constant(10.0).unwrap(), &diff)
        };
        let roots = vec![r1, r2];

        let mut set = compile(&params, || roots.clone()).unwrap();
        let result = nonlinear_least_squares(&[-1.2, 1.0], &mut set, &LmOptions::default()).unwrap();

        assert!(result.final_cost < 1e-8);
        assert!((result.parameters[0] - 1.0).abs() < 1e-3);
        assert!((result.parameters[1] - 1.0).abs() < 1e-3);
    }
}

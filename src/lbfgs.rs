//! L-BFGS solver (C7).
//!
//! Two-loop recursion over a bounded `(s, y)` history, grounded on
//! `argmin-rs/argmin`'s `solver/quasinewton/lbfgs.rs` shape (history
//! deques, `gamma` scaling, rho/alpha arrays) carried over without a
//! dependency on `argmin` itself — only the algorithm shape, adapted to
//! this crate's concrete [`FunctionSet`] scalar objective.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::error::{Result, ShapeError};
use crate::linalg::inf_norm;
use crate::pool::FunctionSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSearchKind {
    Armijo,
    Wolfe,
}

#[derive(Debug, Clone)]
pub struct LbfgsOptions {
    pub max_iterations: usize,
    pub gradient_tolerance: f64,
    pub history_size: usize,
    pub line_search: LineSearchKind,
    pub verbose: bool,
}

impl Default for LbfgsOptions {
    fn default() -> Self {
        LbfgsOptions {
            max_iterations: 200,
            gradient_tolerance: 1e-8,
            history_size: 10,
            line_search: LineSearchKind::Armijo,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceReason {
    ConvergedGradient,
    MaxIterations,
    LineSearchFailed,
}

#[derive(Debug, Clone)]
pub struct LbfgsResult {
    pub iterations: usize,
    pub final_cost: f64,
    pub convergence_reason: ConvergenceReason,
    pub parameters: Vec<f64>,
}

const ARMIJO_C1: f64 = 1e-4;
const WOLFE_C2: f64 = 0.9;
const MAX_BACKTRACKS: usize = 40;

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Standard two-loop recursion: approximates `H_k ∇f(x_k)` from the last
/// `m` `(s, y)` pairs, oldest-first in the deques.
fn two_loop_direction(grad: &[f64], s_hist: &VecDeque<Vec<f64>>, y_hist: &VecDeque<Vec<f64>>) -> Vec<f64> {
    let m = s_hist.len();
    let mut q = grad.to_vec();
    let mut alpha = vec![0.0; m];
    let mut rho = vec![0.0; m];

    for i in (0..m).rev() {
        let sy = dot(&s_hist[i], &y_hist[i]);
        rho[i] = 1.0 / sy;
        alpha[i] = rho[i] * dot(&s_hist[i], &q);
        for k in 0..q.len() {
            q[k] -= alpha[i] * y_hist[i][k];
        }
    }

    let gamma = if m > 0 {
        let s = &s_hist[m - 1];
        let y = &y_hist[m - 1];
        dot(s, y) / dot(y, y)
    } else {
        1.0
    };
    let mut z: Vec<f64> = q.iter().map(|v| v * gamma).collect();

    for i in 0..m {
        let beta = rho[i] * dot(&y_hist[i], &z);
        for k in 0..z.len() {
            z[k] += s_hist[i][k] * (alpha[i] - beta);
        }
    }
    z
}

struct LineSearchOutcome {
    step: f64,
    point: Vec<f64>,
    cost: f64,
    grad: Vec<f64>,
}

/// Backtracking line search satisfying the Armijo sufficient-decrease
/// condition; when `kind` is [`LineSearchKind::Wolfe`], also prefers a step
/// satisfying the curvature condition but falls back to the last
/// Armijo-satisfying point found if none does within the backtrack budget.
fn line_search(
    function_set: &mut FunctionSet,
    p: &[f64],
    direction: &[f64],
    cost0: f64,
    grad0: &[f64],
    kind: LineSearchKind,
) -> Result<Option<LineSearchOutcome>> {
    let directional_derivative0 = dot(grad0, direction);
    if directional_derivative0 >= 0.0 {
        return Ok(None);
    }

    let mut step = 1.0;
    let mut fallback = None;
    for _ in 0..MAX_BACKTRACKS {
        let trial: Vec<f64> = p.iter().zip(direction).map(|(pi, di)| pi + step * di).collect();
        let (cost, grad) = function_set.evaluate_sum_with_gradient(&trial)?;

        if cost <= cost0 + ARMIJO_C1 * step * directional_derivative0 {
            let outcome = LineSearchOutcome { step, point: trial, cost, grad };
            if kind == LineSearchKind::Wolfe {
                let directional_derivative_trial = dot(&outcome.grad, direction);
                if directional_derivative_trial.abs() <= WOLFE_C2 * directional_derivative0.abs() {
                    return Ok(Some(outcome));
                }
                fallback = Some(outcome);
            } else {
                return Ok(Some(outcome));
            }
        }
        step *= 0.5;
    }
    Ok(fallback)
}

/// Runs L-BFGS from `parameters` against `function_set`'s summed objective
/// until gradient tolerance, a line-search failure, or `max_iterations`.
pub fn lbfgs(parameters: &[f64], function_set: &mut FunctionSet, options: &LbfgsOptions) -> Result<LbfgsResult> {
    if parameters.len() != function_set.num_parameters() {
        return Err(ShapeError::ParameterCountMismatch {
            expected: function_set.num_parameters(),
            actual: parameters.len(),
        }
        .into());
    }

    let mut p_current = parameters.to_vec();
    let (mut cost, mut grad) = function_set.evaluate_sum_with_gradient(&p_current)?;
    let mut best_params = p_current.clone();
    let mut best_cost = cost;

    let mut s_hist: VecDeque<Vec<f64>> = VecDeque::with_capacity(options.history_size);
    let mut y_hist: VecDeque<Vec<f64>> = VecDeque::with_capacity(options.history_size);

    debug!(parameters = p_current.len(), cost, "lbfgs start");

    let mut iterations = 0usize;
    let reason;

    loop {
        if inf_norm(&grad) < options.gradient_tolerance {
            reason = ConvergenceReason::ConvergedGradient;
            break;
        }
        if iterations >= options.max_iterations {
            reason = ConvergenceReason::MaxIterations;
            break;
        }

        let raw_direction = two_loop_direction(&grad, &s_hist, &y_hist);
        let direction: Vec<f64> = raw_direction.iter().map(|d| -d).collect();

        match line_search(function_set, &p_current, &direction, cost, &grad, options.line_search)? {
            None => {
                reason = ConvergenceReason::LineSearchFailed;
                break;
            }
            Some(outcome) => {
                let s: Vec<f64> = outcome.point.iter().zip(&p_current).map(|(a, b)| a - b).collect();
                let y: Vec<f64> = outcome.grad.iter().zip(&grad).map(|(a, b)| a - b).collect();
                let sy = dot(&s, &y);

                p_current = outcome.point;
                cost = outcome.cost;
                grad = outcome.grad;
                iterations += 1;

                if cost < best_cost {
                    best_cost = cost;
                    best_params = p_current.clone();
                }

                if sy > 0.0 {
                    if s_hist.len() == options.history_size {
                        s_hist.pop_front();
                        y_hist.pop_front();
                    }
                    s_hist.push_back(s);
                    y_hist.push_back(y);
                } else {
                    trace!(sy, "skipping (s, y) update: curvature condition violated");
                }

                trace!(iterations, step = outcome.step, cost, "lbfgs step accepted");
            }
        }
    }

    debug!(?reason, iterations, final_cost = best_cost, "lbfgs finished");
    Ok(LbfgsResult { iterations, final_cost: best_cost, convergence_reason: reason, parameters: best_params })
}

//! Scalar reverse-mode automatic differentiation with a JIT-compiling
//! kernel cache, plus Levenberg–Marquardt and L-BFGS nonlinear optimizers.
//!
//! Build a graph with [`Node`]'s operator catalog, mark the leaves you want
//! to optimize as parameters, then hand a residual builder to [`compile`]
//! (or [`compile_async`] for large batches). The resulting [`FunctionSet`]
//! drives [`lm::nonlinear_least_squares`] or [`lbfgs::lbfgs`].

pub mod error;
pub mod kernel;
pub mod lbfgs;
pub mod linalg;
pub mod lm;
pub mod node;
pub mod pool;
pub mod registry;
pub mod signature;
pub mod viz;

pub use error::{CompileError, DomainError, Error, Result, ShapeError};
pub use node::{backward, with_no_grad, Node, Op};
pub use pool::{compile, compile_async, compile_async_with_yield, CancellationToken, FunctionSet};
pub use registry::ValueRegistry;
pub use signature::{canonicalize, Signature};

pub use lbfgs::{lbfgs, ConvergenceReason as LbfgsConvergenceReason, LbfgsOptions, LbfgsResult};
pub use lm::{
    nonlinear_least_squares, nonlinear_least_squares_with_history, ConvergenceReason as LmConvergenceReason,
    LmOptions, LmResult,
};

//! Crate-wide error type.
//!
//! Follows the single-enum-plus-`Result`-alias shape used throughout the
//! autodiff/numerics corpus this crate draws from: one `Error` enum, one
//! `Result<T>` alias, `thiserror` for the boilerplate.

use thiserror::Error;

/// A forward evaluation violated an operator's precondition.
///
/// Fatal to the in-flight forward pass; the caller may retry with different
/// inputs. Never caught inside `backward`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("division by {0:e}, magnitude below the 1e-12 floor")]
    DivisionByNearZero(f64),

    #[error("log of non-positive value {0}")]
    LogOfNonPositive(f64),

    #[error("sqrt of negative value {0}")]
    SqrtOfNegative(f64),

    #[error("pow({base}, {exponent}): negative base with non-integer exponent")]
    InvalidPower { base: f64, exponent: f64 },

    #[error("leaf value {0} is NaN or non-finite")]
    NonFiniteLeaf(f64),
}

/// A residual builder or loss helper returned an inconsistent shape.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("parameter vector has length {actual}, expected {expected}")]
    ParameterCountMismatch { expected: usize, actual: usize },
}

/// The kernel compiler could not emit a procedure for a graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("malformed graph: {0}")]
    MalformedGraph(String),

    #[error("compilation cancelled at a chunk boundary; the function set is partially compiled and must not be evaluated")]
    Cancelled,
}

/// Crate-wide error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

//! Core building blocks of a nonlinear least squares problem
//!
//! This module contains everything a caller touches before solving:
//! - Cost function adapters wrapping caller-supplied residual evaluators
//! - Loss functions for robust estimation and the corrector that applies them
//! - Parameter blocks (the values being optimized, their bounds and constness)
//! - Residual blocks and the `Problem` registry that owns them
//! - The evaluator that drives callbacks on behalf of the minimizer
//! - One-dimensional curve fitting built on top of the registry

pub mod corrector;
pub mod cost_function;
pub mod curve_fit;
pub mod evaluator;
pub mod gradient_checker;
pub mod loss_functions;
pub mod parameter_block;
pub mod problem;
pub mod residual_block;

use thiserror::Error;
use tracing::error;

/// Core module error types for problem construction and evaluation
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Parameter block count or sizes disagree with what a cost function declares,
    /// or an identifier does not belong to the problem it is used with
    #[error("Structural mismatch: {0}")]
    StructuralMismatch(String),

    /// Invalid input parameter (non-positive scale, empty block, missing data)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid bound or bound vector
    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),

    /// Index outside of a parameter block
    #[error("Index {index} is out of bounds for a block of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// Symbolic Jacobian structure construction failed
    #[error("Symbolic structure error: {0}")]
    SymbolicStructure(String),

    /// Parallel computation error (thread pool construction)
    #[error("Parallel computation error: {0}")]
    ParallelComputation(String),

    /// Writing a diagnostic artifact failed
    #[error("I/O error: {0}")]
    Io(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the third-party error that caused it
    ///
    /// # Example
    /// ```ignore
    /// SymbolicSparseColMat::try_new_from_indices(rows, cols, &indices)
    ///     .map_err(|e| {
    ///         CoreError::SymbolicStructure("Failed to build Jacobian pattern".to_string())
    ///             .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;

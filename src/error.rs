//! Error types for the apex-nlls library
//!
//! - **`NllsError`** is the top-level error returned by [`solve`](crate::optimizer::solve)
//!   and the curve-fitting helpers
//! - **Module errors** (`CoreError`, `LinAlgError`, `OptimizerError`) are wrapped inside it
//!   transparently, so their messages and sources are preserved
//!
//! A callback returning `false` is never an error: the minimizer treats it as a failed step
//! and the outcome is reported through the solver summary.

use std::error::Error as StdError;

use thiserror::Error;

use crate::{core::CoreError, linalg::LinAlgError, optimizer::OptimizerError};

/// Main result type used throughout the apex-nlls library
pub type NllsResult<T> = Result<T, NllsError>;

/// Main error type for the apex-nlls library
#[derive(Debug, Error)]
pub enum NllsError {
    /// Problem construction and evaluation errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Configuration and minimizer errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),
}

impl NllsError {
    /// The error and its sources, one per line.
    ///
    /// ```rust,ignore
    /// if let Err(e) = solve(&options, &mut problem) {
    ///     warn!("Solve failed:\n{}", e.chain());
    /// }
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Single-line form of [`chain`](Self::chain).
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

//! Minimizers, their configuration and the solve entry point.
//!
//! - [`SolverOptions`]: the validated configuration of a solve
//! - [`SolverSummary`]: the report a solve produces
//! - [`TrustRegionMinimizer`]: Levenberg-Marquardt and dogleg steps on the linearized problem
//! - [`LineSearchMinimizer`]: steepest descent, nonlinear CG, L-BFGS and BFGS directions
//! - [`solve`] / [`Solver`]: validate, evaluate, minimize, report

use thiserror::Error;
use tracing::error;

use crate::{
    core::{CoreError, evaluator::Evaluator},
    linalg,
};

pub mod dog_leg;
pub mod dump;
pub mod levenberg_marquardt;
pub mod line_search;
pub mod options;
pub mod solver;
pub mod summary;
pub mod trust_region;
pub mod types;

pub use dog_leg::DoglegStrategy;
pub use levenberg_marquardt::LevenbergMarquardtStrategy;
pub use line_search::LineSearchMinimizer;
pub use options::SolverOptions;
pub use solver::{Solver, solve};
pub use summary::{IterationSummary, SolverSummary};
pub use trust_region::{TrustRegionMinimizer, TrustRegionStrategy};
pub use types::{
    DenseLinearAlgebraLibraryType, DoglegType, DumpFormatType, LineSearchDirectionType,
    LineSearchInterpolationType, LineSearchType, LinearSolverType, LoggingType, MinimizerType,
    NonlinearConjugateGradientType, PreconditionerType, SparseLinearAlgebraLibraryType,
    TerminationType, TrustRegionStrategyType, VisibilityClusteringType,
};

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Options failed validation, or do not fit the problem being solved
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Problem has no residual blocks
    #[error("Problem has no residual blocks")]
    NoResidualBlocks,

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),

    /// Problem evaluation failed structurally (not a callback returning `false`)
    #[error("Problem error: {0}")]
    Core(#[from] CoreError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// options.validate()
    ///     .map_err(|e| e.log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// An iterative minimization algorithm.
///
/// The minimizer reads the starting point from `evaluator`, records its progress in
/// `summary` and leaves the final point in the problem's parameter blocks. Evaluation
/// failures and non-convergence are reported through `summary`; `Err` is reserved for
/// structural failures.
pub trait Minimizer {
    fn minimize(
        &mut self,
        evaluator: &mut Evaluator<'_>,
        options: &SolverOptions,
        summary: &mut SolverSummary,
    ) -> OptimizerResult<()>;
}

/// `a · b` for column vectors
pub(crate) fn dot(a: &faer::Mat<f64>, b: &faer::Mat<f64>) -> f64 {
    (0..a.nrows()).map(|i| a[(i, 0)] * b[(i, 0)]).sum()
}

/// `y += alpha · x` for column vectors
pub(crate) fn axpy(y: &mut faer::Mat<f64>, alpha: f64, x: &faer::Mat<f64>) {
    for i in 0..y.nrows() {
        y[(i, 0)] += alpha * x[(i, 0)];
    }
}

//! Linear solvers for the trust-region step
//!
//! Every solver answers the same question: given the corrected residuals `r`, the Jacobian
//! `J` and an optional diagonal `d`, find the step `x` of the damped normal equations
//!
//! ```text
//! (JᵀJ + diag(d)²) x = −Jᵀ r
//! ```
//!
//! Without a diagonal this is the Gauss-Newton step. Backends:
//!
//! - [`SparseCholeskySolver`]: faer sparse Cholesky with a cached symbolic factorization
//! - [`SparseQrSolver`]: faer QR of the normal matrix
//! - [`DenseQrSolver`] / [`DenseCholeskySolver`]: nalgebra on densified matrices
//! - [`CgnrSolver`]: preconditioned conjugate gradients on the normal equations

pub mod cgnr;
pub mod cholesky;
pub mod dense;
pub mod qr;

use std::ops::Mul;

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use thiserror::Error;
use tracing::error;

use crate::optimizer::{
    options::SolverOptions,
    types::{DenseLinearAlgebraLibraryType, LinearSolverType},
};

pub use cgnr::CgnrSolver;
pub use cholesky::SparseCholeskySolver;
pub use dense::{DenseCholeskySolver, DenseQrSolver};
pub use qr::SparseQrSolver;

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, QR, etc.)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed(
    ///             "Symbolic Cholesky decomposition failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Solver for the (optionally damped) normal equations of a linearized problem
pub trait LinearSolver: Send {
    /// Solve `(JᵀJ + diag(d)²) x = −Jᵀr`, or the undamped system when `diagonal` is `None`.
    ///
    /// # Errors
    /// Returns `LinAlgError` if:
    /// - Matrix factorization fails
    /// - Matrix is singular or ill-conditioned
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> LinAlgResult<Mat<f64>>;

    /// Solve the normal equation `(JᵀJ) x = −Jᵀr`
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        self.solve_augmented_equation(residuals, jacobian, None)
    }

    /// Iterations used by the last solve. Direct factorizations report 1.
    fn num_iterations(&self) -> usize {
        1
    }
}

/// Build the linear solver selected by `options`.
///
/// `subset_rows` are the residual rows used by the subset preconditioner; they are ignored
/// by every other configuration.
pub fn create_linear_solver(
    options: &SolverOptions,
    subset_rows: Vec<usize>,
) -> Box<dyn LinearSolver> {
    let dense_faer =
        options.dense_linear_algebra_library_type == DenseLinearAlgebraLibraryType::Faer;
    match options.linear_solver_type {
        LinearSolverType::DenseQr if dense_faer => Box::new(SparseQrSolver::new()),
        LinearSolverType::DenseQr => Box::new(DenseQrSolver::new()),
        LinearSolverType::DenseNormalCholesky | LinearSolverType::DenseSchur if dense_faer => {
            Box::new(SparseCholeskySolver::new())
        }
        LinearSolverType::DenseNormalCholesky | LinearSolverType::DenseSchur => {
            Box::new(DenseCholeskySolver::new())
        }
        LinearSolverType::SparseNormalCholesky | LinearSolverType::SparseSchur => {
            Box::new(SparseCholeskySolver::new())
        }
        LinearSolverType::Cgnr | LinearSolverType::IterativeSchur => Box::new(CgnrSolver::new(
            options.preconditioner_type,
            subset_rows,
        )),
    }
}

/// `JᵀJ` as a sparse matrix
pub(crate) fn normal_matrix(
    jacobian: &SparseColMat<usize, f64>,
) -> LinAlgResult<SparseColMat<usize, f64>> {
    let jt = jacobian.as_ref().transpose();
    Ok(jt
        .to_col_major()
        .map_err(|e| {
            LinAlgError::MatrixConversion(
                "Failed to convert transposed Jacobian to column-major format".to_string(),
            )
            .log_with_source(e)
        })?
        .mul(jacobian.as_ref()))
}

/// `Jᵀr`
pub(crate) fn gradient(residuals: &Mat<f64>, jacobian: &SparseColMat<usize, f64>) -> Mat<f64> {
    jacobian.as_ref().transpose().mul(residuals)
}

/// `H + diag(d)²`, or a copy of `H` without a diagonal
pub(crate) fn add_squared_diagonal(
    hessian: &SparseColMat<usize, f64>,
    diagonal: Option<&Mat<f64>>,
) -> LinAlgResult<SparseColMat<usize, f64>> {
    let Some(diagonal) = diagonal else {
        return Ok(hessian.clone());
    };
    let n = hessian.ncols();
    let triplets: Vec<Triplet<usize, usize, f64>> = (0..n)
        .map(|i| Triplet::new(i, i, diagonal[(i, 0)] * diagonal[(i, 0)]))
        .collect();
    let damping = SparseColMat::try_new_from_triplets(n, n, &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create diagonal damping matrix".to_string())
            .log_with_source(e)
    })?;
    Ok(hessian + damping)
}

/// Reject steps containing NaN or infinity.
pub(crate) fn ensure_finite(step: Mat<f64>) -> LinAlgResult<Mat<f64>> {
    if (0..step.nrows()).all(|i| step[(i, 0)].is_finite()) {
        Ok(step)
    } else {
        Err(LinAlgError::SingularMatrix.log())
    }
}

//! Conjugate gradients on the normal equations (CGNR).
//!
//! Solves `(JᵀJ + diag(d)²) x = −Jᵀr` without forming `JᵀJ`: every iteration applies `J`
//! and `Jᵀ` to a vector. The system is preconditioned with one of
//!
//! - the identity
//! - the inverse diagonal of `JᵀJ + diag(d)²` (Jacobi)
//! - a sparse Cholesky factorization of the same matrix built only from a chosen subset of
//!   residual rows (subset preconditioner)
//!
//! Preconditioners that need a Schur complement or visibility clustering are not available
//! here and are replaced by Jacobi.

use std::ops::Mul;

use faer::{
    Mat,
    linalg::solvers::Solve,
    sparse::{SparseColMat, Triplet, linalg::solvers::Llt},
};
use tracing::warn;

use crate::{
    linalg::{
        LinAlgError, LinAlgResult, LinearSolver, SparseCholeskySolver, add_squared_diagonal,
        ensure_finite, gradient, normal_matrix,
    },
    optimizer::types::PreconditionerType,
};

/// Relative residual reduction at which the iteration stops
const RELATIVE_TOLERANCE: f64 = 1e-12;

enum Preconditioner {
    Identity,
    /// Inverse diagonal
    Jacobi(Vec<f64>),
    Subset(Llt<usize, f64>),
}

impl Preconditioner {
    fn apply(&self, residual: &Mat<f64>) -> Mat<f64> {
        match self {
            Preconditioner::Identity => residual.clone(),
            Preconditioner::Jacobi(inverse_diagonal) => {
                Mat::from_fn(residual.nrows(), 1, |i, _| inverse_diagonal[i] * residual[(i, 0)])
            }
            Preconditioner::Subset(cholesky) => cholesky.solve(residual),
        }
    }
}

pub struct CgnrSolver {
    preconditioner_type: PreconditionerType,
    /// Residual rows used to build the subset preconditioner
    subset_rows: Vec<usize>,
    subset_factorizer: SparseCholeskySolver,
    warned_about_fallback: bool,
    num_iterations: usize,
}

impl CgnrSolver {
    pub fn new(preconditioner_type: PreconditionerType, subset_rows: Vec<usize>) -> Self {
        Self {
            preconditioner_type,
            subset_rows,
            subset_factorizer: SparseCholeskySolver::new(),
            warned_about_fallback: false,
            num_iterations: 0,
        }
    }

    fn build_preconditioner(
        &mut self,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> Preconditioner {
        match self.preconditioner_type {
            PreconditionerType::Identity => Preconditioner::Identity,
            PreconditionerType::Subset => match self.subset_preconditioner(jacobian, diagonal) {
                Ok(cholesky) => Preconditioner::Subset(cholesky),
                Err(e) => {
                    if !self.warned_about_fallback {
                        warn!("Subset preconditioner unavailable ({e}), falling back to Jacobi");
                        self.warned_about_fallback = true;
                    }
                    jacobi_preconditioner(jacobian, diagonal)
                }
            },
            PreconditionerType::Jacobi
            | PreconditionerType::SchurJacobi
            | PreconditionerType::ClusterJacobi
            | PreconditionerType::ClusterTridiagonal => jacobi_preconditioner(jacobian, diagonal),
        }
    }

    /// Cholesky of `J_sᵀJ_s + diag(d)²` where `J_s` keeps only the subset rows.
    fn subset_preconditioner(
        &mut self,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> LinAlgResult<Llt<usize, f64>> {
        let mut selected = vec![false; jacobian.nrows()];
        for &row in &self.subset_rows {
            if let Some(flag) = selected.get_mut(row) {
                *flag = true;
            }
        }
        let triplets: Vec<Triplet<usize, usize, f64>> = jacobian
            .triplet_iter()
            .filter(|t| selected[t.row])
            .map(|t| Triplet::new(t.row, t.col, *t.val))
            .collect();
        let subset_jacobian =
            SparseColMat::try_new_from_triplets(jacobian.nrows(), jacobian.ncols(), &triplets)
                .map_err(|e| {
                    LinAlgError::SparseMatrixCreation(
                        "Failed to create subset Jacobian".to_string(),
                    )
                    .log_with_source(e)
                })?;
        let hessian = add_squared_diagonal(&normal_matrix(&subset_jacobian)?, diagonal)?;
        if hessian.compute_nnz() == 0 {
            return Err(LinAlgError::SingularMatrix);
        }
        self.subset_factorizer.factor(&hessian)
    }
}

fn jacobi_preconditioner(
    jacobian: &SparseColMat<usize, f64>,
    diagonal: Option<&Mat<f64>>,
) -> Preconditioner {
    let mut diag = vec![0.0; jacobian.ncols()];
    for t in jacobian.triplet_iter() {
        diag[t.col] += t.val * t.val;
    }
    if let Some(diagonal) = diagonal {
        for (i, value) in diag.iter_mut().enumerate() {
            *value += diagonal[(i, 0)] * diagonal[(i, 0)];
        }
    }
    Preconditioner::Jacobi(
        diag.into_iter()
            .map(|v| if v > 0.0 { 1.0 / v } else { 1.0 })
            .collect(),
    )
}

fn dot(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    (0..a.nrows()).map(|i| a[(i, 0)] * b[(i, 0)]).sum()
}

/// `y += alpha · x`
fn axpy(y: &mut Mat<f64>, alpha: f64, x: &Mat<f64>) {
    for i in 0..y.nrows() {
        y[(i, 0)] += alpha * x[(i, 0)];
    }
}

/// `(JᵀJ + diag(d)²) v`
fn apply_normal_operator(
    jacobian: &SparseColMat<usize, f64>,
    diagonal: Option<&Mat<f64>>,
    v: &Mat<f64>,
) -> Mat<f64> {
    let jv = jacobian.as_ref().mul(v);
    let mut result = jacobian.as_ref().transpose().mul(&jv);
    if let Some(diagonal) = diagonal {
        for i in 0..result.nrows() {
            result[(i, 0)] += diagonal[(i, 0)] * diagonal[(i, 0)] * v[(i, 0)];
        }
    }
    result
}

impl LinearSolver for CgnrSolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> LinAlgResult<Mat<f64>> {
        let n = jacobian.ncols();
        let rhs = -&gradient(residuals, jacobian);
        let mut x = Mat::zeros(n, 1);
        self.num_iterations = 0;

        let rhs_norm = rhs.norm_l2();
        if rhs_norm == 0.0 {
            return Ok(x);
        }

        let preconditioner = self.build_preconditioner(jacobian, diagonal);
        let max_iterations = (2 * n).max(10);

        let mut residual = rhs.clone();
        let mut z = preconditioner.apply(&residual);
        let mut direction = z.clone();
        let mut rz = dot(&residual, &z);

        for iteration in 1..=max_iterations {
            self.num_iterations = iteration;
            let q = apply_normal_operator(jacobian, diagonal, &direction);
            let curvature = dot(&direction, &q);
            if curvature <= 0.0 {
                if iteration == 1 {
                    return Err(LinAlgError::SingularMatrix.log());
                }
                break;
            }

            let alpha = rz / curvature;
            axpy(&mut x, alpha, &direction);
            axpy(&mut residual, -alpha, &q);
            if residual.norm_l2() <= RELATIVE_TOLERANCE * rhs_norm {
                break;
            }

            z = preconditioner.apply(&residual);
            let rz_next = dot(&residual, &z);
            let beta = rz_next / rz;
            rz = rz_next;
            for i in 0..n {
                direction[(i, 0)] = z[(i, 0)] + beta * direction[(i, 0)];
            }
        }

        ensure_finite(x)
    }

    fn num_iterations(&self) -> usize {
        self.num_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::test_support::{overdetermined_system, reference_step};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn assert_matches_reference(preconditioner_type: PreconditionerType) -> TestResult {
        let (jacobian, residuals) = overdetermined_system()?;
        let diagonal = Mat::from_fn(3, 1, |_, _| 0.2);
        let mut solver = CgnrSolver::new(preconditioner_type, vec![0, 1, 2, 3]);

        let solution = solver.solve_augmented_equation(&residuals, &jacobian, Some(&diagonal))?;
        let expected = reference_step(&jacobian, &residuals, Some(&diagonal));
        for (i, value) in expected.iter().enumerate() {
            assert!((solution[(i, 0)] - value).abs() < 1e-8);
        }
        assert!(solver.num_iterations() >= 1);
        Ok(())
    }

    #[test]
    fn test_identity_preconditioner() -> TestResult {
        assert_matches_reference(PreconditionerType::Identity)
    }

    #[test]
    fn test_jacobi_preconditioner() -> TestResult {
        assert_matches_reference(PreconditionerType::Jacobi)
    }

    #[test]
    fn test_full_subset_preconditioner_converges_immediately() -> TestResult {
        // With every row selected the preconditioner is the exact inverse
        let (jacobian, residuals) = overdetermined_system()?;
        let mut solver = CgnrSolver::new(PreconditionerType::Subset, vec![0, 1, 2, 3]);
        solver.solve_normal_equation(&residuals, &jacobian)?;
        assert_eq!(solver.num_iterations(), 1);
        Ok(())
    }

    #[test]
    fn test_deficient_subset_falls_back_to_jacobi() -> TestResult {
        // Row 2 alone does not touch column 0, so its normal matrix is singular
        let (jacobian, residuals) = overdetermined_system()?;
        let mut solver = CgnrSolver::new(PreconditionerType::Subset, vec![2]);
        let solution = solver.solve_normal_equation(&residuals, &jacobian)?;
        let expected = reference_step(&jacobian, &residuals, None);
        for (i, value) in expected.iter().enumerate() {
            assert!((solution[(i, 0)] - value).abs() < 1e-8);
        }
        assert!(solver.warned_about_fallback);
        Ok(())
    }

    #[test]
    fn test_zero_gradient_gives_zero_step() -> TestResult {
        let (jacobian, _) = overdetermined_system()?;
        let residuals = Mat::zeros(4, 1);
        let mut solver = CgnrSolver::new(PreconditionerType::Jacobi, Vec::new());
        let step = solver.solve_normal_equation(&residuals, &jacobian)?;
        assert_eq!(step.norm_l2(), 0.0);
        assert_eq!(solver.num_iterations(), 0);
        Ok(())
    }
}

//! Dense backends built on nalgebra.
//!
//! Both solvers densify the sparse Jacobian, so they are meant for small problems or
//! problems whose Jacobian is mostly full anyway.

use faer::{Mat, sparse::SparseColMat};
use nalgebra::{DMatrix, DVector};

use crate::linalg::{LinAlgError, LinAlgResult, LinearSolver};

/// Copy a sparse Jacobian into a dense nalgebra matrix.
fn densify(jacobian: &SparseColMat<usize, f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(jacobian.nrows(), jacobian.ncols());
    for t in jacobian.triplet_iter() {
        dense[(t.row, t.col)] += *t.val;
    }
    dense
}

fn to_faer(x: &DVector<f64>) -> LinAlgResult<Mat<f64>> {
    if x.iter().all(|v| v.is_finite()) {
        Ok(Mat::from_fn(x.len(), 1, |i, _| x[i]))
    } else {
        Err(LinAlgError::SingularMatrix.log())
    }
}

/// Householder QR of the stacked system `[J; diag(d)] x = [−r; 0]`.
///
/// Never forms `JᵀJ`, so it loses less precision than the normal-equation solvers.
#[derive(Debug, Clone, Default)]
pub struct DenseQrSolver;

impl DenseQrSolver {
    pub fn new() -> Self {
        Self
    }
}

impl LinearSolver for DenseQrSolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> LinAlgResult<Mat<f64>> {
        let (m, n) = (jacobian.nrows(), jacobian.ncols());
        let extra_rows = if diagonal.is_some() { n } else { 0 };
        if m + extra_rows < n {
            return Err(LinAlgError::FactorizationFailed(format!(
                "QR of a {}x{n} system is rank deficient",
                m + extra_rows
            ))
            .log());
        }

        let mut a = DMatrix::zeros(m + extra_rows, n);
        a.rows_mut(0, m).copy_from(&densify(jacobian));
        let mut b = DVector::zeros(m + extra_rows);
        for i in 0..m {
            b[i] = -residuals[(i, 0)];
        }
        if let Some(diagonal) = diagonal {
            for i in 0..n {
                a[(m + i, i)] = diagonal[(i, 0)];
            }
        }

        let qr = a.qr();
        let r = qr.r();
        let largest_pivot = r.diagonal().iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if r
            .diagonal()
            .iter()
            .any(|v| v.abs() <= f64::EPSILON * largest_pivot * n as f64)
        {
            return Err(LinAlgError::SingularMatrix.log());
        }

        qr.q_tr_mul(&mut b);
        let x = r
            .solve_upper_triangular(&b.rows(0, n))
            .ok_or_else(|| LinAlgError::SingularMatrix.log())?;
        to_faer(&x)
    }
}

/// Dense Cholesky of `JᵀJ + diag(d)²`.
#[derive(Debug, Clone, Default)]
pub struct DenseCholeskySolver;

impl DenseCholeskySolver {
    pub fn new() -> Self {
        Self
    }
}

impl LinearSolver for DenseCholeskySolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> LinAlgResult<Mat<f64>> {
        let a = densify(jacobian);
        let r = DVector::from_fn(residuals.nrows(), |i, _| residuals[(i, 0)]);

        let mut hessian = a.tr_mul(&a);
        if let Some(diagonal) = diagonal {
            for i in 0..hessian.ncols() {
                hessian[(i, i)] += diagonal[(i, 0)] * diagonal[(i, 0)];
            }
        }
        let gradient = a.tr_mul(&r);

        let cholesky = hessian.cholesky().ok_or_else(|| {
            LinAlgError::FactorizationFailed(
                "Dense Cholesky: matrix is not positive definite".to_string(),
            )
            .log()
        })?;
        to_faer(&cholesky.solve(&(-gradient)))
    }
}

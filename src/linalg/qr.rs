use faer::{
    Mat,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Qr, SymbolicQr},
};

use crate::linalg::{
    LinAlgError, LinAlgResult, LinearSolver, add_squared_diagonal, ensure_finite, gradient,
    normal_matrix,
};

/// QR factorization of the (damped) normal matrix with faer.
///
/// Slower than Cholesky but tolerates matrices that are only semi-definite up to rounding.
#[derive(Debug, Clone, Default)]
pub struct SparseQrSolver {
    /// Cached symbolic factorization, keyed on `(nrows, nnz)` of the factored matrix
    symbolic_factorization: Option<(SymbolicQr<usize>, (usize, usize))>,
}

impl SparseQrSolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinearSolver for SparseQrSolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> LinAlgResult<Mat<f64>> {
        let hessian = normal_matrix(jacobian)?;
        let augmented_hessian = add_squared_diagonal(&hessian, diagonal)?;
        let gradient = gradient(residuals, jacobian);

        let shape = (augmented_hessian.nrows(), augmented_hessian.compute_nnz());
        let sym = match &self.symbolic_factorization {
            Some((cached_sym, cached_shape)) if *cached_shape == shape => cached_sym.clone(),
            _ => {
                let new_sym = SymbolicQr::try_new(augmented_hessian.symbolic()).map_err(|e| {
                    LinAlgError::FactorizationFailed(
                        "Symbolic QR decomposition failed".to_string(),
                    )
                    .log_with_source(e)
                })?;
                self.symbolic_factorization = Some((new_sym.clone(), shape));
                new_sym
            }
        };

        let qr = Qr::try_new_with_symbolic(sym, augmented_hessian.as_ref())
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        // H · dx = −g
        ensure_finite(qr.solve(-&gradient))
    }
}

use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};

use crate::linalg::{
    LinAlgError, LinAlgResult, LinearSolver, add_squared_diagonal, ensure_finite, gradient,
    normal_matrix,
};

/// Sparse Cholesky factorization of the normal equations.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    /// Cached symbolic factorization for reuse across iterations.
    ///
    /// The Jacobian pattern is fixed for a solve and the damping only touches the diagonal,
    /// which `JᵀJ` already has, so the pattern of the factored matrix never changes.
    symbolic_factorization: Option<SymbolicLlt<usize>>,
    /// `(nrows, nnz)` of the matrix the cached factorization was built for
    symbolic_shape: Option<(usize, usize)>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Numeric Cholesky factorization of the lower triangle of `matrix`.
    pub(crate) fn factor(
        &mut self,
        matrix: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Llt<usize, f64>> {
        let shape = (matrix.nrows(), matrix.compute_nnz());
        let sym = match &self.symbolic_factorization {
            Some(cached_sym) if self.symbolic_shape == Some(shape) => cached_sym.clone(),
            _ => {
                let new_sym = SymbolicLlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
                    LinAlgError::FactorizationFailed(
                        "Symbolic Cholesky decomposition failed".to_string(),
                    )
                    .log_with_source(e)
                })?;
                self.symbolic_factorization = Some(new_sym.clone());
                self.symbolic_shape = Some(shape);
                new_sym
            }
        };

        Llt::try_new_with_symbolic(sym, matrix.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))
    }
}

impl LinearSolver for SparseCholeskySolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> LinAlgResult<Mat<f64>> {
        let hessian = normal_matrix(jacobian)?;
        let augmented_hessian = add_squared_diagonal(&hessian, diagonal)?;
        let gradient = gradient(residuals, jacobian);
        let cholesky = self.factor(&augmented_hessian)?;
        ensure_finite(cholesky.solve(-&gradient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::test_support::{overdetermined_system, reference_step};
    use faer::sparse::Triplet;

    const TOLERANCE: f64 = 1e-10;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_solve_normal_equation_matches_reference() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = overdetermined_system()?;

        let solution = solver.solve_normal_equation(&residuals, &jacobian)?;
        let expected = reference_step(&jacobian, &residuals, None);
        assert_eq!(solution.nrows(), 3);
        for (i, value) in expected.iter().enumerate() {
            assert!((solution[(i, 0)] - value).abs() < TOLERANCE);
        }
        assert!(solver.symbolic_factorization.is_some());
        Ok(())
    }

    #[test]
    fn test_symbolic_pattern_is_reused() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = overdetermined_system()?;
        let diagonal = Mat::from_fn(3, 1, |_, _| 0.5);

        let first = solver.solve_augmented_equation(&residuals, &jacobian, Some(&diagonal))?;
        let shape = solver.symbolic_shape;
        let second = solver.solve_augmented_equation(&residuals, &jacobian, Some(&diagonal))?;

        assert_eq!(shape, solver.symbolic_shape);
        for i in 0..3 {
            assert!((first[(i, 0)] - second[(i, 0)]).abs() < TOLERANCE);
        }
        Ok(())
    }

    #[test]
    fn test_augmented_equation_matches_reference() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = overdetermined_system()?;
        let diagonal = Mat::from_fn(3, 1, |i, _| 0.1 * (i + 1) as f64);

        let solution = solver.solve_augmented_equation(&residuals, &jacobian, Some(&diagonal))?;
        let expected = reference_step(&jacobian, &residuals, Some(&diagonal));
        for (i, value) in expected.iter().enumerate() {
            assert!((solution[(i, 0)] - value).abs() < TOLERANCE);
        }
        Ok(())
    }

    #[test]
    fn test_larger_damping_gives_shorter_step() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = overdetermined_system()?;
        let small = Mat::from_fn(3, 1, |_, _| 0.1);
        let large = Mat::from_fn(3, 1, |_, _| 10.0);

        let short = solver.solve_augmented_equation(&residuals, &jacobian, Some(&large))?;
        let long = solver.solve_augmented_equation(&residuals, &jacobian, Some(&small))?;
        assert!(short.norm_l2() < long.norm_l2());
        Ok(())
    }

    #[test]
    fn test_singular_matrix_fails() -> TestResult {
        let mut solver = SparseCholeskySolver::new();

        // Second row is twice the first
        let triplets = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(0, 1, 2.0),
            Triplet::new(1, 0, 2.0),
            Triplet::new(1, 1, 4.0),
        ];
        let singular_jacobian = SparseColMat::try_new_from_triplets(2, 2, &triplets)?;
        let residuals = Mat::from_fn(2, 1, |i, _| i as f64);

        let result = solver.solve_normal_equation(&residuals, &singular_jacobian);
        assert!(result.is_err(), "Singular matrix should return Err");
        Ok(())
    }

    #[test]
    fn test_identity_jacobian() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let triplets = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(1, 1, 1.0),
            Triplet::new(2, 2, 1.0),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(3, 3, &triplets)?;
        let residuals = Mat::from_fn(3, 1, |i, _| -((i + 1) as f64));

        let solution = solver.solve_normal_equation(&residuals, &jacobian)?;
        for i in 0..3 {
            assert!((solution[(i, 0)] - (i + 1) as f64).abs() < TOLERANCE);
        }
        Ok(())
    }
}

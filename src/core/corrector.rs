//! Applies a robust loss to a residual block before linearization.
//!
//! The minimizer solves Gauss-Newton style subproblems, which only understand plain squared
//! residuals. The corrector rewrites the residuals `r` and Jacobian `J` of a block with loss ρ
//! so that, to second order, `½||r̃||²` matches `½ρ(||r||²)` around the current point.
//!
//! # Mathematical Formulation
//!
//! With `s = ||r||²` and `[ρ, ρ', ρ'']` the loss evaluated at `s`:
//!
//! ```text
//! α  = 1 − √(1 + 2sρ''/ρ')
//! r̃  = √ρ' / (1 − α) · r
//! J̃  = √ρ' · (J − (α/s) · r rᵀ J)
//! ```
//!
//! When `s = 0` or `ρ'' ≤ 0` the curvature term is dropped and both residuals and Jacobian
//! are scaled by `√ρ'` alone.
//!
//! Buffers use the same row-major layout as cost function Jacobians.
//!
//! Reference: Triggs et al., "Bundle Adjustment — A Modern Synthesis" (1999), section 4.3.

use crate::core::loss_functions::LossFunction;

/// Precomputed scaling factors for one residual block at one point.
#[derive(Debug, Clone)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    /// Evaluate `loss_function` at `sq_norm = ||r||²` and derive the scaling factors.
    pub fn new(loss_function: &dyn LossFunction, sq_norm: f64) -> Self {
        let [_, rho_1, rho_2] = loss_function.evaluate(sq_norm);
        let sqrt_rho1 = rho_1.max(0.0).sqrt();

        // No curvature term unless ρ' and ρ'' are both positive
        if sq_norm == 0.0 || rho_1 <= 0.0 || rho_2 <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        // Root of 0.5·α² − α − (ρ''/ρ')·s = 0 that keeps α < 1
        let d = 1.0 + 2.0 * sq_norm * rho_2 / rho_1;
        let alpha = 1.0 - d.sqrt();

        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    /// Scale `residuals` in place.
    pub fn correct_residuals(&self, residuals: &mut [f64]) {
        residuals
            .iter_mut()
            .for_each(|r| *r *= self.residual_scaling);
    }

    /// Correct a row-major `residuals.len() × num_cols` Jacobian in place.
    ///
    /// `residuals` must be the uncorrected residuals of the block.
    pub fn correct_jacobian(&self, residuals: &[f64], num_cols: usize, jacobian: &mut [f64]) {
        if self.alpha_sq_norm == 0.0 {
            jacobian.iter_mut().for_each(|j| *j *= self.sqrt_rho1);
            return;
        }

        let num_rows = residuals.len();
        for c in 0..num_cols {
            // (rᵀJ)_c
            let r_transpose_j: f64 = (0..num_rows)
                .map(|r| residuals[r] * jacobian[r * num_cols + c])
                .sum();
            for r in 0..num_rows {
                let entry = &mut jacobian[r * num_cols + c];
                *entry = self.sqrt_rho1
                    * (*entry - self.alpha_sq_norm * residuals[r] * r_transpose_j);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss_functions::{CauchyLoss, HuberLoss, TrivialLoss};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn sq_norm(r: &[f64]) -> f64 {
        r.iter().map(|v| v * v).sum()
    }

    #[test]
    fn test_corrector_huber_inlier() -> TestResult {
        let loss = HuberLoss::new(1.0)?;
        let residual = [0.1, 0.2, 0.1];
        let corrector = Corrector::new(&loss, sq_norm(&residual));

        assert!((corrector.sqrt_rho1 - 1.0).abs() < 1e-12);
        assert_eq!(corrector.alpha_sq_norm, 0.0);

        let mut corrected = residual;
        corrector.correct_residuals(&mut corrected);
        assert_eq!(corrected, residual);
        Ok(())
    }

    #[test]
    fn test_corrector_huber_outlier_is_downweighted() -> TestResult {
        let loss = HuberLoss::new(1.0)?;
        let residual = [5.0, 5.0, 5.0];
        let corrector = Corrector::new(&loss, sq_norm(&residual));

        assert!(corrector.sqrt_rho1 > 0.0 && corrector.sqrt_rho1 < 1.0);

        let mut corrected = residual;
        corrector.correct_residuals(&mut corrected);
        assert!(sq_norm(&corrected) < sq_norm(&residual));
        Ok(())
    }

    #[test]
    fn test_trivial_loss_is_identity() {
        let residual = [1.5, -2.0];
        let corrector = Corrector::new(&TrivialLoss, sq_norm(&residual));
        let mut jacobian = [1.0, 2.0, 3.0, 4.0];
        corrector.correct_jacobian(&residual, 2, &mut jacobian);
        assert_eq!(jacobian, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_corrected_gradient_matches_robust_gradient() -> TestResult {
        // Gradient of ½ρ(||r||²) is ρ'·Jᵀr; the corrected system must reproduce it.
        // Cauchy has ρ'' < 0, so this exercises the first-order branch.
        let loss = CauchyLoss::new(1.0)?;
        let residual = [2.0, 3.0];
        let s = sq_norm(&residual);
        let corrector = Corrector::new(&loss, s);
        let [_, rho_1, _] = loss.evaluate(s);

        let jacobian = [1.0, 0.5, -1.0, 2.0];
        let mut corrected_jacobian = jacobian;
        let mut corrected_residual = residual;
        corrector.correct_jacobian(&residual, 2, &mut corrected_jacobian);
        corrector.correct_residuals(&mut corrected_residual);

        for c in 0..2 {
            let robust: f64 =
                rho_1 * (0..2).map(|r| jacobian[r * 2 + c] * residual[r]).sum::<f64>();
            let corrected: f64 = (0..2)
                .map(|r| corrected_jacobian[r * 2 + c] * corrected_residual[r])
                .sum();
            assert!((robust - corrected).abs() < 1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_curvature_correction_applies_with_positive_second_derivative() -> TestResult {
        use crate::core::loss_functions::TolerantLoss;

        // Tolerant loss below its threshold has ρ'' > 0
        let loss = TolerantLoss::new(10.0, 1.0)?;
        let residual = [1.0, 1.0];
        let corrector = Corrector::new(&loss, sq_norm(&residual));
        assert!(corrector.alpha_sq_norm != 0.0);

        let mut jacobian = [1.0, 0.0, 0.0, 1.0];
        corrector.correct_jacobian(&residual, 2, &mut jacobian);
        assert!(jacobian.iter().all(|v| v.is_finite()));
        assert_ne!(jacobian, [1.0, 0.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_flat_loss_zeroes_the_jacobian() {
        use crate::core::loss_functions::CallbackLoss;

        // ρ' = 0 with ρ'' > 0
        let loss = CallbackLoss::new(|_| [1.0, 0.0, 2.0]);
        let residual = [3.0, -4.0];
        let corrector = Corrector::new(&loss, sq_norm(&residual));

        let mut jacobian = [1.0, 2.0, 3.0, 4.0];
        corrector.correct_jacobian(&residual, 2, &mut jacobian);
        assert_eq!(jacobian, [0.0; 4]);

        let mut residuals = residual;
        corrector.correct_residuals(&mut residuals);
        assert_eq!(residuals, [0.0; 2]);
    }
}

//! Levenberg-Marquardt trust-region strategy.
//!
//! Each step solves the regularized normal equations
//!
//! ```text
//! (JᵀJ + D/Δ) h = −Jᵀr
//! ```
//!
//! where `D = clamp(diag(JᵀJ), min_lm_diagonal, max_lm_diagonal)` and `Δ` is the trust-region
//! radius, so a larger radius means less damping. Radius updates follow Nielsen's rule as used
//! by Ceres: on acceptance `Δ /= max(1/3, 1 − (2ρ − 1)³)`, on rejection `Δ /= ν` with `ν`
//! doubling after every consecutive rejection.

use faer::{Mat, sparse::SparseColMat};

use crate::{
    linalg::{LinAlgResult, LinearSolver},
    optimizer::{
        options::SolverOptions,
        trust_region::{TrustRegionStep, TrustRegionStrategy},
    },
};

pub struct LevenbergMarquardtStrategy {
    radius: f64,
    max_radius: f64,
    min_diagonal: f64,
    max_diagonal: f64,
    /// Divides the radius on the next rejection
    decrease_factor: f64,
    /// The Jacobian has not changed since `diagonal` was computed
    reuse_diagonal: bool,
    /// Clamped `diag(JᵀJ)`
    diagonal: Mat<f64>,
}

impl LevenbergMarquardtStrategy {
    pub fn new(options: &SolverOptions) -> Self {
        Self {
            radius: options.initial_trust_region_radius,
            max_radius: options.max_trust_region_radius,
            min_diagonal: options.min_lm_diagonal,
            max_diagonal: options.max_lm_diagonal,
            decrease_factor: 2.0,
            reuse_diagonal: false,
            diagonal: Mat::zeros(0, 1),
        }
    }
}

impl TrustRegionStrategy for LevenbergMarquardtStrategy {
    fn compute_step(
        &mut self,
        linear_solver: &mut dyn LinearSolver,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<TrustRegionStep> {
        let n = jacobian.ncols();
        if !self.reuse_diagonal || self.diagonal.nrows() != n {
            let mut column_norms = vec![0.0; n];
            for t in jacobian.triplet_iter() {
                column_norms[t.col] += t.val * t.val;
            }
            self.diagonal = Mat::from_fn(n, 1, |i, _| {
                column_norms[i].clamp(self.min_diagonal, self.max_diagonal)
            });
        }

        let lm_diagonal = Mat::from_fn(n, 1, |i, _| (self.diagonal[(i, 0)] / self.radius).sqrt());
        let step = linear_solver.solve_augmented_equation(residuals, jacobian, Some(&lm_diagonal))?;
        self.reuse_diagonal = true;

        Ok(TrustRegionStep {
            step,
            diagonal: Some(lm_diagonal),
            linear_solver_iterations: linear_solver.num_iterations(),
        })
    }

    fn step_accepted(&mut self, step_quality: f64) {
        let shrink = (1.0_f64 / 3.0).max(1.0 - (2.0 * step_quality - 1.0).powi(3));
        self.radius = (self.radius / shrink).min(self.max_radius);
        self.decrease_factor = 2.0;
        self.reuse_diagonal = false;
    }

    fn step_rejected(&mut self, _step_quality: f64) {
        self.radius /= self.decrease_factor;
        self.decrease_factor *= 2.0;
        self.reuse_diagonal = true;
    }

    fn step_is_invalid(&mut self) {
        self.step_rejected(0.0);
    }

    fn radius(&self) -> f64 {
        self.radius
    }
}

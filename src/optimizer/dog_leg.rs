//! Dogleg trust-region strategies.
//!
//! Both variants combine the steepest-descent direction `−g` (with `g = Jᵀr`) and a
//! Gauss-Newton step `h_gn`:
//!
//! - **Traditional**: follow the piecewise linear path from the origin through the Cauchy
//!   point `−α g`, `α = ‖g‖² / ‖J g‖²`, to `h_gn`, and stop where it leaves the trust region.
//! - **Subspace**: minimize the quadratic model over the plane spanned by `g` and `h_gn`,
//!   subject to the trust-region constraint. The 2×2 subproblem is solved with nalgebra.
//!
//! The Gauss-Newton step is regularized by `μ · clamp(diag(JᵀJ))`. If the linear solve fails
//! `μ` grows tenfold until it succeeds or reaches its cap. On rejection the radius halves and
//! the cached steps are reused, since the linearization has not changed.

use std::ops::Mul;

use faer::{Mat, sparse::SparseColMat};
use nalgebra::{DMatrix, DVector};

use crate::{
    linalg::{LinAlgResult, LinearSolver, gradient},
    optimizer::{
        dot,
        options::SolverOptions,
        trust_region::{TrustRegionStep, TrustRegionStrategy},
        types::DoglegType,
    },
};

const MIN_MU: f64 = 1e-8;
const MAX_MU: f64 = 1.0;
const MU_INCREASE_FACTOR: f64 = 10.0;
const INCREASE_THRESHOLD: f64 = 0.75;
const DECREASE_THRESHOLD: f64 = 0.25;

/// Model restricted to span{g, h_gn}, in an orthonormal basis of that span.
struct Subspace {
    basis: Vec<Mat<f64>>,
    /// `Bᵀ g`
    gradient: DVector<f64>,
    /// `(J B)ᵀ (J B)`
    hessian: DMatrix<f64>,
}

impl Subspace {
    fn new(
        gradient: &Mat<f64>,
        gauss_newton_step: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> Self {
        let mut basis: Vec<Mat<f64>> = Vec::with_capacity(2);
        for candidate in [gradient, gauss_newton_step] {
            let mut v = candidate.clone();
            for b in &basis {
                let projection = dot(b, &v);
                for i in 0..v.nrows() {
                    v[(i, 0)] -= projection * b[(i, 0)];
                }
            }
            let norm = v.norm_l2();
            if norm > f64::EPSILON * candidate.norm_l2().max(1.0) {
                for i in 0..v.nrows() {
                    v[(i, 0)] /= norm;
                }
                basis.push(v);
            }
        }

        let k = basis.len();
        let jb: Vec<Mat<f64>> = basis.iter().map(|b| jacobian.as_ref().mul(b)).collect();
        let reduced_gradient = DVector::from_fn(k, |i, _| dot(&basis[i], gradient));
        let reduced_hessian = DMatrix::from_fn(k, k, |i, j| dot(&jb[i], &jb[j]));
        Self {
            basis,
            gradient: reduced_gradient,
            hessian: reduced_hessian,
        }
    }

    /// Minimizer of `gᵀy + ½ yᵀHy` over `‖y‖ <= radius`, mapped back to full space.
    fn step(&self, radius: f64) -> Mat<f64> {
        let y = solve_trust_region_subproblem(&self.hessian, &self.gradient, radius);
        let n = self.basis.first().map_or(0, |b| b.nrows());
        let mut step = Mat::zeros(n, 1);
        for (b, coefficient) in self.basis.iter().zip(y.iter()) {
            for i in 0..n {
                step[(i, 0)] += coefficient * b[(i, 0)];
            }
        }
        step
    }
}

/// Solve the small dense trust-region subproblem through the eigen-decomposition of `H`.
///
/// The solution is `y(λ) = −(H + λI)⁻¹ g` for the smallest `λ >= max(0, −λ_min)` with
/// `‖y(λ)‖ <= radius`, found by bisection on `λ`.
fn solve_trust_region_subproblem(
    hessian: &DMatrix<f64>,
    gradient: &DVector<f64>,
    radius: f64,
) -> DVector<f64> {
    let k = gradient.len();
    if k == 0 {
        return DVector::zeros(0);
    }
    let eigen = hessian.clone().symmetric_eigen();
    let rotated_gradient = eigen.eigenvectors.tr_mul(gradient);
    let lambda_min = eigen.eigenvalues.min();

    // ‖y(λ)‖ with infinite norm when a pole carries gradient mass
    let step_in_eigenbasis = |lambda: f64| -> Option<DVector<f64>> {
        let mut y = DVector::zeros(k);
        for i in 0..k {
            let denominator = eigen.eigenvalues[i] + lambda;
            if denominator > 0.0 {
                y[i] = -rotated_gradient[i] / denominator;
            } else if rotated_gradient[i].abs() > f64::EPSILON * gradient.norm() {
                return None;
            }
        }
        Some(y)
    };
    let to_subspace = |y: DVector<f64>| &eigen.eigenvectors * y;

    let lower = (-lambda_min).max(0.0);
    if lambda_min > 0.0
        && let Some(y) = step_in_eigenbasis(0.0)
        && y.norm() <= radius
    {
        return to_subspace(y);
    }

    if let Some(y) = step_in_eigenbasis(lower)
        && y.norm() < radius
    {
        // Hard case: move along the eigenvector of the smallest eigenvalue to the boundary
        let index = eigen.eigenvalues.imin();
        let mut y = y;
        let tau = (radius * radius - y.norm_squared()).max(0.0).sqrt();
        y[index] += if y[index] <= 0.0 { -tau } else { tau };
        return to_subspace(y);
    }

    let mut lo = lower;
    let mut hi = lower + gradient.norm() / radius + hessian.norm();
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        match step_in_eigenbasis(mid) {
            Some(y) if y.norm() <= radius => hi = mid,
            _ => lo = mid,
        }
        if hi - lo <= f64::EPSILON * hi.max(1.0) {
            break;
        }
    }
    match step_in_eigenbasis(hi) {
        Some(y) => to_subspace(y),
        None => DVector::zeros(k),
    }
}

pub struct DoglegStrategy {
    dogleg_type: DoglegType,
    radius: f64,
    max_radius: f64,
    min_diagonal: f64,
    max_diagonal: f64,
    /// Regularization of the Gauss-Newton step
    mu: f64,
    /// The cached steps are still valid for the current linearization
    reuse: bool,
    gradient: Mat<f64>,
    gauss_newton_step: Mat<f64>,
    /// Cauchy step length along `−g`
    alpha: f64,
    /// Regularizer used for the Gauss-Newton step
    diagonal: Mat<f64>,
    subspace: Option<Subspace>,
    dogleg_step_norm: f64,
    linear_solver_iterations: usize,
}

impl DoglegStrategy {
    pub fn new(options: &SolverOptions) -> Self {
        Self {
            dogleg_type: options.dogleg_type,
            radius: options.initial_trust_region_radius,
            max_radius: options.max_trust_region_radius,
            min_diagonal: options.min_lm_diagonal,
            max_diagonal: options.max_lm_diagonal,
            mu: MIN_MU,
            reuse: false,
            gradient: Mat::zeros(0, 1),
            gauss_newton_step: Mat::zeros(0, 1),
            alpha: 0.0,
            diagonal: Mat::zeros(0, 1),
            subspace: None,
            dogleg_step_norm: 0.0,
            linear_solver_iterations: 0,
        }
    }

    /// Solve for the Gauss-Newton step, raising `μ` until the solve succeeds.
    fn compute_gauss_newton_step(
        &mut self,
        linear_solver: &mut dyn LinearSolver,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<()> {
        let n = jacobian.ncols();
        let mut column_norms = vec![0.0; n];
        for t in jacobian.triplet_iter() {
            column_norms[t.col] += t.val * t.val;
        }
        for value in &mut column_norms {
            *value = value.clamp(self.min_diagonal, self.max_diagonal);
        }

        loop {
            self.diagonal = Mat::from_fn(n, 1, |i, _| (self.mu * column_norms[i]).sqrt());
            match linear_solver.solve_augmented_equation(residuals, jacobian, Some(&self.diagonal))
            {
                Ok(step) => {
                    self.gauss_newton_step = step;
                    self.linear_solver_iterations = linear_solver.num_iterations();
                    return Ok(());
                }
                Err(e) if self.mu >= MAX_MU => return Err(e),
                Err(_) => self.mu = (self.mu * MU_INCREASE_FACTOR).min(MAX_MU),
            }
        }
    }

    fn traditional_step(&self) -> Mat<f64> {
        let n = self.gradient.nrows();
        let gauss_newton_norm = self.gauss_newton_step.norm_l2();
        if gauss_newton_norm <= self.radius {
            return self.gauss_newton_step.clone();
        }

        let gradient_norm = self.gradient.norm_l2();
        if gradient_norm == 0.0 {
            let scale = self.radius / gauss_newton_norm;
            return Mat::from_fn(n, 1, |i, _| scale * self.gauss_newton_step[(i, 0)]);
        }

        // Cauchy point outside the region: scaled steepest descent
        if self.alpha * gradient_norm >= self.radius {
            let scale = -self.radius / gradient_norm;
            return Mat::from_fn(n, 1, |i, _| scale * self.gradient[(i, 0)]);
        }

        // ‖p_c + β (h_gn − p_c)‖ = radius
        let cauchy_point = Mat::from_fn(n, 1, |i, _| -self.alpha * self.gradient[(i, 0)]);
        let v = Mat::from_fn(n, 1, |i, _| self.gauss_newton_step[(i, 0)] - cauchy_point[(i, 0)]);
        let a = dot(&v, &v);
        let b = dot(&cauchy_point, &v);
        let c = dot(&cauchy_point, &cauchy_point) - self.radius * self.radius;
        let d_squared = b * b - a * c;
        let beta = if d_squared < 0.0 || a.abs() < 1e-15 {
            1.0
        } else {
            let d = d_squared.sqrt();
            if b <= 0.0 { (-b + d) / a } else { -c / (b + d) }
        }
        .clamp(0.0, 1.0);

        Mat::from_fn(n, 1, |i, _| cauchy_point[(i, 0)] + beta * v[(i, 0)])
    }
}

impl TrustRegionStrategy for DoglegStrategy {
    fn compute_step(
        &mut self,
        linear_solver: &mut dyn LinearSolver,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<TrustRegionStep> {
        if !self.reuse || self.gradient.nrows() != jacobian.ncols() {
            self.gradient = gradient(residuals, jacobian);
            let jg = jacobian.as_ref().mul(&self.gradient);
            let jg_norm_squared = dot(&jg, &jg);
            self.alpha = if jg_norm_squared > 0.0 {
                dot(&self.gradient, &self.gradient) / jg_norm_squared
            } else {
                0.0
            };
            self.compute_gauss_newton_step(linear_solver, residuals, jacobian)?;
            self.subspace = match self.dogleg_type {
                DoglegType::SubspaceDogleg => Some(Subspace::new(
                    &self.gradient,
                    &self.gauss_newton_step,
                    jacobian,
                )),
                DoglegType::TraditionalDogleg => None,
            };
        }

        let step = match &self.subspace {
            Some(subspace) => subspace.step(self.radius),
            None => self.traditional_step(),
        };
        self.dogleg_step_norm = step.norm_l2();

        Ok(TrustRegionStep {
            step,
            diagonal: Some(self.diagonal.clone()),
            linear_solver_iterations: self.linear_solver_iterations,
        })
    }

    fn step_accepted(&mut self, step_quality: f64) {
        if step_quality > INCREASE_THRESHOLD {
            self.radius = self
                .radius
                .max(3.0 * self.dogleg_step_norm)
                .min(self.max_radius);
        }
        if step_quality < DECREASE_THRESHOLD {
            self.radius *= 0.5;
        }
        self.mu = (2.0 * self.mu / MU_INCREASE_FACTOR).max(MIN_MU);
        self.reuse = false;
    }

    fn step_rejected(&mut self, _step_quality: f64) {
        self.radius *= 0.5;
        self.reuse = true;
    }

    fn step_is_invalid(&mut self) {
        self.mu = (self.mu * MU_INCREASE_FACTOR).min(MAX_MU);
        self.radius *= 0.5;
        self.reuse = false;
    }

    fn radius(&self) -> f64 {
        self.radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{
        SparseCholeskySolver,
        test_support::{overdetermined_system, reference_step},
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn strategy(dogleg_type: DoglegType, radius: f64) -> DoglegStrategy {
        let mut options = SolverOptions::default().with_dogleg_type(dogleg_type);
        options.set_initial_trust_region_radius(radius);
        DoglegStrategy::new(&options)
    }

    /// `gᵀh + ½ ‖J h‖²`
    fn model_value(
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
        step: &Mat<f64>,
    ) -> f64 {
        let g = gradient(residuals, jacobian);
        let jh = jacobian.as_ref().mul(step);
        dot(&g, step) + 0.5 * dot(&jh, &jh)
    }

    #[test]
    fn test_large_radius_takes_gauss_newton_step() -> TestResult {
        let (jacobian, residuals) = overdetermined_system()?;
        for dogleg_type in [DoglegType::TraditionalDogleg, DoglegType::SubspaceDogleg] {
            let mut strategy = strategy(dogleg_type, 1e6);
            let mut solver = SparseCholeskySolver::new();
            let step = strategy.compute_step(&mut solver, &residuals, &jacobian)?;
            let expected = reference_step(&jacobian, &residuals, None);
            for (i, value) in expected.iter().enumerate() {
                assert!((step.step[(i, 0)] - value).abs() < 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn test_small_radius_stays_on_boundary() -> TestResult {
        let (jacobian, residuals) = overdetermined_system()?;
        for dogleg_type in [DoglegType::TraditionalDogleg, DoglegType::SubspaceDogleg] {
            let mut strategy = strategy(dogleg_type, 0.05);
            let mut solver = SparseCholeskySolver::new();
            let step = strategy.compute_step(&mut solver, &residuals, &jacobian)?;
            assert!((step.step.norm_l2() - 0.05).abs() < 1e-8);
            assert!(model_value(&jacobian, &residuals, &step.step) < 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_subspace_model_is_no_worse_than_traditional() -> TestResult {
        let (jacobian, residuals) = overdetermined_system()?;
        let mut solver = SparseCholeskySolver::new();
        let traditional = strategy(DoglegType::TraditionalDogleg, 0.5)
            .compute_step(&mut solver, &residuals, &jacobian)?;
        let subspace = strategy(DoglegType::SubspaceDogleg, 0.5)
            .compute_step(&mut solver, &residuals, &jacobian)?;

        let traditional_value = model_value(&jacobian, &residuals, &traditional.step);
        let subspace_value = model_value(&jacobian, &residuals, &subspace.step);
        assert!(subspace_value <= traditional_value + 1e-9);
        assert!(subspace.step.norm_l2() <= 0.5 + 1e-8);
        Ok(())
    }

    #[test]
    fn test_radius_updates() -> TestResult {
        let (jacobian, residuals) = overdetermined_system()?;
        let mut strategy = strategy(DoglegType::TraditionalDogleg, 0.1);
        let mut solver = SparseCholeskySolver::new();
        strategy.compute_step(&mut solver, &residuals, &jacobian)?;

        // Good step on the boundary: radius grows to 3‖step‖
        strategy.step_accepted(0.9);
        assert!((strategy.radius() - 0.3).abs() < 1e-8);

        strategy.step_rejected(0.0);
        assert!((strategy.radius() - 0.15).abs() < 1e-8);
        assert!(strategy.reuse);

        strategy.step_accepted(0.1);
        assert!((strategy.radius() - 0.075).abs() < 1e-8);
        assert!(!strategy.reuse);
        Ok(())
    }

    #[test]
    fn test_subproblem_interior_solution() {
        let hessian = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]);
        let gradient = DVector::from_vec(vec![-2.0, -4.0]);
        let y = solve_trust_region_subproblem(&hessian, &gradient, 10.0);
        assert!((y[0] - 1.0).abs() < 1e-12);
        assert!((y[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_subproblem_indefinite_hessian_hits_boundary() {
        let hessian = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        let gradient = DVector::from_vec(vec![1.0, 1.0]);
        let y = solve_trust_region_subproblem(&hessian, &gradient, 2.0);
        assert!((y.norm() - 2.0).abs() < 1e-8);
        let model = gradient.dot(&y) + 0.5 * (y.transpose() * &hessian * &y)[(0, 0)];
        assert!(model < 0.0);
    }
}

//! Line-search minimizer.
//!
//! Each iteration picks a descent direction `d` from the gradient history and searches along
//! it for a step size `α` satisfying either the Armijo (sufficient decrease) or the strong Wolfe
//! conditions on `φ(α) = cost(x ⊞ α d)`. Trial step sizes minimize a polynomial interpolating
//! the samples of `φ` seen so far, clamped to the contraction (or expansion) bounds.
//!
//! A direction that is not a descent direction, or along which the search fails, restarts the
//! direction with steepest descent. At most `max_num_line_search_direction_restarts` restarts
//! are allowed per solve.

use std::collections::VecDeque;

use faer::Mat;
use nalgebra::{DMatrix, DVector};
use tracing::debug;
use web_time::Instant;

use crate::{
    core::{
        CoreResult,
        evaluator::{Evaluator, Linearization},
    },
    optimizer::{
        Minimizer, OptimizerResult, axpy, dot,
        options::SolverOptions,
        summary::{IterationSummary, SolverSummary},
        trust_region::{evaluation_failure_message, record_iteration},
        types::{
            LineSearchDirectionType, LineSearchInterpolationType, LineSearchType,
            NonlinearConjugateGradientType, TerminationType,
        },
    },
};

/// Curvature pairs with `sᵀy` at or below this do not update a quasi-Newton approximation
const SECANT_CONDITION_TOLERANCE: f64 = 1e-14;

/// Interpolated zoom steps stay this fraction of the bracket width away from its ends
const ZOOM_SAFEGUARD: f64 = 0.1;

fn negated(v: &Mat<f64>) -> Mat<f64> {
    Mat::from_fn(v.nrows(), 1, |i, _| -v[(i, 0)])
}

fn to_dvector(v: &Mat<f64>) -> DVector<f64> {
    DVector::from_fn(v.nrows(), |i, _| v[(i, 0)])
}

fn to_mat(v: &DVector<f64>) -> Mat<f64> {
    Mat::from_fn(v.len(), 1, |i, _| v[i])
}

/// Point and gradient of one iterate.
struct Iterate {
    position: Mat<f64>,
    gradient: Mat<f64>,
}

/// Search direction policy.
trait SearchDirection: Send {
    /// Direction at `current`, given the iterate the last step started from and its direction.
    ///
    /// `None` when the policy cannot produce a direction; the minimizer then restarts.
    fn next_direction(
        &mut self,
        previous: &Iterate,
        previous_direction: &Mat<f64>,
        current: &Iterate,
    ) -> Option<Mat<f64>>;

    /// Forget accumulated curvature information.
    fn restart(&mut self) {}
}

struct SteepestDescent;

impl SearchDirection for SteepestDescent {
    fn next_direction(&mut self, _: &Iterate, _: &Mat<f64>, current: &Iterate) -> Option<Mat<f64>> {
        Some(negated(&current.gradient))
    }
}

struct NonlinearConjugateGradient {
    kind: NonlinearConjugateGradientType,
    function_tolerance: f64,
}

impl SearchDirection for NonlinearConjugateGradient {
    fn next_direction(
        &mut self,
        previous: &Iterate,
        previous_direction: &Mat<f64>,
        current: &Iterate,
    ) -> Option<Mat<f64>> {
        let gradient = &current.gradient;
        let gradient_change = gradient - &previous.gradient;
        let previous_norm_squared = dot(&previous.gradient, &previous.gradient);
        let beta = match self.kind {
            NonlinearConjugateGradientType::FletcherReeves => {
                dot(gradient, gradient) / previous_norm_squared
            }
            NonlinearConjugateGradientType::PolakRibiere => {
                dot(gradient, &gradient_change) / previous_norm_squared
            }
            NonlinearConjugateGradientType::HestenesStiefel => {
                dot(gradient, &gradient_change) / dot(previous_direction, &gradient_change)
            }
        };

        let mut direction = negated(gradient);
        if beta.is_finite() {
            axpy(&mut direction, beta, previous_direction);
        }
        let directional_derivative = dot(gradient, &direction);
        if directional_derivative.is_nan() || directional_derivative >= -self.function_tolerance {
            debug!("Nonlinear conjugate gradient lost descent, falling back to -gradient");
            return Some(negated(gradient));
        }
        Some(direction)
    }
}

/// One `(s, y)` curvature pair
struct Correction {
    position_change: Mat<f64>,
    gradient_change: Mat<f64>,
    rho: f64,
}

/// Limited-memory BFGS with the two-loop recursion.
struct Lbfgs {
    max_rank: usize,
    use_approximate_eigenvalue_scaling: bool,
    corrections: VecDeque<Correction>,
    /// `sᵀy / yᵀy` of the newest pair
    approximate_eigenvalue_scale: f64,
}

impl Lbfgs {
    fn new(max_rank: usize, use_approximate_eigenvalue_scaling: bool) -> Self {
        Self {
            max_rank,
            use_approximate_eigenvalue_scaling,
            corrections: VecDeque::with_capacity(max_rank),
            approximate_eigenvalue_scale: 1.0,
        }
    }

    fn update(&mut self, position_change: Mat<f64>, gradient_change: Mat<f64>) {
        let curvature = dot(&position_change, &gradient_change);
        if curvature <= SECANT_CONDITION_TOLERANCE || self.max_rank == 0 {
            return;
        }
        while self.corrections.len() >= self.max_rank {
            self.corrections.pop_front();
        }
        self.approximate_eigenvalue_scale = curvature / dot(&gradient_change, &gradient_change);
        self.corrections.push_back(Correction {
            position_change,
            gradient_change,
            rho: 1.0 / curvature,
        });
    }

    /// `H g` for the implicit inverse Hessian approximation `H`.
    fn apply_inverse_hessian(&self, gradient: &Mat<f64>) -> Mat<f64> {
        let mut q = gradient.clone();
        let mut alphas = vec![0.0; self.corrections.len()];
        for (i, correction) in self.corrections.iter().enumerate().rev() {
            alphas[i] = correction.rho * dot(&correction.position_change, &q);
            axpy(&mut q, -alphas[i], &correction.gradient_change);
        }
        if self.use_approximate_eigenvalue_scaling {
            for i in 0..q.nrows() {
                q[(i, 0)] *= self.approximate_eigenvalue_scale;
            }
        }
        for (i, correction) in self.corrections.iter().enumerate() {
            let beta = correction.rho * dot(&correction.gradient_change, &q);
            axpy(&mut q, alphas[i] - beta, &correction.position_change);
        }
        q
    }
}

impl SearchDirection for Lbfgs {
    fn next_direction(
        &mut self,
        previous: &Iterate,
        _: &Mat<f64>,
        current: &Iterate,
    ) -> Option<Mat<f64>> {
        self.update(
            &current.position - &previous.position,
            &current.gradient - &previous.gradient,
        );
        Some(negated(&self.apply_inverse_hessian(&current.gradient)))
    }

    fn restart(&mut self) {
        self.corrections.clear();
        self.approximate_eigenvalue_scale = 1.0;
    }
}

/// Dense BFGS on the inverse Hessian approximation.
struct Bfgs {
    inverse_hessian: DMatrix<f64>,
    use_approximate_eigenvalue_scaling: bool,
    /// No curvature pair has been applied since the last restart
    is_initial: bool,
}

impl Bfgs {
    fn new(use_approximate_eigenvalue_scaling: bool) -> Self {
        Self {
            inverse_hessian: DMatrix::zeros(0, 0),
            use_approximate_eigenvalue_scaling,
            is_initial: true,
        }
    }

    /// `H⁺ = (I − ρ s yᵀ) H (I − ρ y sᵀ) + ρ s sᵀ`, skipped unless `sᵀy > 0`.
    fn update(&mut self, s: &DVector<f64>, y: &DVector<f64>) {
        let n = s.len();
        if self.inverse_hessian.nrows() != n {
            self.inverse_hessian = DMatrix::identity(n, n);
            self.is_initial = true;
        }
        let curvature = s.dot(y);
        if curvature <= SECANT_CONDITION_TOLERANCE {
            return;
        }
        if self.is_initial && self.use_approximate_eigenvalue_scaling {
            self.inverse_hessian = DMatrix::identity(n, n) * (curvature / y.dot(y));
        }
        self.is_initial = false;

        let rho = 1.0 / curvature;
        let hy = &self.inverse_hessian * y;
        let yhy = y.dot(&hy);
        self.inverse_hessian -= (&hy * s.transpose() + s * hy.transpose()) * rho;
        self.inverse_hessian += (s * s.transpose()) * (rho * rho * yhy + rho);
    }
}

impl SearchDirection for Bfgs {
    fn next_direction(
        &mut self,
        previous: &Iterate,
        _: &Mat<f64>,
        current: &Iterate,
    ) -> Option<Mat<f64>> {
        let s = to_dvector(&(&current.position - &previous.position));
        let y = to_dvector(&(&current.gradient - &previous.gradient));
        self.update(&s, &y);
        let direction = -(&self.inverse_hessian * to_dvector(&current.gradient));
        direction.iter().all(|v| v.is_finite()).then(|| to_mat(&direction))
    }

    fn restart(&mut self) {
        self.inverse_hessian = DMatrix::zeros(0, 0);
        self.is_initial = true;
    }
}

fn create_search_direction(options: &SolverOptions) -> Box<dyn SearchDirection> {
    match options.line_search_direction_type {
        LineSearchDirectionType::SteepestDescent => Box::new(SteepestDescent),
        LineSearchDirectionType::NonlinearConjugateGradient => {
            Box::new(NonlinearConjugateGradient {
                kind: options.nonlinear_conjugate_gradient_type,
                function_tolerance: options.function_tolerance,
            })
        }
        LineSearchDirectionType::Lbfgs => Box::new(Lbfgs::new(
            options.max_lbfgs_rank,
            options.use_approximate_eigenvalue_bfgs_scaling,
        )),
        LineSearchDirectionType::Bfgs => {
            Box::new(Bfgs::new(options.use_approximate_eigenvalue_bfgs_scaling))
        }
    }
}

/// A sample of `φ(α)`; `value` is infinite where the cost could not be evaluated.
#[derive(Debug, Clone, Copy)]
struct FunctionSample {
    step_size: f64,
    value: f64,
    derivative: Option<f64>,
}

impl FunctionSample {
    fn is_valid(&self) -> bool {
        self.value.is_finite()
    }
}

/// Coefficients, lowest degree first, of the polynomial of degree at most `max_degree`
/// matching the values and derivatives of `samples`, taken in order.
fn interpolating_polynomial(samples: &[FunctionSample], max_degree: usize) -> Option<Vec<f64>> {
    // (step size, is a derivative, target)
    let mut constraints = Vec::new();
    for sample in samples {
        if sample.is_valid() {
            constraints.push((sample.step_size, false, sample.value));
        }
        if let Some(derivative) = sample.derivative
            && derivative.is_finite()
        {
            constraints.push((sample.step_size, true, derivative));
        }
    }
    constraints.truncate(max_degree + 1);
    let n = constraints.len();
    if n < 2 {
        return None;
    }

    let matrix = DMatrix::from_fn(n, n, |row, k| {
        let (x, is_derivative, _) = constraints[row];
        match (is_derivative, k) {
            (false, _) => x.powi(k as i32),
            (true, 0) => 0.0,
            (true, _) => k as f64 * x.powi(k as i32 - 1),
        }
    });
    let targets = DVector::from_fn(n, |row, _| constraints[row].2);
    let coefficients = matrix.lu().solve(&targets)?;
    coefficients
        .iter()
        .all(|c| c.is_finite())
        .then(|| coefficients.iter().copied().collect())
}

/// Minimizer over `[lower, upper]` of the polynomial with `coefficients` (lowest degree first,
/// at most cubic).
fn minimize_polynomial(coefficients: &[f64], lower: f64, upper: f64) -> f64 {
    let value = |x: f64| coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c);
    let mut candidates = vec![lower, upper];
    match *coefficients {
        [_, b, c] if c != 0.0 => candidates.push(-b / (2.0 * c)),
        [_, c1, c2, c3] => {
            // Roots of 3 c3 x² + 2 c2 x + c1
            let (a, b, c) = (3.0 * c3, 2.0 * c2, c1);
            if a == 0.0 {
                if b != 0.0 {
                    candidates.push(-c / b);
                }
            } else {
                let discriminant = b * b - 4.0 * a * c;
                if discriminant >= 0.0 {
                    let root = discriminant.sqrt();
                    candidates.push((-b + root) / (2.0 * a));
                    candidates.push((-b - root) / (2.0 * a));
                }
            }
        }
        _ => {}
    }
    candidates
        .into_iter()
        .filter(|x| x.is_finite() && (lower..=upper).contains(x))
        .min_by(|a, b| value(*a).total_cmp(&value(*b)))
        .unwrap_or(lower)
}

/// Step size minimizing the interpolation of `samples` over `[lower, upper]`.
///
/// `None` for bisection, or when the samples determine no polynomial.
fn interpolated_step_size(
    interpolation: LineSearchInterpolationType,
    samples: &[FunctionSample],
    lower: f64,
    upper: f64,
) -> Option<f64> {
    let max_degree = match interpolation {
        LineSearchInterpolationType::Bisection => return None,
        LineSearchInterpolationType::Quadratic => 2,
        LineSearchInterpolationType::Cubic => 3,
    };
    let coefficients = interpolating_polynomial(samples, max_degree)?;
    Some(minimize_polynomial(&coefficients, lower, upper))
}

/// `φ` along one search direction.
struct LineSearchFunction<'s, 'e> {
    evaluator: &'s mut Evaluator<'e>,
    position: &'s Mat<f64>,
    direction: &'s Mat<f64>,
    num_evaluations: usize,
    /// Step size, point and linearization of the last evaluation with a derivative
    last_linearization: Option<(f64, Mat<f64>, Linearization)>,
}

impl<'s, 'e> LineSearchFunction<'s, 'e> {
    fn new(
        evaluator: &'s mut Evaluator<'e>,
        position: &'s Mat<f64>,
        direction: &'s Mat<f64>,
    ) -> Self {
        Self {
            evaluator,
            position,
            direction,
            num_evaluations: 0,
            last_linearization: None,
        }
    }

    fn point(&self, step_size: f64) -> Mat<f64> {
        let delta = Mat::from_fn(self.direction.nrows(), 1, |i, _| {
            step_size * self.direction[(i, 0)]
        });
        self.evaluator.plus(self.position, &delta)
    }

    fn evaluate(&mut self, step_size: f64, with_derivative: bool) -> CoreResult<FunctionSample> {
        self.num_evaluations += 1;
        let point = self.point(step_size);
        if !with_derivative {
            let value = self.evaluator.cost(&point).unwrap_or(f64::INFINITY);
            return Ok(FunctionSample {
                step_size,
                value,
                derivative: None,
            });
        }

        let Some(linearization) = self.evaluator.linearize(&point)? else {
            return Ok(FunctionSample {
                step_size,
                value: f64::INFINITY,
                derivative: None,
            });
        };
        let sample = FunctionSample {
            step_size,
            value: linearization.cost,
            derivative: Some(dot(&linearization.gradient, self.direction)),
        };
        self.last_linearization = Some((step_size, point, linearization));
        Ok(sample)
    }
}

enum LineSearchOutcome {
    Found(FunctionSample),
    Failed(String),
}

/// Armijo and curvature conditions relative to `φ(0)` and `φ'(0)`.
struct Conditions {
    initial: FunctionSample,
    initial_derivative: f64,
    sufficient_decrease: f64,
    sufficient_curvature: f64,
}

impl Conditions {
    fn new(initial: FunctionSample, options: &SolverOptions) -> Self {
        Self {
            initial,
            initial_derivative: initial.derivative.unwrap_or(0.0),
            sufficient_decrease: options.line_search_sufficient_function_decrease,
            sufficient_curvature: options.line_search_sufficient_curvature_decrease,
        }
    }

    fn armijo(&self, sample: &FunctionSample) -> bool {
        sample.is_valid()
            && sample.value
                <= self.initial.value
                    + self.sufficient_decrease * sample.step_size * self.initial_derivative
    }

    fn curvature(&self, sample: &FunctionSample) -> bool {
        sample
            .derivative
            .is_some_and(|d| d.abs() <= -self.sufficient_curvature * self.initial_derivative)
    }
}

/// Backtracking until the Armijo condition holds.
fn armijo_search(
    function: &mut LineSearchFunction<'_, '_>,
    options: &SolverOptions,
    conditions: &Conditions,
    initial_step_size: f64,
) -> CoreResult<LineSearchOutcome> {
    let mut previous: Option<FunctionSample> = None;
    let mut current = function.evaluate(initial_step_size, false)?;
    let mut num_iterations = 1;

    while !conditions.armijo(&current) {
        if num_iterations >= options.max_num_line_search_step_size_iterations {
            return Ok(LineSearchOutcome::Failed(format!(
                "Armijo line search did not find a sufficient decrease in {num_iterations} \
                 step size iterations"
            )));
        }
        let lower = options.max_line_search_step_contraction * current.step_size;
        let upper = options.min_line_search_step_contraction * current.step_size;
        let mut samples = vec![conditions.initial, current];
        if let Some(previous) = previous
            && previous.is_valid()
        {
            samples.push(previous);
        }
        let step_size = current
            .is_valid()
            .then(|| {
                interpolated_step_size(
                    options.line_search_interpolation_type,
                    &samples,
                    lower,
                    upper,
                )
            })
            .flatten()
            .unwrap_or_else(|| (0.5 * current.step_size).clamp(lower, upper));
        if step_size < options.min_line_search_step_size {
            return Ok(LineSearchOutcome::Failed(format!(
                "Step size {:e} fell below min_line_search_step_size {:e}",
                step_size, options.min_line_search_step_size
            )));
        }

        previous = Some(current);
        current = function.evaluate(step_size, false)?;
        num_iterations += 1;
    }
    Ok(LineSearchOutcome::Found(current))
}

/// Bracketing and zoom until the strong Wolfe conditions hold.
fn wolfe_search(
    function: &mut LineSearchFunction<'_, '_>,
    options: &SolverOptions,
    conditions: &Conditions,
    initial_step_size: f64,
) -> CoreResult<LineSearchOutcome> {
    let max_iterations = options.max_num_line_search_step_size_iterations;
    let mut previous = conditions.initial;
    let mut step_size = initial_step_size;
    let mut num_iterations = 0;

    let (low, high) = loop {
        if num_iterations >= max_iterations {
            return Ok(LineSearchOutcome::Failed(format!(
                "Wolfe line search did not bracket an acceptable step in {num_iterations} \
                 step size iterations"
            )));
        }
        num_iterations += 1;
        let current = function.evaluate(step_size, true)?;

        if !current.is_valid() {
            // Contract towards the last valid sample
            step_size = previous.step_size + 0.5 * (current.step_size - previous.step_size);
            if step_size - previous.step_size < options.min_line_search_step_size {
                return Ok(LineSearchOutcome::Failed(format!(
                    "Cost could not be evaluated at step sizes above {:e}",
                    previous.step_size
                )));
            }
            continue;
        }
        if !conditions.armijo(&current)
            || (previous.step_size > 0.0 && current.value >= previous.value)
        {
            break (previous, current);
        }
        if conditions.curvature(&current) {
            return Ok(LineSearchOutcome::Found(current));
        }
        if current.derivative.is_some_and(|d| d >= 0.0) {
            break (current, previous);
        }

        let lower = current.step_size;
        let upper = options.max_line_search_step_expansion * current.step_size;
        step_size = interpolated_step_size(
            options.line_search_interpolation_type,
            &[previous, current],
            lower,
            upper,
        )
        .unwrap_or(upper);
        previous = current;
    };

    zoom(function, options, conditions, low, high, max_iterations - num_iterations)
}

/// Shrink `[low, high]` until a step satisfies the strong Wolfe conditions.
///
/// `low` satisfies the Armijo condition and has the lowest value seen inside the bracket; it
/// is returned if the iterations run out.
fn zoom(
    function: &mut LineSearchFunction<'_, '_>,
    options: &SolverOptions,
    conditions: &Conditions,
    mut low: FunctionSample,
    mut high: FunctionSample,
    max_iterations: usize,
) -> CoreResult<LineSearchOutcome> {
    for _ in 0..max_iterations {
        let width = (high.step_size - low.step_size).abs();
        if width < options.min_line_search_step_size {
            break;
        }
        let lower = low.step_size.min(high.step_size);
        let upper = low.step_size.max(high.step_size);
        let margin = ZOOM_SAFEGUARD * width;
        let step_size = interpolated_step_size(
            options.line_search_interpolation_type,
            &[low, high],
            lower + margin,
            upper - margin,
        )
        .unwrap_or(0.5 * (lower + upper));

        let current = function.evaluate(step_size, true)?;
        if !conditions.armijo(&current) || current.value >= low.value {
            high = current;
            continue;
        }
        if conditions.curvature(&current) {
            return Ok(LineSearchOutcome::Found(current));
        }
        if current
            .derivative
            .is_some_and(|d| d * (high.step_size - low.step_size) >= 0.0)
        {
            high = low;
        }
        low = current;
    }

    if low.step_size > 0.0 {
        debug!("Zoom ended without the curvature condition, taking step size {:e}", low.step_size);
        Ok(LineSearchOutcome::Found(low))
    } else {
        Ok(LineSearchOutcome::Failed(
            "Wolfe zoom did not find a step with sufficient decrease".to_string(),
        ))
    }
}

pub struct LineSearchMinimizer {
    direction: Box<dyn SearchDirection>,
}

impl LineSearchMinimizer {
    pub fn new(options: &SolverOptions) -> Self {
        Self {
            direction: create_search_direction(options),
        }
    }
}

impl Minimizer for LineSearchMinimizer {
    fn minimize(
        &mut self,
        evaluator: &mut Evaluator<'_>,
        options: &SolverOptions,
        summary: &mut SolverSummary,
    ) -> OptimizerResult<()> {
        let solve_start = Instant::now();
        let fixed_cost = summary.fixed_cost;

        let mut position = evaluator.parameters();
        evaluator.project(&mut position);
        let iteration_start = Instant::now();
        let Some(linearization) = evaluator.linearize(&position)? else {
            summary.terminate(
                TerminationType::Failure,
                evaluation_failure_message(evaluator, "at the initial point"),
            );
            return Ok(());
        };

        let mut cost = linearization.cost;
        let mut current = Iterate {
            position,
            gradient: linearization.gradient,
        };
        summary.initial_cost = cost + fixed_cost;
        summary.final_cost = summary.initial_cost;
        let mut gradient_max_norm =
            evaluator.projected_gradient_max_norm(&current.position, &current.gradient);

        IterationSummary::print_header(options);
        record_iteration(
            summary,
            options,
            IterationSummary {
                iteration: 0,
                cost: cost + fixed_cost,
                gradient_max_norm,
                gradient_norm: current.gradient.norm_l2(),
                step_is_valid: true,
                step_is_successful: true,
                ..IterationSummary::default()
            },
            iteration_start,
            solve_start,
        );

        let is_quasi_newton = matches!(
            options.line_search_direction_type,
            LineSearchDirectionType::Lbfgs | LineSearchDirectionType::Bfgs
        );
        // Iterate the last step started from, with its direction
        let mut previous: Option<(Iterate, Mat<f64>)> = None;
        let mut last_cost_change = 0.0;
        let mut num_restarts = 0;
        let mut iteration = 0;

        let (termination_type, message) = loop {
            if gradient_max_norm <= options.gradient_tolerance {
                break (
                    TerminationType::Convergence,
                    format!(
                        "Gradient tolerance reached. Gradient max norm: {:e} <= {:e}",
                        gradient_max_norm, options.gradient_tolerance
                    ),
                );
            }
            if iteration >= options.max_num_iterations {
                break (
                    TerminationType::NoConvergence,
                    format!(
                        "Maximum number of iterations reached. Number of iterations: {iteration}."
                    ),
                );
            }
            let elapsed = solve_start.elapsed().as_secs_f64();
            if elapsed >= options.max_solver_time_in_seconds {
                break (
                    TerminationType::NoConvergence,
                    format!(
                        "Maximum solver time reached. Total solver time: {:e} >= {:e}.",
                        elapsed, options.max_solver_time_in_seconds
                    ),
                );
            }

            iteration += 1;
            let iteration_start = Instant::now();
            let mut record = IterationSummary {
                iteration,
                cost: cost + fixed_cost,
                gradient_max_norm,
                gradient_norm: current.gradient.norm_l2(),
                ..IterationSummary::default()
            };

            let direction = previous
                .as_ref()
                .and_then(|(iterate, direction)| {
                    self.direction.next_direction(iterate, direction, &current)
                })
                .filter(|direction| dot(&current.gradient, direction) < 0.0);
            let restarted = previous.is_some() && direction.is_none();
            if restarted {
                num_restarts += 1;
                if num_restarts > options.max_num_line_search_direction_restarts {
                    summary.num_unsuccessful_steps += 1;
                    record_iteration(summary, options, record, iteration_start, solve_start);
                    break (
                        TerminationType::Failure,
                        format!(
                            "Line search direction failure: no descent direction after {} \
                             restarts",
                            options.max_num_line_search_direction_restarts
                        ),
                    );
                }
                debug!("Restarting the {} direction", options.line_search_direction_type);
                self.direction.restart();
            }
            let search_direction =
                direction.unwrap_or_else(|| negated(&current.gradient));
            let directional_derivative = dot(&current.gradient, &search_direction);

            let initial_step_size = if previous.is_none() || restarted {
                (1.0 / gradient_max_norm).min(1.0)
            } else if is_quasi_newton {
                1.0
            } else {
                (2.0 * last_cost_change / -directional_derivative).min(1.0)
            }
            .max(options.min_line_search_step_size);

            let conditions = Conditions::new(
                FunctionSample {
                    step_size: 0.0,
                    value: cost,
                    derivative: Some(directional_derivative),
                },
                options,
            );
            let mut function =
                LineSearchFunction::new(evaluator, &current.position, &search_direction);
            let outcome = match options.line_search_type {
                LineSearchType::Armijo => {
                    armijo_search(&mut function, options, &conditions, initial_step_size)?
                }
                LineSearchType::Wolfe => {
                    wolfe_search(&mut function, options, &conditions, initial_step_size)?
                }
            };
            let num_evaluations = function.num_evaluations;
            let last_linearization = function.last_linearization.take();
            record.line_search_function_evaluations = num_evaluations;
            summary.num_line_search_steps += num_evaluations;

            let sample = match outcome {
                LineSearchOutcome::Found(sample) => sample,
                LineSearchOutcome::Failed(reason) => {
                    summary.num_unsuccessful_steps += 1;
                    num_restarts += 1;
                    if num_restarts > options.max_num_line_search_direction_restarts {
                        record_iteration(summary, options, record, iteration_start, solve_start);
                        break (
                            TerminationType::Failure,
                            format!("Line search failed: {reason}"),
                        );
                    }
                    debug!("Line search failed, restarting the direction: {reason}");
                    self.direction.restart();
                    previous = None;
                    record_iteration(summary, options, record, iteration_start, solve_start);
                    continue;
                }
            };

            let (new_position, linearization) = match last_linearization {
                Some((step_size, point, linearization)) if step_size == sample.step_size => {
                    (point, linearization)
                }
                _ => {
                    let delta = Mat::from_fn(search_direction.nrows(), 1, |i, _| {
                        sample.step_size * search_direction[(i, 0)]
                    });
                    let point = evaluator.plus(&current.position, &delta);
                    match evaluator.linearize(&point)? {
                        Some(linearization) => (point, linearization),
                        None => {
                            summary.num_unsuccessful_steps += 1;
                            record_iteration(
                                summary,
                                options,
                                record,
                                iteration_start,
                                solve_start,
                            );
                            break (
                                TerminationType::Failure,
                                evaluation_failure_message(evaluator, "after a line search step"),
                            );
                        }
                    }
                }
            };

            let step_norm = (&new_position - &current.position).norm_l2();
            let position_norm = current.position.norm_l2();
            let cost_change = cost - linearization.cost;
            summary.num_successful_steps += 1;
            record.step_is_valid = true;
            record.step_is_successful = true;
            record.step_size = sample.step_size;
            record.step_norm = step_norm;
            record.cost_change = cost_change;

            let next = Iterate {
                position: new_position,
                gradient: linearization.gradient,
            };
            previous = Some((std::mem::replace(&mut current, next), search_direction));
            last_cost_change = cost_change;
            let previous_cost = cost;
            cost = linearization.cost;
            gradient_max_norm =
                evaluator.projected_gradient_max_norm(&current.position, &current.gradient);
            record.cost = cost + fixed_cost;
            record.gradient_max_norm = gradient_max_norm;
            record.gradient_norm = current.gradient.norm_l2();
            if options.update_state_every_iteration {
                evaluator.write_parameters(&current.position);
            }

            let step_limit =
                options.parameter_tolerance * (position_norm + options.parameter_tolerance);
            if step_norm <= step_limit {
                record_iteration(summary, options, record, iteration_start, solve_start);
                break (
                    TerminationType::Convergence,
                    format!(
                        "Parameter tolerance reached. Relative step norm: {:e} <= {:e}.",
                        step_norm / (position_norm + options.parameter_tolerance),
                        options.parameter_tolerance
                    ),
                );
            }
            if cost_change.abs() <= options.function_tolerance * previous_cost {
                record_iteration(summary, options, record, iteration_start, solve_start);
                break (
                    TerminationType::Convergence,
                    format!(
                        "Function tolerance reached. |cost_change|/cost: {:e} <= {:e}",
                        cost_change.abs() / previous_cost,
                        options.function_tolerance
                    ),
                );
            }
            record_iteration(summary, options, record, iteration_start, solve_start);
        };

        evaluator.write_parameters(&current.position);
        summary.final_cost = cost + fixed_cost;
        summary.terminate(termination_type, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{cost_function::CallbackCostFunction, problem::Problem},
        optimizer::types::MinimizerType,
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const SOLUTION: [f64; 3] = [1.0, -2.0, 3.0];

    /// `r = A x − A x*` with a well conditioned upper triangular `A`.
    fn linear_problem() -> Result<Problem, Box<dyn std::error::Error>> {
        const A: [[f64; 3]; 3] = [[2.0, 0.5, 0.0], [0.0, 1.5, 0.0], [0.0, 0.0, 1.0]];
        let mut problem = Problem::new();
        let block = problem.add_parameter_block(vec![0.0; 3])?;
        let cost = CallbackCostFunction::new(
            |parameters, residuals, jacobians| {
                let x = parameters[0];
                for (i, row) in A.iter().enumerate() {
                    residuals[i] = (0..3).map(|k| row[k] * (x[k] - SOLUTION[k])).sum();
                }
                if let Some(jacobians) = jacobians
                    && let Some(j) = jacobians[0].as_deref_mut()
                {
                    for (i, row) in A.iter().enumerate() {
                        j[i * 3..i * 3 + 3].copy_from_slice(row);
                    }
                }
                true
            },
            3,
            vec![3],
        )?;
        problem.add_residual_block(Box::new(cost), None, &[block])?;
        Ok(problem)
    }

    fn run(options: &SolverOptions, problem: &mut Problem) -> OptimizerResult<SolverSummary> {
        let mut evaluator = Evaluator::new(problem, 1, None)?;
        let mut summary = SolverSummary::for_options(options);
        LineSearchMinimizer::new(options).minimize(&mut evaluator, options, &mut summary)?;
        Ok(summary)
    }

    fn line_search_options(
        direction: LineSearchDirectionType,
        line_search_type: LineSearchType,
    ) -> SolverOptions {
        SolverOptions::default()
            .with_minimizer_type(MinimizerType::LineSearch)
            .with_line_search_direction_type(direction)
            .with_line_search_type(line_search_type)
            .with_max_num_iterations(500)
    }

    #[test]
    fn test_every_direction_solves_linear_problem() -> TestResult {
        for direction in [
            LineSearchDirectionType::SteepestDescent,
            LineSearchDirectionType::NonlinearConjugateGradient,
            LineSearchDirectionType::Lbfgs,
            LineSearchDirectionType::Bfgs,
        ] {
            for line_search_type in [LineSearchType::Armijo, LineSearchType::Wolfe] {
                let mut problem = linear_problem()?;
                let options = line_search_options(direction, line_search_type);
                let summary = run(&options, &mut problem)?;

                assert!(summary.is_solution_usable(), "{}", summary.full_report());
                assert!(summary.num_line_search_steps() > 0);
                let ids = problem.parameter_block_ids();
                let values = problem.parameter_block_values(ids[0])?;
                for (value, expected) in values.iter().zip(SOLUTION) {
                    assert!(
                        (value - expected).abs() < 1e-3,
                        "{direction} / {line_search_type}: {values:?}"
                    );
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_conjugate_gradient_variants_converge() -> TestResult {
        for kind in [
            NonlinearConjugateGradientType::FletcherReeves,
            NonlinearConjugateGradientType::PolakRibiere,
            NonlinearConjugateGradientType::HestenesStiefel,
        ] {
            let mut problem = linear_problem()?;
            let mut options = line_search_options(
                LineSearchDirectionType::NonlinearConjugateGradient,
                LineSearchType::Wolfe,
            );
            options.set_nonlinear_conjugate_gradient_type(kind);
            let summary = run(&options, &mut problem)?;
            assert!(summary.is_solution_usable(), "{kind}: {}", summary.full_report());
            assert!(summary.final_cost() < 1e-8);
        }
        Ok(())
    }

    #[test]
    fn test_unevaluable_trial_points_end_in_failure() -> TestResult {
        let mut problem = Problem::new();
        let block = problem.add_parameter_block(vec![0.0])?;
        let cost = CallbackCostFunction::new(
            |parameters, residuals, jacobians| {
                let x = parameters[0][0];
                if x != 0.0 {
                    return false;
                }
                residuals[0] = x - 1.0;
                if let Some(jacobians) = jacobians
                    && let Some(j) = jacobians[0].as_deref_mut()
                {
                    j[0] = 1.0;
                }
                true
            },
            1,
            vec![1],
        )?;
        problem.add_residual_block(Box::new(cost), None, &[block])?;

        let options =
            line_search_options(LineSearchDirectionType::Lbfgs, LineSearchType::Armijo);
        let summary = run(&options, &mut problem)?;

        assert_eq!(summary.termination_type(), TerminationType::Failure);
        assert!(summary.message().starts_with("Line search failed"));
        assert_eq!(summary.num_successful_steps(), 0);
        assert_eq!(problem.parameter_block_values(block)?, &[0.0]);
        Ok(())
    }

    #[test]
    fn test_quadratic_interpolation_finds_parabola_minimum() -> TestResult {
        // φ(α) = (α − 2)² + 1
        let samples = [
            FunctionSample {
                step_size: 0.0,
                value: 5.0,
                derivative: Some(-4.0),
            },
            FunctionSample {
                step_size: 3.0,
                value: 2.0,
                derivative: None,
            },
        ];
        let coefficients = interpolating_polynomial(&samples, 2).ok_or("no polynomial")?;
        assert!((coefficients[0] - 5.0).abs() < 1e-12);
        assert!((coefficients[1] + 4.0).abs() < 1e-12);
        assert!((coefficients[2] - 1.0).abs() < 1e-12);

        let step =
            interpolated_step_size(LineSearchInterpolationType::Quadratic, &samples, 0.0, 10.0)
                .ok_or("no step")?;
        assert!((step - 2.0).abs() < 1e-12);

        // Clamped to the allowed interval
        assert_eq!(minimize_polynomial(&coefficients, 0.0, 1.0), 1.0);
        assert_eq!(
            interpolated_step_size(LineSearchInterpolationType::Bisection, &samples, 0.0, 10.0),
            None
        );
        Ok(())
    }

    #[test]
    fn test_cubic_interpolation_finds_local_minimum() -> TestResult {
        // φ(α) = α³ − 3α, local minimum at α = 1
        let phi = |a: f64| a * a * a - 3.0 * a;
        let samples = [
            FunctionSample {
                step_size: 0.0,
                value: phi(0.0),
                derivative: Some(-3.0),
            },
            FunctionSample {
                step_size: 2.0,
                value: phi(2.0),
                derivative: None,
            },
            FunctionSample {
                step_size: 0.5,
                value: phi(0.5),
                derivative: None,
            },
        ];
        let step = interpolated_step_size(LineSearchInterpolationType::Cubic, &samples, 0.0, 2.0)
            .ok_or("no step")?;
        assert!((step - 1.0).abs() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_bfgs_update_satisfies_secant_equation() {
        let mut bfgs = Bfgs::new(false);
        let s = DVector::from_vec(vec![0.5, -1.0, 0.25]);
        let y = DVector::from_vec(vec![1.0, -1.5, 0.5]);
        bfgs.update(&s, &y);

        let hy = &bfgs.inverse_hessian * &y;
        for i in 0..3 {
            assert!((hy[i] - s[i]).abs() < 1e-12);
        }
        // Symmetric
        let difference = &bfgs.inverse_hessian - bfgs.inverse_hessian.transpose();
        assert!(difference.amax() < 1e-12);
    }

    #[test]
    fn test_lbfgs_with_one_pair_satisfies_secant_equation() {
        let mut lbfgs = Lbfgs::new(3, true);
        let s = Mat::from_fn(2, 1, |i, _| [1.0, 0.5][i]);
        let y = Mat::from_fn(2, 1, |i, _| [2.0, 0.25][i]);
        lbfgs.update(s.clone(), y.clone());

        let hy = lbfgs.apply_inverse_hessian(&y);
        for i in 0..2 {
            assert!((hy[(i, 0)] - s[(i, 0)]).abs() < 1e-12);
        }

        // Pairs violating the curvature condition are ignored
        lbfgs.update(s.clone(), negated(&y));
        assert_eq!(lbfgs.corrections.len(), 1);
    }
}

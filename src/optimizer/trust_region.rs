//! Trust-region minimizer.
//!
//! Each iteration asks a [`TrustRegionStrategy`] for a step of the Jacobi-scaled linearized
//! problem, evaluates the cost at the (bound-projected) candidate and accepts the step when
//! the ratio of actual to model cost decrease exceeds `min_relative_decrease`. The Jacobi
//! scaling `1 / (1 + ‖J_col‖)` is computed once from the initial Jacobian.
//!
//! With `use_nonmonotonic_steps` the ratio is also measured against a reference cost that may
//! lag behind the current one for up to `max_consecutive_nonmonotonic_steps` accepted steps,
//! which lets the minimizer climb out of narrow valleys.

use std::ops::Mul;

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use tracing::warn;
use web_time::Instant;

use crate::{
    core::evaluator::{Evaluator, Linearization},
    linalg::{LinAlgError, LinAlgResult, LinearSolver},
    optimizer::{
        Minimizer, OptimizerError, OptimizerResult,
        dog_leg::DoglegStrategy,
        dump::{LinearLeastSquaresProblem, dump_linear_least_squares_problem},
        levenberg_marquardt::LevenbergMarquardtStrategy,
        options::SolverOptions,
        summary::{IterationSummary, SolverSummary},
        types::{TerminationType, TrustRegionStrategyType},
    },
};

/// Step proposed by a strategy, in scaled coordinates.
pub struct TrustRegionStep {
    pub step: Mat<f64>,
    /// Regularizing diagonal `D` of `(JᵀJ + D²) h = −Jᵀr`, if any
    pub diagonal: Option<Mat<f64>>,
    pub linear_solver_iterations: usize,
}

/// Step computation and radius management of a trust-region method.
pub trait TrustRegionStrategy: Send {
    fn compute_step(
        &mut self,
        linear_solver: &mut dyn LinearSolver,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<TrustRegionStep>;

    /// The last step was accepted with actual/model decrease ratio `step_quality`.
    fn step_accepted(&mut self, step_quality: f64);

    fn step_rejected(&mut self, step_quality: f64);

    /// The linear solve failed or the step could not be used.
    fn step_is_invalid(&mut self);

    fn radius(&self) -> f64;
}

/// Diagonal Jacobi scaling matrix with entries `1 / (1 + ‖J_col‖)`.
fn jacobi_scaling(
    jacobian: &SparseColMat<usize, f64>,
) -> OptimizerResult<SparseColMat<usize, f64>> {
    let cols = jacobian.ncols();
    let mut column_norms = vec![0.0; cols];
    for t in jacobian.triplet_iter() {
        column_norms[t.col] += t.val * t.val;
    }
    let triplets: Vec<Triplet<usize, usize, f64>> = column_norms
        .iter()
        .enumerate()
        .map(|(c, norm_squared)| Triplet::new(c, c, 1.0 / (1.0 + norm_squared.sqrt())))
        .collect();
    SparseColMat::try_new_from_triplets(cols, cols, &triplets).map_err(|e| {
        OptimizerError::from(LinAlgError::SparseMatrixCreation(
            "Failed to create Jacobi scaling".to_string(),
        ))
        .log_with_source(e)
    })
}

/// `−(J h)ᵀ (r + J h / 2)`, the decrease of the linear model for step `h`.
fn model_cost_change(linearization: &Linearization, step: &Mat<f64>) -> f64 {
    let jh = linearization.jacobian.as_ref().mul(step);
    -(0..jh.nrows())
        .map(|i| jh[(i, 0)] * (linearization.residuals[(i, 0)] + 0.5 * jh[(i, 0)]))
        .sum::<f64>()
}

/// Bookkeeping for non-monotonic steps.
struct NonmonotonicState {
    reference_cost: f64,
    candidate_cost: f64,
    minimum_cost: f64,
    accumulated_reference_model_cost_change: f64,
    accumulated_candidate_model_cost_change: f64,
    num_consecutive_nonmonotonic_steps: usize,
    max_consecutive_nonmonotonic_steps: usize,
}

impl NonmonotonicState {
    fn new(cost: f64, max_consecutive_nonmonotonic_steps: usize) -> Self {
        Self {
            reference_cost: cost,
            candidate_cost: cost,
            minimum_cost: cost,
            accumulated_reference_model_cost_change: 0.0,
            accumulated_candidate_model_cost_change: 0.0,
            num_consecutive_nonmonotonic_steps: 0,
            max_consecutive_nonmonotonic_steps,
        }
    }

    /// Decrease ratio measured against the reference cost.
    fn historical_relative_decrease(&self, new_cost: f64, model_cost_change: f64) -> f64 {
        (self.reference_cost - new_cost)
            / (self.accumulated_reference_model_cost_change + model_cost_change)
    }

    fn step_accepted(&mut self, cost: f64, model_cost_change: f64) {
        self.accumulated_candidate_model_cost_change += model_cost_change;
        self.accumulated_reference_model_cost_change += model_cost_change;
        if cost < self.minimum_cost {
            self.minimum_cost = cost;
            self.num_consecutive_nonmonotonic_steps = 0;
            self.candidate_cost = cost;
            self.accumulated_candidate_model_cost_change = 0.0;
        } else {
            self.num_consecutive_nonmonotonic_steps += 1;
            if cost > self.candidate_cost {
                self.candidate_cost = cost;
                self.accumulated_candidate_model_cost_change = 0.0;
            }
        }
        if self.num_consecutive_nonmonotonic_steps == self.max_consecutive_nonmonotonic_steps {
            self.reference_cost = self.candidate_cost;
            self.accumulated_reference_model_cost_change =
                self.accumulated_candidate_model_cost_change;
        }
    }
}

/// Message for a linearization that returned no result.
pub(crate) fn evaluation_failure_message(evaluator: &Evaluator<'_>, context: &str) -> String {
    match evaluator.gradient_check_failure() {
        Some(failure) => format!("Gradient error detected {context}: {failure}"),
        None => format!("Residual and Jacobian evaluation failed {context}"),
    }
}

pub struct TrustRegionMinimizer {
    linear_solver: Box<dyn LinearSolver>,
    strategy: Box<dyn TrustRegionStrategy>,
}

impl TrustRegionMinimizer {
    pub fn new(options: &SolverOptions, linear_solver: Box<dyn LinearSolver>) -> Self {
        let strategy: Box<dyn TrustRegionStrategy> = match options.trust_region_strategy_type {
            TrustRegionStrategyType::LevenbergMarquardt => {
                Box::new(LevenbergMarquardtStrategy::new(options))
            }
            TrustRegionStrategyType::Dogleg => Box::new(DoglegStrategy::new(options)),
        };
        Self {
            linear_solver,
            strategy,
        }
    }

    fn dump_iteration(
        options: &SolverOptions,
        iteration: usize,
        problem: &LinearLeastSquaresProblem<'_>,
    ) {
        if !options.trust_region_minimizer_iterations_to_dump.contains(&iteration) {
            return;
        }
        if let Err(e) = dump_linear_least_squares_problem(
            problem,
            iteration,
            &options.trust_region_problem_dump_directory,
            options.trust_region_problem_dump_format_type,
        ) {
            warn!("Unable to dump the linear least squares problem of iteration {iteration}: {e}");
        }
    }
}

/// Finish an iteration record and hand it to the summary.
pub(crate) fn record_iteration(
    summary: &mut SolverSummary,
    options: &SolverOptions,
    mut record: IterationSummary,
    iteration_start: Instant,
    solve_start: Instant,
) {
    record.iteration_time = iteration_start.elapsed();
    record.cumulative_time = solve_start.elapsed();
    record.print_line(options);
    summary.iterations.push(record);
}

impl Minimizer for TrustRegionMinimizer {
    fn minimize(
        &mut self,
        evaluator: &mut Evaluator<'_>,
        options: &SolverOptions,
        summary: &mut SolverSummary,
    ) -> OptimizerResult<()> {
        let solve_start = Instant::now();
        let fixed_cost = summary.fixed_cost;

        let mut x = evaluator.parameters();
        evaluator.project(&mut x);
        let iteration_start = Instant::now();
        let Some(mut linearization) = evaluator.linearize(&x)? else {
            summary.terminate(
                TerminationType::Failure,
                evaluation_failure_message(evaluator, "at the initial point"),
            );
            return Ok(());
        };

        let mut cost = linearization.cost;
        let mut x_norm = x.norm_l2();
        summary.initial_cost = cost + fixed_cost;
        summary.final_cost = summary.initial_cost;

        let scaling = jacobi_scaling(&linearization.jacobian)?;
        let mut scaled_jacobian = &linearization.jacobian * &scaling;
        let mut gradient_max_norm =
            evaluator.projected_gradient_max_norm(&x, &linearization.gradient);

        IterationSummary::print_header(options);
        record_iteration(
            summary,
            options,
            IterationSummary {
                iteration: 0,
                cost: cost + fixed_cost,
                gradient_max_norm,
                gradient_norm: linearization.gradient.norm_l2(),
                trust_region_radius: self.strategy.radius(),
                step_is_valid: true,
                step_is_successful: true,
                ..IterationSummary::default()
            },
            iteration_start,
            solve_start,
        );

        let mut nonmonotonic = options
            .use_nonmonotonic_steps
            .then(|| NonmonotonicState::new(cost, options.max_consecutive_nonmonotonic_steps));
        let mut num_consecutive_invalid_steps = 0;
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
            if self.strategy.radius() < options.min_trust_region_radius {
                break (
                    TerminationType::Convergence,
                    format!(
                        "Minimum trust region radius reached. Trust region radius: {:e} <= {:e}",
                        self.strategy.radius(),
                        options.min_trust_region_radius
                    ),
                );
            }

            iteration += 1;
            let iteration_start = Instant::now();
            let mut record = IterationSummary {
                iteration,
                cost: cost + fixed_cost,
                gradient_max_norm,
                gradient_norm: linearization.gradient.norm_l2(),
                ..IterationSummary::default()
            };

            let step = self.strategy.compute_step(
                self.linear_solver.as_mut(),
                &linearization.residuals,
                &scaled_jacobian,
            );
            if let Ok(step) = &step {
                Self::dump_iteration(
                    options,
                    iteration,
                    &LinearLeastSquaresProblem {
                        jacobian: &scaled_jacobian,
                        residuals: &linearization.residuals,
                        diagonal: step.diagonal.as_ref(),
                        step: &step.step,
                    },
                );
            }

            // Candidate point in original coordinates, projected onto the bounds
            let candidate = match step {
                Ok(step) => {
                    record.linear_solver_iterations = step.linear_solver_iterations;
                    let unprojected = scaling.as_ref().mul(&step.step);
                    Some(evaluator.plus(&x, &unprojected))
                }
                Err(_) => None,
            };

            let mut model_change = f64::NAN;
            if let Some(candidate) = &candidate {
                let delta = candidate - &x;
                let step_norm = delta.norm_l2();
                record.step_norm = step_norm;
                let step_limit =
                    options.parameter_tolerance * (x_norm + options.parameter_tolerance);
                if step_norm <= step_limit {
                    record.step_is_valid = true;
                    record.trust_region_radius = self.strategy.radius();
                    record_iteration(summary, options, record, iteration_start, solve_start);
                    break (
                        TerminationType::Convergence,
                        format!(
                            "Parameter tolerance reached. Relative step norm: {:e} <= {:e}.",
                            step_norm / (x_norm + options.parameter_tolerance),
                            options.parameter_tolerance
                        ),
                    );
                }
                model_change = model_cost_change(&linearization, &delta);
            }

            // A failed solve or a step the model does not predict to decrease the cost
            let Some(candidate) =
                candidate.filter(|_| model_change.is_finite() && model_change > 0.0)
            else {
                num_consecutive_invalid_steps += 1;
                summary.num_unsuccessful_steps += 1;
                if num_consecutive_invalid_steps > options.max_num_consecutive_invalid_steps {
                    record_iteration(summary, options, record, iteration_start, solve_start);
                    break (
                        TerminationType::Failure,
                        format!(
                            "Number of consecutive invalid steps more than \
                             max_num_consecutive_invalid_steps: {}",
                            options.max_num_consecutive_invalid_steps
                        ),
                    );
                }
                self.strategy.step_is_invalid();
                record.trust_region_radius = self.strategy.radius();
                record_iteration(summary, options, record, iteration_start, solve_start);
                continue;
            };
            num_consecutive_invalid_steps = 0;
            record.step_is_valid = true;

            let new_cost = evaluator.cost(&candidate).unwrap_or(f64::INFINITY);
            let cost_change = cost - new_cost;

            let mut relative_decrease = cost_change / model_change;
            if let Some(state) = &nonmonotonic {
                let historical = state.historical_relative_decrease(new_cost, model_change);
                relative_decrease = relative_decrease.max(historical);
            }
            record.relative_decrease = relative_decrease;

            let converged_on_cost =
                cost_change.abs() <= options.function_tolerance * cost && new_cost.is_finite();
            let step_is_successful = relative_decrease > options.min_relative_decrease
                || (converged_on_cost && cost_change > 0.0);

            if step_is_successful {
                summary.num_successful_steps += 1;
                record.step_is_successful = true;
                record.step_is_nonmonotonic = cost_change < 0.0;
                record.cost_change = cost_change;
                self.strategy.step_accepted(relative_decrease);
                if let Some(state) = &mut nonmonotonic {
                    state.step_accepted(new_cost, model_change);
                }

                x = candidate;
                x_norm = x.norm_l2();
                cost = new_cost;
                record.cost = cost + fixed_cost;
                record.trust_region_radius = self.strategy.radius();

                if converged_on_cost {
                    record_iteration(summary, options, record, iteration_start, solve_start);
                    break (
                        TerminationType::Convergence,
                        format!(
                            "Function tolerance reached. |cost_change|/cost: {:e} <= {:e}",
                            cost_change.abs() / (cost + cost_change),
                            options.function_tolerance
                        ),
                    );
                }

                match evaluator.linearize(&x)? {
                    Some(next) => linearization = next,
                    None => {
                        record_iteration(summary, options, record, iteration_start, solve_start);
                        break (
                            TerminationType::Failure,
                            evaluation_failure_message(evaluator, "after a successful step"),
                        );
                    }
                }
                scaled_jacobian = &linearization.jacobian * &scaling;
                gradient_max_norm =
                    evaluator.projected_gradient_max_norm(&x, &linearization.gradient);
                record.gradient_max_norm = gradient_max_norm;
                record.gradient_norm = linearization.gradient.norm_l2();
            } else {
                summary.num_unsuccessful_steps += 1;
                self.strategy.step_rejected(relative_decrease);
                record.trust_region_radius = self.strategy.radius();
                if converged_on_cost {
                    record_iteration(summary, options, record, iteration_start, solve_start);
                    break (
                        TerminationType::Convergence,
                        format!(
                            "Function tolerance reached. |cost_change|/cost: {:e} <= {:e}",
                            cost_change.abs() / cost,
                            options.function_tolerance
                        ),
                    );
                }
                if options.update_state_every_iteration {
                    evaluator.write_parameters(&x);
                }
            }

            record_iteration(summary, options, record, iteration_start, solve_start);
        };

        evaluator.write_parameters(&x);
        summary.final_cost = cost + fixed_cost;
        summary.terminate(termination_type, message);
        Ok(())
    }
}

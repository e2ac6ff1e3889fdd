//! The solve entry point.
//!
//! A solve runs three stages, once per call:
//!
//! 1. **Validating**: the options, the problem, and how they fit together. A failure here is
//!    returned as `Err` and nothing is evaluated.
//! 2. **Running**: the evaluator, the linear solver and the minimizer selected by the options
//!    are built and the minimizer runs to one of its stopping conditions.
//! 3. **Done**: the [`SolverSummary`] is completed and returned.
//!
//! Evaluation failures and iteration or time limits are not errors. They are reported by the
//! summary's termination type and [`SolverSummary::is_solution_usable`].

use tracing::debug;
use web_time::Instant;

use crate::{
    core::{CoreError, evaluator::Evaluator, gradient_checker::GradientChecker, problem::Problem},
    error::NllsResult,
    linalg::create_linear_solver,
    optimizer::{
        Minimizer, OptimizerError,
        line_search::LineSearchMinimizer,
        options::SolverOptions,
        summary::SolverSummary,
        trust_region::TrustRegionMinimizer,
        types::{MinimizerType, TerminationType},
    },
};

/// A reusable solver configuration.
///
/// ```
/// use apex_nlls::{
///     core::{cost_function::CallbackCostFunction, problem::Problem},
///     optimizer::{Solver, SolverOptions},
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut problem = Problem::new();
/// let x = problem.add_parameter_block(vec![3.0])?;
/// let cost = CallbackCostFunction::new(
///     |parameters, residuals, jacobians| {
///         residuals[0] = parameters[0][0] - 10.0;
///         if let Some(jacobians) = jacobians
///             && let Some(j) = jacobians[0].as_deref_mut()
///         {
///             j[0] = 1.0;
///         }
///         true
///     },
///     1,
///     vec![1],
/// )?;
/// problem.add_residual_block(Box::new(cost), None, &[x])?;
///
/// let summary = Solver::new(SolverOptions::default()).solve(&mut problem)?;
/// assert!(summary.is_solution_usable());
/// assert!((problem.parameter_block_values(x)?[0] - 10.0).abs() < 1e-6);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Solver {
    options: SolverOptions,
}

impl Solver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// See [`solve`].
    pub fn solve(&self, problem: &mut Problem) -> NllsResult<SolverSummary> {
        solve(&self.options, problem)
    }
}

/// Check everything that must hold before any callback runs.
fn validate(options: &SolverOptions, problem: &Problem) -> NllsResult<()> {
    options.validate()?;

    if problem.num_residual_blocks() == 0 {
        return Err(OptimizerError::NoResidualBlocks.log().into());
    }

    if let Some(id) = options
        .residual_blocks_for_subset_preconditioner
        .iter()
        .find(|&&id| !problem.contains_residual_block(id))
    {
        return Err(CoreError::StructuralMismatch(format!(
            "Residual block {id:?} in residual_blocks_for_subset_preconditioner does not belong \
             to the problem being solved"
        ))
        .log()
        .into());
    }

    if options.minimizer_type == MinimizerType::LineSearch && problem.has_bounds() {
        return Err(OptimizerError::InvalidConfiguration(
            "The line search minimizer does not support bounds constraints; use the trust \
             region minimizer"
                .to_string(),
        )
        .log()
        .into());
    }
    Ok(())
}

/// Copy evaluation counters and timings into `summary`.
fn finish(summary: &mut SolverSummary, evaluator: &Evaluator<'_>, solve_start: Instant) {
    let counters = evaluator.counters();
    summary.num_residual_evaluations = counters.num_residual_evaluations;
    summary.num_jacobian_evaluations = counters.num_jacobian_evaluations;
    summary.residual_evaluation_time = counters.residual_evaluation_time;
    summary.jacobian_evaluation_time = counters.jacobian_evaluation_time;
    summary.total_time = solve_start.elapsed();
    debug!("{}", summary.brief_report());
}

/// Minimize the cost of `problem` as configured by `options`.
///
/// On return the parameter blocks of `problem` hold the final point (or the initial one if the
/// very first evaluation failed).
///
/// # Errors
///
/// - `OptimizerError::InvalidConfiguration` if `options` fail validation, or the line search
///   minimizer is asked to solve a bounded problem
/// - `OptimizerError::NoResidualBlocks` for a problem without residual blocks
/// - `CoreError::StructuralMismatch` if `residual_blocks_for_subset_preconditioner` names a
///   block of another problem
/// - `CoreError::ParallelComputation` if the thread pool cannot be created
pub fn solve(options: &SolverOptions, problem: &mut Problem) -> NllsResult<SolverSummary> {
    let solve_start = Instant::now();
    validate(options, problem)?;
    options.print_configuration();

    let mut summary = SolverSummary::for_options(options);
    summary.num_parameter_blocks = problem.num_parameter_blocks();
    summary.num_parameters = problem.num_parameters();
    summary.num_residual_blocks = problem.num_residual_blocks();
    summary.num_residuals = problem.num_residuals();

    let gradient_checker = options.check_gradients.then(|| {
        GradientChecker::new(
            options.gradient_check_relative_precision,
            options.gradient_check_numeric_derivative_relative_step_size,
        )
    });
    let mut evaluator = Evaluator::new(problem, options.num_threads, gradient_checker)?;
    summary.num_parameter_blocks_reduced = evaluator.num_parameter_blocks();
    summary.num_parameters_reduced = evaluator.num_parameters();
    summary.num_residual_blocks_reduced = evaluator.num_residual_blocks();
    summary.num_residuals_reduced = evaluator.num_residuals();
    summary.num_threads_used = evaluator.num_threads_used();

    let subset_rows: Vec<usize> = options
        .residual_blocks_for_subset_preconditioner
        .iter()
        .filter_map(|&id| evaluator.residual_rows(id))
        .flatten()
        .collect();
    summary.preprocessor_time = solve_start.elapsed();

    let Some(fixed_cost) = evaluator.fixed_cost() else {
        summary.terminate(
            TerminationType::Failure,
            "Residual evaluation failed for a residual block with only constant parameters",
        );
        finish(&mut summary, &evaluator, solve_start);
        return Ok(summary);
    };
    summary.fixed_cost = fixed_cost;

    if evaluator.num_parameters() == 0 {
        summary.initial_cost = fixed_cost;
        summary.final_cost = fixed_cost;
        summary.terminate(
            TerminationType::Convergence,
            "Function tolerance reached. No non-constant parameter blocks were found.",
        );
        finish(&mut summary, &evaluator, solve_start);
        return Ok(summary);
    }

    let minimizer_start = Instant::now();
    let mut minimizer: Box<dyn Minimizer> = match options.minimizer_type {
        MinimizerType::TrustRegion => Box::new(TrustRegionMinimizer::new(
            options,
            create_linear_solver(options, subset_rows),
        )),
        MinimizerType::LineSearch => Box::new(LineSearchMinimizer::new(options)),
    };
    minimizer.minimize(&mut evaluator, options, &mut summary)?;
    summary.minimizer_time = minimizer_start.elapsed();

    finish(&mut summary, &evaluator, solve_start);
    Ok(summary)
}

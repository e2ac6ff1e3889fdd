//! What happened during a solve.
//!
//! A [`SolverSummary`] is produced once by [`solve`](crate::optimizer::solve) and is read-only
//! afterwards: all fields are set by the crate and exposed through accessors.

use std::{
    fmt,
    fmt::{Debug, Formatter, Write},
};

use tracing::{debug, info};
use web_time::Duration;

use crate::optimizer::{
    options::SolverOptions,
    types::{
        LineSearchDirectionType, LinearSolverType, LoggingType, MinimizerType,
        TerminationType, TrustRegionStrategyType,
    },
};

/// Per-iteration record, Ceres-style.
#[derive(Debug, Clone, Default)]
pub struct IterationSummary {
    /// Iteration number, 0 for the initial point
    pub iteration: usize,
    /// Cost at the accepted point after this iteration, fixed cost included
    pub cost: f64,
    /// Cost decrease of the candidate step; 0 when rejected
    pub cost_change: f64,
    /// Max-norm of the projected gradient
    pub gradient_max_norm: f64,
    /// L2 norm of the gradient
    pub gradient_norm: f64,
    /// L2 norm of the candidate step
    pub step_norm: f64,
    /// Ratio of actual to predicted cost decrease (trust region)
    pub relative_decrease: f64,
    pub trust_region_radius: f64,
    /// Step length along the search direction (line search)
    pub step_size: f64,
    pub line_search_function_evaluations: usize,
    pub linear_solver_iterations: usize,
    /// The linear solve produced a finite step
    pub step_is_valid: bool,
    /// The step was accepted
    pub step_is_successful: bool,
    pub step_is_nonmonotonic: bool,
    pub iteration_time: Duration,
    pub cumulative_time: Duration,
}

impl IterationSummary {
    pub fn header(minimizer_type: MinimizerType) -> String {
        match minimizer_type {
            MinimizerType::TrustRegion => format!(
                "{:>4}  {:>13}  {:>10}  {:>10}  {:>10}  {:>10}  {:>10}  {:>7}  {:>10}  {:>10}  {:>6}",
                "iter",
                "cost",
                "cost_change",
                "|gradient|",
                "|step|",
                "tr_ratio",
                "tr_radius",
                "ls_iter",
                "iter_time",
                "total_time",
                "status"
            ),
            MinimizerType::LineSearch => format!(
                "{:>4}  {:>13}  {:>10}  {:>10}  {:>10}  {:>10}  {:>6}  {:>10}  {:>10}",
                "iter",
                "cost",
                "cost_change",
                "|gradient|",
                "|step|",
                "step_size",
                "ls_evals",
                "iter_time",
                "total_time"
            ),
        }
    }

    pub fn line(&self, minimizer_type: MinimizerType) -> String {
        let iter_ms = self.iteration_time.as_secs_f64() * 1000.0;
        let total_ms = self.cumulative_time.as_secs_f64() * 1000.0;
        match minimizer_type {
            MinimizerType::TrustRegion => {
                let status = if self.iteration == 0 {
                    "-"
                } else if self.step_is_successful {
                    "✓"
                } else {
                    "✗"
                };
                format!(
                    "{:>4}  {:>13.6e}  {:>10.2e}  {:>10.2e}  {:>10.2e}  {:>10.2e}  {:>10.2e}  \
                     {:>7}  {:>8.2}ms  {:>8.2}ms  {:>6}",
                    self.iteration,
                    self.cost,
                    self.cost_change,
                    self.gradient_max_norm,
                    self.step_norm,
                    self.relative_decrease,
                    self.trust_region_radius,
                    self.linear_solver_iterations,
                    iter_ms,
                    total_ms,
                    status
                )
            }
            MinimizerType::LineSearch => format!(
                "{:>4}  {:>13.6e}  {:>10.2e}  {:>10.2e}  {:>10.2e}  {:>10.2e}  {:>8}  \
                 {:>8.2}ms  {:>8.2}ms",
                self.iteration,
                self.cost,
                self.cost_change,
                self.gradient_max_norm,
                self.step_norm,
                self.step_size,
                self.line_search_function_evaluations,
                iter_ms,
                total_ms
            ),
        }
    }

    pub fn print_header(options: &SolverOptions) {
        emit_progress(options, &Self::header(options.minimizer_type));
    }

    pub fn print_line(&self, options: &SolverOptions) {
        emit_progress(options, &self.line(options.minimizer_type));
    }
}

/// Route one progress line to stdout, `info!` or `debug!` depending on the options.
fn emit_progress(options: &SolverOptions, line: &str) {
    if options.minimizer_progress_to_stdout {
        println!("{line}");
    } else if options.logging_type == LoggingType::PerMinimizerIteration {
        info!("{line}");
    } else if tracing::enabled!(tracing::Level::DEBUG) {
        debug!("{line}");
    }
}

/// Report of one solve.
///
/// Costs include [`fixed_cost`](Self::fixed_cost). If the initial evaluation failed, the
/// initial and final costs are NaN.
#[derive(Clone)]
pub struct SolverSummary {
    pub(crate) minimizer_type: MinimizerType,
    pub(crate) trust_region_strategy_type: TrustRegionStrategyType,
    pub(crate) line_search_direction_type: LineSearchDirectionType,
    pub(crate) linear_solver_type: LinearSolverType,

    pub(crate) initial_cost: f64,
    pub(crate) final_cost: f64,
    pub(crate) fixed_cost: f64,

    pub(crate) num_successful_steps: usize,
    pub(crate) num_unsuccessful_steps: usize,
    pub(crate) num_inner_iteration_steps: usize,
    pub(crate) num_line_search_steps: usize,

    pub(crate) termination_type: TerminationType,
    pub(crate) message: String,

    pub(crate) num_threads_given: usize,
    pub(crate) num_threads_used: usize,

    pub(crate) num_parameter_blocks: usize,
    pub(crate) num_parameters: usize,
    pub(crate) num_residual_blocks: usize,
    pub(crate) num_residuals: usize,
    pub(crate) num_parameter_blocks_reduced: usize,
    pub(crate) num_parameters_reduced: usize,
    pub(crate) num_residual_blocks_reduced: usize,
    pub(crate) num_residuals_reduced: usize,

    pub(crate) num_residual_evaluations: usize,
    pub(crate) num_jacobian_evaluations: usize,

    pub(crate) iterations: Vec<IterationSummary>,

    pub(crate) preprocessor_time: Duration,
    pub(crate) minimizer_time: Duration,
    pub(crate) total_time: Duration,
    pub(crate) residual_evaluation_time: Duration,
    pub(crate) jacobian_evaluation_time: Duration,
}

impl Default for SolverSummary {
    fn default() -> Self {
        Self {
            minimizer_type: MinimizerType::default(),
            trust_region_strategy_type: TrustRegionStrategyType::default(),
            line_search_direction_type: LineSearchDirectionType::default(),
            linear_solver_type: LinearSolverType::default(),
            initial_cost: f64::NAN,
            final_cost: f64::NAN,
            fixed_cost: 0.0,
            num_successful_steps: 0,
            num_unsuccessful_steps: 0,
            num_inner_iteration_steps: 0,
            num_line_search_steps: 0,
            termination_type: TerminationType::Failure,
            message: "Solver did not run".to_string(),
            num_threads_given: 0,
            num_threads_used: 0,
            num_parameter_blocks: 0,
            num_parameters: 0,
            num_residual_blocks: 0,
            num_residuals: 0,
            num_parameter_blocks_reduced: 0,
            num_parameters_reduced: 0,
            num_residual_blocks_reduced: 0,
            num_residuals_reduced: 0,
            num_residual_evaluations: 0,
            num_jacobian_evaluations: 0,
            iterations: Vec::new(),
            preprocessor_time: Duration::ZERO,
            minimizer_time: Duration::ZERO,
            total_time: Duration::ZERO,
            residual_evaluation_time: Duration::ZERO,
            jacobian_evaluation_time: Duration::ZERO,
        }
    }
}

impl SolverSummary {
    /// An empty summary for a solve configured by `options`.
    pub(crate) fn for_options(options: &SolverOptions) -> Self {
        Self {
            minimizer_type: options.minimizer_type,
            trust_region_strategy_type: options.trust_region_strategy_type,
            line_search_direction_type: options.line_search_direction_type,
            linear_solver_type: options.linear_solver_type,
            num_threads_given: options.num_threads,
            ..Self::default()
        }
    }

    /// Record how the minimizer stopped.
    pub(crate) fn terminate(
        &mut self,
        termination_type: TerminationType,
        message: impl Into<String>,
    ) {
        self.termination_type = termination_type;
        self.message = message.into();
    }

    pub fn initial_cost(&self) -> f64 {
        self.initial_cost
    }

    pub fn final_cost(&self) -> f64 {
        self.final_cost
    }

    /// Cost of residual blocks that only read constant parameter blocks
    pub fn fixed_cost(&self) -> f64 {
        self.fixed_cost
    }

    pub fn num_successful_steps(&self) -> usize {
        self.num_successful_steps
    }

    pub fn num_unsuccessful_steps(&self) -> usize {
        self.num_unsuccessful_steps
    }

    /// Always 0; inner iterations are not offered.
    pub fn num_inner_iteration_steps(&self) -> usize {
        self.num_inner_iteration_steps
    }

    /// Cost evaluations made by the line search
    pub fn num_line_search_steps(&self) -> usize {
        self.num_line_search_steps
    }

    pub fn termination_type(&self) -> TerminationType {
        self.termination_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn minimizer_type(&self) -> MinimizerType {
        self.minimizer_type
    }

    pub fn linear_solver_type(&self) -> LinearSolverType {
        self.linear_solver_type
    }

    pub fn num_threads_given(&self) -> usize {
        self.num_threads_given
    }

    pub fn num_threads_used(&self) -> usize {
        self.num_threads_used
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.num_parameter_blocks
    }

    pub fn num_parameters(&self) -> usize {
        self.num_parameters
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.num_residual_blocks
    }

    pub fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    pub fn num_residual_evaluations(&self) -> usize {
        self.num_residual_evaluations
    }

    pub fn num_jacobian_evaluations(&self) -> usize {
        self.num_jacobian_evaluations
    }

    pub fn iterations(&self) -> &[IterationSummary] {
        &self.iterations
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn minimizer_time(&self) -> Duration {
        self.minimizer_time
    }

    pub fn preprocessor_time(&self) -> Duration {
        self.preprocessor_time
    }

    /// Only a converged solve is usable. Hitting an iteration or time limit is not.
    pub fn is_solution_usable(&self) -> bool {
        self.termination_type == TerminationType::Convergence
    }

    /// One-line report.
    pub fn brief_report(&self) -> String {
        format!(
            "apex-nlls Solver Report: Iterations: {}, Initial cost: {:e}, Final cost: {:e}, \
             Termination: {}",
            self.num_successful_steps + self.num_unsuccessful_steps,
            self.initial_cost,
            self.final_cost,
            self.termination_type
        )
    }

    /// Multi-section report covering problem size, configuration, costs, steps and timings.
    pub fn full_report(&self) -> String {
        let mut report = String::new();
        // Writing into a String never fails
        let _ = self.write_full_report(&mut report);
        report
    }

    fn write_full_report(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "Solver Summary (apex-nlls)")?;
        writeln!(out)?;
        writeln!(out, "{:<30}{:>12}{:>12}", "", "Original", "Reduced")?;
        writeln!(
            out,
            "{:<30}{:>12}{:>12}",
            "Parameter blocks", self.num_parameter_blocks, self.num_parameter_blocks_reduced
        )?;
        writeln!(
            out,
            "{:<30}{:>12}{:>12}",
            "Parameters", self.num_parameters, self.num_parameters_reduced
        )?;
        writeln!(
            out,
            "{:<30}{:>12}{:>12}",
            "Residual blocks", self.num_residual_blocks, self.num_residual_blocks_reduced
        )?;
        writeln!(
            out,
            "{:<30}{:>12}{:>12}",
            "Residuals", self.num_residuals, self.num_residuals_reduced
        )?;
        writeln!(out)?;

        writeln!(out, "Minimizer                     {}", self.minimizer_type)?;
        match self.minimizer_type {
            MinimizerType::TrustRegion => {
                writeln!(out, "Trust region strategy         {}", self.trust_region_strategy_type)?;
                writeln!(out, "Linear solver                 {}", self.linear_solver_type)?;
            }
            MinimizerType::LineSearch => {
                writeln!(out, "Line search direction         {}", self.line_search_direction_type)?;
            }
        }
        writeln!(
            out,
            "Threads                       {} given, {} used",
            self.num_threads_given, self.num_threads_used
        )?;
        writeln!(out)?;

        writeln!(out, "Cost:")?;
        writeln!(out, "  Initial                     {:e}", self.initial_cost)?;
        writeln!(out, "  Final                       {:e}", self.final_cost)?;
        writeln!(
            out,
            "  Change                      {:e}",
            self.initial_cost - self.final_cost
        )?;
        writeln!(out, "  Fixed                       {:e}", self.fixed_cost)?;
        writeln!(out)?;

        writeln!(out, "Minimizer iterations          {}", self.iterations.len())?;
        writeln!(out, "  Successful steps            {}", self.num_successful_steps)?;
        writeln!(out, "  Unsuccessful steps          {}", self.num_unsuccessful_steps)?;
        writeln!(out, "  Inner iteration steps       {}", self.num_inner_iteration_steps)?;
        if self.minimizer_type == MinimizerType::LineSearch {
            writeln!(out, "  Line search steps           {}", self.num_line_search_steps)?;
        }
        writeln!(out)?;

        writeln!(out, "Time (in seconds):")?;
        writeln!(
            out,
            "  Preprocessor                {:.6}",
            self.preprocessor_time.as_secs_f64()
        )?;
        writeln!(
            out,
            "  Residual evaluation         {:.6} ({})",
            self.residual_evaluation_time.as_secs_f64(),
            self.num_residual_evaluations
        )?;
        writeln!(
            out,
            "  Jacobian evaluation         {:.6} ({})",
            self.jacobian_evaluation_time.as_secs_f64(),
            self.num_jacobian_evaluations
        )?;
        writeln!(
            out,
            "  Minimizer                   {:.6}",
            self.minimizer_time.as_secs_f64()
        )?;
        writeln!(out, "  Total                       {:.6}", self.total_time.as_secs_f64())?;
        writeln!(out)?;

        writeln!(
            out,
            "Termination:                  {} ({})",
            self.termination_type, self.message
        )?;
        Ok(())
    }
}

impl Debug for SolverSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.brief_report())
    }
}

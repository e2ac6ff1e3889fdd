//! Drives cost functions on behalf of the minimizer.
//!
//! The evaluator flattens a [`Problem`] into the vector form the minimizer works with:
//!
//! - `x`: the values of every non-constant parameter block that some residual block reads,
//!   stacked in registration order
//! - `r(x)`: the residuals of every residual block that reads at least one such block
//! - `J(x)`: the sparse Jacobian `∂r/∂x`, whose sparsity pattern is computed once
//!
//! Residual blocks whose parameter blocks are all constant never change during a solve.
//! They are evaluated once into the fixed cost and are otherwise left out.
//!
//! To evaluate at a point the evaluator first writes it into the problem's parameter
//! blocks, then calls each residual block against that shared storage. Residual blocks are
//! evaluated on a rayon pool when more than one thread is configured.
//!
//! A callback returning `false`, or producing a non-finite value, makes the whole evaluation
//! fail. This is reported as `None`, never as an error: the minimizer treats it as a
//! rejected step.

use std::{ops::Mul, ops::Range};

use faer::{
    Mat,
    sparse::{Argsort, Pair, SparseColMat, SymbolicSparseColMat},
};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::debug;
use web_time::{Duration, Instant};

use crate::core::{
    CoreError, CoreResult, gradient_checker::GradientChecker, problem::Problem,
    residual_block::ResidualBlockId,
};

/// Sparsity pattern of the Jacobian and the permutation from evaluation order to storage
/// order. Computed once per solve.
pub struct SymbolicStructure {
    pub pattern: SymbolicSparseColMat<usize>,
    pub order: Argsort<usize>,
}

/// Residuals and Jacobian at one point, with the loss already applied.
pub struct Linearization {
    /// `½ Σ ρ(||r_i||²)` over the evaluated residual blocks
    pub cost: f64,
    /// Corrected residuals, `num_residuals × 1`
    pub residuals: Mat<f64>,
    /// Corrected Jacobian, `num_residuals × num_parameters`
    pub jacobian: SparseColMat<usize, f64>,
    /// `Jᵀ r`, the gradient of the cost
    pub gradient: Mat<f64>,
}

/// Evaluation counters and timings collected over a solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationCounters {
    pub num_residual_evaluations: usize,
    pub num_jacobian_evaluations: usize,
    pub residual_evaluation_time: Duration,
    pub jacobian_evaluation_time: Duration,
}

/// Where each piece of the problem lands in the flattened vectors.
struct Program {
    /// Residual blocks with at least one variable parameter block
    active_residual_blocks: Vec<usize>,
    /// Residual blocks reading only constant parameter blocks
    fixed_residual_blocks: Vec<usize>,
    /// Parameter block indices in `x` order
    variable_blocks: Vec<usize>,
    /// Per parameter block, its first column in `x` if variable
    column_offsets: Vec<Option<usize>>,
    /// Per residual block, its first row in `r` if active
    row_offsets: Vec<Option<usize>>,
    num_residuals: usize,
    num_parameters: usize,
}

impl Program {
    fn new(problem: &Problem) -> Self {
        let parameter_blocks = problem.parameter_blocks();
        let residual_blocks = problem.residual_blocks();

        let mut used = vec![false; parameter_blocks.len()];
        let mut active_residual_blocks = Vec::new();
        let mut fixed_residual_blocks = Vec::new();
        for (index, residual_block) in residual_blocks.iter().enumerate() {
            let mut active = false;
            for id in residual_block.parameter_blocks() {
                if !parameter_blocks[id.index].is_constant() {
                    used[id.index] = true;
                    active = true;
                }
            }
            if active {
                active_residual_blocks.push(index);
            } else {
                fixed_residual_blocks.push(index);
            }
        }

        let mut variable_blocks = Vec::new();
        let mut column_offsets = vec![None; parameter_blocks.len()];
        let mut num_parameters = 0;
        for (index, block) in parameter_blocks.iter().enumerate() {
            if used[index] {
                variable_blocks.push(index);
                column_offsets[index] = Some(num_parameters);
                num_parameters += block.size();
            }
        }

        let mut row_offsets = vec![None; residual_blocks.len()];
        let mut num_residuals = 0;
        for &index in &active_residual_blocks {
            row_offsets[index] = Some(num_residuals);
            num_residuals += residual_blocks[index].num_residuals();
        }

        Self {
            active_residual_blocks,
            fixed_residual_blocks,
            variable_blocks,
            column_offsets,
            row_offsets,
            num_residuals,
            num_parameters,
        }
    }

    /// Every structurally non-zero Jacobian entry, in the order block evaluation emits them:
    /// residual block, then parameter block, then row-major within the block.
    fn build_symbolic_structure(&self, problem: &Problem) -> CoreResult<SymbolicStructure> {
        let mut indices = Vec::<Pair<usize, usize>>::new();
        let residual_blocks = problem.residual_blocks();

        for &index in &self.active_residual_blocks {
            let residual_block = &residual_blocks[index];
            let row_start = self.row_offsets[index].unwrap_or_default();
            for id in residual_block.parameter_blocks() {
                let Some(col_start) = self.column_offsets[id.index] else {
                    continue;
                };
                let size = problem.parameter_blocks()[id.index].size();
                for row in 0..residual_block.num_residuals() {
                    for col in 0..size {
                        indices.push(Pair::new(row_start + row, col_start + col));
                    }
                }
            }
        }

        let (pattern, order) = SymbolicSparseColMat::try_new_from_indices(
            self.num_residuals,
            self.num_parameters,
            &indices,
        )
        .map_err(|e| {
            CoreError::SymbolicStructure(
                "Failed to build symbolic sparse Jacobian structure".to_string(),
            )
            .log_with_source(e)
        })?;

        Ok(SymbolicStructure { pattern, order })
    }
}

/// Output of one residual block evaluation.
struct BlockEvaluation {
    cost: f64,
    residuals: Vec<f64>,
    jacobian_values: Vec<f64>,
}

enum BlockFailure {
    Callback,
    GradientMismatch(String),
}

pub struct Evaluator<'a> {
    problem: &'a mut Problem,
    program: Program,
    structure: SymbolicStructure,
    gradient_checker: Option<GradientChecker>,
    gradient_check_failure: Option<String>,
    #[cfg(feature = "parallel")]
    thread_pool: Option<rayon::ThreadPool>,
    num_threads: usize,
    counters: EvaluationCounters,
}

impl<'a> Evaluator<'a> {
    /// Prepare `problem` for evaluation with up to `num_threads` worker threads.
    ///
    /// # Errors
    ///
    /// `CoreError::SymbolicStructure` if the Jacobian pattern cannot be built and
    /// `CoreError::ParallelComputation` if the thread pool cannot be created.
    pub fn new(
        problem: &'a mut Problem,
        num_threads: usize,
        gradient_checker: Option<GradientChecker>,
    ) -> CoreResult<Self> {
        let program = Program::new(problem);
        let structure = program.build_symbolic_structure(problem)?;

        #[cfg(feature = "parallel")]
        let (thread_pool, num_threads) = if num_threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .map_err(|e| {
                    CoreError::ParallelComputation(format!(
                        "Failed to build a pool of {num_threads} threads"
                    ))
                    .log_with_source(e)
                })?;
            (Some(pool), num_threads)
        } else {
            (None, 1)
        };
        #[cfg(not(feature = "parallel"))]
        let num_threads = {
            let _ = num_threads;
            1
        };

        debug!(
            "Evaluator: {} parameters in {} blocks, {} residuals in {} blocks \
             ({} fixed), {} threads",
            program.num_parameters,
            program.variable_blocks.len(),
            program.num_residuals,
            program.active_residual_blocks.len(),
            program.fixed_residual_blocks.len(),
            num_threads
        );

        Ok(Self {
            problem,
            program,
            structure,
            gradient_checker,
            gradient_check_failure: None,
            #[cfg(feature = "parallel")]
            thread_pool,
            num_threads,
            counters: EvaluationCounters::default(),
        })
    }

    pub fn num_parameters(&self) -> usize {
        self.program.num_parameters
    }

    pub fn num_residuals(&self) -> usize {
        self.program.num_residuals
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.program.variable_blocks.len()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.program.active_residual_blocks.len()
    }

    pub fn num_threads_used(&self) -> usize {
        self.num_threads
    }

    pub fn counters(&self) -> EvaluationCounters {
        self.counters
    }

    pub fn problem(&self) -> &Problem {
        &*self.problem
    }

    pub fn symbolic_structure(&self) -> &SymbolicStructure {
        &self.structure
    }

    /// Message from the gradient checker if the last Jacobian evaluation failed a check.
    pub fn gradient_check_failure(&self) -> Option<&str> {
        self.gradient_check_failure.as_deref()
    }

    /// Rows of `id` in the residual vector, or `None` if the block is fixed or foreign.
    pub fn residual_rows(&self, id: ResidualBlockId) -> Option<Range<usize>> {
        if !self.problem.contains_residual_block(id) {
            return None;
        }
        let start = self.program.row_offsets[id.index]?;
        let len = self.problem.residual_blocks()[id.index].num_residuals();
        Some(start..start + len)
    }

    /// Current values of the variable parameter blocks, stacked.
    pub fn parameters(&self) -> Mat<f64> {
        let mut x = Mat::zeros(self.program.num_parameters, 1);
        let blocks = self.problem.parameter_blocks();
        for &index in &self.program.variable_blocks {
            let offset = self.program.column_offsets[index].unwrap_or_default();
            for (i, &value) in blocks[index].values().iter().enumerate() {
                x[(offset + i, 0)] = value;
            }
        }
        x
    }

    /// Write `x` into the problem's parameter blocks.
    pub fn write_parameters(&mut self, x: &Mat<f64>) {
        let Program {
            variable_blocks,
            column_offsets,
            ..
        } = &self.program;
        let blocks = self.problem.parameter_blocks_mut();
        for &index in variable_blocks {
            let offset = column_offsets[index].unwrap_or_default();
            for (i, value) in blocks[index].values_mut().iter_mut().enumerate() {
                *value = x[(offset + i, 0)];
            }
        }
    }

    /// Project `x` onto the bounds of the parameter blocks, in place.
    pub fn project(&self, x: &mut Mat<f64>) {
        let blocks = self.problem.parameter_blocks();
        for &index in &self.program.variable_blocks {
            let block = &blocks[index];
            if !block.is_bounded() {
                continue;
            }
            let offset = self.program.column_offsets[index].unwrap_or_default();
            let mut point: Vec<f64> = (0..block.size()).map(|i| x[(offset + i, 0)]).collect();
            block.project(&mut point);
            for (i, value) in point.into_iter().enumerate() {
                x[(offset + i, 0)] = value;
            }
        }
    }

    /// `x + delta`, projected onto the bounds.
    pub fn plus(&self, x: &Mat<f64>, delta: &Mat<f64>) -> Mat<f64> {
        let mut candidate = x + delta;
        self.project(&mut candidate);
        candidate
    }

    /// Max-norm of `x − P(x − g)`, the gradient measure used for convergence under bounds.
    pub fn projected_gradient_max_norm(&self, x: &Mat<f64>, gradient: &Mat<f64>) -> f64 {
        let mut moved = x - gradient;
        self.project(&mut moved);
        (0..x.nrows())
            .map(|i| (x[(i, 0)] - moved[(i, 0)]).abs())
            .fold(0.0, f64::max)
    }

    /// Cost of the residual blocks that read only constant parameter blocks.
    pub fn fixed_cost(&self) -> Option<f64> {
        let problem = &*self.problem;
        self.program
            .fixed_residual_blocks
            .iter()
            .map(|&index| {
                let residual_block = &problem.residual_blocks()[index];
                let parameters = problem.parameters_of(residual_block);
                let mut residuals = vec![0.0; residual_block.num_residuals()];
                residual_block.evaluate(&parameters, &mut residuals, None)
            })
            .try_fold(0.0, |total, cost| cost.map(|cost| total + cost))
    }

    /// Cost at `x`, or `None` if any callback failed.
    pub fn cost(&mut self, x: &Mat<f64>) -> Option<f64> {
        let start = Instant::now();
        self.write_parameters(x);
        let results = self.map_active_blocks(false);
        self.counters.num_residual_evaluations += 1;
        self.counters.residual_evaluation_time += start.elapsed();

        results
            .into_iter()
            .map(|result| result.ok().map(|block| block.cost))
            .sum()
    }

    /// Residuals, Jacobian and gradient at `x`.
    ///
    /// Returns `Ok(None)` if a callback failed or the gradient check rejected a Jacobian; in
    /// the latter case [`gradient_check_failure`](Self::gradient_check_failure) says why.
    pub fn linearize(&mut self, x: &Mat<f64>) -> CoreResult<Option<Linearization>> {
        let start = Instant::now();
        self.write_parameters(x);
        let results = self.map_active_blocks(true);
        self.counters.num_residual_evaluations += 1;
        self.counters.num_jacobian_evaluations += 1;

        let mut cost = 0.0;
        let mut residuals = Mat::zeros(self.program.num_residuals, 1);
        let mut jacobian_values = Vec::with_capacity(self.structure.pattern.compute_nnz());
        let mut row = 0;
        for result in results {
            match result {
                Ok(block) => {
                    cost += block.cost;
                    for value in block.residuals {
                        residuals[(row, 0)] = value;
                        row += 1;
                    }
                    jacobian_values.extend(block.jacobian_values);
                }
                Err(BlockFailure::Callback) => {
                    self.counters.jacobian_evaluation_time += start.elapsed();
                    return Ok(None);
                }
                Err(BlockFailure::GradientMismatch(message)) => {
                    self.gradient_check_failure = Some(message);
                    self.counters.jacobian_evaluation_time += start.elapsed();
                    return Ok(None);
                }
            }
        }

        let jacobian = SparseColMat::new_from_argsort(
            self.structure.pattern.clone(),
            &self.structure.order,
            jacobian_values.as_slice(),
        )
        .map_err(|e| {
            CoreError::SymbolicStructure(
                "Failed to create sparse Jacobian from argsort".to_string(),
            )
            .log_with_source(e)
        })?;
        let gradient = jacobian.as_ref().transpose().mul(&residuals);
        self.counters.jacobian_evaluation_time += start.elapsed();

        Ok(Some(Linearization {
            cost,
            residuals,
            jacobian,
            gradient,
        }))
    }

    /// Evaluate every active residual block at the values currently stored in the problem.
    fn map_active_blocks(
        &self,
        with_jacobian: bool,
    ) -> Vec<Result<BlockEvaluation, BlockFailure>> {
        let problem = &*self.problem;
        let program = &self.program;
        let checker = self.gradient_checker.as_ref();
        let evaluate = |&index: &usize| {
            evaluate_residual_block(problem, program, checker, index, with_jacobian)
        };

        #[cfg(feature = "parallel")]
        if let Some(pool) = &self.thread_pool {
            return pool.install(|| {
                program
                    .active_residual_blocks
                    .par_iter()
                    .map(&evaluate)
                    .collect()
            });
        }

        program.active_residual_blocks.iter().map(evaluate).collect()
    }
}

fn evaluate_residual_block(
    problem: &Problem,
    program: &Program,
    checker: Option<&GradientChecker>,
    index: usize,
    with_jacobian: bool,
) -> Result<BlockEvaluation, BlockFailure> {
    let residual_block = &problem.residual_blocks()[index];
    let parameters = problem.parameters_of(residual_block);
    let num_residuals = residual_block.num_residuals();
    let mut residuals = vec![0.0; num_residuals];

    if !with_jacobian {
        let cost = residual_block
            .evaluate(&parameters, &mut residuals, None)
            .ok_or(BlockFailure::Callback)?;
        return Ok(BlockEvaluation {
            cost,
            residuals,
            jacobian_values: Vec::new(),
        });
    }

    // Constant blocks get no Jacobian request
    let mut jacobians: Vec<Option<Vec<f64>>> = residual_block
        .parameter_blocks()
        .iter()
        .zip(&parameters)
        .map(|(id, values)| {
            program.column_offsets[id.index].map(|_| vec![0.0; num_residuals * values.len()])
        })
        .collect();

    let cost = {
        let mut slots: Vec<Option<&mut [f64]>> =
            jacobians.iter_mut().map(Option::as_deref_mut).collect();
        residual_block.evaluate(&parameters, &mut residuals, Some(slots.as_mut_slice()))
    }
    .ok_or(BlockFailure::Callback)?;

    if let Some(checker) = checker {
        checker
            .check(residual_block.cost_function(), &parameters, &jacobians)
            .map_err(|message| {
                BlockFailure::GradientMismatch(format!("Residual block {index}: {message}"))
            })?;
    }

    {
        let mut slots: Vec<Option<&mut [f64]>> =
            jacobians.iter_mut().map(Option::as_deref_mut).collect();
        residual_block.correct(&mut residuals, &mut slots);
    }

    Ok(BlockEvaluation {
        cost,
        residuals,
        jacobian_values: jacobians.into_iter().flatten().flatten().collect(),
    })
}

//! The problem registry: parameter blocks, residual blocks and the links between them.
//!
//! A `Problem` is the single owner of everything a solve works on:
//!
//! ```text
//! Parameter blocks:   p0 ------ p1 ------ p2
//!                      \        /  \      /
//! Residual blocks:       r0(p0,p1)  r1(p1,p2)
//! ```
//!
//! The objective is
//!
//! ```text
//! F(x) = ½ Σ_i ρ_i(||r_i(x)||²)
//! ```
//!
//! Parameter blocks live in an arena inside the problem and are addressed by
//! [`ParameterBlockId`]. Two residual blocks that name the same id read the same storage, so
//! an update made by the minimizer is seen identically by both on their next evaluation.
//! Residual blocks are addressed by [`ResidualBlockId`]. Neither kind of block can be
//! removed once added.
//!
//! The registry is mutated only while the problem is built. During a solve it is borrowed
//! mutably by the minimizer, which writes trial points into the parameter blocks between
//! evaluations.
//!
//! # Example
//!
//! ```
//! use apex_nlls::core::problem::Problem;
//! use apex_nlls::core::cost_function::CallbackCostFunction;
//! # use apex_nlls::core::CoreResult;
//! # fn example() -> CoreResult<()> {
//!
//! let mut problem = Problem::new();
//! let x = problem.add_parameter_block(vec![1.0, 2.0])?;
//!
//! // r = [x0 - 1, x1 - 3]
//! let cost = CallbackCostFunction::new(
//!     |p: &[&[f64]], r: &mut [f64], _j: Option<&mut [Option<&mut [f64]>]>| {
//!         r[0] = p[0][0] - 1.0;
//!         r[1] = p[0][1] - 3.0;
//!         true
//!     },
//!     2,
//!     vec![2],
//! )?;
//! problem.add_residual_block(Box::new(cost), None, &[x])?;
//!
//! assert_eq!(problem.num_residuals(), 2);
//! assert_eq!(problem.evaluate_cost(), Some(0.5));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::debug;

use crate::core::{
    CoreError, CoreResult,
    cost_function::CostFunction,
    loss_functions::LossFunction,
    parameter_block::{ParameterBlock, ParameterBlockId},
    residual_block::{ResidualBlock, ResidualBlockId},
};

/// Source of per-problem identities carried by every issued id.
static NEXT_PROBLEM_ID: AtomicU64 = AtomicU64::new(0);

pub struct Problem {
    id: u64,
    parameter_blocks: Vec<ParameterBlock>,
    residual_blocks: Vec<ResidualBlock>,
    num_residuals: usize,
}

impl Default for Problem {
    fn default() -> Self {
        Self::new()
    }
}

impl Problem {
    /// Create an empty problem.
    pub fn new() -> Self {
        Self {
            id: NEXT_PROBLEM_ID.fetch_add(1, Ordering::Relaxed),
            parameter_blocks: Vec::new(),
            residual_blocks: Vec::new(),
            num_residuals: 0,
        }
    }

    /// Store `values` as a new parameter block and return its id.
    ///
    /// # Errors
    ///
    /// `CoreError::InvalidInput` if `values` is empty.
    pub fn add_parameter_block(
        &mut self,
        values: impl Into<Vec<f64>>,
    ) -> CoreResult<ParameterBlockId> {
        let block = ParameterBlock::new(values)?;
        self.parameter_blocks.push(block);
        Ok(ParameterBlockId {
            problem: self.id,
            index: self.parameter_blocks.len() - 1,
        })
    }

    /// Register a residual block reading `parameter_blocks`, in the order the cost function
    /// declares them. `loss_function = None` is plain least squares.
    ///
    /// The same parameter block may be shared by any number of residual blocks.
    ///
    /// # Errors
    ///
    /// `CoreError::StructuralMismatch` if:
    /// - the number of ids differs from the number of declared block sizes
    /// - an id belongs to another problem or is out of range
    /// - a block is listed twice
    /// - a declared size differs from the stored block's size
    ///
    /// Nothing is registered when an error is returned.
    pub fn add_residual_block(
        &mut self,
        cost_function: Box<dyn CostFunction>,
        loss_function: Option<Box<dyn LossFunction>>,
        parameter_blocks: &[ParameterBlockId],
    ) -> CoreResult<ResidualBlockId> {
        let sizes = cost_function.parameter_block_sizes();
        if sizes.len() != parameter_blocks.len() {
            return Err(CoreError::StructuralMismatch(format!(
                "cost function declares {} parameter blocks but {} were given",
                sizes.len(),
                parameter_blocks.len()
            ))
            .log());
        }

        let mut seen = HashSet::with_capacity(parameter_blocks.len());
        for (position, (&id, &declared_size)) in parameter_blocks.iter().zip(sizes).enumerate() {
            let block = self.parameter_block(id)?;
            if !seen.insert(id) {
                return Err(CoreError::StructuralMismatch(format!(
                    "{id} appears more than once in the same residual block"
                ))
                .log());
            }
            if block.size() != declared_size {
                return Err(CoreError::StructuralMismatch(format!(
                    "cost function declares size {declared_size} for parameter {position}, \
                     but {id} has size {}",
                    block.size()
                ))
                .log());
            }
        }

        self.num_residuals += cost_function.num_residuals();
        self.residual_blocks.push(ResidualBlock::new(
            cost_function,
            loss_function,
            parameter_blocks.to_vec(),
        ));
        let id = ResidualBlockId {
            problem: self.id,
            index: self.residual_blocks.len() - 1,
        };
        debug!("Added {} with {} parameter blocks", id, parameter_blocks.len());
        Ok(id)
    }

    fn check_parameter_block_id(&self, id: ParameterBlockId) -> CoreResult<usize> {
        if id.problem != self.id {
            return Err(
                CoreError::StructuralMismatch(format!("{id} belongs to another problem")).log(),
            );
        }
        if id.index >= self.parameter_blocks.len() {
            return Err(CoreError::StructuralMismatch(format!(
                "{id} is out of range ({} parameter blocks)",
                self.parameter_blocks.len()
            ))
            .log());
        }
        Ok(id.index)
    }

    pub fn parameter_block(&self, id: ParameterBlockId) -> CoreResult<&ParameterBlock> {
        let index = self.check_parameter_block_id(id)?;
        Ok(&self.parameter_blocks[index])
    }

    pub fn parameter_block_mut(
        &mut self,
        id: ParameterBlockId,
    ) -> CoreResult<&mut ParameterBlock> {
        let index = self.check_parameter_block_id(id)?;
        Ok(&mut self.parameter_blocks[index])
    }

    pub fn parameter_block_values(&self, id: ParameterBlockId) -> CoreResult<&[f64]> {
        Ok(self.parameter_block(id)?.values())
    }

    pub fn set_parameter_block_values(
        &mut self,
        id: ParameterBlockId,
        values: &[f64],
    ) -> CoreResult<()> {
        self.parameter_block_mut(id)?.set_values(values)
    }

    pub fn set_parameter_block_constant(&mut self, id: ParameterBlockId) -> CoreResult<()> {
        self.parameter_block_mut(id)?.set_constant(true);
        Ok(())
    }

    pub fn set_parameter_block_variable(&mut self, id: ParameterBlockId) -> CoreResult<()> {
        self.parameter_block_mut(id)?.set_constant(false);
        Ok(())
    }

    pub fn is_parameter_block_constant(&self, id: ParameterBlockId) -> CoreResult<bool> {
        Ok(self.parameter_block(id)?.is_constant())
    }

    pub fn set_parameter_lower_bound(
        &mut self,
        id: ParameterBlockId,
        index: usize,
        value: f64,
    ) -> CoreResult<()> {
        self.parameter_block_mut(id)?.set_lower_bound(index, value)
    }

    pub fn set_parameter_upper_bound(
        &mut self,
        id: ParameterBlockId,
        index: usize,
        value: f64,
    ) -> CoreResult<()> {
        self.parameter_block_mut(id)?.set_upper_bound(index, value)
    }

    pub fn parameter_lower_bound(&self, id: ParameterBlockId, index: usize) -> CoreResult<f64> {
        self.parameter_block(id)?.lower_bound(index)
    }

    pub fn parameter_upper_bound(&self, id: ParameterBlockId, index: usize) -> CoreResult<f64> {
        self.parameter_block(id)?.upper_bound(index)
    }

    pub fn residual_block(&self, id: ResidualBlockId) -> CoreResult<&ResidualBlock> {
        if !self.contains_residual_block(id) {
            return Err(CoreError::StructuralMismatch(format!(
                "{id} is not registered in this problem"
            ))
            .log());
        }
        Ok(&self.residual_blocks[id.index])
    }

    /// True if `id` was issued by this problem.
    pub fn contains_residual_block(&self, id: ResidualBlockId) -> bool {
        id.problem == self.id && id.index < self.residual_blocks.len()
    }

    pub fn residual_block_ids(&self) -> Vec<ResidualBlockId> {
        (0..self.residual_blocks.len())
            .map(|index| ResidualBlockId {
                problem: self.id,
                index,
            })
            .collect()
    }

    pub fn parameter_block_ids(&self) -> Vec<ParameterBlockId> {
        (0..self.parameter_blocks.len())
            .map(|index| ParameterBlockId {
                problem: self.id,
                index,
            })
            .collect()
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.parameter_blocks.len()
    }

    /// Total number of scalar parameters over all blocks.
    pub fn num_parameters(&self) -> usize {
        self.parameter_blocks.iter().map(ParameterBlock::size).sum()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    /// Total number of scalar residuals over all blocks.
    pub fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    /// True if any non-constant parameter block has a finite bound.
    pub fn has_bounds(&self) -> bool {
        self.parameter_blocks
            .iter()
            .any(|block| !block.is_constant() && block.is_bounded())
    }

    /// Evaluate `½ Σ ρ(||r||²)` at the current parameter values.
    ///
    /// Returns `None` if any cost function fails.
    pub fn evaluate_cost(&self) -> Option<f64> {
        self.residual_blocks
            .iter()
            .map(|residual_block| {
                let parameters = self.parameters_of(residual_block);
                let mut residuals = vec![0.0; residual_block.num_residuals()];
                residual_block.evaluate(&parameters, &mut residuals, None)
            })
            .sum()
    }

    /// Value slices of the blocks read by `residual_block`, in declaration order.
    pub(crate) fn parameters_of(&self, residual_block: &ResidualBlock) -> Vec<&[f64]> {
        residual_block
            .parameter_blocks()
            .iter()
            .map(|id| self.parameter_blocks[id.index].values())
            .collect()
    }

    pub(crate) fn parameter_blocks(&self) -> &[ParameterBlock] {
        &self.parameter_blocks
    }

    pub(crate) fn parameter_blocks_mut(&mut self) -> &mut [ParameterBlock] {
        &mut self.parameter_blocks
    }

    pub(crate) fn residual_blocks(&self) -> &[ResidualBlock] {
        &self.residual_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cost_function::CallbackCostFunction;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// r_k = Σ of all parameters, one residual
    fn summing_cost(sizes: Vec<usize>) -> CoreResult<Box<dyn CostFunction>> {
        Ok(Box::new(CallbackCostFunction::new(
            |parameters: &[&[f64]],
             residuals: &mut [f64],
             _jacobians: Option<&mut [Option<&mut [f64]>]>| {
                residuals[0] = parameters.iter().flat_map(|p| p.iter()).sum();
                true
            },
            1,
            sizes,
        )?))
    }

    #[test]
    fn test_block_count_mismatch_rejected() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(vec![1.0])?;
        let result = problem.add_residual_block(summing_cost(vec![1, 1])?, None, &[a]);
        assert!(matches!(result, Err(CoreError::StructuralMismatch(_))));
        assert_eq!(problem.num_residual_blocks(), 0);
        assert_eq!(problem.num_residuals(), 0);
        Ok(())
    }

    #[test]
    fn test_size_mismatch_rejected() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(vec![1.0, 2.0])?;
        let result = problem.add_residual_block(summing_cost(vec![3])?, None, &[a]);
        assert!(matches!(result, Err(CoreError::StructuralMismatch(_))));
        Ok(())
    }

    #[test]
    fn test_duplicate_block_in_one_residual_rejected() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(vec![1.0])?;
        let result = problem.add_residual_block(summing_cost(vec![1, 1])?, None, &[a, a]);
        assert!(matches!(result, Err(CoreError::StructuralMismatch(_))));
        Ok(())
    }

    #[test]
    fn test_foreign_parameter_block_rejected() -> TestResult {
        let mut other = Problem::new();
        let foreign = other.add_parameter_block(vec![1.0])?;

        let mut problem = Problem::new();
        let result = problem.add_residual_block(summing_cost(vec![1])?, None, &[foreign]);
        assert!(matches!(result, Err(CoreError::StructuralMismatch(_))));
        Ok(())
    }

    #[test]
    fn test_shared_parameter_block_is_accepted() -> TestResult {
        let mut problem = Problem::new();
        let shared = problem.add_parameter_block(vec![2.0])?;
        let other = problem.add_parameter_block(vec![1.0, 1.0])?;

        let first = problem.add_residual_block(summing_cost(vec![1])?, None, &[shared])?;
        let second =
            problem.add_residual_block(summing_cost(vec![2, 1])?, None, &[other, shared])?;

        assert_ne!(first, second);
        assert_eq!(problem.num_residual_blocks(), 2);
        assert_eq!(problem.num_parameters(), 3);
        // ½(2²) + ½(4²)
        assert_eq!(problem.evaluate_cost(), Some(10.0));

        // Both blocks see the update through the shared storage
        problem.set_parameter_block_values(shared, &[0.0])?;
        assert_eq!(problem.evaluate_cost(), Some(2.0));
        Ok(())
    }

    #[test]
    fn test_residual_block_ids_are_problem_scoped() -> TestResult {
        let mut first = Problem::new();
        let a = first.add_parameter_block(vec![0.0])?;
        let id = first.add_residual_block(summing_cost(vec![1])?, None, &[a])?;

        let mut second = Problem::new();
        let b = second.add_parameter_block(vec![0.0])?;
        second.add_residual_block(summing_cost(vec![1])?, None, &[b])?;

        assert!(first.contains_residual_block(id));
        assert!(!second.contains_residual_block(id));
        assert!(second.residual_block(id).is_err());
        assert_eq!(first.residual_block_ids(), vec![id]);
        Ok(())
    }

    #[test]
    fn test_constant_and_bounds_accessors() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(vec![0.5, 0.5])?;
        assert!(!problem.is_parameter_block_constant(a)?);
        problem.set_parameter_block_constant(a)?;
        assert!(problem.is_parameter_block_constant(a)?);
        problem.set_parameter_block_variable(a)?;

        problem.set_parameter_upper_bound(a, 1, 2.0)?;
        assert_eq!(problem.parameter_upper_bound(a, 1)?, 2.0);
        assert_eq!(problem.parameter_lower_bound(a, 1)?, f64::NEG_INFINITY);
        assert!(problem.has_bounds());

        problem.set_parameter_block_constant(a)?;
        assert!(!problem.has_bounds());
        Ok(())
    }

    #[test]
    fn test_failed_callback_yields_no_cost() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(vec![0.0])?;
        let failing = CallbackCostFunction::new(
            |_: &[&[f64]], _: &mut [f64], _: Option<&mut [Option<&mut [f64]>]>| false,
            1,
            vec![1],
        )?;
        problem.add_residual_block(Box::new(failing), None, &[a])?;
        assert_eq!(problem.evaluate_cost(), None);
        Ok(())
    }
}

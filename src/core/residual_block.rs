//! Residual blocks: one cost function, its optional loss and the parameter blocks it reads.
//!
//! A residual block owns its [`CostFunction`] and [`LossFunction`] exclusively once it has
//! been added to a [`Problem`](crate::core::problem::Problem). Callers keep a
//! [`ResidualBlockId`], a plain value that can be copied freely and compared, to refer to
//! the block later (for example in the subset preconditioner option).
//!
//! # Evaluation
//!
//! Evaluating a block runs the cost function, rejects non-finite output, and returns the
//! block's contribution to the objective:
//!
//! ```text
//! cost = ½ ρ(||r||²)      (½ ||r||² without a loss function)
//! ```
//!
//! Before the residuals and Jacobians are handed to a linear solver they are passed through
//! [`ResidualBlock::correct`], which applies the loss with a [`Corrector`].

use std::fmt;

use crate::core::{
    corrector::Corrector, cost_function::CostFunction, loss_functions::LossFunction,
    parameter_block::ParameterBlockId,
};

/// Stable handle to a residual block inside one problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResidualBlockId {
    pub(crate) problem: u64,
    pub(crate) index: usize,
}

impl ResidualBlockId {
    /// Position of the block in its problem, in registration order.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for ResidualBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "residual block {} (problem {})", self.index, self.problem)
    }
}

pub struct ResidualBlock {
    cost_function: Box<dyn CostFunction>,
    /// `None` is plain least squares
    loss_function: Option<Box<dyn LossFunction>>,
    parameter_blocks: Vec<ParameterBlockId>,
}

impl ResidualBlock {
    /// Assemble a block. Structural checks are done by the problem before this is called.
    pub(crate) fn new(
        cost_function: Box<dyn CostFunction>,
        loss_function: Option<Box<dyn LossFunction>>,
        parameter_blocks: Vec<ParameterBlockId>,
    ) -> Self {
        Self {
            cost_function,
            loss_function,
            parameter_blocks,
        }
    }

    pub fn cost_function(&self) -> &dyn CostFunction {
        self.cost_function.as_ref()
    }

    pub fn loss_function(&self) -> Option<&dyn LossFunction> {
        self.loss_function.as_deref()
    }

    pub fn parameter_blocks(&self) -> &[ParameterBlockId] {
        &self.parameter_blocks
    }

    pub fn num_residuals(&self) -> usize {
        self.cost_function.num_residuals()
    }

    /// Run the cost function and return this block's cost, or `None` if the callback failed
    /// or produced non-finite residuals or Jacobian entries.
    ///
    /// Residuals and Jacobians are left uncorrected.
    pub fn evaluate(
        &self,
        parameters: &[&[f64]],
        residuals: &mut [f64],
        mut jacobians: Option<&mut [Option<&mut [f64]>]>,
    ) -> Option<f64> {
        if !self
            .cost_function
            .evaluate(parameters, residuals, jacobians.as_deref_mut())
        {
            return None;
        }
        if !residuals.iter().all(|r| r.is_finite()) {
            return None;
        }
        if let Some(jacobians) = jacobians
            && !jacobians
                .iter()
                .flatten()
                .all(|jacobian| jacobian.iter().all(|j| j.is_finite()))
        {
            return None;
        }
        Some(self.cost(residuals))
    }

    /// `½ ρ(||r||²)` for uncorrected `residuals`.
    pub fn cost(&self, residuals: &[f64]) -> f64 {
        let sq_norm: f64 = residuals.iter().map(|r| r * r).sum();
        match &self.loss_function {
            Some(loss) => 0.5 * loss.evaluate(sq_norm)[0],
            None => 0.5 * sq_norm,
        }
    }

    /// Apply the loss to freshly evaluated residuals and Jacobians, in place.
    ///
    /// Each Jacobian slot is row-major with `residuals.len()` rows.
    pub fn correct(&self, residuals: &mut [f64], jacobians: &mut [Option<&mut [f64]>]) {
        let Some(loss) = &self.loss_function else {
            return;
        };
        let sq_norm: f64 = residuals.iter().map(|r| r * r).sum();
        let corrector = Corrector::new(loss.as_ref(), sq_norm);
        let num_residuals = residuals.len();
        for jacobian in jacobians.iter_mut().flatten() {
            let num_cols = jacobian.len() / num_residuals;
            corrector.correct_jacobian(residuals, num_cols, jacobian);
        }
        corrector.correct_residuals(residuals);
    }
}

impl fmt::Debug for ResidualBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResidualBlock")
            .field("num_residuals", &self.num_residuals())
            .field("parameter_blocks", &self.parameter_blocks)
            .field("has_loss_function", &self.loss_function.is_some())
            .finish()
    }
}

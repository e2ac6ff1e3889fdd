//! Cost functions: the residual callback contract between the caller and the minimizer.
//!
//! A cost function declares how many residuals it produces and the size of every parameter
//! block it reads. Both are fixed at construction; the minimizer sizes its buffers from them
//! once and relies on them never changing.
//!
//! # Buffer layout
//!
//! On each call the minimizer hands over:
//! - `parameters`: one slice per parameter block, in registration order
//! - `residuals`: a contiguous buffer of `num_residuals` values
//! - `jacobians`: `None` when no derivatives are needed, otherwise one slot per parameter
//!   block. A slot is `None` when that block's Jacobian is not requested (for example because
//!   the block is held constant). A requested slot is a row-major
//!   `num_residuals × parameter_block_sizes[i]` buffer:
//!
//! ```text
//! jacobians[i][r * parameter_block_sizes[i] + c] = ∂ residuals[r] / ∂ parameters[i][c]
//! ```
//!
//! Returning `false` tells the minimizer that the residuals could not be computed at this
//! point. The current trial step is rejected and the solve continues.
//!
//! # Example
//!
//! ```
//! use apex_nlls::core::cost_function::{CallbackCostFunction, CostFunction};
//! # use apex_nlls::core::CoreResult;
//! # fn example() -> CoreResult<()> {
//!
//! // r = 10 - x
//! let cost = CallbackCostFunction::new(
//!     |parameters: &[&[f64]],
//!      residuals: &mut [f64],
//!      jacobians: Option<&mut [Option<&mut [f64]>]>| {
//!         residuals[0] = 10.0 - parameters[0][0];
//!         if let Some(jacobians) = jacobians
//!             && let Some(jacobian) = jacobians[0].as_deref_mut()
//!         {
//!             jacobian[0] = -1.0;
//!         }
//!         true
//!     },
//!     1,
//!     vec![1],
//! )?;
//!
//! assert_eq!(cost.num_residuals(), 1);
//! assert_eq!(cost.parameter_block_sizes(), &[1]);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::fmt;

use crate::core::{CoreError, CoreResult};

/// Per-block Jacobian output buffers handed to [`CostFunction::evaluate`].
pub type JacobianBuffers<'a, 'b> = Option<&'a mut [Option<&'b mut [f64]>]>;

/// Boxed caller-supplied residual evaluator.
pub type CostEvaluator = Box<
    dyn Fn(&[&[f64]], &mut [f64], Option<&mut [Option<&mut [f64]>]>) -> bool + Send + Sync,
>;

/// Residual evaluation interface consumed by the minimizer.
///
/// Implementations must be callable concurrently from several worker threads and may be
/// invoked any number of times per solve, in any order. The buffers passed to `evaluate`
/// are only valid for the duration of the call.
pub trait CostFunction: Send + Sync {
    /// Number of residuals this function writes.
    fn num_residuals(&self) -> usize;

    /// Sizes of the parameter blocks this function reads, in order.
    fn parameter_block_sizes(&self) -> &[usize];

    /// Evaluate residuals and, when requested, Jacobians at `parameters`.
    ///
    /// Returns `false` if the point cannot be evaluated.
    fn evaluate(
        &self,
        parameters: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<&mut [f64]>]>,
    ) -> bool;
}

/// Adapter turning any closure with the evaluation signature into a [`CostFunction`].
///
/// The closure is owned exclusively by the adapter, and later by the residual block the
/// adapter is registered into. Buffers are forwarded untouched and the closure's return
/// value is relayed verbatim.
pub struct CallbackCostFunction {
    evaluator: CostEvaluator,
    num_residuals: usize,
    parameter_block_sizes: Vec<usize>,
}

impl CallbackCostFunction {
    /// Wrap `evaluator`, declaring its residual count and parameter block sizes.
    ///
    /// # Errors
    ///
    /// `CoreError::InvalidInput` if `num_residuals` is zero, no parameter blocks are
    /// declared, or any declared block size is zero.
    pub fn new<F>(
        evaluator: F,
        num_residuals: usize,
        parameter_block_sizes: impl Into<Vec<usize>>,
    ) -> CoreResult<Self>
    where
        F: Fn(&[&[f64]], &mut [f64], Option<&mut [Option<&mut [f64]>]>) -> bool
            + Send
            + Sync
            + 'static,
    {
        let parameter_block_sizes = parameter_block_sizes.into();
        if num_residuals == 0 {
            return Err(CoreError::InvalidInput(
                "cost function must declare at least one residual".to_string(),
            )
            .log());
        }
        if parameter_block_sizes.is_empty() {
            return Err(CoreError::InvalidInput(
                "cost function must declare at least one parameter block".to_string(),
            )
            .log());
        }
        if let Some(position) = parameter_block_sizes.iter().position(|&size| size == 0) {
            return Err(CoreError::InvalidInput(format!(
                "parameter block {position} of the cost function has size zero"
            ))
            .log());
        }

        Ok(Self {
            evaluator: Box::new(evaluator),
            num_residuals,
            parameter_block_sizes,
        })
    }
}

impl CostFunction for CallbackCostFunction {
    fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        &self.parameter_block_sizes
    }

    fn evaluate(
        &self,
        parameters: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<&mut [f64]>]>,
    ) -> bool {
        (self.evaluator)(parameters, residuals, jacobians)
    }
}

impl fmt::Debug for CallbackCostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackCostFunction")
            .field("num_residuals", &self.num_residuals)
            .field("parameter_block_sizes", &self.parameter_block_sizes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn linear_cost(num_residuals: usize, sizes: Vec<usize>) -> CoreResult<CallbackCostFunction> {
        CallbackCostFunction::new(
            move |parameters: &[&[f64]],
                  residuals: &mut [f64],
                  _jacobians: Option<&mut [Option<&mut [f64]>]>| {
                let total: f64 = parameters.iter().flat_map(|block| block.iter()).sum();
                residuals.iter_mut().for_each(|r| *r = total);
                true
            },
            num_residuals,
            sizes,
        )
    }

    #[test]
    fn test_sizes_are_reported_unchanged() -> TestResult {
        for (num_residuals, sizes) in [(1, vec![1]), (3, vec![2, 4]), (7, vec![1, 1, 5, 9])] {
            let cost = linear_cost(num_residuals, sizes.clone())?;
            assert_eq!(cost.num_residuals(), num_residuals);
            assert_eq!(cost.parameter_block_sizes(), sizes.as_slice());

            // Evaluations never change the declared sizes
            let blocks: Vec<Vec<f64>> = sizes.iter().map(|&s| vec![0.5; s]).collect();
            let views: Vec<&[f64]> = blocks.iter().map(Vec::as_slice).collect();
            let mut residuals = vec![0.0; num_residuals];
            assert!(cost.evaluate(&views, &mut residuals, None));
            assert_eq!(cost.num_residuals(), num_residuals);
            assert_eq!(cost.parameter_block_sizes(), sizes.as_slice());
        }
        Ok(())
    }

    #[test]
    fn test_rejects_degenerate_declarations() {
        assert!(matches!(
            linear_cost(0, vec![1]),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            linear_cost(1, vec![]),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            linear_cost(1, vec![2, 0]),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_forwards_jacobian_requests_and_result() -> TestResult {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let cost = CallbackCostFunction::new(
            move |parameters: &[&[f64]],
                  residuals: &mut [f64],
                  jacobians: Option<&mut [Option<&mut [f64]>]>| {
                seen.fetch_add(1, Ordering::SeqCst);
                residuals[0] = parameters[0][0] * parameters[1][1];
                residuals[1] = parameters[0][0] - parameters[1][0];
                if let Some(jacobians) = jacobians {
                    if let Some(jacobian) = jacobians[0].as_deref_mut() {
                        jacobian.copy_from_slice(&[parameters[1][1], 1.0]);
                    }
                    if let Some(jacobian) = jacobians[1].as_deref_mut() {
                        jacobian.copy_from_slice(&[0.0, parameters[0][0], -1.0, 0.0]);
                    }
                }
                parameters[0][0].is_finite()
            },
            2,
            vec![1, 2],
        )?;

        let a = [3.0];
        let b = [2.0, 5.0];
        let mut residuals = [0.0; 2];
        let mut jacobian_b = [0.0; 4];
        let mut slots: Vec<Option<&mut [f64]>> = vec![None, Some(&mut jacobian_b[..])];

        assert!(cost.evaluate(&[&a, &b], &mut residuals, Some(slots.as_mut_slice())));
        assert_eq!(residuals, [15.0, 1.0]);
        assert_eq!(jacobian_b, [0.0, 3.0, -1.0, 0.0]);

        // A failing evaluation is relayed verbatim
        let nan = [f64::NAN];
        assert!(!cost.evaluate(&[&nan, &b], &mut residuals, None));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }
}

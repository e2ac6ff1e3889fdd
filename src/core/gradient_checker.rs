//! Compares user-supplied Jacobians against central finite differences.
//!
//! Enabled through `SolverOptions::check_gradients`. Every time a residual block's Jacobians
//! are evaluated, each requested Jacobian column is recomputed numerically:
//!
//! ```text
//! J_num[:, c] = (r(x + h e_c) − r(x − h e_c)) / 2h,   h = step · |x_c|  (step when x_c = 0)
//! ```
//!
//! An entry fails when `|J − J_num| / max(|J|, |J_num|, 1)` exceeds the relative precision.
//! Entries smaller than one in magnitude are therefore compared in absolute terms.

use crate::core::cost_function::CostFunction;

#[derive(Debug, Clone, Copy)]
pub struct GradientChecker {
    relative_precision: f64,
    relative_step_size: f64,
}

impl GradientChecker {
    pub fn new(relative_precision: f64, relative_step_size: f64) -> Self {
        Self {
            relative_precision,
            relative_step_size,
        }
    }

    /// Check the analytic `jacobians` a cost function produced at `parameters`.
    ///
    /// Slots that are `None` (constant blocks) are skipped. On mismatch the error names the
    /// parameter block, row and column of the first offending entry.
    pub fn check(
        &self,
        cost_function: &dyn CostFunction,
        parameters: &[&[f64]],
        jacobians: &[Option<Vec<f64>>],
    ) -> Result<(), String> {
        let num_residuals = cost_function.num_residuals();
        let mut perturbed: Vec<Vec<f64>> = parameters.iter().map(|p| p.to_vec()).collect();
        let mut residuals_plus = vec![0.0; num_residuals];
        let mut residuals_minus = vec![0.0; num_residuals];

        for (block, analytic) in jacobians.iter().enumerate() {
            let Some(analytic) = analytic else {
                continue;
            };
            let size = parameters[block].len();

            for col in 0..size {
                let x = parameters[block][col];
                let h = if x == 0.0 {
                    self.relative_step_size
                } else {
                    self.relative_step_size * x.abs()
                };

                perturbed[block][col] = x + h;
                let ok_plus = evaluate_residuals(cost_function, &perturbed, &mut residuals_plus);
                perturbed[block][col] = x - h;
                let ok_minus = evaluate_residuals(cost_function, &perturbed, &mut residuals_minus);
                perturbed[block][col] = x;

                if !ok_plus || !ok_minus {
                    return Err(format!(
                        "numeric differentiation failed for parameter block {block}, \
                         coordinate {col}"
                    ));
                }

                for row in 0..num_residuals {
                    let numeric = (residuals_plus[row] - residuals_minus[row]) / (2.0 * h);
                    let user = analytic[row * size + col];
                    let scale = user.abs().max(numeric.abs()).max(1.0);
                    let relative_error = (user - numeric).abs() / scale;
                    if relative_error > self.relative_precision {
                        return Err(format!(
                            "Jacobian mismatch in parameter block {block} at row {row}, \
                             column {col}: user {user:e}, numeric {numeric:e}, \
                             relative error {relative_error:e} exceeds {:e}",
                            self.relative_precision
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn evaluate_residuals(
    cost_function: &dyn CostFunction,
    parameters: &[Vec<f64>],
    residuals: &mut [f64],
) -> bool {
    let views: Vec<&[f64]> = parameters.iter().map(Vec::as_slice).collect();
    cost_function.evaluate(&views, residuals, None) && residuals.iter().all(|r| r.is_finite())
}

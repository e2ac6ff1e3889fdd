//! One-dimensional curve fitting.
//!
//! [`CurveFitProblem1D`] fits the parameters `p` of a scalar model `y ≈ f(x; p)` to data
//! points `(x_i, y_i)`. Every parameter becomes its own one-element parameter block, so single
//! parameters can be held constant or bounded. All points share one residual block whose
//! residuals are `w_i (y_i − f(x_i; p))`, with `w_i` the optional inverse errors.
//!
//! ```
//! use apex_nlls::{core::curve_fit::CurveFitProblem1D, optimizer::SolverOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let x: Vec<f64> = (0..20).map(|i| i as f64 / 4.0).collect();
//! let y: Vec<f64> = x.iter().map(|x| 3.0 * x - 2.0).collect();
//!
//! let solution = CurveFitProblem1D::new(
//!     |x, p: &[f64], y: &mut f64, dy_dp: Option<&mut [f64]>| {
//!         *y = p[0] * x + p[1];
//!         if let Some(dy_dp) = dy_dp {
//!             dy_dp[0] = x;
//!             dy_dp[1] = 1.0;
//!         }
//!         true
//!     },
//!     &x,
//!     &y,
//!     &[1.0, 0.0],
//! )?
//! .solve(&SolverOptions::default())?;
//!
//! assert!((solution.parameters[0] - 3.0).abs() < 1e-6);
//! assert!((solution.parameters[1] + 2.0).abs() < 1e-6);
//! # Ok(())
//! # }
//! ```

use crate::{
    core::{
        CoreError, CoreResult,
        cost_function::CostFunction,
        loss_functions::LossFunction,
        parameter_block::ParameterBlockId,
        problem::Problem,
    },
    error::NllsResult,
    optimizer::{SolverOptions, SolverSummary, solve},
};

/// Model callback: `(x, parameters, y, dy_dp) -> success`.
///
/// `dy_dp`, when present, has one slot per parameter.
pub type CurveFunction =
    Box<dyn Fn(f64, &[f64], &mut f64, Option<&mut [f64]>) -> bool + Send + Sync>;

/// Weighted residuals of all data points against the model.
struct CurveCostFunction {
    func: CurveFunction,
    x: Vec<f64>,
    y: Vec<f64>,
    inverse_error: Option<Vec<f64>>,
    parameter_block_sizes: Vec<usize>,
}

impl CostFunction for CurveCostFunction {
    fn num_residuals(&self) -> usize {
        self.x.len()
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        &self.parameter_block_sizes
    }

    fn evaluate(
        &self,
        parameters: &[&[f64]],
        residuals: &mut [f64],
        mut jacobians: Option<&mut [Option<&mut [f64]>]>,
    ) -> bool {
        let values: Vec<f64> = parameters.iter().map(|block| block[0]).collect();
        let mut derivatives = jacobians.is_some().then(|| vec![0.0; values.len()]);

        for (i, (&x, &y)) in self.x.iter().zip(&self.y).enumerate() {
            let weight = self.inverse_error.as_ref().map_or(1.0, |w| w[i]);
            let mut model = 0.0;
            if !(self.func)(x, &values, &mut model, derivatives.as_deref_mut()) {
                return false;
            }
            residuals[i] = weight * (y - model);

            if let (Some(jacobians), Some(derivatives)) =
                (jacobians.as_deref_mut(), derivatives.as_deref())
            {
                for (slot, derivative) in jacobians.iter_mut().zip(derivatives) {
                    // Each block holds one parameter, so its Jacobian is a column
                    if let Some(column) = slot.as_deref_mut() {
                        column[i] = -weight * derivative;
                    }
                }
            }
        }
        true
    }
}

/// A curve fit ready to solve.
pub struct CurveFitProblem1D {
    problem: Problem,
    parameter_ids: Vec<ParameterBlockId>,
}

/// Fitted parameters and the summary of the solve that produced them.
#[derive(Debug)]
pub struct CurveFitSolution {
    pub parameters: Vec<f64>,
    pub summary: SolverSummary,
}

impl CurveFitProblem1D {
    /// Fit `func` to `(x, y)` starting from `initial`, without weights, loss or bounds.
    ///
    /// # Errors
    ///
    /// Same as [`CurveFitProblem1DBuilder::build`].
    pub fn new<F>(func: F, x: &[f64], y: &[f64], initial: &[f64]) -> CoreResult<Self>
    where
        F: Fn(f64, &[f64], &mut f64, Option<&mut [f64]>) -> bool + Send + Sync + 'static,
    {
        Self::builder()
            .func(func)
            .x(x)
            .y(y)
            .parameters(initial)
            .build()
    }

    pub fn builder() -> CurveFitProblem1DBuilder {
        CurveFitProblem1DBuilder::default()
    }

    /// The underlying problem, one parameter block per model parameter.
    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    /// Solve and collect the fitted parameters.
    ///
    /// # Errors
    ///
    /// Whatever [`solve`] returns for invalid options.
    pub fn solve(mut self, options: &SolverOptions) -> NllsResult<CurveFitSolution> {
        let summary = solve(options, &mut self.problem)?;
        let parameters = self
            .parameter_ids
            .iter()
            .map(|&id| -> CoreResult<f64> { Ok(self.problem.parameter_block_values(id)?[0]) })
            .collect::<CoreResult<Vec<f64>>>()?;
        Ok(CurveFitSolution {
            parameters,
            summary,
        })
    }
}

/// Builder for [`CurveFitProblem1D`].
///
/// `func`, `x`, `y` and `parameters` are required. Without `inverse_error` every point has
/// weight one; without `loss` the loss is trivial.
#[derive(Default)]
pub struct CurveFitProblem1DBuilder {
    func: Option<CurveFunction>,
    x: Option<Vec<f64>>,
    y: Option<Vec<f64>>,
    inverse_error: Option<Vec<f64>>,
    parameters: Option<Vec<f64>>,
    lower_bounds: Option<Vec<Option<f64>>>,
    upper_bounds: Option<Vec<Option<f64>>>,
    constant: Vec<usize>,
    loss: Option<Box<dyn LossFunction>>,
}

impl CurveFitProblem1DBuilder {
    pub fn func<F>(mut self, func: F) -> Self
    where
        F: Fn(f64, &[f64], &mut f64, Option<&mut [f64]>) -> bool + Send + Sync + 'static,
    {
        self.func = Some(Box::new(func));
        self
    }

    pub fn x(mut self, x: &[f64]) -> Self {
        self.x = Some(x.to_vec());
        self
    }

    pub fn y(mut self, y: &[f64]) -> Self {
        self.y = Some(y.to_vec());
        self
    }

    /// Per-point inverse errors (square roots of the weights), expected to be positive.
    pub fn inverse_error(mut self, inverse_error: &[f64]) -> Self {
        self.inverse_error = Some(inverse_error.to_vec());
        self
    }

    /// Initial guess, one value per model parameter.
    pub fn parameters(mut self, parameters: &[f64]) -> Self {
        self.parameters = Some(parameters.to_vec());
        self
    }

    /// Lower bound per parameter; `None` leaves a parameter unbounded below.
    pub fn lower_bounds(mut self, lower_bounds: &[Option<f64>]) -> Self {
        self.lower_bounds = Some(lower_bounds.to_vec());
        self
    }

    /// Upper bound per parameter; `None` leaves a parameter unbounded above.
    pub fn upper_bounds(mut self, upper_bounds: &[Option<f64>]) -> Self {
        self.upper_bounds = Some(upper_bounds.to_vec());
        self
    }

    /// Indices of parameters held at their initial value.
    pub fn constant(mut self, indices: &[usize]) -> Self {
        self.constant = indices.to_vec();
        self
    }

    pub fn loss(mut self, loss: impl LossFunction + 'static) -> Self {
        self.loss = Some(Box::new(loss));
        self
    }

    /// # Errors
    ///
    /// - `CoreError::InvalidInput` if the function, the data or the parameters are missing
    ///   or empty
    /// - `CoreError::StructuralMismatch` if `x`, `y` and the inverse errors differ in length
    /// - `CoreError::InvalidConstraint` if a bound vector does not have one entry per
    ///   parameter, or a bound is invalid
    /// - `CoreError::IndexOutOfBounds` for a constant index past the last parameter
    pub fn build(self) -> CoreResult<CurveFitProblem1D> {
        let func = self.func.ok_or_else(|| missing("curve function"))?;
        let x = self.x.ok_or_else(|| missing("x data"))?;
        let y = self.y.ok_or_else(|| missing("y data"))?;
        let initial = self
            .parameters
            .filter(|parameters| !parameters.is_empty())
            .ok_or_else(|| missing("initial parameters"))?;
        if x.is_empty() {
            return Err(missing("data points"));
        }
        if x.len() != y.len() {
            return Err(CoreError::StructuralMismatch(format!(
                "x has {} points but y has {}",
                x.len(),
                y.len()
            ))
            .log());
        }
        if let Some(inverse_error) = &self.inverse_error
            && inverse_error.len() != x.len()
        {
            return Err(CoreError::StructuralMismatch(format!(
                "{} inverse errors for {} data points",
                inverse_error.len(),
                x.len()
            ))
            .log());
        }
        for (name, bounds) in [("lower", &self.lower_bounds), ("upper", &self.upper_bounds)] {
            if let Some(bounds) = bounds
                && bounds.len() != initial.len()
            {
                return Err(CoreError::InvalidConstraint(format!(
                    "{} {name} bounds for {} parameters",
                    bounds.len(),
                    initial.len()
                ))
                .log());
            }
        }

        let mut problem = Problem::new();
        let parameter_ids = initial
            .iter()
            .map(|&value| problem.add_parameter_block(vec![value]))
            .collect::<CoreResult<Vec<_>>>()?;
        for (i, &id) in parameter_ids.iter().enumerate() {
            if let Some(Some(bound)) = self.lower_bounds.as_ref().map(|bounds| bounds[i]) {
                problem.set_parameter_lower_bound(id, 0, bound)?;
            }
            if let Some(Some(bound)) = self.upper_bounds.as_ref().map(|bounds| bounds[i]) {
                problem.set_parameter_upper_bound(id, 0, bound)?;
            }
        }
        for &index in &self.constant {
            let id = parameter_ids
                .get(index)
                .copied()
                .ok_or_else(|| {
                    CoreError::IndexOutOfBounds {
                        index,
                        len: parameter_ids.len(),
                    }
                    .log()
                })?;
            problem.set_parameter_block_constant(id)?;
        }

        let cost = CurveCostFunction {
            func,
            x,
            y,
            inverse_error: self.inverse_error,
            parameter_block_sizes: vec![1; parameter_ids.len()],
        };
        problem.add_residual_block(Box::new(cost), self.loss, &parameter_ids)?;

        Ok(CurveFitProblem1D {
            problem,
            parameter_ids,
        })
    }
}

fn missing(what: &str) -> CoreError {
    CoreError::InvalidInput(format!("curve fit is missing {what}")).log()
}

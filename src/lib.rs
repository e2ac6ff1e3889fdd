//! # Apex NLLS
//!
//! Nonlinear least squares with caller-supplied residual callbacks, in the manner of Ceres
//! Solver's problem API.
//!
//! A [`Problem`] owns parameter blocks (flat `f64` vectors, optionally bounded or held
//! constant) and residual blocks. Each residual block pairs a [`CostFunction`] with an
//! optional robust loss and the parameter blocks it reads. [`solve`] minimizes
//! `½ Σ ρ(‖r_i‖²)` in place and returns a [`SolverSummary`].
//!
//! ## Minimizers
//!
//! - **Trust region**: Levenberg-Marquardt or dogleg (traditional and subspace) steps, with
//!   optional nonmonotonic acceptance and Jacobi scaling
//! - **Line search**: steepest descent, nonlinear conjugate gradients, L-BFGS and BFGS
//!   directions under Armijo or Wolfe conditions
//!
//! ## Linear solvers
//!
//! Dense QR and dense normal Cholesky (nalgebra), sparse normal Cholesky and sparse QR (faer),
//! and CGNR with Jacobi, subset or Schur-style preconditioning.
//!
//! ```
//! use apex_nlls::{CallbackCostFunction, Problem, SolverOptions, solve};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut problem = Problem::new();
//! let x = problem.add_parameter_block(vec![0.5])?;
//! let cost = CallbackCostFunction::new(
//!     |parameters, residuals, jacobians| {
//!         residuals[0] = 10.0 - parameters[0][0];
//!         if let Some(jacobians) = jacobians
//!             && let Some(jacobian) = jacobians[0].as_deref_mut()
//!         {
//!             jacobian[0] = -1.0;
//!         }
//!         true
//!     },
//!     1,
//!     [1],
//! )?;
//! problem.add_residual_block(Box::new(cost), None, &[x])?;
//!
//! let summary = solve(&SolverOptions::default(), &mut problem)?;
//! assert!(summary.is_solution_usable());
//! assert!((problem.parameter_block_values(x)?[0] - 10.0).abs() < 1e-6);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod optimizer;

pub use core::{
    CoreError, CoreResult,
    cost_function::{CallbackCostFunction, CostFunction},
    curve_fit::{CurveFitProblem1D, CurveFitSolution},
    loss_functions::{
        ArctanLoss, CallbackLoss, CauchyLoss, HuberLoss, LossFunction, ScaledLoss, SoftLOneLoss,
        TolerantLoss, TrivialLoss, TukeyLoss,
    },
    parameter_block::ParameterBlockId,
    problem::Problem,
    residual_block::ResidualBlockId,
};
pub use error::{NllsError, NllsResult};
pub use linalg::LinAlgError;
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{
    LineSearchDirectionType, LineSearchType, LinearSolverType, MinimizerType, OptimizerError,
    Solver, SolverOptions, SolverSummary, TerminationType, TrustRegionStrategyType, solve,
};

//! End-to-end tests of the problem API and the minimizers.
//!
//! Each test builds a small problem through the public API, solves it and checks the
//! parameters left in the problem together with the summary.
//!
//! ```bash
//! cargo test --test solve_end_to_end
//! ```

use apex_nlls::{
    CallbackCostFunction, CauchyLoss, CurveFitProblem1D, LineSearchDirectionType, LineSearchType,
    MinimizerType, NllsError, Problem, SolverOptions, TerminationType, TrustRegionStrategyType,
    core::CoreError, optimizer::DumpFormatType, solve,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Rosenbrock as two residuals: `10 (x1 − x0²)` and `1 − x0`.
fn rosenbrock_problem(start: [f64; 2]) -> Result<Problem, Box<dyn std::error::Error>> {
    let mut problem = Problem::new();
    let x = problem.add_parameter_block(start.to_vec())?;
    let cost = CallbackCostFunction::new(
        |parameters, residuals, jacobians| {
            let (x0, x1) = (parameters[0][0], parameters[0][1]);
            residuals[0] = 10.0 * (x1 - x0 * x0);
            residuals[1] = 1.0 - x0;
            if let Some(jacobians) = jacobians
                && let Some(jacobian) = jacobians[0].as_deref_mut()
            {
                jacobian.copy_from_slice(&[-20.0 * x0, 10.0, -1.0, 0.0]);
            }
            true
        },
        2,
        [2],
    )?;
    problem.add_residual_block(Box::new(cost), None, &[x])?;
    Ok(problem)
}

/// `target − x` on a one-element block.
fn offset_cost(target: f64) -> Result<CallbackCostFunction, NllsError> {
    Ok(CallbackCostFunction::new(
        move |parameters, residuals, jacobians| {
            residuals[0] = target - parameters[0][0];
            if let Some(jacobians) = jacobians
                && let Some(jacobian) = jacobians[0].as_deref_mut()
            {
                jacobian[0] = -1.0;
            }
            true
        },
        1,
        [1],
    )?)
}

#[test]
fn test_rosenbrock_with_both_trust_region_strategies() -> TestResult {
    for strategy in [
        TrustRegionStrategyType::LevenbergMarquardt,
        TrustRegionStrategyType::Dogleg,
    ] {
        let mut problem = rosenbrock_problem([-1.2, 1.0])?;
        let options = SolverOptions::default()
            .with_trust_region_strategy_type(strategy)
            .with_max_num_iterations(200);
        let summary = solve(&options, &mut problem)?;

        let id = problem.parameter_block_ids()[0];
        let x = problem.parameter_block_values(id)?;
        assert!(summary.is_solution_usable(), "{strategy}: {}", summary.message());
        assert!(summary.final_cost() < summary.initial_cost());
        assert!((x[0] - 1.0).abs() < 1e-4, "{strategy}: x0 = {}", x[0]);
        assert!((x[1] - 1.0).abs() < 1e-4, "{strategy}: x1 = {}", x[1]);
        assert!(summary.num_successful_steps() > 0);
    }
    Ok(())
}

#[test]
fn test_two_parameter_quadratic_converges() -> TestResult {
    let mut problem = Problem::new();
    let x = problem.add_parameter_block(vec![1.0, 0.0])?;
    // r = [x0² − 4, x1 − 1]
    let cost = CallbackCostFunction::new(
        |parameters, residuals, jacobians| {
            let (x0, x1) = (parameters[0][0], parameters[0][1]);
            residuals[0] = x0 * x0 - 4.0;
            residuals[1] = x1 - 1.0;
            if let Some(jacobians) = jacobians
                && let Some(jacobian) = jacobians[0].as_deref_mut()
            {
                jacobian.copy_from_slice(&[2.0 * x0, 0.0, 0.0, 1.0]);
            }
            true
        },
        2,
        [2],
    )?;
    problem.add_residual_block(Box::new(cost), None, &[x])?;

    let options = SolverOptions::default()
        .with_max_num_iterations(50)
        .with_function_tolerance(1e-6);
    let summary = solve(&options, &mut problem)?;

    assert!(summary.final_cost() < summary.initial_cost());
    assert!(summary.is_solution_usable(), "{}", summary.message());
    let values = problem.parameter_block_values(x)?;
    assert!((values[0] - 2.0).abs() < 1e-4);
    assert!((values[1] - 1.0).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_failing_callback_yields_unusable_solution() -> TestResult {
    let mut problem = Problem::new();
    let x = problem.add_parameter_block(vec![1.0])?;
    let cost = CallbackCostFunction::new(|_, _, _| false, 1, [1])?;
    problem.add_residual_block(Box::new(cost), None, &[x])?;

    let summary = solve(&SolverOptions::default(), &mut problem)?;

    assert_eq!(summary.termination_type(), TerminationType::Failure);
    assert!(!summary.is_solution_usable());
    assert!(summary.initial_cost().is_nan());
    assert_eq!(problem.parameter_block_values(x)?, &[1.0]);
    Ok(())
}

#[test]
fn test_residual_blocks_share_one_parameter_block() -> TestResult {
    let mut problem = Problem::new();
    let x = problem.add_parameter_block(vec![0.0])?;
    problem.add_residual_block(Box::new(offset_cost(1.0)?), None, &[x])?;
    problem.add_residual_block(Box::new(offset_cost(3.0)?), None, &[x])?;

    let summary = solve(&SolverOptions::default(), &mut problem)?;

    assert!(summary.is_solution_usable());
    assert_eq!(summary.num_parameter_blocks(), 1);
    assert_eq!(summary.num_residual_blocks(), 2);
    assert!((problem.parameter_block_values(x)?[0] - 2.0).abs() < 1e-6);
    // ½ (1² + 1²)
    assert!((summary.final_cost() - 1.0).abs() < 1e-6);
    Ok(())
}

fn exponential(x: f64, p: &[f64], y: &mut f64, dy_dp: Option<&mut [f64]>) -> bool {
    *y = (p[0] * x + p[1]).exp();
    if let Some(dy_dp) = dy_dp {
        dy_dp[0] = x * *y;
        dy_dp[1] = *y;
    }
    true
}

#[test]
fn test_robust_exponential_fit_reaches_the_robust_minimum() -> TestResult {
    let (m, c) = (0.3, 0.1);
    let mut rng = StdRng::seed_from_u64(5);
    let x: Vec<f64> = (0..80).map(|i| i as f64 * 0.0625).collect();
    let mut y: Vec<f64> = x
        .iter()
        .map(|&x| (m * x + c).exp() + rng.random_range(-0.02..0.02))
        .collect();
    for index in [7, 23, 41, 60, 77] {
        y[index] += 3.0 + 2.0 * rng.random::<f64>();
    }

    // All points share one residual block, so the loss sees the norm of the whole block
    let fit = |parameters: &[f64]| -> Result<CurveFitProblem1D, CoreError> {
        CurveFitProblem1D::builder()
            .func(exponential)
            .x(&x)
            .y(&y)
            .parameters(parameters)
            .loss(CauchyLoss::new(0.5)?)
            .build()
    };
    let cost_at_truth = fit(&[m, c])?
        .problem()
        .evaluate_cost()
        .ok_or("evaluation at the true parameters failed")?;

    let options = SolverOptions::default().with_max_num_iterations(100);
    let solution = fit(&[0.0, 0.0])?.solve(&options)?;

    let summary = &solution.summary;
    assert!(summary.is_solution_usable(), "{}", summary.message());
    assert!(summary.final_cost() < summary.initial_cost());
    assert!(
        summary.final_cost() <= cost_at_truth + 1e-9,
        "final cost {} above the cost {} at the true parameters",
        summary.final_cost(),
        cost_at_truth
    );
    assert!(solution.parameters.iter().all(|p| p.is_finite()));
    Ok(())
}

#[test]
fn test_quasi_newton_line_search_directions() -> TestResult {
    for direction in [LineSearchDirectionType::Lbfgs, LineSearchDirectionType::Bfgs] {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(vec![0.0])?;
        let y = problem.add_parameter_block(vec![0.0])?;
        problem.add_residual_block(Box::new(offset_cost(4.0)?), None, &[x])?;
        problem.add_residual_block(Box::new(offset_cost(-1.0)?), None, &[y])?;

        let options = SolverOptions::default()
            .with_minimizer_type(MinimizerType::LineSearch)
            .with_line_search_direction_type(direction)
            .with_line_search_type(LineSearchType::Wolfe);
        let summary = solve(&options, &mut problem)?;

        assert_ne!(summary.termination_type(), TerminationType::Failure);
        assert!(summary.final_cost() < 1e-6, "{direction}: {}", summary.final_cost());
        assert!(summary.num_line_search_steps() > 0);
        assert!((problem.parameter_block_values(x)?[0] - 4.0).abs() < 1e-3);
        assert!((problem.parameter_block_values(y)?[0] + 1.0).abs() < 1e-3);
    }
    Ok(())
}

#[test]
fn test_wrong_jacobian_is_caught_by_gradient_check() -> TestResult {
    let mut problem = Problem::new();
    let x = problem.add_parameter_block(vec![1.0])?;
    let cost = CallbackCostFunction::new(
        |parameters, residuals, jacobians| {
            residuals[0] = 2.0 - parameters[0][0];
            if let Some(jacobians) = jacobians
                && let Some(jacobian) = jacobians[0].as_deref_mut()
            {
                // Correct value is −1
                jacobian[0] = 3.0;
            }
            true
        },
        1,
        [1],
    )?;
    problem.add_residual_block(Box::new(cost), None, &[x])?;

    let options = SolverOptions::default().with_check_gradients(true);
    let summary = solve(&options, &mut problem)?;

    assert_eq!(summary.termination_type(), TerminationType::Failure);
    assert!(summary.message().contains("Gradient error"), "{}", summary.message());
    Ok(())
}

#[test]
fn test_trust_region_iteration_is_dumped_as_text() -> TestResult {
    let directory = tempfile::tempdir()?;
    let mut problem = rosenbrock_problem([-1.2, 1.0])?;
    let options = SolverOptions::default().with_trust_region_dump(
        vec![1],
        directory.path(),
        DumpFormatType::TextFile,
    );

    solve(&options, &mut problem)?;

    for piece in ["A", "b", "D", "x"] {
        let path = directory
            .path()
            .join(format!("ceres_solver_iteration_001_{piece}.txt"));
        let contents = std::fs::read_to_string(&path)?;
        assert!(!contents.trim().is_empty(), "{} is empty", path.display());
    }
    let residuals = std::fs::read_to_string(
        directory.path().join("ceres_solver_iteration_001_b.txt"),
    )?;
    assert_eq!(residuals.lines().count(), 2);
    Ok(())
}

#[test]
fn test_foreign_subset_block_is_rejected() -> TestResult {
    use apex_nlls::{LinearSolverType, optimizer::PreconditionerType};

    let mut other = Problem::new();
    let y = other.add_parameter_block(vec![0.0])?;
    other.add_residual_block(Box::new(offset_cost(1.0)?), None, &[y])?;
    let foreign = other.add_residual_block(Box::new(offset_cost(2.0)?), None, &[y])?;

    let mut problem = Problem::new();
    let x = problem.add_parameter_block(vec![0.0])?;
    problem.add_residual_block(Box::new(offset_cost(1.0)?), None, &[x])?;

    let mut options = SolverOptions::default()
        .with_linear_solver_type(LinearSolverType::Cgnr)
        .with_preconditioner_type(PreconditionerType::Subset)
        .with_residual_blocks_for_subset_preconditioner(vec![foreign]);
    options.set_max_num_iterations(5);

    let result = solve(&options, &mut problem);
    assert!(matches!(
        result,
        Err(NllsError::Core(CoreError::StructuralMismatch(_)))
    ));
    Ok(())
}

#[test]
fn test_reports_are_stable_across_calls() -> TestResult {
    let mut problem = rosenbrock_problem([0.0, 0.0])?;
    let summary = solve(&SolverOptions::default(), &mut problem)?;

    let brief = summary.brief_report();
    assert_eq!(brief, summary.brief_report());
    assert!(brief.contains("Initial"));
    assert_eq!(summary.full_report(), summary.full_report());
    assert!(summary.full_report().contains(summary.message()));
    Ok(())
}

#[test]
fn test_invalid_options_report_their_reason() {
    let mut options = SolverOptions::default();
    assert!(options.is_valid());
    assert_eq!(options.is_valid_with_message(), (true, String::new()));

    options.set_function_tolerance(-1.0);
    let (valid, message) = options.is_valid_with_message();
    assert!(!valid);
    assert!(message.contains("function_tolerance"), "{message}");
}

//! Solver configuration.
//!
//! [`SolverOptions`] is a flat record of every numerical-method switch. Fields are public and
//! each has a `set_*` method; the most common knobs also have `with_*` builder counterparts:
//!
//! ```
//! use apex_nlls::optimizer::{SolverOptions, types::LinearSolverType};
//!
//! let options = SolverOptions::new()
//!     .with_max_num_iterations(100)
//!     .with_function_tolerance(1e-8)
//!     .with_linear_solver_type(LinearSolverType::DenseQr);
//! assert!(options.is_valid());
//! ```
//!
//! Setters never look at other fields. Consistency between fields is checked once, by
//! [`SolverOptions::validate`], before a solve starts.

use std::path::PathBuf;

use tracing::debug;

use crate::{
    core::residual_block::ResidualBlockId,
    optimizer::{
        OptimizerError, OptimizerResult,
        types::{
            DenseLinearAlgebraLibraryType, DoglegType, DumpFormatType, LineSearchDirectionType,
            LineSearchInterpolationType, LineSearchType, LinearSolverType, LoggingType,
            MinimizerType, NonlinearConjugateGradientType, PreconditionerType,
            SparseLinearAlgebraLibraryType, TrustRegionStrategyType, VisibilityClusteringType,
        },
    },
};

#[derive(Debug, Clone)]
pub struct SolverOptions {
    // Line search
    pub line_search_direction_type: LineSearchDirectionType,
    pub line_search_type: LineSearchType,
    pub nonlinear_conjugate_gradient_type: NonlinearConjugateGradientType,
    /// Number of correction pairs kept by L-BFGS
    pub max_lbfgs_rank: usize,
    /// Scale the initial (L-)BFGS inverse Hessian by `sᵀy / yᵀy`
    pub use_approximate_eigenvalue_bfgs_scaling: bool,
    pub line_search_interpolation_type: LineSearchInterpolationType,
    /// Line search gives up once the step falls below this size
    pub min_line_search_step_size: f64,
    /// Armijo constant `c1` of the sufficient decrease condition
    pub line_search_sufficient_function_decrease: f64,
    /// A new trial step is at least this fraction of the previous one
    pub max_line_search_step_contraction: f64,
    /// A new trial step is at most this fraction of the previous one
    pub min_line_search_step_contraction: f64,
    pub max_num_line_search_step_size_iterations: usize,
    pub max_num_line_search_direction_restarts: usize,
    /// Wolfe constant `c2` of the curvature condition
    pub line_search_sufficient_curvature_decrease: f64,
    /// Growth factor of the trial step while bracketing
    pub max_line_search_step_expansion: f64,

    // Trust region
    pub minimizer_type: MinimizerType,
    pub trust_region_strategy_type: TrustRegionStrategyType,
    pub dogleg_type: DoglegType,
    pub use_nonmonotonic_steps: bool,
    pub max_consecutive_nonmonotonic_steps: usize,

    // Limits
    pub max_num_iterations: usize,
    pub max_solver_time_in_seconds: f64,
    pub num_threads: usize,

    // Radius
    pub initial_trust_region_radius: f64,
    pub max_trust_region_radius: f64,
    /// Convergence is declared once the radius shrinks below this
    pub min_trust_region_radius: f64,
    /// Steps with a smaller actual/predicted reduction ratio are rejected
    pub min_relative_decrease: f64,
    pub min_lm_diagonal: f64,
    pub max_lm_diagonal: f64,
    /// Failed linear solves tolerated in a row before the solve fails
    pub max_num_consecutive_invalid_steps: usize,

    // Tolerances
    pub function_tolerance: f64,
    pub gradient_tolerance: f64,
    pub parameter_tolerance: f64,

    // Linear algebra
    pub linear_solver_type: LinearSolverType,
    pub preconditioner_type: PreconditionerType,
    pub visibility_clustering_type: VisibilityClusteringType,
    /// Residual blocks used by [`PreconditionerType::Subset`]
    pub residual_blocks_for_subset_preconditioner: Vec<ResidualBlockId>,
    pub dense_linear_algebra_library_type: DenseLinearAlgebraLibraryType,
    pub sparse_linear_algebra_library_type: SparseLinearAlgebraLibraryType,

    // Logging
    pub logging_type: LoggingType,
    pub minimizer_progress_to_stdout: bool,

    // Dump
    /// Trust-region iterations whose linear least squares problem is dumped
    pub trust_region_minimizer_iterations_to_dump: Vec<usize>,
    pub trust_region_problem_dump_directory: PathBuf,
    pub trust_region_problem_dump_format_type: DumpFormatType,

    // Gradient check
    pub check_gradients: bool,
    pub gradient_check_relative_precision: f64,
    pub gradient_check_numeric_derivative_relative_step_size: f64,

    /// Write the current point into the parameter blocks after every iteration, not only at
    /// the end of the solve
    pub update_state_every_iteration: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            line_search_direction_type: LineSearchDirectionType::default(),
            line_search_type: LineSearchType::default(),
            nonlinear_conjugate_gradient_type: NonlinearConjugateGradientType::default(),
            max_lbfgs_rank: 20,
            use_approximate_eigenvalue_bfgs_scaling: false,
            line_search_interpolation_type: LineSearchInterpolationType::default(),
            min_line_search_step_size: 1e-9,
            line_search_sufficient_function_decrease: 1e-4,
            max_line_search_step_contraction: 1e-3,
            min_line_search_step_contraction: 0.6,
            max_num_line_search_step_size_iterations: 20,
            max_num_line_search_direction_restarts: 5,
            line_search_sufficient_curvature_decrease: 0.9,
            max_line_search_step_expansion: 10.0,

            minimizer_type: MinimizerType::default(),
            trust_region_strategy_type: TrustRegionStrategyType::default(),
            dogleg_type: DoglegType::default(),
            use_nonmonotonic_steps: false,
            max_consecutive_nonmonotonic_steps: 5,

            max_num_iterations: 50,
            max_solver_time_in_seconds: 1e9,
            num_threads: 1,

            initial_trust_region_radius: 1e4,
            max_trust_region_radius: 1e16,
            min_trust_region_radius: 1e-32,
            min_relative_decrease: 1e-3,
            min_lm_diagonal: 1e-6,
            max_lm_diagonal: 1e32,
            max_num_consecutive_invalid_steps: 5,

            function_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-8,

            linear_solver_type: LinearSolverType::default(),
            preconditioner_type: PreconditionerType::default(),
            visibility_clustering_type: VisibilityClusteringType::default(),
            residual_blocks_for_subset_preconditioner: Vec::new(),
            dense_linear_algebra_library_type: DenseLinearAlgebraLibraryType::default(),
            sparse_linear_algebra_library_type: SparseLinearAlgebraLibraryType::default(),

            logging_type: LoggingType::default(),
            minimizer_progress_to_stdout: false,

            trust_region_minimizer_iterations_to_dump: Vec::new(),
            trust_region_problem_dump_directory: std::env::temp_dir(),
            trust_region_problem_dump_format_type: DumpFormatType::default(),

            check_gradients: false,
            gradient_check_relative_precision: 1e-8,
            gradient_check_numeric_derivative_relative_step_size: 1e-6,

            update_state_every_iteration: false,
        }
    }
}

/// `set_<field>(&mut self, value)` for each listed field
macro_rules! setters {
    ($($setter:ident => $field:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $setter(&mut self, value: $ty) {
                self.$field = value;
            }
        )*
    };
}

impl SolverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    setters! {
        set_line_search_direction_type => line_search_direction_type: LineSearchDirectionType,
        set_line_search_type => line_search_type: LineSearchType,
        set_nonlinear_conjugate_gradient_type =>
            nonlinear_conjugate_gradient_type: NonlinearConjugateGradientType,
        set_max_lbfgs_rank => max_lbfgs_rank: usize,
        set_use_approximate_eigenvalue_bfgs_scaling =>
            use_approximate_eigenvalue_bfgs_scaling: bool,
        set_line_search_interpolation_type =>
            line_search_interpolation_type: LineSearchInterpolationType,
        set_min_line_search_step_size => min_line_search_step_size: f64,
        set_line_search_sufficient_function_decrease =>
            line_search_sufficient_function_decrease: f64,
        set_max_line_search_step_contraction => max_line_search_step_contraction: f64,
        set_min_line_search_step_contraction => min_line_search_step_contraction: f64,
        set_max_num_line_search_step_size_iterations =>
            max_num_line_search_step_size_iterations: usize,
        set_max_num_line_search_direction_restarts =>
            max_num_line_search_direction_restarts: usize,
        set_line_search_sufficient_curvature_decrease =>
            line_search_sufficient_curvature_decrease: f64,
        set_max_line_search_step_expansion => max_line_search_step_expansion: f64,
        set_minimizer_type => minimizer_type: MinimizerType,
        set_trust_region_strategy_type => trust_region_strategy_type: TrustRegionStrategyType,
        set_dogleg_type => dogleg_type: DoglegType,
        set_use_nonmonotonic_steps => use_nonmonotonic_steps: bool,
        set_max_consecutive_nonmonotonic_steps => max_consecutive_nonmonotonic_steps: usize,
        set_max_num_iterations => max_num_iterations: usize,
        set_max_solver_time_in_seconds => max_solver_time_in_seconds: f64,
        set_num_threads => num_threads: usize,
        set_initial_trust_region_radius => initial_trust_region_radius: f64,
        set_max_trust_region_radius => max_trust_region_radius: f64,
        set_min_trust_region_radius => min_trust_region_radius: f64,
        set_min_relative_decrease => min_relative_decrease: f64,
        set_min_lm_diagonal => min_lm_diagonal: f64,
        set_max_lm_diagonal => max_lm_diagonal: f64,
        set_max_num_consecutive_invalid_steps => max_num_consecutive_invalid_steps: usize,
        set_function_tolerance => function_tolerance: f64,
        set_gradient_tolerance => gradient_tolerance: f64,
        set_parameter_tolerance => parameter_tolerance: f64,
        set_linear_solver_type => linear_solver_type: LinearSolverType,
        set_preconditioner_type => preconditioner_type: PreconditionerType,
        set_visibility_clustering_type => visibility_clustering_type: VisibilityClusteringType,
        set_residual_blocks_for_subset_preconditioner =>
            residual_blocks_for_subset_preconditioner: Vec<ResidualBlockId>,
        set_dense_linear_algebra_library_type =>
            dense_linear_algebra_library_type: DenseLinearAlgebraLibraryType,
        set_sparse_linear_algebra_library_type =>
            sparse_linear_algebra_library_type: SparseLinearAlgebraLibraryType,
        set_logging_type => logging_type: LoggingType,
        set_minimizer_progress_to_stdout => minimizer_progress_to_stdout: bool,
        set_trust_region_minimizer_iterations_to_dump =>
            trust_region_minimizer_iterations_to_dump: Vec<usize>,
        set_trust_region_problem_dump_directory => trust_region_problem_dump_directory: PathBuf,
        set_trust_region_problem_dump_format_type =>
            trust_region_problem_dump_format_type: DumpFormatType,
        set_check_gradients => check_gradients: bool,
        set_gradient_check_relative_precision => gradient_check_relative_precision: f64,
        set_gradient_check_numeric_derivative_relative_step_size =>
            gradient_check_numeric_derivative_relative_step_size: f64,
        set_update_state_every_iteration => update_state_every_iteration: bool,
    }

    pub fn with_minimizer_type(mut self, minimizer_type: MinimizerType) -> Self {
        self.minimizer_type = minimizer_type;
        self
    }

    pub fn with_trust_region_strategy_type(mut self, strategy: TrustRegionStrategyType) -> Self {
        self.trust_region_strategy_type = strategy;
        self
    }

    pub fn with_dogleg_type(mut self, dogleg_type: DoglegType) -> Self {
        self.dogleg_type = dogleg_type;
        self
    }

    pub fn with_line_search_direction_type(mut self, direction: LineSearchDirectionType) -> Self {
        self.line_search_direction_type = direction;
        self
    }

    pub fn with_line_search_type(mut self, line_search_type: LineSearchType) -> Self {
        self.line_search_type = line_search_type;
        self
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_preconditioner_type(mut self, preconditioner_type: PreconditionerType) -> Self {
        self.preconditioner_type = preconditioner_type;
        self
    }

    pub fn with_max_num_iterations(mut self, max_num_iterations: usize) -> Self {
        self.max_num_iterations = max_num_iterations;
        self
    }

    pub fn with_max_solver_time_in_seconds(mut self, seconds: f64) -> Self {
        self.max_solver_time_in_seconds = seconds;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_function_tolerance(mut self, function_tolerance: f64) -> Self {
        self.function_tolerance = function_tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    /// Set the initial radius and the range it is kept in.
    pub fn with_trust_region_radius(mut self, initial: f64, min: f64, max: f64) -> Self {
        self.initial_trust_region_radius = initial;
        self.min_trust_region_radius = min;
        self.max_trust_region_radius = max;
        self
    }

    pub fn with_logging_type(mut self, logging_type: LoggingType) -> Self {
        self.logging_type = logging_type;
        self
    }

    pub fn with_minimizer_progress_to_stdout(mut self, enable: bool) -> Self {
        self.minimizer_progress_to_stdout = enable;
        self
    }

    pub fn with_check_gradients(mut self, check_gradients: bool) -> Self {
        self.check_gradients = check_gradients;
        self
    }

    pub fn with_residual_blocks_for_subset_preconditioner(
        mut self,
        residual_blocks: Vec<ResidualBlockId>,
    ) -> Self {
        self.residual_blocks_for_subset_preconditioner = residual_blocks;
        self
    }

    /// Dump the listed trust-region iterations to `directory` in `format`.
    pub fn with_trust_region_dump(
        mut self,
        iterations: Vec<usize>,
        directory: impl Into<PathBuf>,
        format: DumpFormatType,
    ) -> Self {
        self.trust_region_minimizer_iterations_to_dump = iterations;
        self.trust_region_problem_dump_directory = directory.into();
        self.trust_region_problem_dump_format_type = format;
        self
    }

    pub fn with_update_state_every_iteration(mut self, enable: bool) -> Self {
        self.update_state_every_iteration = enable;
        self
    }

    /// Check every option and the consistency between options.
    ///
    /// The first violation found is returned. Trust-region options are only checked for the
    /// trust-region minimizer and line-search options only for the line-search minimizer.
    ///
    /// # Errors
    ///
    /// `OptimizerError::InvalidConfiguration` naming the offending option and its value.
    pub fn validate(&self) -> OptimizerResult<()> {
        self.validate_common()?;
        match self.minimizer_type {
            MinimizerType::TrustRegion => self.validate_trust_region(),
            MinimizerType::LineSearch => self.validate_line_search(),
        }
    }

    /// Same verdict as [`validate`](Self::validate), without logging the failure.
    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    /// `(true, "")` for valid options, otherwise `(false, <reason>)`.
    pub fn is_valid_with_message(&self) -> (bool, String) {
        match self.check() {
            Ok(()) => (true, String::new()),
            Err(message) => (false, message),
        }
    }

    fn validate_common(&self) -> OptimizerResult<()> {
        self.check_common().map_err(invalid)
    }

    fn validate_trust_region(&self) -> OptimizerResult<()> {
        self.check_trust_region().map_err(invalid)
    }

    fn validate_line_search(&self) -> OptimizerResult<()> {
        self.check_line_search().map_err(invalid)
    }

    fn check(&self) -> Result<(), String> {
        self.check_common()?;
        match self.minimizer_type {
            MinimizerType::TrustRegion => self.check_trust_region(),
            MinimizerType::LineSearch => self.check_line_search(),
        }
    }

    fn check_common(&self) -> Result<(), String> {
        require(
            self.max_num_iterations > 0,
            format!("max_num_iterations must be positive, got {}", self.max_num_iterations),
        )?;
        require(
            self.num_threads > 0,
            format!("num_threads must be positive, got {}", self.num_threads),
        )?;
        require(
            self.max_solver_time_in_seconds >= 0.0,
            format!(
                "max_solver_time_in_seconds must be non-negative, got {}",
                self.max_solver_time_in_seconds
            ),
        )?;
        for (name, value) in [
            ("function_tolerance", self.function_tolerance),
            ("gradient_tolerance", self.gradient_tolerance),
            ("parameter_tolerance", self.parameter_tolerance),
        ] {
            require(value >= 0.0, format!("{name} must be non-negative, got {value}"))?;
        }
        if self.check_gradients {
            require(
                self.gradient_check_relative_precision > 0.0,
                format!(
                    "gradient_check_relative_precision must be positive, got {}",
                    self.gradient_check_relative_precision
                ),
            )?;
            require(
                self.gradient_check_numeric_derivative_relative_step_size > 0.0,
                format!(
                    "gradient_check_numeric_derivative_relative_step_size must be positive, \
                     got {}",
                    self.gradient_check_numeric_derivative_relative_step_size
                ),
            )?;
        }
        if !self.trust_region_minimizer_iterations_to_dump.is_empty()
            && self.trust_region_problem_dump_format_type == DumpFormatType::TextFile
        {
            require(
                !self.trust_region_problem_dump_directory.as_os_str().is_empty(),
                "trust_region_problem_dump_directory must be set when dumping to text files"
                    .to_string(),
            )?;
        }
        Ok(())
    }

    fn check_trust_region(&self) -> Result<(), String> {
        for (name, value) in [
            ("initial_trust_region_radius", self.initial_trust_region_radius),
            ("max_trust_region_radius", self.max_trust_region_radius),
            ("min_trust_region_radius", self.min_trust_region_radius),
        ] {
            require(value > 0.0, format!("{name} must be positive, got {value}"))?;
        }
        require(
            self.min_trust_region_radius <= self.max_trust_region_radius,
            format!(
                "min_trust_region_radius ({}) exceeds max_trust_region_radius ({})",
                self.min_trust_region_radius, self.max_trust_region_radius
            ),
        )?;
        require(
            self.min_trust_region_radius <= self.initial_trust_region_radius
                && self.initial_trust_region_radius <= self.max_trust_region_radius,
            format!(
                "initial_trust_region_radius ({}) must lie in [{}, {}]",
                self.initial_trust_region_radius,
                self.min_trust_region_radius,
                self.max_trust_region_radius
            ),
        )?;
        require(
            self.min_relative_decrease >= 0.0,
            format!(
                "min_relative_decrease must be non-negative, got {}",
                self.min_relative_decrease
            ),
        )?;
        require(
            self.min_lm_diagonal >= 0.0,
            format!("min_lm_diagonal must be non-negative, got {}", self.min_lm_diagonal),
        )?;
        require(
            self.min_lm_diagonal <= self.max_lm_diagonal,
            format!(
                "min_lm_diagonal ({}) exceeds max_lm_diagonal ({})",
                self.min_lm_diagonal, self.max_lm_diagonal
            ),
        )?;
        if self.use_nonmonotonic_steps {
            require(
                self.max_consecutive_nonmonotonic_steps > 0,
                "max_consecutive_nonmonotonic_steps must be positive with use_nonmonotonic_steps"
                    .to_string(),
            )?;
        }

        let no_sparse =
            self.sparse_linear_algebra_library_type == SparseLinearAlgebraLibraryType::NoSparse;
        require(
            !(self.linear_solver_type.is_sparse() && no_sparse),
            format!(
                "linear_solver_type {} requires a sparse linear algebra library",
                self.linear_solver_type
            ),
        )?;

        match self.linear_solver_type {
            LinearSolverType::Cgnr => require(
                matches!(
                    self.preconditioner_type,
                    PreconditionerType::Identity
                        | PreconditionerType::Jacobi
                        | PreconditionerType::Subset
                ),
                format!(
                    "linear_solver_type CGNR does not support preconditioner_type {}",
                    self.preconditioner_type
                ),
            )?,
            LinearSolverType::IterativeSchur => require(
                self.preconditioner_type != PreconditionerType::Subset,
                "linear_solver_type Iterative Schur does not support the Subset preconditioner"
                    .to_string(),
            )?,
            _ => {}
        }

        match self.preconditioner_type {
            PreconditionerType::Subset => {
                require(
                    !self.residual_blocks_for_subset_preconditioner.is_empty(),
                    "preconditioner_type Subset requires \
                     residual_blocks_for_subset_preconditioner"
                        .to_string(),
                )?;
                require(
                    !no_sparse,
                    "preconditioner_type Subset requires a sparse linear algebra library"
                        .to_string(),
                )?;
            }
            PreconditionerType::ClusterJacobi | PreconditionerType::ClusterTridiagonal => {
                require(
                    !no_sparse,
                    format!(
                        "preconditioner_type {} requires a sparse linear algebra library",
                        self.preconditioner_type
                    ),
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn check_line_search(&self) -> Result<(), String> {
        require(
            self.max_lbfgs_rank > 0,
            format!("max_lbfgs_rank must be positive, got {}", self.max_lbfgs_rank),
        )?;
        require(
            self.min_line_search_step_size > 0.0,
            format!(
                "min_line_search_step_size must be positive, got {}",
                self.min_line_search_step_size
            ),
        )?;
        require(
            0.0 < self.max_line_search_step_contraction
                && self.max_line_search_step_contraction < self.min_line_search_step_contraction
                && self.min_line_search_step_contraction <= 1.0,
            format!(
                "line search step contractions must satisfy 0 < max ({}) < min ({}) <= 1",
                self.max_line_search_step_contraction, self.min_line_search_step_contraction
            ),
        )?;
        require(
            0.0 < self.line_search_sufficient_function_decrease
                && self.line_search_sufficient_function_decrease
                    < self.line_search_sufficient_curvature_decrease
                && self.line_search_sufficient_curvature_decrease < 1.0,
            format!(
                "line search constants must satisfy 0 < sufficient_function_decrease ({}) < \
                 sufficient_curvature_decrease ({}) < 1",
                self.line_search_sufficient_function_decrease,
                self.line_search_sufficient_curvature_decrease
            ),
        )?;
        require(
            self.max_line_search_step_expansion > 1.0,
            format!(
                "max_line_search_step_expansion must exceed 1, got {}",
                self.max_line_search_step_expansion
            ),
        )?;
        require(
            self.max_num_line_search_step_size_iterations > 0,
            "max_num_line_search_step_size_iterations must be positive".to_string(),
        )?;
        require(
            !matches!(
                self.line_search_direction_type,
                LineSearchDirectionType::Bfgs | LineSearchDirectionType::Lbfgs
            ) || self.line_search_type == LineSearchType::Wolfe,
            format!(
                "line_search_direction_type {} requires the Wolfe line search, got {}",
                self.line_search_direction_type, self.line_search_type
            ),
        )?;
        Ok(())
    }

    /// Print configuration parameters at debug level
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Minimizer:           {}\n  Trust region:        {} ({})\n  \
             Line search:         {} / {} / {}\n  Linear solver:       {}\n  \
             Preconditioner:      {}\n  Dense library:       {}\n  Sparse library:      {}\n  \
             Convergence Criteria:\n  Max iterations:      {}\n  Max time:            {:.2e}s\n  \
             Function tolerance:  {:.2e}\n  Gradient tolerance:  {:.2e}\n  \
             Parameter tolerance: {:.2e}\n  Trust Region Radius:\n  Initial radius:      {:.2e}\n  \
             Radius range:        [{:.2e}, {:.2e}]\n  Min rel. decrease:   {:.2e}\n  \
             LM diagonal range:   [{:.2e}, {:.2e}]\n  Nonmonotonic steps:  {}\n  \
             Threads:             {}\n  Check gradients:     {}",
            self.minimizer_type,
            self.trust_region_strategy_type,
            self.dogleg_type,
            self.line_search_direction_type,
            self.line_search_type,
            self.line_search_interpolation_type,
            self.linear_solver_type,
            self.preconditioner_type,
            self.dense_linear_algebra_library_type,
            self.sparse_linear_algebra_library_type,
            self.max_num_iterations,
            self.max_solver_time_in_seconds,
            self.function_tolerance,
            self.gradient_tolerance,
            self.parameter_tolerance,
            self.initial_trust_region_radius,
            self.min_trust_region_radius,
            self.max_trust_region_radius,
            self.min_relative_decrease,
            self.min_lm_diagonal,
            self.max_lm_diagonal,
            if self.use_nonmonotonic_steps {
                "enabled"
            } else {
                "disabled"
            },
            self.num_threads,
            if self.check_gradients {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
}

fn require(condition: bool, message: String) -> Result<(), String> {
    if condition { Ok(()) } else { Err(message) }
}

fn invalid(message: String) -> OptimizerError {
    OptimizerError::InvalidConfiguration(message).log()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = SolverOptions::default();
        assert!(options.is_valid());
        assert_eq!(options.max_num_iterations, 50);
        assert_eq!(options.num_threads, 1);
        assert_eq!(options.minimizer_type, MinimizerType::TrustRegion);
        assert_eq!(
            options.linear_solver_type,
            LinearSolverType::SparseNormalCholesky
        );
        assert_eq!(options.is_valid_with_message(), (true, String::new()));
    }

    #[test]
    fn test_negative_function_tolerance_is_rejected() {
        let mut options = SolverOptions::default();
        options.set_function_tolerance(-1.0);
        let (valid, message) = options.is_valid_with_message();
        assert!(!valid);
        assert!(message.contains("function_tolerance"));
        assert!(matches!(
            options.validate(),
            Err(OptimizerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_is_valid_agrees_with_validate() {
        let mut options = SolverOptions::default();
        assert_eq!(options.is_valid(), options.validate().is_ok());

        options.set_max_num_iterations(0);
        assert!(!options.is_valid());
        assert!(options.validate().is_err());

        options.set_max_num_iterations(10);
        options.set_minimizer_type(MinimizerType::LineSearch);
        options.set_line_search_type(LineSearchType::Armijo);
        assert!(!options.is_valid());
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_radius_ordering_is_checked() {
        let mut options = SolverOptions::default();
        options.set_min_trust_region_radius(10.0);
        options.set_max_trust_region_radius(1.0);
        let (valid, message) = options.is_valid_with_message();
        assert!(!valid);
        assert!(message.contains("min_trust_region_radius"));

        let options = SolverOptions::new().with_trust_region_radius(0.0, 1e-32, 1e16);
        assert!(!options.is_valid());
    }

    #[test]
    fn test_zero_counts_are_rejected() {
        let mut options = SolverOptions::default();
        options.set_num_threads(0);
        assert!(!options.is_valid());

        let options = SolverOptions::new().with_max_num_iterations(0);
        let (valid, message) = options.is_valid_with_message();
        assert!(!valid);
        assert!(message.contains("max_num_iterations"));
    }

    #[test]
    fn test_setters_do_not_touch_other_fields() {
        let mut options = SolverOptions::default();
        options.set_minimizer_type(MinimizerType::LineSearch);
        // Trust-region fields keep their values and are no longer validated
        options.set_initial_trust_region_radius(-1.0);
        assert_eq!(options.linear_solver_type, LinearSolverType::SparseNormalCholesky);
        assert!(options.is_valid());
    }

    #[test]
    fn test_sparse_solver_requires_sparse_library() {
        let mut options = SolverOptions::default();
        options.set_sparse_linear_algebra_library_type(SparseLinearAlgebraLibraryType::NoSparse);
        assert!(!options.is_valid());

        options.set_linear_solver_type(LinearSolverType::DenseQr);
        assert!(options.is_valid());
    }

    #[test]
    fn test_preconditioner_compatibility() {
        let options = SolverOptions::new()
            .with_linear_solver_type(LinearSolverType::Cgnr)
            .with_preconditioner_type(PreconditionerType::SchurJacobi);
        assert!(!options.is_valid());

        // Subset needs a block list
        let options = SolverOptions::new()
            .with_linear_solver_type(LinearSolverType::Cgnr)
            .with_preconditioner_type(PreconditionerType::Subset);
        let (valid, message) = options.is_valid_with_message();
        assert!(!valid);
        assert!(message.contains("residual_blocks_for_subset_preconditioner"));

        let options = SolverOptions::new()
            .with_linear_solver_type(LinearSolverType::IterativeSchur)
            .with_preconditioner_type(PreconditionerType::Subset)
            .with_residual_blocks_for_subset_preconditioner(vec![ResidualBlockId {
                problem: 0,
                index: 0,
            }]);
        assert!(!options.is_valid());
    }

    #[test]
    fn test_line_search_constraints() {
        let mut options = SolverOptions::new().with_minimizer_type(MinimizerType::LineSearch);
        assert!(options.is_valid());

        options.set_line_search_type(LineSearchType::Armijo);
        let (valid, message) = options.is_valid_with_message();
        assert!(!valid);
        assert!(message.contains("Wolfe"));

        options.set_line_search_direction_type(LineSearchDirectionType::SteepestDescent);
        assert!(options.is_valid());

        options.set_max_line_search_step_contraction(0.9);
        assert!(!options.is_valid());
    }

    #[test]
    fn test_gradient_check_knobs_only_checked_when_enabled() {
        let mut options = SolverOptions::default();
        options.set_gradient_check_relative_precision(0.0);
        assert!(options.is_valid());
        options.set_check_gradients(true);
        assert!(!options.is_valid());
    }

    #[test]
    fn test_text_dump_requires_directory() {
        let options = SolverOptions::new().with_trust_region_dump(
            vec![0],
            PathBuf::new(),
            DumpFormatType::TextFile,
        );
        assert!(!options.is_valid());

        let options = SolverOptions::new().with_trust_region_dump(
            vec![0],
            PathBuf::new(),
            DumpFormatType::Console,
        );
        assert!(options.is_valid());
    }
}

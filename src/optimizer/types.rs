//! Enumerations selecting the numerical methods used by the solver.

use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// Family of minimization algorithm
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MinimizerType {
    /// Search along a descent direction; no linear solves
    LineSearch,
    /// Solve a model problem inside a trust region each iteration
    #[default]
    TrustRegion,
}

impl Display for MinimizerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MinimizerType::LineSearch => write!(f, "Line search"),
            MinimizerType::TrustRegion => write!(f, "Trust region"),
        }
    }
}

/// How the line-search minimizer picks its search direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LineSearchDirectionType {
    SteepestDescent,
    NonlinearConjugateGradient,
    /// Limited-memory BFGS
    #[default]
    Lbfgs,
    /// Dense BFGS; quadratic memory in the number of parameters
    Bfgs,
}

impl Display for LineSearchDirectionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LineSearchDirectionType::SteepestDescent => write!(f, "Steepest descent"),
            LineSearchDirectionType::NonlinearConjugateGradient => {
                write!(f, "Nonlinear conjugate gradient")
            }
            LineSearchDirectionType::Lbfgs => write!(f, "L-BFGS"),
            LineSearchDirectionType::Bfgs => write!(f, "BFGS"),
        }
    }
}

/// Step-size search along a direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LineSearchType {
    /// Backtracking until the sufficient decrease condition holds
    Armijo,
    /// Bracketing and zoom until the strong Wolfe conditions hold
    #[default]
    Wolfe,
}

impl Display for LineSearchType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LineSearchType::Armijo => write!(f, "Armijo"),
            LineSearchType::Wolfe => write!(f, "Wolfe"),
        }
    }
}

/// Update formula for nonlinear conjugate gradients
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum NonlinearConjugateGradientType {
    #[default]
    FletcherReeves,
    PolakRibiere,
    HestenesStiefel,
}

impl Display for NonlinearConjugateGradientType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NonlinearConjugateGradientType::FletcherReeves => write!(f, "Fletcher-Reeves"),
            NonlinearConjugateGradientType::PolakRibiere => write!(f, "Polak-Ribiere"),
            NonlinearConjugateGradientType::HestenesStiefel => write!(f, "Hestenes-Stiefel"),
        }
    }
}

/// Polynomial used to pick the next trial step inside a line search
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LineSearchInterpolationType {
    Bisection,
    Quadratic,
    #[default]
    Cubic,
}

impl Display for LineSearchInterpolationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LineSearchInterpolationType::Bisection => write!(f, "Bisection"),
            LineSearchInterpolationType::Quadratic => write!(f, "Quadratic"),
            LineSearchInterpolationType::Cubic => write!(f, "Cubic"),
        }
    }
}

/// Model step computed by the trust-region minimizer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TrustRegionStrategyType {
    #[default]
    LevenbergMarquardt,
    Dogleg,
}

impl Display for TrustRegionStrategyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TrustRegionStrategyType::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            TrustRegionStrategyType::Dogleg => write!(f, "Dogleg"),
        }
    }
}

/// Variant of the dogleg strategy
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DoglegType {
    /// Piecewise linear path through the Cauchy point to the Gauss-Newton point
    #[default]
    TraditionalDogleg,
    /// Minimize the model over the plane spanned by the gradient and Gauss-Newton step
    SubspaceDogleg,
}

impl Display for DoglegType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DoglegType::TraditionalDogleg => write!(f, "Traditional dogleg"),
            DoglegType::SubspaceDogleg => write!(f, "Subspace dogleg"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    DenseNormalCholesky,
    DenseQr,
    #[default]
    SparseNormalCholesky,
    DenseSchur,
    SparseSchur,
    IterativeSchur,
    Cgnr,
}

impl LinearSolverType {
    /// Whether the solver needs a sparse linear algebra library
    pub fn is_sparse(&self) -> bool {
        matches!(
            self,
            LinearSolverType::SparseNormalCholesky | LinearSolverType::SparseSchur
        )
    }
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::DenseNormalCholesky => write!(f, "Dense normal Cholesky"),
            LinearSolverType::DenseQr => write!(f, "Dense QR"),
            LinearSolverType::SparseNormalCholesky => write!(f, "Sparse normal Cholesky"),
            LinearSolverType::DenseSchur => write!(f, "Dense Schur"),
            LinearSolverType::SparseSchur => write!(f, "Sparse Schur"),
            LinearSolverType::IterativeSchur => write!(f, "Iterative Schur"),
            LinearSolverType::Cgnr => write!(f, "CGNR"),
        }
    }
}

/// Preconditioner for the iterative linear solvers
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionerType {
    Identity,
    #[default]
    Jacobi,
    SchurJacobi,
    ClusterJacobi,
    ClusterTridiagonal,
    /// Sparse Cholesky of the normal equations restricted to chosen residual blocks
    Subset,
}

impl Display for PreconditionerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PreconditionerType::Identity => write!(f, "Identity"),
            PreconditionerType::Jacobi => write!(f, "Jacobi"),
            PreconditionerType::SchurJacobi => write!(f, "Schur-Jacobi"),
            PreconditionerType::ClusterJacobi => write!(f, "Cluster Jacobi"),
            PreconditionerType::ClusterTridiagonal => write!(f, "Cluster tridiagonal"),
            PreconditionerType::Subset => write!(f, "Subset"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityClusteringType {
    #[default]
    CanonicalViews,
    SingleLinkage,
}

impl Display for VisibilityClusteringType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VisibilityClusteringType::CanonicalViews => write!(f, "Canonical views"),
            VisibilityClusteringType::SingleLinkage => write!(f, "Single linkage"),
        }
    }
}

/// Backend for dense factorizations
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DenseLinearAlgebraLibraryType {
    #[default]
    Nalgebra,
    Faer,
}

impl Display for DenseLinearAlgebraLibraryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DenseLinearAlgebraLibraryType::Nalgebra => write!(f, "nalgebra"),
            DenseLinearAlgebraLibraryType::Faer => write!(f, "faer"),
        }
    }
}

/// Backend for sparse factorizations
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SparseLinearAlgebraLibraryType {
    #[default]
    Faer,
    NoSparse,
}

impl Display for SparseLinearAlgebraLibraryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SparseLinearAlgebraLibraryType::Faer => write!(f, "faer"),
            SparseLinearAlgebraLibraryType::NoSparse => write!(f, "none"),
        }
    }
}

/// Verbosity of the minimizer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LoggingType {
    #[default]
    Silent,
    /// One `info!` line per iteration
    PerMinimizerIteration,
}

impl Display for LoggingType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LoggingType::Silent => write!(f, "Silent"),
            LoggingType::PerMinimizerIteration => write!(f, "Per minimizer iteration"),
        }
    }
}

/// Destination of trust-region problem dumps
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormatType {
    /// Log the matrices through `tracing`
    Console,
    /// Write one text file per matrix
    #[default]
    TextFile,
}

impl Display for DumpFormatType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DumpFormatType::Console => write!(f, "Console"),
            DumpFormatType::TextFile => write!(f, "Text file"),
        }
    }
}

/// How a solve ended
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TerminationType {
    /// A tolerance was met
    Convergence,
    /// The iteration or time limit was reached first
    #[default]
    NoConvergence,
    /// The minimizer could not make progress (repeated invalid steps, failed gradient check,
    /// failed initial evaluation)
    Failure,
}

impl Display for TerminationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TerminationType::Convergence => write!(f, "CONVERGENCE"),
            TerminationType::NoConvergence => write!(f, "NO_CONVERGENCE"),
            TerminationType::Failure => write!(f, "FAILURE"),
        }
    }
}

//! Dumps of the linear least squares problem solved by a trust-region iteration.
//!
//! For iteration `k` the problem `min ‖A x + b‖² + ‖D x‖²` is written as four pieces:
//! the Jacobian `A`, the residuals `b`, the regularizing diagonal `D` and the computed step
//! `x`. With [`DumpFormatType::TextFile`] each piece goes to
//! `<dir>/ceres_solver_iteration_<kkk>_<piece>.txt`:
//!
//! - `A` as `row col value` triplets, one per line, 0-based
//! - `b`, `D`, `x` as one value per line
//!
//! With [`DumpFormatType::Console`] the same text is logged at info level.

use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use faer::{Mat, sparse::SparseColMat};
use tracing::info;

use crate::{
    core::{CoreError, CoreResult},
    optimizer::types::DumpFormatType,
};

/// The linear least squares problem of one iteration
pub struct LinearLeastSquaresProblem<'a> {
    pub jacobian: &'a SparseColMat<usize, f64>,
    pub residuals: &'a Mat<f64>,
    pub diagonal: Option<&'a Mat<f64>>,
    pub step: &'a Mat<f64>,
}

/// Path of one dumped piece.
pub fn dump_file_path(directory: &Path, iteration: usize, piece: &str) -> PathBuf {
    directory.join(format!("ceres_solver_iteration_{iteration:03}_{piece}.txt"))
}

fn format_triplets(matrix: &SparseColMat<usize, f64>) -> String {
    let mut text = String::new();
    for t in matrix.triplet_iter() {
        let _ = writeln!(text, "{} {} {:.17e}", t.row, t.col, t.val);
    }
    text
}

fn format_vector(vector: &Mat<f64>) -> String {
    let mut text = String::new();
    for i in 0..vector.nrows() {
        let _ = writeln!(text, "{:.17e}", vector[(i, 0)]);
    }
    text
}

/// Write `problem` for `iteration` in `format`.
///
/// # Errors
///
/// `CoreError::Io` if a text file cannot be written.
pub fn dump_linear_least_squares_problem(
    problem: &LinearLeastSquaresProblem<'_>,
    iteration: usize,
    directory: &Path,
    format: DumpFormatType,
) -> CoreResult<()> {
    let diagonal = problem
        .diagonal
        .map(format_vector)
        .unwrap_or_default();
    let pieces = [
        ("A", format_triplets(problem.jacobian)),
        ("b", format_vector(problem.residuals)),
        ("D", diagonal),
        ("x", format_vector(problem.step)),
    ];

    match format {
        DumpFormatType::Console => {
            for (piece, text) in &pieces {
                info!("Iteration {iteration} {piece}:\n{text}");
            }
        }
        DumpFormatType::TextFile => {
            fs::create_dir_all(directory).map_err(|e| {
                CoreError::Io(format!("Cannot create {}", directory.display())).log_with_source(e)
            })?;
            for (piece, text) in &pieces {
                let path = dump_file_path(directory, iteration, piece);
                fs::write(&path, text).map_err(|e| {
                    CoreError::Io(format!("Cannot write {}", path.display())).log_with_source(e)
                })?;
            }
        }
    }
    Ok(())
}

//! Parameter blocks: the values being optimized.
//!
//! A parameter block is a contiguous vector of doubles owned by a
//! [`Problem`](crate::core::problem::Problem). Residual blocks refer to it through a
//! [`ParameterBlockId`], so every residual block that names the same id reads the same storage.
//!
//! Besides its values a block carries:
//! - a constant flag: constant blocks are read by cost functions but never updated and never
//!   get Jacobian requests
//! - optional per-coordinate box bounds: every trial point is projected onto the box

use std::fmt;

use crate::core::{CoreError, CoreResult};

/// Stable handle to a parameter block inside one problem.
///
/// The handle carries the identity of the problem that issued it, so using it with another
/// problem is detected instead of silently addressing the wrong block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterBlockId {
    pub(crate) problem: u64,
    pub(crate) index: usize,
}

impl ParameterBlockId {
    /// Position of the block in its problem, in registration order.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for ParameterBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parameter block {} (problem {})", self.index, self.problem)
    }
}

/// Values, bounds and constness of one parameter block.
#[derive(Debug, Clone)]
pub struct ParameterBlock {
    values: Vec<f64>,
    /// `f64::NEG_INFINITY` where unbounded
    lower_bounds: Vec<f64>,
    /// `f64::INFINITY` where unbounded
    upper_bounds: Vec<f64>,
    constant: bool,
}

impl ParameterBlock {
    /// Create a variable, unbounded block holding `values`.
    ///
    /// # Errors
    ///
    /// `CoreError::InvalidInput` if `values` is empty.
    pub fn new(values: impl Into<Vec<f64>>) -> CoreResult<Self> {
        let values = values.into();
        if values.is_empty() {
            return Err(
                CoreError::InvalidInput("parameter block must not be empty".to_string()).log(),
            );
        }
        let size = values.len();
        Ok(Self {
            values,
            lower_bounds: vec![f64::NEG_INFINITY; size],
            upper_bounds: vec![f64::INFINITY; size],
            constant: false,
        })
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Overwrite the block's values. The length must match.
    pub fn set_values(&mut self, values: &[f64]) -> CoreResult<()> {
        if values.len() != self.values.len() {
            return Err(CoreError::StructuralMismatch(format!(
                "expected {} values for the parameter block, got {}",
                self.values.len(),
                values.len()
            ))
            .log());
        }
        self.values.copy_from_slice(values);
        Ok(())
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub fn set_constant(&mut self, constant: bool) {
        self.constant = constant;
    }

    fn check_index(&self, index: usize) -> CoreResult<()> {
        if index >= self.values.len() {
            return Err(CoreError::IndexOutOfBounds {
                index,
                len: self.values.len(),
            }
            .log());
        }
        Ok(())
    }

    fn check_bound_pair(lower: f64, upper: f64, index: usize) -> CoreResult<()> {
        if lower.is_nan() || upper.is_nan() {
            return Err(
                CoreError::InvalidConstraint(format!("bound at index {index} is NaN")).log(),
            );
        }
        if lower > upper {
            return Err(CoreError::InvalidConstraint(format!(
                "lower bound {lower} exceeds upper bound {upper} at index {index}"
            ))
            .log());
        }
        Ok(())
    }

    pub fn lower_bound(&self, index: usize) -> CoreResult<f64> {
        self.check_index(index)?;
        Ok(self.lower_bounds[index])
    }

    pub fn upper_bound(&self, index: usize) -> CoreResult<f64> {
        self.check_index(index)?;
        Ok(self.upper_bounds[index])
    }

    /// Set the lower bound of coordinate `index`. `f64::NEG_INFINITY` removes it.
    pub fn set_lower_bound(&mut self, index: usize, value: f64) -> CoreResult<()> {
        self.check_index(index)?;
        Self::check_bound_pair(value, self.upper_bounds[index], index)?;
        self.lower_bounds[index] = value;
        Ok(())
    }

    /// Set the upper bound of coordinate `index`. `f64::INFINITY` removes it.
    pub fn set_upper_bound(&mut self, index: usize, value: f64) -> CoreResult<()> {
        self.check_index(index)?;
        Self::check_bound_pair(self.lower_bounds[index], value, index)?;
        self.upper_bounds[index] = value;
        Ok(())
    }

    pub fn set_all_lower_bounds(&mut self, bounds: &[f64]) -> CoreResult<()> {
        self.check_bound_vector(bounds)?;
        for (index, (&lower, &upper)) in bounds.iter().zip(&self.upper_bounds).enumerate() {
            Self::check_bound_pair(lower, upper, index)?;
        }
        self.lower_bounds.copy_from_slice(bounds);
        Ok(())
    }

    pub fn set_all_upper_bounds(&mut self, bounds: &[f64]) -> CoreResult<()> {
        self.check_bound_vector(bounds)?;
        for (index, (&lower, &upper)) in self.lower_bounds.iter().zip(bounds).enumerate() {
            Self::check_bound_pair(lower, upper, index)?;
        }
        self.upper_bounds.copy_from_slice(bounds);
        Ok(())
    }

    fn check_bound_vector(&self, bounds: &[f64]) -> CoreResult<()> {
        if bounds.len() != self.values.len() {
            return Err(CoreError::InvalidConstraint(format!(
                "bound vector has {} entries, parameter block has {}",
                bounds.len(),
                self.values.len()
            ))
            .log());
        }
        Ok(())
    }

    /// True if any coordinate has a finite bound.
    pub fn is_bounded(&self) -> bool {
        self.lower_bounds.iter().any(|b| b.is_finite())
            || self.upper_bounds.iter().any(|b| b.is_finite())
    }

    /// Clamp `point` (a candidate for this block) onto the bound box.
    pub fn project(&self, point: &mut [f64]) {
        for ((value, &lower), &upper) in point
            .iter_mut()
            .zip(&self.lower_bounds)
            .zip(&self.upper_bounds)
        {
            *value = value.clamp(lower, upper);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_new_block_is_free() -> TestResult {
        let block = ParameterBlock::new(vec![1.0, 2.0, 3.0])?;
        assert_eq!(block.size(), 3);
        assert!(!block.is_constant());
        assert!(!block.is_bounded());
        assert_eq!(block.lower_bound(1)?, f64::NEG_INFINITY);
        assert_eq!(block.upper_bound(2)?, f64::INFINITY);
        Ok(())
    }

    #[test]
    fn test_empty_block_rejected() {
        assert!(matches!(
            ParameterBlock::new(Vec::new()),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_set_values_checks_length() -> TestResult {
        let mut block = ParameterBlock::new([0.0, 0.0])?;
        block.set_values(&[4.0, 5.0])?;
        assert_eq!(block.values(), &[4.0, 5.0]);
        assert!(matches!(
            block.set_values(&[1.0]),
            Err(CoreError::StructuralMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_bounds_and_projection() -> TestResult {
        let mut block = ParameterBlock::new([0.0, 0.0, 0.0])?;
        block.set_lower_bound(0, -1.0)?;
        block.set_upper_bound(2, 0.5)?;
        assert!(block.is_bounded());

        let mut point = [-3.0, 100.0, 2.0];
        block.project(&mut point);
        assert_eq!(point, [-1.0, 100.0, 0.5]);

        assert!(matches!(
            block.set_lower_bound(3, 0.0),
            Err(CoreError::IndexOutOfBounds { index: 3, len: 3 })
        ));
        assert!(matches!(
            block.set_lower_bound(2, 1.0),
            Err(CoreError::InvalidConstraint(_))
        ));
        Ok(())
    }

    #[test]
    fn test_bound_vectors_are_size_checked() -> TestResult {
        let mut block = ParameterBlock::new([1.0, 1.0])?;
        block.set_all_lower_bounds(&[0.0, -2.0])?;
        block.set_all_upper_bounds(&[2.0, 2.0])?;
        assert_eq!(block.lower_bound(1)?, -2.0);
        assert!(matches!(
            block.set_all_upper_bounds(&[1.0]),
            Err(CoreError::InvalidConstraint(_))
        ));
        Ok(())
    }
}

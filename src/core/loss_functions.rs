//! Robust loss functions for outlier rejection in nonlinear least squares.
//!
//! A loss function ρ maps the squared norm of a residual block, `s = ||r||²`, to a robust
//! cost. Without a loss the cost of a block is `½ s`; with one it becomes `½ ρ(s)`.
//!
//! # Mathematical Formulation
//!
//! Each loss function returns `[ρ(s), ρ'(s), ρ''(s)]`. The first derivative acts as a weight
//! on the residual, the second is used by the [`Corrector`](crate::core::corrector::Corrector)
//! to keep the Gauss-Newton model consistent.
//!
//! All built-ins satisfy `ρ(0) = 0` and, except [`TolerantLoss`], `ρ'(0) = 1`, so they behave
//! like plain least squares for small residuals.
//!
//! # Available Loss Functions
//!
//! | Loss | ρ(s) | Parameters |
//! |------|------|------------|
//! | [`TrivialLoss`] | `s` | none |
//! | [`HuberLoss`] | `s` for `s ≤ a²`, `2a√s − a²` otherwise | `a > 0` |
//! | [`SoftLOneLoss`] | `2a²(√(1 + s/a²) − 1)` | `a > 0` |
//! | [`CauchyLoss`] | `a² ln(1 + s/a²)` | `a > 0` |
//! | [`ArctanLoss`] | `a atan2(s, a)` | `a > 0` |
//! | [`TolerantLoss`] | `b ln(1 + e^((s−a)/b)) − b ln(1 + e^(−a/b))` | `a > 0, b > 0` |
//! | [`TukeyLoss`] | `a²/3 (1 − (1 − s/a²)³)` for `s ≤ a²`, `a²/3` otherwise | `a > 0` |
//!
//! Callers can supply their own robustifier through [`CallbackLoss`], and rescale any loss with
//! [`ScaledLoss`].
//!
//! # Example
//!
//! ```
//! use apex_nlls::core::loss_functions::{HuberLoss, LossFunction};
//! # use apex_nlls::core::CoreResult;
//! # fn example() -> CoreResult<()> {
//!
//! let huber = HuberLoss::new(1.345)?;
//!
//! // Inlier: quadratic cost, full weight
//! let [rho, rho_prime, rho_double_prime] = huber.evaluate(0.5);
//! assert_eq!([rho, rho_prime, rho_double_prime], [0.5, 1.0, 0.0]);
//!
//! // Outlier: linear growth, reduced weight
//! let [_, rho_prime, _] = huber.evaluate(10.0);
//! assert!(rho_prime < 1.0);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::fmt;

use crate::core::{CoreError, CoreResult};

/// Trait for robust loss functions.
///
/// Implementations must be pure: the same `s` always yields the same triple, and no state is
/// shared between calls. The minimizer evaluates losses concurrently from several threads and
/// repeatedly for the same point.
pub trait LossFunction: Send + Sync {
    /// Evaluate `[ρ(s), ρ'(s), ρ''(s)]` at the squared residual norm `s ≥ 0`.
    fn evaluate(&self, s: f64) -> [f64; 3];
}

fn check_scale(name: &str, value: f64) -> CoreResult<()> {
    // Written to also reject NaN
    if !(value > 0.0) {
        return Err(
            CoreError::InvalidInput(format!("{name} needs to be larger than zero, got {value}"))
                .log(),
        );
    }
    Ok(())
}

/// Plain least squares: `ρ(s) = s`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialLoss;

impl TrivialLoss {
    pub fn new() -> Self {
        TrivialLoss
    }
}

impl LossFunction for TrivialLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        [s, 1.0, 0.0]
    }
}

/// Huber loss: quadratic for inliers, linear for outliers.
///
/// ```text
/// ρ(s) = s                 s ≤ a²
/// ρ(s) = 2a√s − a²         s > a²
/// ```
///
/// Convex and the usual first choice when a few outliers are expected.
#[derive(Debug, Clone)]
pub struct HuberLoss {
    /// Scale parameter a
    scale: f64,
    /// Cached a²
    scale2: f64,
}

impl HuberLoss {
    /// Create a Huber loss with threshold `scale` (must be positive).
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("scale", scale)?;
        Ok(HuberLoss {
            scale,
            scale2: scale * scale,
        })
    }
}

impl LossFunction for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            // Outlier region: s > a²
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN_POSITIVE);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            // Inlier region: s ≤ a²
            [s, 1.0, 0.0]
        }
    }
}

/// Soft L1 loss, a smooth approximation of the absolute value.
///
/// ```text
/// ρ(s) = 2a²(√(1 + s/a²) − 1)
/// ```
#[derive(Debug, Clone)]
pub struct SoftLOneLoss {
    /// a²
    b: f64,
    /// 1 / a²
    c: f64,
}

impl SoftLOneLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("scale", scale)?;
        let b = scale * scale;
        Ok(SoftLOneLoss { b, c: 1.0 / b })
    }
}

impl LossFunction for SoftLOneLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let tmp = sum.sqrt();
        let rho1 = (1.0 / tmp).max(f64::MIN_POSITIVE);
        [2.0 * self.b * (tmp - 1.0), rho1, -(self.c * rho1) / (2.0 * sum)]
    }
}

/// Cauchy (Lorentzian) loss.
///
/// ```text
/// ρ(s)   = a² ln(1 + s/a²)
/// ρ'(s)  = 1 / (1 + s/a²)
/// ρ''(s) = −1 / (a² (1 + s/a²)²)
/// ```
///
/// Grows logarithmically, so large residuals receive very small weights. Non-convex.
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    /// a²
    b: f64,
    /// 1 / a²
    c: f64,
}

impl CauchyLoss {
    /// Create a Cauchy loss with scale `scale` (must be positive).
    ///
    /// # Example
    ///
    /// ```
    /// use apex_nlls::core::loss_functions::{CauchyLoss, LossFunction};
    /// # use apex_nlls::core::CoreResult;
    /// # fn example() -> CoreResult<()> {
    ///
    /// let cauchy = CauchyLoss::new(2.0)?;
    /// let [_, weight, _] = cauchy.evaluate(100.0);
    /// assert!(weight < 0.05);
    /// # Ok(())
    /// # }
    /// # example().unwrap();
    /// ```
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("scale", scale)?;
        let b = scale * scale;
        Ok(CauchyLoss { b, c: 1.0 / b })
    }
}

impl LossFunction for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let inv = 1.0 / sum;
        [
            self.b * sum.ln(),
            inv.max(f64::MIN_POSITIVE),
            -self.c * (inv * inv),
        ]
    }
}

/// Arctangent loss: `ρ(s) = a atan2(s, a)`, bounded above by `aπ/2`.
#[derive(Debug, Clone)]
pub struct ArctanLoss {
    a: f64,
    /// 1 / a²
    b: f64,
}

impl ArctanLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("scale", scale)?;
        Ok(ArctanLoss {
            a: scale,
            b: 1.0 / (scale * scale),
        })
    }
}

impl LossFunction for ArctanLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * s * self.b;
        let inv = 1.0 / sum;
        [
            self.a * s.atan2(self.a),
            inv.max(f64::MIN_POSITIVE),
            -2.0 * s * self.b * (inv * inv),
        ]
    }
}

/// Tolerant loss: residuals below `a` cost almost nothing, above `a` cost grows linearly.
///
/// ```text
/// ρ(s) = b ln(1 + e^((s − a)/b)) − b ln(1 + e^(−a/b))
/// ```
///
/// `b` controls how sharp the transition around `a` is.
#[derive(Debug, Clone)]
pub struct TolerantLoss {
    a: f64,
    b: f64,
    /// b ln(1 + e^(−a/b)), keeps ρ(0) = 0
    c: f64,
}

impl TolerantLoss {
    /// Beyond this exponent `ln(1 + e^x)` is `x` to machine precision.
    const LOG_OVERFLOW_THRESHOLD: f64 = 700.0;

    pub fn new(a: f64, b: f64) -> CoreResult<Self> {
        check_scale("a", a)?;
        check_scale("b", b)?;
        Ok(TolerantLoss {
            a,
            b,
            c: b * (-a / b).exp().ln_1p(),
        })
    }
}

impl LossFunction for TolerantLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let x = (s - self.a) / self.b;
        if x > Self::LOG_OVERFLOW_THRESHOLD {
            [s - self.a - self.c, 1.0, 0.0]
        } else {
            let e_x = x.exp();
            [
                self.b * e_x.ln_1p() - self.c,
                (e_x / (1.0 + e_x)).max(f64::MIN_POSITIVE),
                0.5 / (self.b * (1.0 + x.cosh())),
            ]
        }
    }
}

/// Tukey biweight loss. Redescending: residuals with `s > a²` get zero weight.
///
/// ```text
/// ρ(s) = a²/3 (1 − (1 − s/a²)³)     s ≤ a²
/// ρ(s) = a²/3                       s > a²
/// ```
#[derive(Debug, Clone)]
pub struct TukeyLoss {
    /// a²
    a_squared: f64,
}

impl TukeyLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale("scale", scale)?;
        Ok(TukeyLoss {
            a_squared: scale * scale,
        })
    }
}

impl LossFunction for TukeyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s <= self.a_squared {
            let value = s / self.a_squared;
            let aux = 1.0 - value;
            let aux2 = aux * aux;
            [
                self.a_squared / 3.0 * (1.0 - aux2 * aux),
                aux2,
                -2.0 * aux / self.a_squared,
            ]
        } else {
            [self.a_squared / 3.0, 0.0, 0.0]
        }
    }
}

/// Boxed caller-supplied robustifier.
pub type LossEvaluator = Box<dyn Fn(f64) -> [f64; 3] + Send + Sync>;

/// Adapter for a caller-supplied robustifier.
///
/// The closure must be pure; it is evaluated concurrently and repeatedly.
pub struct CallbackLoss {
    evaluator: LossEvaluator,
}

impl CallbackLoss {
    pub fn new<F>(evaluator: F) -> Self
    where
        F: Fn(f64) -> [f64; 3] + Send + Sync + 'static,
    {
        CallbackLoss {
            evaluator: Box::new(evaluator),
        }
    }
}

impl LossFunction for CallbackLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        (self.evaluator)(s)
    }
}

impl fmt::Debug for CallbackLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLoss").finish_non_exhaustive()
    }
}

/// Multiplies another loss (or plain least squares when `inner` is `None`) by a constant.
///
/// Useful for weighting whole residual blocks against each other.
pub struct ScaledLoss {
    inner: Option<Box<dyn LossFunction>>,
    factor: f64,
}

impl ScaledLoss {
    pub fn new(inner: Option<Box<dyn LossFunction>>, factor: f64) -> CoreResult<Self> {
        check_scale("factor", factor)?;
        Ok(ScaledLoss { inner, factor })
    }
}

impl LossFunction for ScaledLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let rho = match &self.inner {
            Some(loss) => loss.evaluate(s),
            None => [s, 1.0, 0.0],
        };
        rho.map(|value| value * self.factor)
    }
}

impl fmt::Debug for ScaledLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScaledLoss")
            .field("factor", &self.factor)
            .field("has_inner", &self.inner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const EPSILON: f64 = 1e-9;

    /// Central differences of ρ at `s`
    fn numerical_derivative(loss: &dyn LossFunction, s: f64, h: f64) -> (f64, f64) {
        let [rho_plus, _, _] = loss.evaluate(s + h);
        let [rho_minus, _, _] = loss.evaluate(s - h);
        let [rho, _, _] = loss.evaluate(s);

        let rho_prime_numerical = (rho_plus - rho_minus) / (2.0 * h);
        let rho_double_prime_numerical = (rho_plus - 2.0 * rho + rho_minus) / (h * h);

        (rho_prime_numerical, rho_double_prime_numerical)
    }

    fn assert_derivatives(loss: &dyn LossFunction, s: f64) {
        let [_, rho_prime, rho_double_prime] = loss.evaluate(s);
        let (rho_prime_num, rho_double_prime_num) = numerical_derivative(loss, s, 1e-5);
        assert!(
            (rho_prime - rho_prime_num).abs() < 1e-6,
            "ρ'({s}) = {rho_prime}, numerical {rho_prime_num}"
        );
        assert!(
            (rho_double_prime - rho_double_prime_num).abs() < 1e-3,
            "ρ''({s}) = {rho_double_prime}, numerical {rho_double_prime_num}"
        );
    }

    fn builtins() -> Result<Vec<Box<dyn LossFunction>>, CoreError> {
        Ok(vec![
            Box::new(TrivialLoss::new()),
            Box::new(HuberLoss::new(1.5)?),
            Box::new(SoftLOneLoss::new(1.5)?),
            Box::new(CauchyLoss::new(1.5)?),
            Box::new(ArctanLoss::new(1.5)?),
            Box::new(TolerantLoss::new(1.5, 0.5)?),
            Box::new(TukeyLoss::new(1.5)?),
        ])
    }

    #[test]
    fn test_all_builtins_vanish_at_zero() -> TestResult {
        for loss in builtins()? {
            let [rho, rho_prime, rho_double_prime] = loss.evaluate(0.0);
            assert!(rho.abs() < EPSILON);
            assert!(rho_prime.is_finite() && rho_prime > 0.0);
            assert!(rho_double_prime.is_finite());
        }
        Ok(())
    }

    #[test]
    fn test_unit_slope_at_zero() -> TestResult {
        let losses: Vec<Box<dyn LossFunction>> = vec![
            Box::new(SoftLOneLoss::new(0.7)?),
            Box::new(CauchyLoss::new(0.7)?),
            Box::new(ArctanLoss::new(0.7)?),
            Box::new(TukeyLoss::new(0.7)?),
        ];
        for loss in losses {
            let [rho, rho_prime, rho_double_prime] = loss.evaluate(0.0);
            assert_eq!(rho, 0.0);
            assert!((rho_prime - 1.0).abs() < EPSILON);
            assert!(rho_double_prime.is_finite());
        }
        Ok(())
    }

    #[test]
    fn test_huber_loss() -> TestResult {
        let a = 2.0;
        let loss = HuberLoss::new(a)?;

        for s in [0.0, 0.5, 1.0, 3.9, a * a] {
            assert_eq!(loss.evaluate(s), [s, 1.0, 0.0]);
        }

        // Concave roll-off beyond a²
        let [rho, rho_prime, rho_double_prime] = loss.evaluate(9.0);
        assert!((rho - (2.0 * a * 3.0 - a * a)).abs() < EPSILON);
        assert!(rho < 9.0);
        assert!(rho_prime < 1.0);
        assert!(rho_double_prime < 0.0);
        assert_derivatives(&loss, 9.0);
        Ok(())
    }

    #[test]
    fn test_soft_l1_loss() -> TestResult {
        let loss = SoftLOneLoss::new(1.0)?;
        // ρ(3) = 2(√4 − 1) = 2
        let [rho, rho_prime, _] = loss.evaluate(3.0);
        assert!((rho - 2.0).abs() < EPSILON);
        assert!((rho_prime - 0.5).abs() < EPSILON);
        assert_derivatives(&loss, 3.0);
        Ok(())
    }

    #[test]
    fn test_cauchy_loss() -> TestResult {
        let loss = CauchyLoss::new(1.0)?;
        let [rho, rho_prime, rho_double_prime] = loss.evaluate(1.0);
        assert!((rho - 2.0_f64.ln()).abs() < EPSILON);
        assert!((rho_prime - 0.5).abs() < EPSILON);
        assert!((rho_double_prime + 0.25).abs() < EPSILON);
        assert_derivatives(&loss, 2.5);
        Ok(())
    }

    #[test]
    fn test_arctan_loss_is_bounded() -> TestResult {
        let a = 3.0;
        let loss = ArctanLoss::new(a)?;
        let [rho, _, _] = loss.evaluate(1e12);
        assert!(rho < a * std::f64::consts::FRAC_PI_2);
        assert_derivatives(&loss, 1.7);
        Ok(())
    }

    #[test]
    fn test_tolerant_loss() -> TestResult {
        let loss = TolerantLoss::new(4.0, 1.0)?;
        let [rho, _, _] = loss.evaluate(0.0);
        assert!(rho.abs() < EPSILON);

        // Below a: nearly free; above a: slope approaches one
        let [_, slope_below, _] = loss.evaluate(1.0);
        let [_, slope_above, _] = loss.evaluate(20.0);
        assert!(slope_below < 0.1);
        assert!(slope_above > 0.99);
        assert_derivatives(&loss, 4.0);

        // Overflow branch stays finite
        let [rho, rho_prime, rho_double_prime] = loss.evaluate(1e6);
        assert!(rho.is_finite());
        assert_eq!(rho_prime, 1.0);
        assert_eq!(rho_double_prime, 0.0);
        Ok(())
    }

    #[test]
    fn test_tukey_loss() -> TestResult {
        let loss = TukeyLoss::new(2.0)?;
        assert_derivatives(&loss, 1.0);
        assert_eq!(loss.evaluate(5.0), [4.0 / 3.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_non_positive_scale_rejected() {
        for scale in [0.0, -1.0, f64::NAN] {
            assert!(HuberLoss::new(scale).is_err());
            assert!(SoftLOneLoss::new(scale).is_err());
            assert!(CauchyLoss::new(scale).is_err());
            assert!(ArctanLoss::new(scale).is_err());
            assert!(TukeyLoss::new(scale).is_err());
            assert!(TolerantLoss::new(scale, 1.0).is_err());
            assert!(TolerantLoss::new(1.0, scale).is_err());
            assert!(ScaledLoss::new(None, scale).is_err());
        }
        assert!(matches!(
            HuberLoss::new(-2.0),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_callback_and_scaled_loss() -> TestResult {
        let custom = CallbackLoss::new(|s| [s.sqrt(), 0.5 / s.sqrt(), -0.25 / s.powf(1.5)]);
        assert_eq!(custom.evaluate(4.0)[0], 2.0);

        let scaled = ScaledLoss::new(Some(Box::new(CauchyLoss::new(1.0)?)), 3.0)?;
        let [rho, rho_prime, _] = scaled.evaluate(1.0);
        assert!((rho - 3.0 * 2.0_f64.ln()).abs() < EPSILON);
        assert!((rho_prime - 1.5).abs() < EPSILON);

        let plain = ScaledLoss::new(None, 2.0)?;
        assert_eq!(plain.evaluate(5.0), [10.0, 2.0, 0.0]);
        Ok(())
    }
}

//! The small, closed set of distributions used for priors and proposals.
//!
//! Every variant is chosen when it is constructed and exposes the same
//! sampling and log-density interface through [`LogDensity`]. All sampling
//! goes through a caller-owned random number generator.

use std::f64::consts::PI;

use faer::{ColRef, Mat};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    error::NumericalError,
    math::{cholesky, log_det, solve_lower},
};

pub trait LogDensity {
    type Sample;

    /// Natural log of the density (or mass) at `x`.
    ///
    /// Points outside the support evaluate to negative infinity.
    fn log_probability(&self, x: &Self::Sample) -> f64;

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Self::Sample;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Uniform {
    low: f64,
    high: f64,
}

impl Uniform {
    pub fn new(low: f64, high: f64) -> Result<Self, NumericalError> {
        if !(low.is_finite() && high.is_finite()) {
            return Err(NumericalError::NonFinite("uniform bounds"));
        }
        if !(high > low) {
            return Err(NumericalError::InvalidParameter("uniform needs high > low"));
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn log_width(&self) -> f64 {
        (self.high - self.low).ln()
    }
}

impl LogDensity for Uniform {
    type Sample = f64;

    fn log_probability(&self, x: &f64) -> f64 {
        if (*x >= self.low) & (*x <= self.high) {
            -self.log_width()
        } else {
            f64::NEG_INFINITY
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u: f64 = rng.random();
        (self.high - self.low).mul_add(u, self.low)
    }
}

/// Univariate normal, optionally over the natural log of the variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normal {
    mean: f64,
    variance: f64,
    log: bool,
}

impl Normal {
    pub fn new(mean: f64, variance: f64) -> Self {
        assert!(variance > 0f64, "Illegal variance: {}", variance);
        Self {
            mean,
            variance,
            log: false,
        }
    }

    /// Log-normal with `ln x ~ N(mean_log, variance)`.
    pub fn log_normal(mean_log: f64, variance: f64) -> Self {
        Self {
            log: true,
            ..Self::new(mean_log, variance)
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    /// First derivative of the negative log density in the working space.
    pub fn gradient(&self, x: f64) -> f64 {
        let y = if self.log { x.ln() } else { x };
        (y - self.mean) / self.variance
    }

    /// Second derivative of the negative log density in the working space.
    pub fn curvature(&self) -> f64 {
        self.variance.recip()
    }
}

impl LogDensity for Normal {
    type Sample = f64;

    fn log_probability(&self, x: &f64) -> f64 {
        let (y, jacobian) = if self.log {
            if !(*x > 0f64) {
                return f64::NEG_INFINITY;
            }
            let y = x.ln();
            (y, -y)
        } else {
            (*x, 0f64)
        };
        let diff = y - self.mean;
        -0.5 * ((2. * PI * self.variance).ln() + diff * diff / self.variance) + jacobian
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let z: f64 = rng.sample(StandardNormal);
        let y = self.variance.sqrt().mul_add(z, self.mean);
        if self.log {
            y.exp()
        } else {
            y
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Categorical {
    probabilities: Vec<f64>,
}

impl Categorical {
    /// Normalises the weights. Negative or non-finite weights are rejected.
    pub fn new(weights: &[f64]) -> Result<Self, NumericalError> {
        if weights.iter().any(|w| !w.is_finite() || *w < 0f64) {
            return Err(NumericalError::InvalidParameter("categorical weights"));
        }
        let total: f64 = weights.iter().sum();
        if !(total > 0f64) {
            return Err(NumericalError::InvalidParameter("categorical weights"));
        }
        Ok(Self {
            probabilities: weights.iter().map(|w| w / total).collect(),
        })
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }
}

impl LogDensity for Categorical {
    type Sample = usize;

    fn log_probability(&self, x: &usize) -> f64 {
        self.probabilities
            .get(*x)
            .map_or(f64::NEG_INFINITY, |p| p.ln())
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let u: f64 = rng.random();
        let mut cumulative = 0f64;
        for (i, p) in self.probabilities.iter().enumerate() {
            cumulative += p;
            if u < cumulative {
                return i;
            }
        }
        // Rounding can leave the cumulative sum just below one.
        self.probabilities
            .iter()
            .rposition(|&p| p > 0f64)
            .unwrap_or(0)
    }
}

/// Order-statistic prior on `count` sorted interior boundaries.
///
/// The density does not depend on where the boundaries are, only on how many
/// there are: `Σ_{j=1}^{count} [ln j − ln(range − j·min_width)]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderStatistic {
    low: f64,
    high: f64,
    min_width: f64,
    count: usize,
}

impl OrderStatistic {
    pub fn new(low: f64, high: f64, min_width: f64, count: usize) -> Self {
        Self {
            low,
            high,
            min_width,
            count,
        }
    }

    pub fn remaining_space(&self, n: usize) -> f64 {
        (self.high - self.low) - (n as f64) * self.min_width
    }

    pub fn log_density_for_count(&self) -> f64 {
        (1..=self.count)
            .map(|j| (j as f64).ln() - self.remaining_space(j).ln())
            .sum()
    }
}

impl LogDensity for OrderStatistic {
    type Sample = Vec<f64>;

    fn log_probability(&self, x: &Vec<f64>) -> f64 {
        let sorted = x.windows(2).all(|w| w[0] < w[1]);
        let inside = x.iter().all(|v| (*v >= self.low) & (*v <= self.high));
        if (x.len() != self.count) | !sorted | !inside {
            return f64::NEG_INFINITY;
        }
        self.log_density_for_count()
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let mut out: Vec<f64> = (0..self.count)
            .map(|_| {
                let u: f64 = rng.random();
                (self.high - self.low).mul_add(u, self.low)
            })
            .collect();
        out.sort_by(f64::total_cmp);
        out
    }
}

/// Multivariate log-normal: `ln x ~ N(mean, covariance)`.
///
/// Densities are with respect to `x` itself, so they include the
/// `−Σ ln xᵢ` Jacobian.
#[derive(Debug, Clone)]
pub struct MvLogNormal {
    mean: Vec<f64>,
    covariance: Mat<f64>,
    lower: Mat<f64>,
    log_det: f64,
}

impl MvLogNormal {
    pub fn new(mean: Vec<f64>, covariance: Mat<f64>) -> Result<Self, NumericalError> {
        if covariance.nrows() != mean.len() {
            return Err(NumericalError::DimensionMismatch {
                expected: mean.len(),
                found: covariance.nrows(),
            });
        }
        if mean.iter().any(|m| !m.is_finite()) {
            return Err(NumericalError::NonFinite("log-normal mean"));
        }
        let llt = cholesky(&covariance)?;
        let log_det = log_det(&llt);
        let lower = llt.L().to_owned();
        Ok(Self {
            mean,
            covariance,
            lower,
            log_det,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Mean of `ln x`.
    pub fn mean_log(&self) -> &[f64] {
        &self.mean
    }

    pub fn covariance(&self) -> &Mat<f64> {
        &self.covariance
    }
}

impl LogDensity for MvLogNormal {
    type Sample = Vec<f64>;

    fn log_probability(&self, x: &Vec<f64>) -> f64 {
        if (x.len() != self.dim()) || x.iter().any(|v| !(*v > 0f64)) {
            return f64::NEG_INFINITY;
        }
        let y: Vec<f64> = x.iter().map(|v| v.ln()).collect();
        let diff: Vec<f64> = y.iter().zip(self.mean.iter()).map(|(a, b)| a - b).collect();
        let Ok(z) = solve_lower(self.lower.as_ref(), &diff) else {
            return f64::NEG_INFINITY;
        };
        let n = self.dim() as f64;
        let jacobian: f64 = y.iter().sum();
        let squared: f64 = z.iter().map(|z| z * z).sum();
        -0.5 * (n * (2. * PI).ln() + self.log_det + squared) - jacobian
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let z: Vec<f64> = (0..self.dim()).map(|_| rng.sample(StandardNormal)).collect();
        let offsets = &self.lower * ColRef::from_slice(&z);
        offsets
            .iter()
            .zip(self.mean.iter())
            .map(|(offset, mean)| (mean + offset).exp())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use faer::Mat;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn uniform_density() {
        let u = Uniform::new(0., 4.).unwrap();
        assert_relative_eq!(u.log_probability(&1.), -(4f64.ln()));
        assert_eq!(u.log_probability(&5.), f64::NEG_INFINITY);
        assert!(Uniform::new(1., 1.).is_err());
    }

    #[test]
    fn categorical_follows_weights() {
        let cat = Categorical::new(&[1., 0., 3.]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut counts = [0usize; 3];
        for _ in 0..4000 {
            counts[cat.sample(&mut rng)] += 1;
        }
        assert_eq!(counts[1], 0);
        assert!((counts[2] as f64 / 4000. - 0.75).abs() < 0.03);
        assert_relative_eq!(cat.log_probability(&0), 0.25f64.ln());
    }

    #[test]
    fn log_normal_matches_univariate() {
        let mut cov = Mat::<f64>::zeros(2, 2);
        cov[(0, 0)] = 0.5;
        cov[(1, 1)] = 2.0;
        let mv = MvLogNormal::new(vec![0.1, -0.3], cov).unwrap();
        let a = Normal::log_normal(0.1, 0.5);
        let b = Normal::log_normal(-0.3, 2.0);
        let x = vec![1.7, 0.4];
        assert_relative_eq!(
            mv.log_probability(&x),
            a.log_probability(&x[0]) + b.log_probability(&x[1]),
            epsilon = 1e-12
        );
        assert_eq!(mv.log_probability(&vec![-1., 1.]), f64::NEG_INFINITY);
    }

    #[test]
    fn order_statistic_counts_only() {
        let prior = OrderStatistic::new(0., 10., 1., 2);
        let expected = (1f64.ln() - 9f64.ln()) + (2f64.ln() - 8f64.ln());
        assert_relative_eq!(prior.log_probability(&vec![2., 7.]), expected);
        assert_relative_eq!(prior.log_probability(&vec![3., 4.]), expected);
        assert_eq!(prior.log_probability(&vec![7., 2.]), f64::NEG_INFINITY);

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let draw = prior.sample(&mut rng);
        assert!(prior.log_probability(&draw).is_finite());
    }
}

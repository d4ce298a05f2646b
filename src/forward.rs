//! The boundary to the physics: a forward operator and the observed data it
//! is compared against.

use std::f64::consts::PI;

use faer::{Col, ColRef, Mat};

use crate::{
    error::{JumpError, NumericalError, Result},
    model::{DataTerm, Model},
};

/// Predicted data and its Jacobian with respect to `ln v`.
#[derive(Debug, Clone)]
pub struct Forward {
    pub predicted: Vec<f64>,
    /// One row per datum, one column per cell.
    pub jacobian: Mat<f64>,
}

/// Simulates the data a layered model would produce.
///
/// Implementations only supply `evaluate`. The crate treats the result as a
/// source of residuals and Gauss–Newton curvature and knows nothing about
/// the physics behind it.
pub trait ForwardModel: Send + Sync {
    type Err: std::error::Error + Send + Sync + 'static;

    fn evaluate(&self, model: &Model) -> std::result::Result<Forward, Self::Err>;

    fn forward(&self, model: &Model) -> Result<Forward> {
        let forward = self
            .evaluate(model)
            .map_err(|err| JumpError::Forward(Box::new(err)))?;
        if forward.jacobian.ncols() != model.n_cells() {
            return Err(NumericalError::DimensionMismatch {
                expected: model.n_cells(),
                found: forward.jacobian.ncols(),
            }
            .into());
        }
        Ok(forward)
    }

    /// Gauss–Newton gradient `Jᵀ W r` and Hessian `Jᵀ W J` of the negative
    /// log likelihood, with `r = predicted − observed` and `W = diag(1/σ²)`.
    fn data_term(&self, forward: &Forward, sounding: &Sounding) -> Result<DataTerm> {
        let residual = sounding.residual(&forward.predicted)?;
        let jacobian = &forward.jacobian;
        if jacobian.nrows() != sounding.n_data() {
            return Err(NumericalError::DimensionMismatch {
                expected: sounding.n_data(),
                found: jacobian.nrows(),
            }
            .into());
        }
        let weights = Col::from_fn(sounding.n_data(), |j| sounding.variance[j].recip());
        let weighted = weights.as_diagonal() * jacobian;

        let gradient = weighted.transpose() * ColRef::from_slice(&residual);
        let hessian = jacobian.transpose() * weighted.as_ref();
        let gradient = gradient.iter().copied().collect();
        DataTerm::new(gradient, hessian)
    }
}

/// Observed data of one sounding with independent Gaussian errors.
#[derive(Debug, Clone, PartialEq)]
pub struct Sounding {
    observed: Vec<f64>,
    variance: Vec<f64>,
}

impl Sounding {
    /// `std` holds one standard deviation per datum.
    pub fn new(observed: Vec<f64>, std: &[f64]) -> Result<Self> {
        if observed.len() != std.len() {
            return Err(NumericalError::DimensionMismatch {
                expected: observed.len(),
                found: std.len(),
            }
            .into());
        }
        if std.iter().any(|s| !(*s > 0f64) || !s.is_finite()) {
            return Err(JumpError::InvalidConfig(
                "data standard deviations must be positive".into(),
            ));
        }
        Ok(Self {
            observed,
            variance: std.iter().map(|s| s * s).collect(),
        })
    }

    pub fn observed(&self) -> &[f64] {
        &self.observed
    }

    pub fn variance(&self) -> &[f64] {
        &self.variance
    }

    pub fn n_data(&self) -> usize {
        self.observed.len()
    }

    fn residual(&self, predicted: &[f64]) -> Result<Vec<f64>> {
        if predicted.len() != self.n_data() {
            return Err(NumericalError::DimensionMismatch {
                expected: self.n_data(),
                found: predicted.len(),
            }
            .into());
        }
        Ok(predicted
            .iter()
            .zip(&self.observed)
            .map(|(p, o)| p - o)
            .collect())
    }

    /// Weighted sum of squared residuals.
    pub fn misfit(&self, predicted: &[f64]) -> Result<f64> {
        Ok(self
            .residual(predicted)?
            .iter()
            .zip(&self.variance)
            .map(|(r, v)| r * r / v)
            .sum())
    }

    pub fn log_likelihood(&self, predicted: &[f64]) -> Result<f64> {
        let normalisation: f64 = self.variance.iter().map(|v| (2. * PI * v).ln()).sum();
        Ok(-0.5 * (self.misfit(predicted)? + normalisation))
    }
}


#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::{test_forward::LinearForward, *};
    use crate::{
        mesh::{Mesh, MeshSettings},
        model::PriorSettings,
    };

    fn model() -> Model {
        let mesh = Mesh::new(vec![0., 10., 30.])
            .unwrap()
            .with_settings(&MeshSettings {
                min_edge: 0.,
                max_edge: 30.,
                max_cells: 5,
                ..Default::default()
            })
            .unwrap();
        Model::new(mesh, vec![1., 4.])
            .unwrap()
            .with_priors(&PriorSettings::default())
            .unwrap()
    }

    #[test]
    fn gaussian_log_likelihood() {
        let sounding = Sounding::new(vec![1., 2.], &[1., 2.]).unwrap();
        let expected = -0.5 * (1. + 0.25 + (2. * PI).ln() + (8. * PI).ln());
        assert_relative_eq!(sounding.log_likelihood(&[0., 3.]).unwrap(), expected);
        assert!(sounding.log_likelihood(&[0.]).is_err());
        assert!(Sounding::new(vec![1.], &[0.]).is_err());
    }

    #[test]
    fn data_term_matches_likelihood_gradient() {
        let operator = LinearForward {
            depths: vec![5., 20., 30.],
        };
        let model = model();
        let sounding = Sounding::new(vec![0.1, 0.5, 0.9], &[0.1, 0.2, 0.1]).unwrap();
        let forward = operator.forward(&model).unwrap();
        let term = operator.data_term(&forward, &sounding).unwrap();

        // The operator is linear in ln v, so Gauss–Newton is exact.
        let h = 1e-6;
        for i in 0..model.n_cells() {
            let shifted = |delta: f64| {
                let mut m = model.clone();
                let mut values = model.values().to_vec();
                values[i] *= delta.exp();
                m.set_values(values).unwrap();
                let predicted = operator.forward(&m).unwrap().predicted;
                -sounding.log_likelihood(&predicted).unwrap()
            };
            let numeric = (shifted(h) - shifted(-h)) / (2. * h);
            assert_relative_eq!(term.gradient[i], numeric, epsilon = 1e-4);
        }
        assert_relative_eq!(term.hessian[(0, 1)], term.hessian[(1, 0)], epsilon = 1e-12);
        assert!(term.hessian[(0, 0)] > 0.);
    }
}

//! A mesh with one strictly positive value per cell, its priors, and the
//! stochastic Newton proposal over those values.
//!
//! All derivatives are taken with respect to `ln v`, the space in which the
//! priors are Gaussian and the proposal is a multivariate normal.

use faer::Mat;
use rand::Rng;

use crate::{
    distributions::{LogDensity, MvLogNormal, Normal},
    error::{JumpError, NumericalError, Result},
    math::{add_mat, axpy, mat_vec, spd_inverse},
    mesh::{Action, Mesh},
    storage::{Group, Persist, Value},
};

/// Settings for the priors on the cell values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorSettings {
    /// Median of the log-normal value prior.
    pub value_mean: f64,
    /// Spread of the value prior. The variance of `ln v` is
    /// `ln(1 + factor)²`.
    pub factor: f64,
    /// Variance of the normal prior on the depth gradient of `ln v`.
    /// `None` disables the gradient prior.
    pub gradient_variance: Option<f64>,
    /// Hard lower and upper limits on every value.
    pub value_bounds: Option<(f64, f64)>,
    /// Include the value prior in the posterior and the proposal curvature.
    pub solve_values: bool,
    /// Include the gradient prior in the posterior and the proposal curvature.
    pub solve_gradient: bool,
}

impl Default for PriorSettings {
    fn default() -> Self {
        Self {
            value_mean: 1.,
            factor: 10.,
            gradient_variance: Some(1.5),
            value_bounds: None,
            solve_values: true,
            solve_gradient: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelPriors {
    settings: PriorSettings,
    value: Normal,
    gradient: Option<Normal>,
}

impl ModelPriors {
    pub fn new(settings: &PriorSettings) -> Result<Self> {
        if !(settings.value_mean > 0f64) || !settings.value_mean.is_finite() {
            return Err(JumpError::InvalidConfig(format!(
                "value prior mean must be positive, got {}",
                settings.value_mean
            )));
        }
        if !(settings.factor > 0f64) {
            return Err(JumpError::InvalidConfig(format!(
                "prior factor must be positive, got {}",
                settings.factor
            )));
        }
        if let Some((low, high)) = settings.value_bounds {
            if !(low >= 0f64 && high > low) {
                return Err(JumpError::InvalidConfig(format!(
                    "value bounds [{}, {}] are invalid",
                    low, high
                )));
            }
        }
        let gradient = match settings.gradient_variance {
            Some(variance) if variance > 0f64 => Some(Normal::new(0., variance)),
            Some(variance) => {
                return Err(JumpError::InvalidConfig(format!(
                    "gradient variance must be positive, got {}",
                    variance
                )))
            }
            None => None,
        };
        let log_variance = (1. + settings.factor).ln().powi(2);
        Ok(Self {
            settings: *settings,
            value: Normal::log_normal(settings.value_mean.ln(), log_variance),
            gradient,
        })
    }

    pub fn settings(&self) -> &PriorSettings {
        &self.settings
    }

    /// Log-normal prior on each value.
    pub fn value(&self) -> &Normal {
        &self.value
    }

    /// Normal prior on each depth gradient, if enabled.
    pub fn gradient(&self) -> Option<&Normal> {
        self.gradient.as_ref()
    }

    fn uses_gradient(&self) -> Option<&Normal> {
        self.gradient.as_ref().filter(|_| self.settings.solve_gradient)
    }
}

/// Gradient and Gauss–Newton Hessian of the negative log likelihood with
/// respect to `ln v`.
#[derive(Debug, Clone)]
pub struct DataTerm {
    pub gradient: Vec<f64>,
    pub hessian: Mat<f64>,
}

impl DataTerm {
    pub fn new(gradient: Vec<f64>, hessian: Mat<f64>) -> Result<Self> {
        let n = gradient.len();
        if hessian.nrows() != n || hessian.ncols() != n {
            return Err(NumericalError::DimensionMismatch {
                expected: n,
                found: hessian.nrows(),
            }
            .into());
        }
        Ok(Self { gradient, hessian })
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    mesh: Mesh,
    values: Vec<f64>,
    priors: Option<ModelPriors>,
    proposal: Option<MvLogNormal>,
    gradient: Vec<f64>,
    dirty: bool,
}

fn check_values(mesh: &Mesh, values: &[f64]) -> Result<()> {
    if values.len() != mesh.n_cells() {
        return Err(NumericalError::DimensionMismatch {
            expected: mesh.n_cells(),
            found: values.len(),
        }
        .into());
    }
    if values.iter().any(|v| !(*v > 0f64) || !v.is_finite()) {
        return Err(JumpError::InvalidConfig(
            "cell values must be positive and finite".into(),
        ));
    }
    Ok(())
}

impl Model {
    pub fn new(mesh: Mesh, values: Vec<f64>) -> Result<Self> {
        check_values(&mesh, &values)?;
        Ok(Self {
            mesh,
            values,
            priors: None,
            proposal: None,
            gradient: vec![],
            dirty: true,
        })
    }

    /// A model with every cell at the median of the value prior.
    pub fn from_prior(mesh: Mesh, settings: &PriorSettings) -> Result<Self> {
        let values = vec![settings.value_mean; mesh.n_cells()];
        Self::new(mesh, values)?.with_priors(settings)
    }

    pub fn with_priors(mut self, settings: &PriorSettings) -> Result<Self> {
        self.set_priors(ModelPriors::new(settings)?);
        Ok(self)
    }

    pub fn set_priors(&mut self, priors: ModelPriors) {
        self.priors = Some(priors);
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn n_cells(&self) -> usize {
        self.values.len()
    }

    pub fn priors(&self) -> Result<&ModelPriors> {
        self.priors
            .as_ref()
            .ok_or(JumpError::NotConfigured("model priors"))
    }

    /// The distribution the current values were drawn from.
    pub fn proposal(&self) -> Option<&MvLogNormal> {
        self.proposal.as_ref()
    }

    pub fn set_values(&mut self, values: Vec<f64>) -> Result<()> {
        check_values(&self.mesh, &values)?;
        self.values = values;
        self.dirty = true;
        Ok(())
    }

    /// The cached depth gradient. Fails if the model changed since it was
    /// last computed.
    pub fn gradient(&self) -> Result<&[f64]> {
        if self.dirty {
            return Err(JumpError::GradientStale);
        }
        Ok(&self.gradient)
    }

    pub fn recompute_gradient(&mut self) -> Result<&[f64]> {
        self.gradient = self.depth_gradient()?;
        self.dirty = false;
        Ok(&self.gradient)
    }

    /// `(ln v_{i+1} − ln v_i) / ln(w_i / min_width)` across every boundary.
    pub fn depth_gradient(&self) -> Result<Vec<f64>> {
        let scale = self.mesh.log_thickness_ratios()?;
        Ok(self
            .values
            .windows(2)
            .zip(scale)
            .map(|(v, s)| (v[1].ln() - v[0].ln()) / s)
            .collect())
    }

    /// Perturb the mesh and carry the values over to the new cells.
    ///
    /// The attached proposal survives only if the number of cells does.
    pub fn perturb_structure<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Model> {
        let mesh = self.mesh.perturb(rng)?;
        let values = mesh.remap_values(&self.values)?;
        let proposal = if mesh.action().changes_dimension() {
            None
        } else {
            self.proposal.clone()
        };
        Ok(Model {
            mesh,
            values,
            priors: self.priors.clone(),
            proposal,
            gradient: vec![],
            dirty: true,
        })
    }

    /// Gradient of the negative log prior with respect to `ln v`.
    pub fn prior_gradient(&self) -> Result<Vec<f64>> {
        let priors = self.priors()?;
        let mut out = vec![0f64; self.n_cells()];
        if priors.settings.solve_values {
            let value = &priors.value;
            out.iter_mut()
                .zip(&self.values)
                .for_each(|(o, v)| *o += value.gradient(*v));
        }
        if let Some(gradient) = priors.uses_gradient() {
            let scale = self.mesh.log_thickness_ratios()?;
            let g = self.depth_gradient()?;
            let weight = gradient.variance().recip();
            // Dᵀ g with D_{i,i} = −1/s_i and D_{i,i+1} = 1/s_i
            for (i, (gi, si)) in g.iter().zip(&scale).enumerate() {
                out[i] -= weight * gi / si;
                out[i + 1] += weight * gi / si;
            }
        }
        Ok(out)
    }

    /// Hessian of the negative log prior with respect to `ln v`.
    pub fn prior_hessian(&self) -> Result<Mat<f64>> {
        let priors = self.priors()?;
        let n = self.n_cells();
        let mut hessian = Mat::<f64>::zeros(n, n);
        if priors.settings.solve_values {
            let curvature = priors.value.curvature();
            for i in 0..n {
                hessian[(i, i)] += curvature;
            }
        }
        if let Some(gradient) = priors.uses_gradient() {
            let weight = gradient.variance().recip();
            for (i, s) in self.mesh.log_thickness_ratios()?.iter().enumerate() {
                let w = weight / (s * s);
                hessian[(i, i)] += w;
                hessian[(i + 1, i + 1)] += w;
                hessian[(i, i + 1)] -= w;
                hessian[(i + 1, i)] -= w;
            }
        }
        Ok(hessian)
    }

    /// `(prior Hessian + data Hessian)⁻¹`.
    pub fn local_inverse_hessian(&self, data: Option<&DataTerm>) -> Result<Mat<f64>> {
        let mut hessian = self.prior_hessian()?;
        if let Some(data) = data {
            hessian = add_mat(&hessian, &data.hessian)?;
        }
        Ok(spd_inverse(&hessian)?)
    }

    /// Gradient of the negative log posterior with respect to `ln v`.
    pub fn posterior_gradient(&self, data: Option<&DataTerm>) -> Result<Vec<f64>> {
        let mut gradient = self.prior_gradient()?;
        if let Some(data) = data {
            if data.gradient.len() != gradient.len() {
                return Err(NumericalError::DimensionMismatch {
                    expected: gradient.len(),
                    found: data.gradient.len(),
                }
                .into());
            }
            axpy(&data.gradient, &mut gradient, 1f64);
        }
        Ok(gradient)
    }

    /// Draw new values from a log-normal centred half a Newton step downhill.
    ///
    /// The covariance is the local inverse Hessian. It is recomputed after a
    /// birth or death and otherwise taken from the proposal attached to this
    /// model.
    pub fn stochastic_newton_step<R: Rng + ?Sized>(
        &self,
        data: Option<&DataTerm>,
        rng: &mut R,
    ) -> Result<Model> {
        let n = self.n_cells();
        let covariance = match (&self.proposal, self.mesh.action()) {
            (_, Action::Insert { .. } | Action::Delete { .. }) | (None, _) => {
                self.local_inverse_hessian(data)?
            }
            (Some(previous), _) if previous.dim() != n => self.local_inverse_hessian(data)?,
            (Some(previous), _) => previous.covariance().clone(),
        };

        let gradient = self.posterior_gradient(data)?;
        let mut mean: Vec<f64> = self.values.iter().map(|v| v.ln()).collect();
        axpy(&mat_vec(covariance.as_ref(), &gradient)?, &mut mean, -0.5);

        let proposal = MvLogNormal::new(mean, covariance)?;
        let values = proposal.sample(rng);
        check_values(&self.mesh, &values)?;

        Ok(Model {
            mesh: self.mesh.clone(),
            values,
            priors: self.priors.clone(),
            proposal: Some(proposal),
            gradient: vec![],
            dirty: true,
        })
    }

    /// Structural perturbation followed by a stochastic Newton step.
    ///
    /// `data_term` is evaluated at the structurally perturbed model. Returns
    /// `(remapped, perturbed)`.
    pub fn perturb<R, F>(&self, mut data_term: F, rng: &mut R) -> Result<(Model, Model)>
    where
        R: Rng + ?Sized,
        F: FnMut(&Model) -> Result<Option<DataTerm>>,
    {
        let remapped = self.perturb_structure(rng)?;
        let data = data_term(&remapped)?;
        let perturbed = remapped.stochastic_newton_step(data.as_ref(), rng)?;
        Ok((remapped, perturbed))
    }

    pub fn in_value_bounds(&self) -> Result<bool> {
        Ok(match self.priors()?.settings.value_bounds {
            Some((low, high)) => self.values.iter().all(|v| (*v >= low) & (*v <= high)),
            None => true,
        })
    }

    /// Log prior of structure and values.
    pub fn prior_log_probability(&self) -> Result<f64> {
        if !self.in_value_bounds()? {
            return Ok(f64::NEG_INFINITY);
        }
        let priors = self.priors()?;
        let mut total = self.mesh.prior_log_probability()?;
        if priors.settings.solve_values {
            total += self
                .values
                .iter()
                .map(|v| priors.value.log_probability(v))
                .sum::<f64>();
        }
        if let Some(gradient) = priors.uses_gradient() {
            total += self
                .depth_gradient()?
                .iter()
                .map(|g| gradient.log_probability(g))
                .sum::<f64>();
        }
        Ok(total)
    }
}

impl Persist for Model {
    fn write_to<G: Group>(&self, parent: &mut G, name: &str) -> anyhow::Result<()> {
        let group = parent.create_group(name)?;
        self.mesh.write_to(group, "mesh")?;
        group.write("values", self.values.clone().into())?;
        if let Some(priors) = &self.priors {
            let s = priors.settings;
            let priors = group.create_group("priors")?;
            priors.write("value_mean", s.value_mean.into())?;
            priors.write("factor", s.factor.into())?;
            if let Some(variance) = s.gradient_variance {
                priors.write("gradient_variance", variance.into())?;
            }
            if let Some((low, high)) = s.value_bounds {
                priors.write("value_bounds", vec![low, high].into())?;
            }
            priors.write("solve_values", Value::ScalarU64(s.solve_values.into()))?;
            priors.write("solve_gradient", Value::ScalarU64(s.solve_gradient.into()))?;
        }
        Ok(())
    }

    fn read_from<G: Group>(parent: &G, name: &str) -> anyhow::Result<Self> {
        let group = parent.group(name)?;
        let mesh = Mesh::read_from(group, "mesh")?;
        let values = group.read("values")?.as_f64s()?.to_vec();
        let mut model = Model::new(mesh, values)?;
        if group.contains("priors") {
            let priors = group.group("priors")?;
            let value_bounds = if priors.contains("value_bounds") {
                match priors.read("value_bounds")?.as_f64s()? {
                    &[low, high] => Some((low, high)),
                    other => anyhow::bail!("Expected two value bounds, found {}", other.len()),
                }
            } else {
                None
            };
            let gradient_variance = if priors.contains("gradient_variance") {
                Some(priors.read("gradient_variance")?.as_scalar_f64()?)
            } else {
                None
            };
            let settings = PriorSettings {
                value_mean: priors.read("value_mean")?.as_scalar_f64()?,
                factor: priors.read("factor")?.as_scalar_f64()?,
                gradient_variance,
                value_bounds,
                solve_values: priors.read("solve_values")?.as_scalar_u64()? != 0,
                solve_gradient: priors.read("solve_gradient")?.as_scalar_u64()? != 0,
            };
            model = model.with_priors(&settings)?;
        }
        Ok(model)
    }
}

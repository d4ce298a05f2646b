use crate::{
    error::{JumpError, Result},
    histogram::{Bins, Histogram1D, Histogram2D, OutOfRange},
    mesh::{Mesh, Transform},
    model::{Model, ModelPriors},
    storage::{Group, Persist, Value},
};

/// Grid and summary settings for the posterior histograms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosteriorSettings {
    /// Number of value bins.
    pub n_bins: usize,
    /// Half-width of the value axis in prior standard deviations of `ln v`.
    pub n_std: f64,
    /// An interface is only counted when the values on either side differ by
    /// at least this fraction.
    pub interface_ratio: f64,
    /// Credible interval used for opacity and depth of investigation.
    pub credible_percent: f64,
    /// Opacity threshold for the depth of investigation, in percent.
    pub doi_percent: f64,
}

impl Default for PosteriorSettings {
    fn default() -> Self {
        Self {
            n_bins: 250,
            n_std: 4.,
            interface_ratio: 0.5,
            credible_percent: 95.,
            doi_percent: 67.,
        }
    }
}

/// Streaming posterior of one sounding.
///
/// Holds the number of cells, the interface locations, and the cell values
/// against depth. Depths are binned in the stored space of the mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorHistogram {
    settings: PosteriorSettings,
    n_cells: Histogram1D,
    interfaces: Histogram1D,
    values: Histogram2D,
    transform: Transform,
    relative_to: f64,
}

fn depth_grid(mesh: &Mesh) -> Result<Bins> {
    let bounds = mesh.bounds()?;
    let range = bounds.max_edge - bounds.min_edge;
    let low = if bounds.min_edge > 0f64 {
        0.9 * bounds.min_edge
    } else {
        bounds.min_edge - 0.1 * range
    };
    let high = if bounds.max_edge > 0f64 {
        1.1 * bounds.max_edge
    } else {
        bounds.max_edge + 0.1 * range
    };
    Bins::stepped(low, high, 0.5 * bounds.min_width, Transform::Linear)
}

impl PosteriorHistogram {
    pub fn new(mesh: &Mesh, priors: &ModelPriors, settings: &PosteriorSettings) -> Result<Self> {
        if !(settings.n_std > 0f64) {
            return Err(JumpError::InvalidConfig("n_std must be positive".into()));
        }
        if !(0f64..1f64).contains(&settings.interface_ratio) {
            return Err(JumpError::InvalidConfig(
                "interface_ratio must be in [0, 1)".into(),
            ));
        }
        let bounds = mesh.bounds()?;
        let depths = depth_grid(mesh)?;

        let prior = priors.value();
        let half_width = settings.n_std * prior.variance().sqrt();
        let values = Bins::regular(
            prior.mean() - half_width,
            prior.mean() + half_width,
            settings.n_bins,
            Transform::Log,
        )?;

        Ok(Self {
            settings: *settings,
            n_cells: Histogram1D::new(Bins::integers(bounds.max_cells)),
            interfaces: Histogram1D::new(depths.clone()),
            values: Histogram2D::new(values, depths),
            transform: mesh.transform(),
            relative_to: mesh.relative_to(),
        })
    }

    pub fn settings(&self) -> &PosteriorSettings {
        &self.settings
    }

    pub fn n_cells(&self) -> &Histogram1D {
        &self.n_cells
    }

    pub fn interfaces(&self) -> &Histogram1D {
        &self.interfaces
    }

    pub fn values(&self) -> &Histogram2D {
        &self.values
    }

    /// Number of models recorded.
    pub fn n_samples(&self) -> u64 {
        self.n_cells.total()
    }

    /// Record one model.
    ///
    /// `policy` decides what happens to cell counts, interfaces and values
    /// that fall outside their grids, and to depths below or above the mesh.
    /// The value grid has no overflow counters, so [`OutOfRange::Tally`]
    /// drops values there like [`OutOfRange::Trim`].
    pub fn update(&mut self, model: &Model, policy: OutOfRange) {
        let mesh = model.mesh();
        let values = model.values();
        self.n_cells.update(mesh.n_cells() as f64, policy);

        let low = 1. - self.settings.interface_ratio;
        let high = 1. + self.settings.interface_ratio;
        for (i, edge) in mesh.edges().iter().enumerate().take(mesh.n_cells()).skip(1) {
            let ratio = values[i] / values[i - 1];
            if (ratio <= low) | (ratio >= high) {
                self.interfaces.update(*edge, policy);
            }
        }

        for (row, depth) in self.values.y_bins().centres().into_iter().enumerate() {
            if let Some(cell) = mesh.cell_index(depth, policy) {
                self.values.increment_row(row, values[cell], policy);
            }
        }
    }

    /// Centres of the depth bins in absolute coordinates.
    pub fn depths(&self) -> Vec<f64> {
        self.values
            .y_bins()
            .centres()
            .into_iter()
            .map(|d| self.transform.inverse(d) + self.relative_to)
            .collect()
    }

    /// `(median, low, high)` of the value at every depth.
    pub fn credible_intervals(&self) -> Vec<Option<(f64, f64, f64)>> {
        self.values.credible_intervals(self.settings.credible_percent)
    }

    pub fn transparency(&self) -> Vec<f64> {
        self.values.transparency(self.settings.credible_percent)
    }

    pub fn opacity(&self) -> Vec<f64> {
        self.values.opacity(self.settings.credible_percent)
    }

    /// Fraction of recorded models with an interface in each depth bin.
    pub fn interface_probability(&self) -> Vec<f64> {
        let n = self.n_samples();
        self.interfaces
            .counts()
            .iter()
            .map(|c| if n == 0 { 0f64 } else { *c as f64 / n as f64 })
            .collect()
    }

    /// Deepest depth whose opacity reaches `doi_percent`.
    ///
    /// Scans upward from the bottom of the depth grid and falls back to the
    /// shallowest depth when no bin is opaque enough.
    pub fn depth_of_investigation(&self) -> f64 {
        let threshold = 0.01 * self.settings.doi_percent;
        let opacity = self.opacity();
        let index = opacity
            .iter()
            .rposition(|o| *o >= threshold)
            .unwrap_or(0);
        self.depths()[index]
    }

    /// Add the counts of another sounding recorded on the same grids.
    pub fn merge(&mut self, other: &PosteriorHistogram) -> Result<()> {
        self.n_cells.merge(&other.n_cells)?;
        self.interfaces.merge(&other.interfaces)?;
        self.values.merge(&other.values)
    }
}

impl Persist for PosteriorHistogram {
    fn write_to<G: Group>(&self, parent: &mut G, name: &str) -> anyhow::Result<()> {
        let group = parent.create_group(name)?;
        let s = &self.settings;
        group.write(
            "settings",
            vec![
                s.n_bins as f64,
                s.n_std,
                s.interface_ratio,
                s.credible_percent,
                s.doi_percent,
            ]
            .into(),
        )?;
        group.write("transform", Value::String(self.transform.name().into()))?;
        group.write("relative_to", self.relative_to.into())?;
        self.n_cells.write_to(group, "n_cells")?;
        self.interfaces.write_to(group, "interfaces")?;
        self.values.write_to(group, "values")
    }

    fn read_from<G: Group>(parent: &G, name: &str) -> anyhow::Result<Self> {
        let group = parent.group(name)?;
        let settings = match group.read("settings")?.as_f64s()? {
            &[n_bins, n_std, interface_ratio, credible_percent, doi_percent] => PosteriorSettings {
                n_bins: n_bins as usize,
                n_std,
                interface_ratio,
                credible_percent,
                doi_percent,
            },
            other => anyhow::bail!("Expected 5 posterior settings, found {}", other.len()),
        };
        let transform_name = group.read("transform")?.as_str()?;
        let Some(transform) = Transform::from_name(transform_name) else {
            anyhow::bail!("Unknown transform {}", transform_name);
        };
        Ok(Self {
            settings,
            n_cells: Histogram1D::read_from(group, "n_cells")?,
            interfaces: Histogram1D::read_from(group, "interfaces")?,
            values: Histogram2D::read_from(group, "values")?,
            transform,
            relative_to: group.read("relative_to")?.as_scalar_f64()?,
        })
    }
}

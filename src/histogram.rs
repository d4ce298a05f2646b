//! Streaming 1D and 2D count histograms and the statistics derived from them.
//!
//! Bin edges live in the space given by the bins' [`Transform`]. Samples are
//! transformed before they are located. Percentiles, means and modes are
//! mapped back to the original space. Credible ranges, transparency and
//! opacity are measured in bin space.

use anyhow::Context;

use crate::{
    error::{JumpError, Result},
    math::add_counts,
    mesh::Transform,
    storage::{Group, Persist, Value},
};

/// What to do with a sample that falls outside the bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutOfRange {
    /// Count it in the underflow or overflow counter, outside `counts`.
    #[default]
    Tally,
    /// Count it in the nearest edge bin.
    Clip,
    /// Drop it.
    Trim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Below,
    Inside(usize),
    Above,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bins {
    edges: Vec<f64>,
    transform: Transform,
}

impl Bins {
    /// Bins from edges given in bin (transformed) space.
    pub fn from_edges(edges: Vec<f64>, transform: Transform) -> Result<Self> {
        if edges.len() < 2 {
            return Err(JumpError::InvalidConfig(
                "histogram needs at least one bin".into(),
            ));
        }
        if edges.iter().any(|e| !e.is_finite()) || edges.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(JumpError::InvalidConfig(
                "histogram edges must be finite and strictly increasing".into(),
            ));
        }
        Ok(Self { edges, transform })
    }

    /// `n_bins` equal bins over `[low, high]` in bin space.
    pub fn regular(low: f64, high: f64, n_bins: usize, transform: Transform) -> Result<Self> {
        if n_bins == 0 {
            return Err(JumpError::InvalidConfig("n_bins must be > 0".into()));
        }
        let step = (high - low) / n_bins as f64;
        let edges = (0..=n_bins).map(|i| step.mul_add(i as f64, low)).collect();
        Self::from_edges(edges, transform)
    }

    /// Bins of width `step` starting at `low`, covering `[low, high)`.
    pub fn stepped(low: f64, high: f64, step: f64, transform: Transform) -> Result<Self> {
        if !(step > 0f64) || !(high > low) {
            return Err(JumpError::InvalidConfig(format!(
                "cannot step [{}, {}) by {}",
                low, high, step
            )));
        }
        let n_bins = ((high - low) / step).ceil() as usize;
        let edges = (0..=n_bins).map(|i| step.mul_add(i as f64, low)).collect();
        Self::from_edges(edges, transform)
    }

    /// One unit-width bin centred on each integer in `0..=max`.
    pub fn integers(max: usize) -> Self {
        Self {
            edges: (0..=max + 1).map(|i| i as f64 - 0.5).collect(),
            transform: Transform::Linear,
        }
    }

    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn centres(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }

    pub fn widths(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Width of the whole bin range in bin space.
    pub fn range(&self) -> f64 {
        self.edges[self.n_bins()] - self.edges[0]
    }

    /// Bins are closed on the left. The last bin also holds its right edge.
    fn locate(&self, x: f64) -> Option<Location> {
        let y = self.transform.forward(x);
        if y.is_nan() {
            return None;
        }
        let n = self.n_bins();
        if y < self.edges[0] {
            Some(Location::Below)
        } else if y > self.edges[n] {
            Some(Location::Above)
        } else if y == self.edges[n] {
            Some(Location::Inside(n - 1))
        } else {
            Some(Location::Inside(self.edges.partition_point(|e| *e <= y) - 1))
        }
    }

    /// Bin index of `x` under `policy`, `None` if it is not binned.
    pub fn index(&self, x: f64, policy: OutOfRange) -> Option<usize> {
        match (self.locate(x)?, policy) {
            (Location::Inside(i), _) => Some(i),
            (Location::Below, OutOfRange::Clip) => Some(0),
            (Location::Above, OutOfRange::Clip) => Some(self.n_bins() - 1),
            _ => None,
        }
    }

    fn write_into<G: Group>(&self, group: &mut G) -> anyhow::Result<()> {
        group.write("edges", self.edges.clone().into())?;
        group.write("transform", Value::String(self.transform.name().into()))
    }

    fn read_from_group<G: Group>(group: &G) -> anyhow::Result<Self> {
        let name = group.read("transform")?.as_str()?;
        let transform =
            Transform::from_name(name).with_context(|| format!("Unknown transform {}", name))?;
        let edges = group.read("edges")?.as_f64s()?.to_vec();
        Bins::from_edges(edges, transform).context("Stored bins are invalid")
    }
}

fn check_same_bins(a: &Bins, b: &Bins) -> Result<()> {
    if a != b {
        return Err(JumpError::InvalidConfig(
            "cannot merge histograms with different bins".into(),
        ));
    }
    Ok(())
}

/// Interpolated percentile in bin space.
///
/// The CDF is linear inside each bin, so the result lies between the edges
/// of the bin where the cumulative count crosses `percent`.
fn percentile_of(edges: &[f64], counts: &[u64], percent: f64) -> Option<f64> {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return None;
    }
    let target = (percent / 100.).clamp(0., 1.) * total as f64;
    let mut cumulative = 0f64;
    for (i, &c) in counts.iter().enumerate() {
        if c == 0 {
            continue;
        }
        let next = cumulative + c as f64;
        if next >= target {
            let fraction = (target - cumulative) / c as f64;
            return Some(fraction.mul_add(edges[i + 1] - edges[i], edges[i]));
        }
        cumulative = next;
    }
    Some(edges[edges.len() - 1])
}

fn credible_range_of(edges: &[f64], counts: &[u64], percent: f64) -> Option<f64> {
    let tail = 0.5 * (100. - percent);
    Some(percentile_of(edges, counts, 100. - tail)? - percentile_of(edges, counts, tail)?)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram1D {
    bins: Bins,
    counts: Vec<u64>,
    underflow: u64,
    overflow: u64,
}

impl Histogram1D {
    pub fn new(bins: Bins) -> Self {
        Self {
            counts: vec![0; bins.n_bins()],
            bins,
            underflow: 0,
            overflow: 0,
        }
    }

    pub fn bins(&self) -> &Bins {
        &self.bins
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn underflow(&self) -> u64 {
        self.underflow
    }

    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    /// Samples inside the bins.
    pub fn binned(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Every sample recorded, including underflow and overflow.
    pub fn total(&self) -> u64 {
        self.binned() + self.underflow + self.overflow
    }

    pub fn update(&mut self, x: f64, policy: OutOfRange) {
        let Some(location) = self.bins.locate(x) else {
            return;
        };
        match (location, policy) {
            (Location::Inside(i), _) => self.counts[i] += 1,
            (Location::Below, OutOfRange::Tally) => self.underflow += 1,
            (Location::Above, OutOfRange::Tally) => self.overflow += 1,
            (Location::Below, OutOfRange::Clip) => {
                if let Some(first) = self.counts.first_mut() {
                    *first += 1
                }
            }
            (Location::Above, OutOfRange::Clip) => {
                if let Some(last) = self.counts.last_mut() {
                    *last += 1
                }
            }
            (_, OutOfRange::Trim) => {}
        }
    }

    pub fn update_all(&mut self, xs: &[f64], policy: OutOfRange) {
        xs.iter().for_each(|x| self.update(*x, policy));
    }

    /// Probability density over bin space. Zero everywhere when empty.
    pub fn pdf(&self) -> Vec<f64> {
        let total = self.binned() as f64;
        if total == 0f64 {
            return vec![0f64; self.counts.len()];
        }
        self.counts
            .iter()
            .zip(self.bins.widths())
            .map(|(c, w)| *c as f64 / (total * w))
            .collect()
    }

    /// Cumulative fraction of binned samples at each right bin edge.
    pub fn cdf(&self) -> Vec<f64> {
        let total = self.binned() as f64;
        let mut cumulative = 0u64;
        self.counts
            .iter()
            .map(|c| {
                cumulative += c;
                if total == 0f64 {
                    0f64
                } else {
                    cumulative as f64 / total
                }
            })
            .collect()
    }

    pub fn mean(&self) -> Option<f64> {
        let total = self.binned();
        if total == 0 {
            return None;
        }
        let sum: f64 = self
            .counts
            .iter()
            .zip(self.bins.centres())
            .map(|(c, x)| *c as f64 * x)
            .sum();
        Some(self.bins.transform.inverse(sum / total as f64))
    }

    /// Centre of the fullest bin.
    pub fn mode(&self) -> Option<f64> {
        if self.binned() == 0 {
            return None;
        }
        let (index, _) = self
            .counts
            .iter()
            .enumerate()
            .rev()
            .max_by_key(|(_, c)| **c)?;
        Some(self.bins.transform.inverse(self.bins.centres()[index]))
    }

    pub fn percentile(&self, percent: f64) -> Option<f64> {
        percentile_of(&self.bins.edges, &self.counts, percent).map(|y| self.bins.transform.inverse(y))
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.)
    }

    /// `(low, high)` bounds holding the central `percent` of the samples.
    pub fn credible_interval(&self, percent: f64) -> Option<(f64, f64)> {
        let tail = 0.5 * (100. - percent);
        Some((self.percentile(tail)?, self.percentile(100. - tail)?))
    }

    /// Width of the central `percent` interval in bin space.
    pub fn credible_range(&self, percent: f64) -> Option<f64> {
        credible_range_of(&self.bins.edges, &self.counts, percent)
    }

    /// Shannon entropy of the bin probabilities in nats.
    pub fn entropy(&self) -> f64 {
        let total = self.binned() as f64;
        if total == 0f64 {
            return 0f64;
        }
        self.counts
            .iter()
            .filter(|c| **c > 0)
            .map(|c| {
                let p = *c as f64 / total;
                -p * p.ln()
            })
            .sum()
    }

    /// Add the counts of `other`, which must use identical bins.
    pub fn merge(&mut self, other: &Histogram1D) -> Result<()> {
        check_same_bins(&self.bins, &other.bins)?;
        add_counts(&mut self.counts, &other.counts);
        self.underflow += other.underflow;
        self.overflow += other.overflow;
        Ok(())
    }
}

impl Persist for Histogram1D {
    fn write_to<G: Group>(&self, parent: &mut G, name: &str) -> anyhow::Result<()> {
        let group = parent.create_group(name)?;
        self.bins.write_into(group)?;
        group.write("counts", self.counts.clone().into())?;
        group.write("underflow", self.underflow.into())?;
        group.write("overflow", self.overflow.into())
    }

    fn read_from<G: Group>(parent: &G, name: &str) -> anyhow::Result<Self> {
        let group = parent.group(name)?;
        let bins = Bins::read_from_group(group)?;
        let counts = group.read("counts")?.as_u64s()?.to_vec();
        if counts.len() != bins.n_bins() {
            anyhow::bail!(
                "Histogram {} has {} counts for {} bins",
                name,
                counts.len(),
                bins.n_bins()
            );
        }
        Ok(Self {
            bins,
            counts,
            underflow: group.read("underflow")?.as_scalar_u64()?,
            overflow: group.read("overflow")?.as_scalar_u64()?,
        })
    }
}

/// Counts over an `x` by `y` grid, stored row by row along `y`.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram2D {
    x: Bins,
    y: Bins,
    counts: Vec<u64>,
}

impl Histogram2D {
    pub fn new(x: Bins, y: Bins) -> Self {
        Self {
            counts: vec![0; x.n_bins() * y.n_bins()],
            x,
            y,
        }
    }

    pub fn x_bins(&self) -> &Bins {
        &self.x
    }

    pub fn y_bins(&self) -> &Bins {
        &self.y
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn row(&self, y_index: usize) -> &[u64] {
        let n = self.x.n_bins();
        &self.counts[y_index * n..(y_index + 1) * n]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Count `x` in row `y_index`. Returns whether it was binned.
    pub fn increment_row(&mut self, y_index: usize, x: f64, policy: OutOfRange) -> bool {
        if y_index >= self.y.n_bins() {
            return false;
        }
        match self.x.index(x, policy) {
            Some(i) => {
                self.counts[y_index * self.x.n_bins() + i] += 1;
                true
            }
            None => false,
        }
    }

    pub fn update(&mut self, x: f64, y: f64, policy: OutOfRange) -> bool {
        match self.y.index(y, policy) {
            Some(row) => self.increment_row(row, x, policy),
            None => false,
        }
    }

    /// The distribution of `x` in one row.
    pub fn row_histogram(&self, y_index: usize) -> Histogram1D {
        Histogram1D {
            bins: self.x.clone(),
            counts: self.row(y_index).to_vec(),
            underflow: 0,
            overflow: 0,
        }
    }

    /// Sum over `y`, the distribution of `x`.
    pub fn marginal_x(&self) -> Histogram1D {
        let mut counts = vec![0u64; self.x.n_bins()];
        for row in self.counts.chunks(self.x.n_bins()) {
            add_counts(&mut counts, row);
        }
        Histogram1D {
            bins: self.x.clone(),
            counts,
            underflow: 0,
            overflow: 0,
        }
    }

    /// Sum over `x`, the distribution of `y`.
    pub fn marginal_y(&self) -> Histogram1D {
        Histogram1D {
            bins: self.y.clone(),
            counts: self
                .counts
                .chunks(self.x.n_bins())
                .map(|row| row.iter().sum())
                .collect(),
            underflow: 0,
            overflow: 0,
        }
    }

    /// `(median, low, high)` of `x` for every row, `None` for empty rows.
    pub fn credible_intervals(&self, percent: f64) -> Vec<Option<(f64, f64, f64)>> {
        (0..self.y.n_bins())
            .map(|row| {
                let hist = self.row_histogram(row);
                let (low, high) = hist.credible_interval(percent)?;
                Some((hist.median()?, low, high))
            })
            .collect()
    }

    /// Credible range of every row divided by the `x` range.
    ///
    /// Empty rows are fully transparent.
    pub fn transparency(&self, percent: f64) -> Vec<f64> {
        let range = self.x.range();
        (0..self.y.n_bins())
            .map(|row| {
                credible_range_of(&self.x.edges, self.row(row), percent)
                    .map_or(1f64, |r| (r / range).clamp(0., 1.))
            })
            .collect()
    }

    pub fn opacity(&self, percent: f64) -> Vec<f64> {
        self.transparency(percent)
            .into_iter()
            .map(|t| 1f64 - t)
            .collect()
    }

    pub fn merge(&mut self, other: &Histogram2D) -> Result<()> {
        check_same_bins(&self.x, &other.x)?;
        check_same_bins(&self.y, &other.y)?;
        add_counts(&mut self.counts, &other.counts);
        Ok(())
    }
}

impl Persist for Histogram2D {
    fn write_to<G: Group>(&self, parent: &mut G, name: &str) -> anyhow::Result<()> {
        let group = parent.create_group(name)?;
        self.x.write_into(group.create_group("x")?)?;
        self.y.write_into(group.create_group("y")?)?;
        group.write("counts", self.counts.clone().into())
    }

    fn read_from<G: Group>(parent: &G, name: &str) -> anyhow::Result<Self> {
        let group = parent.group(name)?;
        let x = Bins::read_from_group(group.group("x")?)?;
        let y = Bins::read_from_group(group.group("y")?)?;
        let counts = group.read("counts")?.as_u64s()?.to_vec();
        if counts.len() != x.n_bins() * y.n_bins() {
            anyhow::bail!("Histogram {} has {} counts for its grid", name, counts.len());
        }
        Ok(Self { x, y, counts })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    use super::*;
    use crate::storage::HashMapGroup;

    fn gaussian_histogram(policy: OutOfRange) -> Histogram1D {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut hist = Histogram1D::new(Bins::regular(-3., 3., 101, Transform::Linear).unwrap());
        for _ in 0..10_000 {
            let x: f64 = StandardNormal.sample(&mut rng);
            hist.update(x, policy);
        }
        hist
    }

    #[test]
    fn gaussian_statistics() {
        let hist = gaussian_histogram(OutOfRange::Tally);
        assert_eq!(hist.total(), 10_000);
        assert!(hist.underflow() + hist.overflow() > 0);
        assert!(hist.median().unwrap().abs() < 0.05);
        assert!(hist.mean().unwrap().abs() < 0.05);
        let (low, high) = hist.credible_interval(95.).unwrap();
        assert!((low + 1.96).abs() < 0.1, "{}", low);
        assert!((high - 1.96).abs() < 0.1, "{}", high);
        assert_relative_eq!(*hist.cdf().last().unwrap(), 1.);
        let integral: f64 = hist
            .pdf()
            .iter()
            .zip(hist.bins().widths())
            .map(|(p, w)| p * w)
            .sum();
        assert_relative_eq!(integral, 1., epsilon = 1e-12);
    }

    #[test]
    fn clipped_samples_all_land_in_bins() {
        let hist = gaussian_histogram(OutOfRange::Clip);
        assert_eq!(hist.binned(), 10_000);
        assert_eq!(hist.counts().iter().sum::<u64>(), 10_000);
        assert_eq!((hist.underflow(), hist.overflow()), (0, 0));
        assert!(hist.median().unwrap().abs() < 0.05);

        let tallied = gaussian_histogram(OutOfRange::Tally);
        let outside = tallied.underflow() + tallied.overflow();
        assert_eq!(
            hist.counts()[0] + hist.counts()[100],
            tallied.counts()[0] + tallied.counts()[100] + outside
        );
    }

    #[test]
    fn out_of_range_policies() {
        let bins = Bins::regular(0., 1., 4, Transform::Linear).unwrap();
        let samples = [-1., 0., 0.5, 1., 2.];

        let mut tally = Histogram1D::new(bins.clone());
        tally.update_all(&samples, OutOfRange::Tally);
        assert_eq!(tally.counts(), &[1, 0, 1, 1]);
        assert_eq!((tally.underflow(), tally.overflow()), (1, 1));

        let mut clip = Histogram1D::new(bins.clone());
        clip.update_all(&samples, OutOfRange::Clip);
        assert_eq!(clip.counts(), &[2, 0, 1, 2]);

        let mut trim = Histogram1D::new(bins);
        trim.update_all(&samples, OutOfRange::Trim);
        assert_eq!(trim.total(), 3);
    }

    #[test]
    fn log_bins() {
        let bins = Bins::regular(0., 10f64.ln(), 10, Transform::Log).unwrap();
        let mut hist = Histogram1D::new(bins);
        hist.update_all(&[2., 3., 5.], OutOfRange::Trim);
        assert_eq!(hist.total(), 3);
        let median = hist.median().unwrap();
        assert!(median > 2. && median < 5.);
    }

    #[test]
    fn integer_bins() {
        let mut hist = Histogram1D::new(Bins::integers(5));
        hist.update_all(&[1., 1., 3., 5.], OutOfRange::Trim);
        assert_eq!(hist.counts(), &[0, 2, 0, 1, 0, 1]);
        assert_eq!(hist.mode(), Some(1.));
    }

    #[test]
    fn entropy_of_uniform_counts() {
        let mut hist = Histogram1D::new(Bins::integers(3));
        hist.update_all(&[0., 1., 2., 3.], OutOfRange::Trim);
        assert_relative_eq!(hist.entropy(), 4f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn merging_adds_counts() {
        let mut a = gaussian_histogram(OutOfRange::Tally);
        let b = gaussian_histogram(OutOfRange::Tally);
        a.merge(&b).unwrap();
        assert_eq!(a.total(), 20_000);
        assert_eq!(a.counts()[50], 2 * b.counts()[50]);

        let other = Histogram1D::new(Bins::integers(3));
        assert!(a.merge(&other).is_err());
    }

    #[test]
    fn opacity_of_rows() {
        let x = Bins::regular(0., 10., 10, Transform::Linear).unwrap();
        let y = Bins::integers(2);
        let mut hist = Histogram2D::new(x, y);
        for _ in 0..100 {
            hist.increment_row(0, 4.5, OutOfRange::Clip);
        }
        for i in 0..100 {
            hist.increment_row(1, i as f64 / 10., OutOfRange::Clip);
        }
        let opacity = hist.opacity(95.);
        assert!(opacity[0] > 0.85);
        assert!(opacity[1] < 0.15);
        assert_eq!(opacity[2], 0.);

        let intervals = hist.credible_intervals(95.);
        let (median, low, high) = intervals[0].unwrap();
        assert!(low <= median && median <= high);
        assert!(intervals[2].is_none());
        assert_eq!(hist.marginal_x().total(), 200);
        assert_eq!(hist.marginal_y().counts(), &[100, 100, 0]);
    }

    #[test]
    fn persist_roundtrip() {
        let hist = gaussian_histogram(OutOfRange::Tally);
        let mut grid = Histogram2D::new(Bins::integers(2), Bins::integers(1));
        grid.update(1., 0., OutOfRange::Trim);

        let mut root = HashMapGroup::default();
        hist.write_to(&mut root, "values").unwrap();
        grid.write_to(&mut root, "grid").unwrap();
        assert_eq!(Histogram1D::read_from(&root, "values").unwrap(), hist);
        assert_eq!(Histogram2D::read_from(&root, "grid").unwrap(), grid);
    }
}

//! Dynamically sized 1D mesh with reversible structural moves.
//!
//! A [`Mesh`] partitions `[edges[0], edges[k]]` into `k` cells. The outer
//! edges are fixed. The interior edges are the boundaries that the
//! reversible-jump sampler creates, destroys and moves. Every structural
//! change is recorded as an [`Action`] so that it can be undone exactly.

use anyhow::Context;
use rand::Rng;

use crate::{
    distributions::{Categorical, LogDensity, OrderStatistic, Uniform},
    error::{JumpError, Result},
    histogram::OutOfRange,
    storage::{Group, Persist, Value},
};

/// Give up on a proposal after this many consecutive abandoned events.
///
/// Only reachable when every possible event keeps exhausting its retries,
/// which means the structural settings leave no room for any move.
const MAX_ABANDONED_EVENTS: usize = 10_000;

/// How absolute coordinates map into the space the edges are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    #[default]
    Linear,
    /// Natural logarithm of the coordinate.
    Log,
}

impl Transform {
    pub fn forward(&self, x: f64) -> f64 {
        match self {
            Transform::Linear => x,
            Transform::Log => x.ln(),
        }
    }

    pub fn inverse(&self, y: f64) -> f64 {
        match self {
            Transform::Linear => y,
            Transform::Log => y.exp(),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Transform::Linear => "linear",
            Transform::Log => "log",
        }
    }

    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "linear" => Some(Transform::Linear),
            "log" => Some(Transform::Log),
            _ => None,
        }
    }
}

/// The kind of structural proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Birth,
    Death,
    Move,
    NoChange,
}

impl Event {
    /// Order of the entries in [`MeshSettings::event_probabilities`].
    pub const ALL: [Event; 4] = [Event::Birth, Event::Death, Event::Move, Event::NoChange];
}

/// The structural change that produced a mesh from its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Action {
    #[default]
    None,
    /// A boundary was inserted at `edges[index] = value`.
    Insert { index: usize, value: f64 },
    /// The boundary `value` at `edges[index]` was removed.
    Delete { index: usize, value: f64 },
    /// `edges[index]` moved by `delta` away from `previous`.
    Perturb {
        index: usize,
        delta: f64,
        previous: f64,
    },
}

impl Action {
    pub fn event(&self) -> Event {
        match self {
            Action::None => Event::NoChange,
            Action::Insert { .. } => Event::Birth,
            Action::Delete { .. } => Event::Death,
            Action::Perturb { .. } => Event::Move,
        }
    }

    /// Birth and death change the number of cells.
    pub fn changes_dimension(&self) -> bool {
        matches!(self, Action::Insert { .. } | Action::Delete { .. })
    }
}

/// Structural bounds and proposal settings for a perturbable mesh.
///
/// All lengths are in the stored (transformed) space of the mesh.
#[derive(Debug, Clone, Copy)]
pub struct MeshSettings {
    /// Smallest location a new boundary may be placed at.
    pub min_edge: f64,
    /// Largest location a new boundary may be placed at.
    pub max_edge: f64,
    /// Upper limit on the number of cells.
    pub max_cells: usize,
    /// Minimum cell width. Derived as `(max_edge - min_edge) / (2 max_cells)`
    /// when not given.
    pub min_width: Option<f64>,
    /// Relative weights of birth, death, move and no change.
    pub event_probabilities: [f64; 4],
    /// Attempts at a valid birth or move before that event is abandoned.
    pub max_tries: usize,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            min_edge: 1.,
            max_edge: 150.,
            max_cells: 30,
            min_width: None,
            event_probabilities: [0.25, 0.25, 0.25, 0.25],
            max_tries: 10,
        }
    }
}

/// Resolved structural bounds of a mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshBounds {
    pub min_edge: f64,
    pub max_edge: f64,
    pub min_width: f64,
    pub max_cells: usize,
    pub max_tries: usize,
    events: Categorical,
}

impl MeshBounds {
    fn new(settings: &MeshSettings) -> Result<Self> {
        let MeshSettings {
            min_edge,
            max_edge,
            max_cells,
            min_width,
            event_probabilities,
            max_tries,
        } = *settings;
        if !(min_edge.is_finite() && max_edge.is_finite() && max_edge > min_edge) {
            return Err(JumpError::InvalidMesh(format!(
                "need finite min_edge < max_edge, got [{}, {}]",
                min_edge, max_edge
            )));
        }
        if max_cells == 0 {
            return Err(JumpError::InvalidMesh("max_cells must be > 0".into()));
        }
        if max_tries == 0 {
            return Err(JumpError::InvalidConfig("max_tries must be > 0".into()));
        }
        let min_width = min_width.unwrap_or((max_edge - min_edge) / (2. * max_cells as f64));
        if !(min_width > 0f64) {
            return Err(JumpError::InvalidMesh(format!(
                "min_width must be positive, got {}",
                min_width
            )));
        }
        let events = Categorical::new(&event_probabilities)?;
        let bounds = Self {
            min_edge,
            max_edge,
            min_width,
            max_cells,
            max_tries,
            events,
        };
        // A birth from max_cells - 1 cells must still have room to land.
        let remaining = bounds.remaining_space(max_cells - 1);
        if !(remaining > 0f64) {
            return Err(JumpError::InvalidMesh(format!(
                "{} cells of width {} do not fit in [{}, {}], lower max_cells or min_width",
                max_cells, min_width, min_edge, max_edge
            )));
        }
        Ok(bounds)
    }

    pub fn event_probabilities(&self) -> &[f64] {
        self.events.probabilities()
    }

    /// Interval left for a new boundary when `n_cells` cells already exist.
    pub fn remaining_space(&self, n_cells: usize) -> f64 {
        (self.max_edge - self.min_edge) - (n_cells as f64) * self.min_width
    }

    fn is_possible(&self, event: Event, n_cells: usize) -> bool {
        match event {
            Event::Birth => n_cells < self.max_cells,
            Event::Death | Event::Move => n_cells > 1,
            Event::NoChange => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mesh {
    edges: Vec<f64>,
    transform: Transform,
    relative_to: f64,
    bounds: Option<MeshBounds>,
    action: Action,
}

fn check_edges(edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(JumpError::InvalidMesh(format!(
            "a mesh needs at least one cell, got {} edges",
            edges.len()
        )));
    }
    if let Some(bad) = edges.iter().find(|e| !e.is_finite()) {
        return Err(JumpError::InvalidMesh(format!("edge {} is not finite", bad)));
    }
    if let Some(i) = edges.windows(2).position(|w| !(w[1] > w[0])) {
        return Err(JumpError::InvalidMesh(format!(
            "edges must be strictly increasing, edges[{}] = {} and edges[{}] = {}",
            i,
            edges[i],
            i + 1,
            edges[i + 1]
        )));
    }
    Ok(())
}

impl Mesh {
    /// A mesh from edges that are already in stored space.
    pub fn new(edges: Vec<f64>) -> Result<Self> {
        check_edges(&edges)?;
        Ok(Self {
            edges,
            transform: Transform::Linear,
            relative_to: 0f64,
            bounds: None,
            action: Action::None,
        })
    }

    /// A mesh from absolute coordinates.
    ///
    /// The baseline `relative_to` is subtracted before `transform` is applied.
    pub fn from_absolute(absolute: &[f64], transform: Transform, relative_to: f64) -> Result<Self> {
        let edges = absolute
            .iter()
            .map(|x| transform.forward(x - relative_to))
            .collect();
        let mut mesh = Self::new(edges)?;
        mesh.transform = transform;
        mesh.relative_to = relative_to;
        Ok(mesh)
    }

    /// Attach structural bounds so that the mesh can be perturbed.
    pub fn with_settings(mut self, settings: &MeshSettings) -> Result<Self> {
        let bounds = MeshBounds::new(settings)?;
        let k = self.n_cells();
        if (self.edges[0] > bounds.min_edge) | (self.edges[k] < bounds.max_edge) {
            return Err(JumpError::InvalidMesh(format!(
                "boundary range [{}, {}] is not inside the domain [{}, {}]",
                bounds.min_edge, bounds.max_edge, self.edges[0], self.edges[k]
            )));
        }
        if k > bounds.max_cells {
            return Err(JumpError::InvalidMesh(format!(
                "{} cells exceed max_cells = {}",
                k, bounds.max_cells
            )));
        }
        if self.min_gap() < bounds.min_width {
            return Err(JumpError::InvalidMesh(format!(
                "smallest cell width {} is below min_width {}",
                self.min_gap(),
                bounds.min_width
            )));
        }
        self.bounds = Some(bounds);
        Ok(self)
    }

    pub fn n_cells(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// The movable boundaries `edges[1..k]`.
    pub fn interior_edges(&self) -> &[f64] {
        &self.edges[1..self.n_cells()]
    }

    pub fn edges_absolute(&self) -> Vec<f64> {
        self.edges
            .iter()
            .map(|e| self.transform.inverse(*e) + self.relative_to)
            .collect()
    }

    pub fn widths(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn centres(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn relative_to(&self) -> f64 {
        self.relative_to
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn bounds(&self) -> Result<&MeshBounds> {
        self.bounds
            .as_ref()
            .ok_or(JumpError::NotConfigured("mesh bounds and event probabilities"))
    }

    pub fn min_gap(&self) -> f64 {
        self.edges
            .windows(2)
            .map(|w| w[1] - w[0])
            .fold(f64::INFINITY, f64::min)
    }

    pub fn remaining_space(&self, n_cells: usize) -> Result<f64> {
        Ok(self.bounds()?.remaining_space(n_cells))
    }

    /// Index of the cell holding the stored-space coordinate `x`.
    ///
    /// Cells are closed on the left. With [`OutOfRange::Tally`] and
    /// [`OutOfRange::Trim`] coordinates outside the mesh give `None`.
    pub fn cell_index(&self, x: f64, policy: OutOfRange) -> Option<usize> {
        let k = self.n_cells();
        let inside = (x >= self.edges[0]) & (x < self.edges[k]);
        if !inside {
            return match policy {
                OutOfRange::Clip if x < self.edges[0] => Some(0),
                OutOfRange::Clip if !x.is_nan() => Some(k - 1),
                _ => None,
            };
        }
        Some(self.edges.partition_point(|e| *e <= x) - 1)
    }

    pub fn cell_index_absolute(&self, x: f64, policy: OutOfRange) -> Option<usize> {
        self.cell_index(self.transform.forward(x - self.relative_to), policy)
    }

    fn derived(&self, edges: Vec<f64>, action: Action) -> Self {
        Self {
            edges,
            transform: self.transform,
            relative_to: self.relative_to,
            bounds: self.bounds.clone(),
            action,
        }
    }

    /// Insert a boundary at the stored-space coordinate `value`.
    pub fn insert_edge(&self, value: f64) -> Result<Self> {
        let k = self.n_cells();
        if !((value > self.edges[0]) & (value < self.edges[k])) {
            return Err(JumpError::InvalidMesh(format!(
                "cannot insert {} outside ({}, {})",
                value, self.edges[0], self.edges[k]
            )));
        }
        let index = self.edges.partition_point(|e| *e < value);
        if self.edges[index] == value {
            return Err(JumpError::InvalidMesh(format!(
                "edge {} already exists",
                value
            )));
        }
        let mut edges = Vec::with_capacity(k + 2);
        edges.extend_from_slice(&self.edges[..index]);
        edges.push(value);
        edges.extend_from_slice(&self.edges[index..]);
        Ok(self.derived(edges, Action::Insert { index, value }))
    }

    /// Remove the interior boundary `edges[index]`.
    pub fn delete_edge(&self, index: usize) -> Result<Self> {
        let k = self.n_cells();
        if !(1..k).contains(&index) {
            return Err(JumpError::InvalidMesh(format!(
                "can only delete interior edges 1..={}, got {}",
                k.saturating_sub(1),
                index
            )));
        }
        let value = self.edges[index];
        let mut edges = self.edges.clone();
        edges.remove(index);
        Ok(self.derived(edges, Action::Delete { index, value }))
    }

    fn move_edge(&self, index: usize, delta: f64) -> Self {
        let previous = self.edges[index];
        let mut edges = self.edges.clone();
        edges[index] = previous + delta;
        self.derived(
            edges,
            Action::Perturb {
                index,
                delta,
                previous,
            },
        )
    }

    /// Propose a structurally perturbed copy of this mesh.
    ///
    /// Impossible events are redrawn. A birth or move that finds no valid
    /// candidate within `max_tries` attempts is abandoned and a new event is
    /// drawn. The returned mesh records what was done in [`Mesh::action`].
    pub fn perturb<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Self> {
        let bounds = self.bounds()?;
        let k = self.n_cells();

        let possible: Vec<bool> = Event::ALL
            .iter()
            .zip(bounds.event_probabilities())
            .map(|(event, &p)| (p > 0f64) & bounds.is_possible(*event, k))
            .collect();
        if !possible.iter().any(|&p| p) {
            return Err(JumpError::InvalidConfig(format!(
                "no structural event has positive probability for a mesh with {} cells",
                k
            )));
        }

        for _ in 0..MAX_ABANDONED_EVENTS {
            let event = loop {
                let idx = bounds.events.sample(rng);
                if possible[idx] {
                    break Event::ALL[idx];
                }
            };

            match event {
                Event::NoChange => return Ok(self.derived(self.edges.clone(), Action::None)),
                Event::Death => {
                    let index = rng.random_range(1..k);
                    return self.delete_edge(index);
                }
                Event::Birth => {
                    if let Some(mesh) = self.try_birth(bounds, rng) {
                        return Ok(mesh);
                    }
                }
                Event::Move => {
                    if let Some(mesh) = self.try_move(bounds, rng) {
                        return Ok(mesh);
                    }
                }
            }
            tracing::trace!(
                ?event,
                n_cells = k,
                tries = bounds.max_tries,
                "structural event abandoned"
            );
        }

        Err(JumpError::InvalidConfig(format!(
            "no valid structural move found for a mesh with {} cells",
            k
        )))
    }

    fn try_birth<R: Rng + ?Sized>(&self, bounds: &MeshBounds, rng: &mut R) -> Option<Self> {
        let k = self.n_cells();
        let location = Uniform::new(bounds.min_edge, bounds.max_edge).ok()?;
        for _ in 0..bounds.max_tries {
            let value = location.sample(rng);
            let index = self.edges.partition_point(|e| *e < value);
            if (index == 0) | (index > k) {
                continue;
            }
            // Only the two gaps around the new boundary change.
            let gap = (value - self.edges[index - 1]).min(self.edges[index] - value);
            if gap >= bounds.min_width {
                return self.insert_edge(value).ok();
            }
        }
        None
    }

    fn try_move<R: Rng + ?Sized>(&self, bounds: &MeshBounds, rng: &mut R) -> Option<Self> {
        let k = self.n_cells();
        for _ in 0..bounds.max_tries {
            let index = rng.random_range(1..k);
            let sign = if rng.random::<bool>() { 1f64 } else { -1f64 };
            let delta = sign * bounds.min_width * rng.random::<f64>();
            let moved = self.edges[index] + delta;

            let gap = (moved - self.edges[index - 1]).min(self.edges[index + 1] - moved);
            let first = if index == 1 { moved } else { self.edges[1] };
            let last = if index == k - 1 { moved } else { self.edges[k - 1] };
            if (gap >= bounds.min_width) & (first >= bounds.min_edge) & (last <= bounds.max_edge) {
                return Some(self.move_edge(index, delta));
            }
        }
        None
    }

    /// Reconstruct the mesh this one was perturbed from.
    pub fn unperturb(&self) -> Result<Self> {
        match self.action {
            Action::None => Ok(self.derived(self.edges.clone(), Action::None)),
            Action::Insert { index, value } => {
                if self.edges.get(index) != Some(&value) {
                    return Err(JumpError::InvalidMesh(format!(
                        "edge {} does not hold the inserted value {}",
                        index, value
                    )));
                }
                let mut edges = self.edges.clone();
                edges.remove(index);
                Ok(self.derived(edges, Action::None))
            }
            Action::Delete { index, value } => {
                if !(1..=self.n_cells()).contains(&index) {
                    return Err(JumpError::InvalidMesh(format!(
                        "cannot restore deleted edge at {}",
                        index
                    )));
                }
                let mut edges = self.edges.clone();
                edges.insert(index, value);
                Ok(self.derived(edges, Action::None))
            }
            Action::Perturb {
                index, previous, ..
            } => {
                let mut edges = self.edges.clone();
                *edges.get_mut(index).ok_or_else(|| {
                    JumpError::InvalidMesh(format!("cannot restore moved edge at {}", index))
                })? = previous;
                Ok(self.derived(edges, Action::None))
            }
        }
    }

    /// Carry per-cell values of the previous mesh over to this one.
    ///
    /// A birth splits cell `i - 1`. The new cell `i` takes the average of its
    /// two former neighbours (old cells `i - 1` and `i`), or copies cell
    /// `i - 1` when the split cell was the last one. A death merges cells
    /// `i - 1` and `i` into their average.
    pub fn remap_values(&self, previous: &[f64]) -> Result<Vec<f64>> {
        let expected = match self.action {
            Action::Insert { .. } => self.n_cells() - 1,
            Action::Delete { .. } => self.n_cells() + 1,
            Action::None | Action::Perturb { .. } => self.n_cells(),
        };
        if previous.len() != expected {
            return Err(JumpError::Numerical(
                crate::error::NumericalError::DimensionMismatch {
                    expected,
                    found: previous.len(),
                },
            ));
        }
        let mut values = previous.to_vec();
        match self.action {
            Action::Insert { index, .. } => {
                let value = match previous.get(index) {
                    Some(next) => 0.5 * (previous[index - 1] + next),
                    None => previous[index - 1],
                };
                values.insert(index, value);
            }
            Action::Delete { index, .. } => {
                values[index - 1] = 0.5 * (previous[index - 1] + previous[index]);
                values.remove(index);
            }
            Action::None | Action::Perturb { .. } => {}
        }
        Ok(values)
    }

    /// Log prior of the mesh structure.
    ///
    /// Uniform over the number of cells and order statistics over the
    /// interior boundaries.
    pub fn prior_log_probability(&self) -> Result<f64> {
        let bounds = self.bounds()?;
        let k = self.n_cells();
        if k > bounds.max_cells {
            return Ok(f64::NEG_INFINITY);
        }
        let n_cells = -(bounds.max_cells as f64).ln();
        let boundaries =
            OrderStatistic::new(bounds.min_edge, bounds.max_edge, bounds.min_width, k - 1);
        Ok(n_cells + boundaries.log_probability(&self.interior_edges().to_vec()))
    }

    /// `ln(wᵢ / min_width)` for every cell above the last boundary.
    ///
    /// Floored at machine epsilon so that cells of exactly the minimum width
    /// stay finite.
    pub fn log_thickness_ratios(&self) -> Result<Vec<f64>> {
        let min_width = self.bounds()?.min_width;
        let widths = self.widths();
        Ok(widths[..widths.len() - 1]
            .iter()
            .map(|w| (w / min_width).ln().max(f64::EPSILON))
            .collect())
    }

    /// Whether the stored-space coordinate `x` lies inside the mesh domain.
    pub fn in_bounds(&self, x: f64) -> bool {
        (x >= self.edges[0]) & (x <= self.edges[self.n_cells()])
    }

    /// Whether the structural invariants hold.
    pub fn is_valid(&self) -> bool {
        if check_edges(&self.edges).is_err() {
            return false;
        }
        match &self.bounds {
            None => true,
            Some(bounds) => {
                (self.n_cells() <= bounds.max_cells) & (self.min_gap() >= bounds.min_width)
            }
        }
    }
}

impl Persist for Mesh {
    fn write_to<G: Group>(&self, parent: &mut G, name: &str) -> anyhow::Result<()> {
        let group = parent.create_group(name)?;
        group.write("edges", self.edges.clone().into())?;
        group.write("n_cells", (self.n_cells() as u64).into())?;
        group.write("transform", Value::String(self.transform.name().into()))?;
        group.write("relative_to", self.relative_to.into())?;
        if let Some(bounds) = &self.bounds {
            group.write("min_edge", bounds.min_edge.into())?;
            group.write("max_edge", bounds.max_edge.into())?;
            group.write("min_width", bounds.min_width.into())?;
            group.write("max_cells", (bounds.max_cells as u64).into())?;
            group.write("max_tries", (bounds.max_tries as u64).into())?;
            group.write(
                "event_probabilities",
                bounds.event_probabilities().to_vec().into(),
            )?;
        }
        Ok(())
    }

    fn read_from<G: Group>(parent: &G, name: &str) -> anyhow::Result<Self> {
        let group = parent.group(name)?;
        let edges = group.read("edges")?.as_f64s()?.to_vec();
        let transform_name = group.read("transform")?.as_str()?;
        let transform = Transform::from_name(transform_name)
            .with_context(|| format!("Unknown transform {}", transform_name))?;
        let mut mesh = Mesh::new(edges).context("Stored mesh is invalid")?;
        mesh.transform = transform;
        mesh.relative_to = group.read("relative_to")?.as_scalar_f64()?;

        if group.contains("min_width") {
            let probabilities = group.read("event_probabilities")?.as_f64s()?;
            let mut event_probabilities = [0f64; 4];
            if probabilities.len() != event_probabilities.len() {
                anyhow::bail!("Expected 4 event probabilities, found {}", probabilities.len());
            }
            event_probabilities.copy_from_slice(probabilities);
            let settings = MeshSettings {
                min_edge: group.read("min_edge")?.as_scalar_f64()?,
                max_edge: group.read("max_edge")?.as_scalar_f64()?,
                max_cells: group.read("max_cells")?.as_scalar_u64()? as usize,
                min_width: Some(group.read("min_width")?.as_scalar_f64()?),
                event_probabilities,
                max_tries: group.read("max_tries")?.as_scalar_u64()? as usize,
            };
            mesh = mesh
                .with_settings(&settings)
                .context("Stored mesh bounds are invalid")?;
        }
        Ok(mesh)
    }
}

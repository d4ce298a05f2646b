//! Reversible-jump MCMC inversion of 1D layered-earth soundings.
//!
//! A [`Model`] is a [`Mesh`] of layers with one positive value per layer.
//! Each [`Chain`] step proposes a birth, death or move of a layer boundary,
//! then redraws the values with a stochastic Newton step, and accepts or
//! rejects the result. Accepted states accumulate in a [`PosteriorHistogram`].

pub(crate) mod chain;
pub(crate) mod distributions;
pub(crate) mod error;
pub(crate) mod forward;
pub(crate) mod histogram;
pub(crate) mod math;
pub(crate) mod mesh;
pub(crate) mod model;
pub(crate) mod posterior;
pub(crate) mod proposal;
pub(crate) mod sampler;
pub(crate) mod storage;

pub use chain::{Chain, ChainSummary, Progress};
pub use distributions::{Categorical, LogDensity, MvLogNormal, Normal, OrderStatistic, Uniform};
pub use error::{JumpError, NumericalError, Result};
pub use forward::{Forward, ForwardModel, Sounding};
pub use histogram::{Bins, Histogram1D, Histogram2D, OutOfRange};
pub use mesh::{Action, Event, Mesh, MeshBounds, MeshSettings, Transform};
pub use model::{DataTerm, Model, ModelPriors, PriorSettings};
pub use posterior::{PosteriorHistogram, PosteriorSettings};
pub use proposal::{jump_densities, proposal_probabilities, ProposalDensities};
pub use sampler::{merge_posteriors, sample_parallel, sample_sequentially, SamplerSettings};
pub use storage::{Group, HashMapGroup, Persist, Value};

use anyhow::{Context, Result};
use rayon::{prelude::*, ThreadPoolBuilder};

use crate::{
    chain::{Chain, ChainSummary, Progress},
    error::JumpError,
    forward::{ForwardModel, Sounding},
    histogram::OutOfRange,
    mesh::{Mesh, MeshSettings},
    model::{Model, PriorSettings},
    posterior::{PosteriorHistogram, PosteriorSettings},
};

/// Settings for sampling soundings.
#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    /// Draws recorded in the posterior after burn-in.
    pub num_draws: u64,
    /// Draws discarded before recording starts.
    pub burn_in: u64,
    pub seed: u64,
    /// Worker threads for [`sample_parallel`]. Zero lets rayon decide.
    pub num_threads: usize,
    /// Sample the prior only. The forward model is never evaluated.
    pub ignore_likelihood: bool,
    /// Outer edges of the initial single-cell mesh, in stored space.
    pub domain: (f64, f64),
    pub mesh: MeshSettings,
    pub priors: PriorSettings,
    pub posterior: PosteriorSettings,
    /// How recorded draws that fall outside the posterior grids are handled.
    pub out_of_range: OutOfRange,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_draws: 10_000,
            burn_in: 1_000,
            seed: 0,
            num_threads: 0,
            ignore_likelihood: false,
            domain: (0., 200.),
            mesh: MeshSettings::default(),
            priors: PriorSettings::default(),
            posterior: PosteriorSettings::default(),
            out_of_range: OutOfRange::Clip,
        }
    }
}

impl SamplerSettings {
    /// A half-space over `domain` at the prior median.
    pub fn initial_model(&self) -> Result<Model> {
        let (top, bottom) = self.domain;
        let mesh = Mesh::new(vec![top, bottom])
            .and_then(|mesh| mesh.with_settings(&self.mesh))
            .context("Invalid mesh settings")?;
        Model::from_prior(mesh, &self.priors).context("Invalid prior settings")
    }
}

/// Draw from one sounding on the current thread.
pub fn sample_sequentially<'a, F: ForwardModel>(
    forward: &'a F,
    sounding: &'a Sounding,
    settings: &SamplerSettings,
    chain: u64,
) -> Result<impl Iterator<Item = Result<(Model, Progress)>> + 'a> {
    let mut sampler = Chain::new(forward, sounding, settings.initial_model()?, settings, chain)?;
    let draws = settings.burn_in + settings.num_draws;
    Ok((0..draws).map(move |_| {
        let progress = sampler.draw()?;
        Ok((sampler.current().clone(), progress))
    }))
}

/// Run one independent chain per sounding on a rayon thread pool.
///
/// Chain `i` samples `soundings[i]` with random stream `i`, so results do not
/// depend on the number of threads.
pub fn sample_parallel<F: ForwardModel>(
    forward: &F,
    soundings: &[Sounding],
    settings: &SamplerSettings,
) -> Result<Vec<ChainSummary>> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(settings.num_threads)
        .thread_name(|i| format!("layerjump-worker-{}", i))
        .build()
        .context("Could not start thread pool")?;

    tracing::info!(
        soundings = soundings.len(),
        threads = pool.current_num_threads(),
        "sampling soundings"
    );

    pool.install(|| {
        soundings
            .par_iter()
            .enumerate()
            .map(|(i, sounding)| {
                let initial = settings.initial_model()?;
                Chain::new(forward, sounding, initial, settings, i as u64)?
                    .run()
                    .with_context(|| format!("Sounding {} failed", i))
            })
            .collect()
    })
}

/// Sum the posteriors of many soundings into one.
///
/// Returns `None` for an empty input.
pub fn merge_posteriors(posteriors: &[PosteriorHistogram]) -> Result<Option<PosteriorHistogram>> {
    posteriors
        .par_iter()
        .map(|p| Ok::<_, JumpError>(p.clone()))
        .try_reduce_with(|mut a, b| {
            a.merge(&b)?;
            Ok(a)
        })
        .transpose()
        .context("Could not merge posteriors")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::forward::test_forward::LinearForward;

    fn soundings() -> Vec<Sounding> {
        (0..4)
            .map(|i| {
                let shift = 0.1 * i as f64;
                Sounding::new(
                    vec![0.5 + shift, 0.2, -0.3 - shift, -0.6],
                    &[0.05, 0.05, 0.05, 0.05],
                )
                .unwrap()
            })
            .collect()
    }

    fn settings() -> SamplerSettings {
        SamplerSettings {
            num_draws: 200,
            burn_in: 20,
            seed: 42,
            num_threads: 2,
            ..Default::default()
        }
    }

    fn forward() -> LinearForward {
        LinearForward {
            depths: vec![15., 40., 90., 140.],
        }
    }

    #[test]
    fn sequential_yields_every_draw() {
        let forward = forward();
        let soundings = soundings();
        let draws: Vec<_> = sample_sequentially(&forward, &soundings[0], &settings(), 0)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(draws.len(), 220);
        for (model, progress) in &draws {
            assert_eq!(model.n_cells(), progress.n_cells);
            assert!(model.mesh().is_valid());
        }
    }

    #[test]
    fn parallel_matches_sequential() {
        let forward = forward();
        let soundings = soundings();
        let settings = settings();
        let summaries = sample_parallel(&forward, &soundings, &settings).unwrap();
        assert_eq!(summaries.len(), 4);

        let single = SamplerSettings {
            num_threads: 1,
            ..settings
        };
        let again = sample_parallel(&forward, &soundings, &single).unwrap();
        for (a, b) in summaries.iter().zip(&again) {
            assert_eq!(a.chain, b.chain);
            assert_eq!(a.accepted, b.accepted);
            assert_eq!(a.posterior, b.posterior);
        }

        let (model, _) = sample_sequentially(&forward, &soundings[2], &settings, 2)
            .unwrap()
            .last()
            .unwrap()
            .unwrap();
        assert_eq!(model.values(), summaries[2].last.values());
    }

    #[test]
    fn merging_is_a_sum() {
        let forward = forward();
        let summaries = sample_parallel(&forward, &soundings(), &settings()).unwrap();
        let posteriors: Vec<_> = summaries.into_iter().map(|s| s.posterior).collect();
        let merged = merge_posteriors(&posteriors).unwrap().unwrap();
        assert_eq!(merged.n_samples(), 800);

        let mut reversed = posteriors.clone();
        reversed.reverse();
        assert_eq!(merge_posteriors(&reversed).unwrap().unwrap(), merged);
        assert!(merge_posteriors(&[]).unwrap().is_none());
    }

    #[test]
    fn bad_domain_is_reported() {
        let settings = SamplerSettings {
            domain: (10., 20.),
            ..settings()
        };
        assert!(settings.initial_model().is_err());
    }
}

use anyhow::{ensure, Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    error::JumpError,
    forward::{ForwardModel, Sounding},
    mesh::Event,
    model::{DataTerm, Model},
    posterior::PosteriorHistogram,
    proposal::proposal_probabilities,
    sampler::SamplerSettings,
};

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Progress {
    pub draw: u64,
    pub chain: u64,
    /// The draw was not recorded in the posterior.
    pub burn_in: bool,
    pub accepted: bool,
    /// Structural event of the proposal.
    pub event: Event,
    pub n_cells: usize,
    pub log_posterior: f64,
    pub acceptance_rate: f64,
}

/// What a finished chain leaves behind.
#[derive(Debug, Clone)]
pub struct ChainSummary {
    pub chain: u64,
    pub draws: u64,
    pub accepted: u64,
    pub acceptance_rate: f64,
    /// Highest posterior model seen, burn-in included.
    pub best: Model,
    pub best_log_posterior: f64,
    /// State of the chain after the final draw.
    pub last: Model,
    pub posterior: PosteriorHistogram,
}

/// A proposed model with its likelihood, prior and data term.
struct Evaluated {
    model: Model,
    log_likelihood: f64,
    log_prior: f64,
    data: Option<DataTerm>,
}

impl Evaluated {
    fn log_posterior(&self) -> f64 {
        self.log_likelihood + self.log_prior
    }
}

/// A single reversible-jump Metropolis–Hastings chain for one sounding.
pub struct Chain<'a, F: ForwardModel> {
    forward: &'a F,
    sounding: &'a Sounding,
    settings: SamplerSettings,
    rng: ChaCha8Rng,
    chain: u64,
    current: Evaluated,
    posterior: PosteriorHistogram,
    best: Model,
    best_log_posterior: f64,
    draw_count: u64,
    accepted: u64,
}

impl<'a, F: ForwardModel> Chain<'a, F> {
    pub fn new(
        forward: &'a F,
        sounding: &'a Sounding,
        initial: Model,
        settings: &SamplerSettings,
        chain: u64,
    ) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        rng.set_stream(chain);

        let posterior = PosteriorHistogram::new(
            initial.mesh(),
            initial.priors().context("Initial model has no priors")?,
            &settings.posterior,
        )
        .context("Could not set up posterior histograms")?;

        let current = evaluate(forward, sounding, settings.ignore_likelihood, initial)
            .context("Could not evaluate initial model")?;
        ensure!(
            current.log_posterior().is_finite(),
            "Initial model has zero posterior probability"
        );

        Ok(Self {
            forward,
            sounding,
            settings: *settings,
            rng,
            chain,
            best: current.model.clone(),
            best_log_posterior: current.log_posterior(),
            current,
            posterior,
            draw_count: 0,
            accepted: 0,
        })
    }

    pub fn current(&self) -> &Model {
        &self.current.model
    }

    pub fn posterior(&self) -> &PosteriorHistogram {
        &self.posterior
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.draw_count == 0 {
            return 0f64;
        }
        self.accepted as f64 / self.draw_count as f64
    }

    /// Propose, accept or reject, and record the resulting state.
    pub fn draw(&mut self) -> Result<Progress> {
        let (event, accepted) = self.step()?;

        self.draw_count += 1;
        if accepted {
            self.accepted += 1;
        }
        let log_posterior = self.current.log_posterior();
        if log_posterior > self.best_log_posterior {
            self.best = self.current.model.clone();
            self.best_log_posterior = log_posterior;
        }
        let burn_in = self.draw_count <= self.settings.burn_in;
        if !burn_in {
            self.posterior
                .update(&self.current.model, self.settings.out_of_range);
        }

        tracing::debug!(
            chain = self.chain,
            draw = self.draw_count,
            ?event,
            accepted,
            n_cells = self.current.model.n_cells(),
            log_posterior,
            "draw"
        );

        Ok(Progress {
            draw: self.draw_count,
            chain: self.chain,
            burn_in,
            accepted,
            event,
            n_cells: self.current.model.n_cells(),
            log_posterior,
            acceptance_rate: self.acceptance_rate(),
        })
    }

    fn step(&mut self) -> Result<(Event, bool)> {
        let current = &self.current.model;
        let remapped = current
            .perturb_structure(&mut self.rng)
            .context("Structural perturbation failed")?;
        let event = remapped.mesh().action().event();

        let data = if self.settings.ignore_likelihood {
            None
        } else {
            let forward = self.forward.forward(&remapped)?;
            Some(self.forward.data_term(&forward, self.sounding)?)
        };

        let perturbed = match remapped.stochastic_newton_step(data.as_ref(), &mut self.rng) {
            Ok(perturbed) => perturbed,
            Err(JumpError::Numerical(err)) => {
                tracing::debug!(chain = self.chain, %err, "newton step failed, rejecting");
                return Ok((event, false));
            }
            Err(err) => return Err(err).context("Stochastic Newton step failed"),
        };

        let candidate = evaluate(
            self.forward,
            self.sounding,
            self.settings.ignore_likelihood,
            perturbed,
        )?;
        let log_alpha = if candidate.log_prior.is_finite() {
            match proposal_probabilities(&remapped, &candidate.model, candidate.data.as_ref()) {
                Ok(densities) => {
                    candidate.log_posterior() - self.current.log_posterior() + densities.log_ratio()
                }
                Err(JumpError::Numerical(err)) => {
                    tracing::debug!(chain = self.chain, %err, "reverse density failed, rejecting");
                    f64::NEG_INFINITY
                }
                Err(err) => return Err(err).context("Proposal densities failed"),
            }
        } else {
            f64::NEG_INFINITY
        };

        let u: f64 = self.rng.random();
        if u.ln() < log_alpha {
            self.current = candidate;
            return Ok((event, true));
        }

        let restored = candidate
            .model
            .mesh()
            .unperturb()
            .context("Could not undo structural perturbation")?;
        ensure!(
            restored.edges() == self.current.model.mesh().edges(),
            "Undoing {:?} did not restore the current mesh",
            event
        );
        Ok((event, false))
    }

    /// Run burn-in and all draws and summarise the chain.
    pub fn run(mut self) -> Result<ChainSummary> {
        let total = self.settings.burn_in + self.settings.num_draws;
        tracing::info!(
            chain = self.chain,
            burn_in = self.settings.burn_in,
            draws = self.settings.num_draws,
            "starting chain"
        );
        for _ in 0..total {
            self.draw()
                .with_context(|| format!("Chain {} failed at draw {}", self.chain, self.draw_count))?;
        }
        let acceptance_rate = self.acceptance_rate();
        tracing::info!(
            chain = self.chain,
            acceptance_rate,
            best_log_posterior = self.best_log_posterior,
            "finished chain"
        );
        Ok(ChainSummary {
            chain: self.chain,
            draws: self.draw_count,
            accepted: self.accepted,
            acceptance_rate,
            best: self.best,
            best_log_posterior: self.best_log_posterior,
            last: self.current.model,
            posterior: self.posterior,
        })
    }
}

fn evaluate<F: ForwardModel>(
    forward: &F,
    sounding: &Sounding,
    ignore_likelihood: bool,
    mut model: Model,
) -> Result<Evaluated> {
    model.recompute_gradient()?;
    let log_prior = model.prior_log_probability()?;
    if ignore_likelihood || !log_prior.is_finite() {
        return Ok(Evaluated {
            model,
            log_likelihood: 0f64,
            log_prior,
            data: None,
        });
    }
    let prediction = forward.forward(&model)?;
    let log_likelihood = sounding.log_likelihood(&prediction.predicted)?;
    let data = Some(forward.data_term(&prediction, sounding)?);
    Ok(Evaluated {
        model,
        log_likelihood,
        log_prior,
        data,
    })
}

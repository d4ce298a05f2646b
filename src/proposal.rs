//! Proposal log-densities for the Metropolis–Hastings–Green acceptance ratio.

use crate::{
    distributions::{LogDensity, MvLogNormal},
    error::{JumpError, NumericalError, Result},
    math::{axpy, mat_vec},
    mesh::{Action, Mesh},
    model::{DataTerm, Model},
};

/// Log-densities of proposing a move and of proposing its reverse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposalDensities {
    /// `ln q(perturbed | current)`
    pub forward: f64,
    /// `ln q(current | perturbed)`
    pub reverse: f64,
}

impl ProposalDensities {
    /// The proposal part of the acceptance log-ratio.
    pub fn log_ratio(&self) -> f64 {
        self.reverse - self.forward
    }
}

/// Densities of the extra dimension a birth or death adds or removes.
///
/// A birth from `k` cells draws the new boundary uniformly over the
/// remaining space. Its reverse chooses one of the `k` interior boundaries
/// of the larger mesh. A death is the mirror image.
pub fn jump_densities(perturbed: &Mesh) -> Result<ProposalDensities> {
    let k = perturbed.n_cells();
    Ok(match perturbed.action() {
        Action::Insert { .. } => {
            let old = k - 1;
            ProposalDensities {
                forward: -perturbed.remaining_space(old)?.ln(),
                reverse: -(old as f64).ln(),
            }
        }
        Action::Delete { .. } => ProposalDensities {
            forward: -(k as f64).ln(),
            reverse: -perturbed.remaining_space(k)?.ln(),
        },
        Action::Perturb { .. } | Action::None => ProposalDensities {
            forward: 0f64,
            reverse: 0f64,
        },
    })
}

/// Forward and reverse proposal log-densities of `remapped -> perturbed`.
///
/// The forward density is the proposal attached to `perturbed`. The reverse
/// density is a Newton proposal with the same covariance, centred half a step
/// downhill from `perturbed`, evaluated at the remapped values. `data` is the
/// data term at `perturbed`.
pub fn proposal_probabilities(
    remapped: &Model,
    perturbed: &Model,
    data: Option<&DataTerm>,
) -> Result<ProposalDensities> {
    let proposal = perturbed
        .proposal()
        .ok_or(JumpError::NotConfigured("perturbation proposal"))?;
    for found in [proposal.dim(), remapped.n_cells()] {
        if found != perturbed.n_cells() {
            return Err(NumericalError::DimensionMismatch {
                expected: perturbed.n_cells(),
                found,
            }
            .into());
        }
    }
    let forward = proposal.log_probability(&perturbed.values().to_vec());

    let covariance = proposal.covariance();
    let gradient = perturbed.posterior_gradient(data)?;
    let mut mean: Vec<f64> = perturbed.values().iter().map(|v| v.ln()).collect();
    axpy(&mat_vec(covariance.as_ref(), &gradient)?, &mut mean, -0.5);
    let reverse = MvLogNormal::new(mean, covariance.clone())?
        .log_probability(&remapped.values().to_vec());

    let jump = jump_densities(perturbed.mesh())?;
    Ok(ProposalDensities {
        forward: forward + jump.forward,
        reverse: reverse + jump.reverse,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::{mesh::MeshSettings, model::PriorSettings};

    fn two_cells() -> Mesh {
        Mesh::new(vec![0., 10., 30.])
            .unwrap()
            .with_settings(&MeshSettings {
                min_edge: 0.,
                max_edge: 30.,
                max_cells: 10,
                min_width: Some(1.),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn birth_on_two_cells() {
        let mesh = two_cells();
        let born = mesh.insert_edge(20.).unwrap();

        let jump = jump_densities(&born).unwrap();
        assert_relative_eq!(jump.forward, -(28f64.ln()));
        assert_relative_eq!(jump.reverse, -(2f64.ln()));

        // The boundary terms cancel against the order-statistic prior.
        let prior_ratio = born.prior_log_probability().unwrap() - mesh.prior_log_probability().unwrap();
        assert_relative_eq!(prior_ratio + jump.reverse - jump.forward, 0., epsilon = 1e-12);

        let death = born.delete_edge(2).unwrap();
        let back = jump_densities(&death).unwrap();
        assert_relative_eq!(back.forward, jump.reverse);
        assert_relative_eq!(back.reverse, jump.forward);
    }

    #[test]
    fn densities_of_a_birth() {
        let priors = PriorSettings::default();
        let current = Model::new(two_cells(), vec![0.5, 2.])
            .unwrap()
            .with_priors(&priors)
            .unwrap();
        let born = current.mesh().insert_edge(20.).unwrap();
        let values = born.remap_values(current.values()).unwrap();
        let remapped = Model::new(born, values).unwrap().with_priors(&priors).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let perturbed = remapped.stochastic_newton_step(None, &mut rng).unwrap();
        let densities = proposal_probabilities(&remapped, &perturbed, None).unwrap();

        let proposal = perturbed.proposal().unwrap();
        let forward = proposal.log_probability(&perturbed.values().to_vec()) - 28f64.ln();
        assert_relative_eq!(densities.forward, forward, epsilon = 1e-10);

        let covariance = proposal.covariance().clone();
        let gradient = perturbed.prior_gradient().unwrap();
        let shift = mat_vec(covariance.as_ref(), &gradient).unwrap();
        let mean = perturbed
            .values()
            .iter()
            .zip(shift)
            .map(|(v, s)| v.ln() - 0.5 * s)
            .collect();
        let reverse = MvLogNormal::new(mean, covariance)
            .unwrap()
            .log_probability(&remapped.values().to_vec())
            - 2f64.ln();
        assert_relative_eq!(densities.reverse, reverse, epsilon = 1e-10);
        assert_relative_eq!(densities.log_ratio(), reverse - forward, epsilon = 1e-10);
    }

    #[test]
    fn births_drop_the_attached_proposal() {
        let priors = PriorSettings::default();
        let model = Model::new(two_cells(), vec![1., 2.])
            .unwrap()
            .with_priors(&priors)
            .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let stepped = model.stochastic_newton_step(None, &mut rng).unwrap();
        assert_eq!(stepped.proposal().unwrap().dim(), 2);

        let born = (0..1000)
            .map(|_| stepped.perturb_structure(&mut rng).unwrap())
            .find(|m| matches!(m.mesh().action(), Action::Insert { .. }))
            .unwrap();
        assert_eq!(born.n_cells(), 3);
        assert!(born.proposal().is_none());
        assert!(matches!(
            proposal_probabilities(&stepped, &born, None),
            Err(JumpError::NotConfigured(_))
        ));

        let moved = (0..1000)
            .map(|_| stepped.perturb_structure(&mut rng).unwrap())
            .find(|m| matches!(m.mesh().action(), Action::Perturb { .. }))
            .unwrap();
        assert_eq!(
            moved.proposal().unwrap().mean_log(),
            stepped.proposal().unwrap().mean_log()
        );

        let grown = born.stochastic_newton_step(None, &mut rng).unwrap();
        assert!(matches!(
            proposal_probabilities(&stepped, &grown, None),
            Err(JumpError::Numerical(NumericalError::DimensionMismatch {
                expected: 3,
                found: 2
            }))
        ));
    }

    #[test]
    fn fixed_dimension_has_no_jump_term() {
        let mesh = two_cells();
        let jump = jump_densities(&mesh).unwrap();
        assert_eq!(jump.log_ratio(), 0.);
    }

    #[test]
    fn needs_a_proposal() {
        let model = Model::new(two_cells(), vec![1., 1.])
            .unwrap()
            .with_priors(&PriorSettings::default())
            .unwrap();
        assert!(matches!(
            proposal_probabilities(&model, &model, None),
            Err(JumpError::NotConfigured(_))
        ));
    }
}

use faer::Mat;
use layerjump::{
    merge_posteriors, sample_parallel, Forward, ForwardModel, HashMapGroup, Mesh, MeshSettings,
    Model, Persist, PosteriorHistogram, SamplerSettings, Sounding, Transform,
};
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

/// Each datum is the thickness-weighted mean of `ln v` down to a sensing
/// depth, which makes the problem linear in log space.
struct AveragingForward {
    depths: Vec<f64>,
}

#[derive(Error, Debug)]
enum AveragingError {
    #[error("sensing depth {0} lies below the mesh")]
    TooDeep(f64),
}

impl ForwardModel for AveragingForward {
    type Err = AveragingError;

    fn evaluate(&self, model: &Model) -> Result<Forward, AveragingError> {
        let edges = model.mesh().edges_absolute();
        let bottom = *edges.last().unwrap();
        if let Some(depth) = self.depths.iter().find(|d| **d > bottom) {
            return Err(AveragingError::TooDeep(*depth));
        }
        let jacobian = Mat::from_fn(self.depths.len(), model.n_cells(), |j, i| {
            let depth = self.depths[j];
            (edges[i + 1].min(depth) - edges[i].min(depth)) / depth
        });
        let predicted = (0..self.depths.len())
            .map(|j| {
                model
                    .values()
                    .iter()
                    .enumerate()
                    .map(|(i, v)| jacobian[(j, i)] * v.ln())
                    .sum()
            })
            .collect();
        Ok(Forward {
            predicted,
            jacobian,
        })
    }
}

fn forward() -> AveragingForward {
    AveragingForward {
        depths: vec![5., 10., 20., 35., 50., 80., 120., 160.],
    }
}

/// A conductive layer over a resistive half-space with the interface at 40.
fn synthetic(seed: u64, noise: f64) -> Sounding {
    let truth = Model::new(Mesh::new(vec![0., 40., 200.]).unwrap(), vec![0.1, 10.]).unwrap();
    let clean = forward().evaluate(&truth).unwrap().predicted;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let error = Normal::new(0., noise).unwrap();
    let observed = clean.iter().map(|d| d + error.sample(&mut rng)).collect();
    Sounding::new(observed, &vec![noise; clean.len()]).unwrap()
}

fn settings() -> SamplerSettings {
    SamplerSettings {
        num_draws: 2000,
        burn_in: 500,
        seed: 17,
        num_threads: 2,
        mesh: MeshSettings {
            min_edge: 1.,
            max_edge: 150.,
            max_cells: 15,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn recovers_shallow_layer() {
    let forward = forward();
    let soundings = vec![synthetic(1, 0.02), synthetic(2, 0.02)];
    let settings = settings();
    let summaries = sample_parallel(&forward, &soundings, &settings).unwrap();
    assert_eq!(summaries.len(), 2);

    let initial = settings.initial_model().unwrap();
    let initial_misfit = soundings[0]
        .misfit(&forward.evaluate(&initial).unwrap().predicted)
        .unwrap();

    for (summary, sounding) in summaries.iter().zip(&soundings) {
        assert_eq!(summary.posterior.n_samples(), settings.num_draws);
        assert!(summary.acceptance_rate > 0.);

        let best = forward.evaluate(&summary.best).unwrap().predicted;
        assert!(sounding.misfit(&best).unwrap() < initial_misfit);

        // The shallowest depth bins sit well inside the conductive layer.
        let intervals = summary.posterior.credible_intervals();
        let (median, low, high) = intervals[0].unwrap();
        assert!(low <= median && median <= high);
        assert!(median < 0.5, "median {} did not move towards 0.1", median);

        let doi = summary.posterior.depth_of_investigation();
        assert!(doi > 0.);
    }

    let posteriors: Vec<PosteriorHistogram> =
        summaries.iter().map(|s| s.posterior.clone()).collect();
    let merged = merge_posteriors(&posteriors).unwrap().unwrap();
    assert_eq!(merged.n_samples(), 2 * settings.num_draws);
}

#[test]
fn seeded_runs_are_identical() {
    let forward = forward();
    let soundings = vec![synthetic(3, 0.05)];
    let settings = SamplerSettings {
        num_draws: 300,
        burn_in: 50,
        ..settings()
    };
    let a = sample_parallel(&forward, &soundings, &settings).unwrap();
    let b = sample_parallel(&forward, &soundings, &settings).unwrap();
    assert_eq!(a[0].accepted, b[0].accepted);
    assert_eq!(a[0].best.values(), b[0].best.values());
    assert_eq!(a[0].posterior, b[0].posterior);
}

#[test]
fn results_survive_storage() {
    let forward = forward();
    let soundings = vec![synthetic(4, 0.05)];
    let settings = SamplerSettings {
        num_draws: 200,
        burn_in: 20,
        ..settings()
    };
    let summary = sample_parallel(&forward, &soundings, &settings)
        .unwrap()
        .remove(0);

    let mut root = HashMapGroup::default();
    summary.best.write_to(&mut root, "best").unwrap();
    summary.posterior.write_to(&mut root, "posterior").unwrap();

    let best = Model::read_from(&root, "best").unwrap();
    assert_eq!(best.values(), summary.best.values());
    assert_eq!(best.mesh().edges(), summary.best.mesh().edges());
    assert_eq!(
        PosteriorHistogram::read_from(&root, "posterior").unwrap(),
        summary.posterior
    );
}

#[test]
fn log_depth_mesh() {
    let mesh = Mesh::from_absolute(&[1., 10., 100.], Transform::Log, 0.)
        .unwrap()
        .with_settings(&MeshSettings {
            min_edge: 0.5,
            max_edge: 4.,
            max_cells: 8,
            ..Default::default()
        })
        .unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let mut current = mesh;
    for _ in 0..500 {
        current = current.perturb(&mut rng).unwrap();
        assert!(current.is_valid());
        let absolute = current.edges_absolute();
        assert!((absolute[0] - 1.).abs() < 1e-12);
        assert!((absolute[absolute.len() - 1] - 100.).abs() < 1e-9);
    }
}

#[test]
fn forward_errors_are_reported() {
    let forward = AveragingForward {
        depths: vec![500.],
    };
    let soundings = vec![Sounding::new(vec![0.], &[1.]).unwrap()];
    let result = sample_parallel(&forward, &soundings, &settings());
    assert!(result.is_err());
}

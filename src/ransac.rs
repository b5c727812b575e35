//! Global registration: RANSAC over mutual FPFH matches.
//!
//! No initial pose is needed. Every trial draws its sample from its own
//! `StdRng` seeded from one base seed and the trial number, so the result is
//! reproducible for a given caller RNG state even though batches of trials
//! run in parallel.

use log::debug;
use nalgebra as na;
use rand::prelude::IndexedRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;

use crate::{
    config::RansacConfig,
    correspondence::{evaluate_registration, Correspondence, Evaluation},
    error::{RegistrationError, Result, Stage},
    features::{FeatureSet, Fpfh},
    point_cloud::PointCloud,
    spatial_index::SpatialIndex,
    transform::{estimate_rigid_transform, RigidTransform},
};

const TRIAL_BATCH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct CoarseResult {
    pub transform: RigidTransform,
    pub fitness: f64,
    pub inlier_rmse: f64,
    pub inlier_count: usize,
    /// Feature matches RANSAC sampled from.
    pub correspondence_count: usize,
    pub trials: usize,
}

struct Hypothesis {
    transform: RigidTransform,
    evaluation: Evaluation,
}

impl Hypothesis {
    fn is_better_than(&self, other: &Hypothesis) -> bool {
        self.evaluation.fitness > other.evaluation.fitness
            || (self.evaluation.fitness == other.evaluation.fitness
                && self.evaluation.inlier_rmse < other.evaluation.inlier_rmse)
    }
}

/// Nearest target descriptor for every valid source descriptor, optionally kept only when mutual.
pub fn match_features(
    source: &FeatureSet,
    target: &FeatureSet,
    mutual_filter: bool,
) -> Vec<Correspondence> {
    let forward = nearest_descriptors(&source.descriptors, &target.descriptors);
    if !mutual_filter {
        return forward.into_iter().flatten().collect();
    }
    let backward = nearest_descriptors(&target.descriptors, &source.descriptors);
    forward
        .into_iter()
        .flatten()
        .filter(|c| backward[c.target].is_some_and(|b| b.target == c.source))
        .collect()
}

fn nearest_descriptors(
    from: &[Option<Fpfh>],
    to: &[Option<Fpfh>],
) -> Vec<Option<Correspondence>> {
    from.par_iter()
        .enumerate()
        .map(|(i, descriptor)| {
            let descriptor = descriptor.as_ref()?;
            let mut best: Option<(usize, f64)> = None;
            for (j, candidate) in to.iter().enumerate() {
                let Some(candidate) = candidate else {
                    continue;
                };
                let d2 = descriptor.squared_distance(candidate);
                if best.map_or(true, |(_, best_d2)| d2 < best_d2) {
                    best = Some((j, d2));
                }
            }
            best.map(|(j, d2)| Correspondence {
                source: i,
                target: j,
                distance: d2.sqrt(),
            })
        })
        .collect()
}

/// Pairwise edge lengths of the sample must agree between source and target within `similarity`.
fn edge_lengths_consistent(
    source: &[na::Point3<f64>],
    target: &[na::Point3<f64>],
    similarity: f64,
) -> bool {
    for i in 0..source.len() {
        for j in (i + 1)..source.len() {
            let ds = (source[i] - source[j]).norm();
            let dt = (target[i] - target[j]).norm();
            if ds < similarity * dt || dt < similarity * ds {
                return false;
            }
        }
    }
    true
}

fn trial_seed(base: u64, trial: usize) -> u64 {
    // splitmix64 finalizer keeps neighbouring trials decorrelated
    let mut z = base ^ (trial as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn run_trial(
    trial: usize,
    base_seed: u64,
    source: &[na::Point3<f64>],
    target: &[na::Point3<f64>],
    correspondences: &[Correspondence],
    target_index: &SpatialIndex,
    config: &RansacConfig,
) -> Option<Hypothesis> {
    let mut rng = StdRng::seed_from_u64(trial_seed(base_seed, trial));
    let sample: Vec<&Correspondence> = correspondences
        .choose_multiple(&mut rng, config.sample_size)
        .collect();
    let sample_source: Vec<na::Point3<f64>> = sample.iter().map(|c| source[c.source]).collect();
    let sample_target: Vec<na::Point3<f64>> = sample.iter().map(|c| target[c.target]).collect();

    if !edge_lengths_consistent(&sample_source, &sample_target, config.edge_length_similarity) {
        return None;
    }
    // degenerate fits are dropped and sampling continues
    let transform = estimate_rigid_transform(&sample_source, &sample_target).ok()?;
    let distance_ok = sample_source
        .iter()
        .zip(&sample_target)
        .all(|(s, t)| (transform.transform_point(s) - t).norm() <= config.max_correspondence_distance);
    if !distance_ok {
        return None;
    }

    let evaluation = evaluate_registration(
        source,
        target_index,
        &transform,
        config.max_correspondence_distance,
    );
    if evaluation.inlier_count == 0 || evaluation.fitness < config.min_fitness {
        return None;
    }
    Some(Hypothesis {
        transform,
        evaluation,
    })
}

fn required_trials(fitness: f64, sample_size: usize, confidence: f64, max_iterations: usize) -> usize {
    let inlier_probability = fitness.powi(sample_size as i32);
    if inlier_probability >= 1.0 {
        return 0;
    }
    if inlier_probability <= 0.0 {
        return max_iterations;
    }
    let estimate = (1.0 - confidence).ln() / (1.0 - inlier_probability).ln();
    if estimate.is_finite() {
        (estimate.ceil() as usize).min(max_iterations)
    } else {
        max_iterations
    }
}

/// Coarse alignment of `source` onto `target` from their descriptors.
pub fn align<R: Rng>(
    source: &PointCloud,
    target: &PointCloud,
    source_features: &FeatureSet,
    target_features: &FeatureSet,
    config: &RansacConfig,
    rng: &mut R,
) -> Result<CoarseResult> {
    config.validate()?;
    if source_features.len() != source.len() || target_features.len() != target.len() {
        return Err(RegistrationError::invalid_input(
            Stage::CoarseAlignment,
            format!(
                "descriptors are stale: {}/{} source and {}/{} target entries",
                source_features.len(),
                source.len(),
                target_features.len(),
                target.len()
            ),
        ));
    }

    let correspondences = match_features(source_features, target_features, config.mutual_filter);
    debug!(
        "{} feature correspondences (mutual filter {})",
        correspondences.len(),
        config.mutual_filter
    );
    let base_seed: u64 = rng.random();

    let failure = |trials: usize| {
        RegistrationError::no_convergence(
            Stage::CoarseAlignment,
            format!(
                "no valid sample after {} trials ({} feature matches, sample_size {}, \
                 max_correspondence_distance {}, edge_length_similarity {}, min_fitness {}, max_iterations {})",
                trials,
                correspondences.len(),
                config.sample_size,
                config.max_correspondence_distance,
                config.edge_length_similarity,
                config.min_fitness,
                config.max_iterations
            ),
        )
    };
    if correspondences.len() < config.sample_size {
        return Err(failure(0));
    }

    let target_index = SpatialIndex::new(target.points(), config.max_correspondence_distance);
    let mut best: Option<Hypothesis> = None;
    let mut trial_budget = config.max_iterations;
    let mut trials = 0;

    while trials < trial_budget {
        let batch_end = (trials + TRIAL_BATCH).min(trial_budget);
        let batch: Vec<Option<Hypothesis>> = (trials..batch_end)
            .into_par_iter()
            .map(|trial| {
                run_trial(
                    trial,
                    base_seed,
                    source.points(),
                    target.points(),
                    &correspondences,
                    &target_index,
                    config,
                )
            })
            .collect();
        trials = batch_end;

        // reduce in trial order so ties resolve identically on every run
        for hypothesis in batch.into_iter().flatten() {
            if best.as_ref().map_or(true, |b| hypothesis.is_better_than(b)) {
                best = Some(hypothesis);
            }
        }
        if let Some(best) = &best {
            trial_budget = required_trials(
                best.evaluation.fitness,
                config.sample_size,
                config.confidence,
                config.max_iterations,
            )
            .max(trials.min(config.max_iterations))
            .min(trial_budget);
        }
    }

    let best = best.ok_or_else(|| failure(trials))?;
    debug!(
        "RANSAC kept fitness {:.4}, rmse {:.6} after {} trials",
        best.evaluation.fitness, best.evaluation.inlier_rmse, trials
    );
    Ok(CoarseResult {
        transform: best.transform,
        fitness: best.evaluation.fitness,
        inlier_rmse: best.evaluation.inlier_rmse,
        inlier_count: best.evaluation.inlier_count,
        correspondence_count: correspondences.len(),
        trials,
    })
}

use crate::data::{FeatureMatrix, GroupLabels};
use crate::error::Result;
use crate::ranking::{check_dimensions, score_features};
use crate::statistic::Statistic;
use log::{debug, info, warn};
use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Scores of every feature under every completed label permutation, pooled
/// across features (round after round, features in index order)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct NullPool {
    #[serde(with = "crate::utils::serde_float_vec")]
    pub scores: Vec<f64>,
    pub rounds_completed: usize,
    pub n_features: usize,
}

impl NullPool {
    pub fn is_empty(&self) -> bool {
        self.rounds_completed == 0
    }

    /// Pooled scores that could be computed
    pub fn finite_scores(&self) -> Vec<f64> {
        self.scores.iter().cloned().filter(|v| v.is_finite()).collect()
    }

    pub fn mean(&self) -> f64 {
        let finite = self.finite_scores();
        if finite.is_empty() {
            return f64::NAN;
        }
        finite.iter().sum::<f64>() / finite.len() as f64
    }

    /// Scores of one round
    pub fn round(&self, r: usize) -> &[f64] {
        &self.scores[r * self.n_features..(r + 1) * self.n_features]
    }
}

/// One seed per round, drawn up front from the master seed so that the pool
/// does not depend on scheduling
pub fn round_seeds(seed: u64, n_rounds: usize) -> Vec<u64> {
    let mut master = ChaCha8Rng::seed_from_u64(seed);
    (0..n_rounds).map(|_| master.next_u64()).collect()
}

/// Rank every feature against `n_rounds` random permutations of the labels.
/// Rounds run one after another, features in parallel within a round.
/// `running` is checked between rounds; on a stop request the rounds already
/// completed are returned.
pub fn estimate_null(
    matrix: &FeatureMatrix,
    labels: &GroupLabels,
    statistic: &Statistic,
    n_rounds: usize,
    seed: u64,
    running: &AtomicBool,
) -> Result<NullPool> {
    check_dimensions(matrix, labels, statistic)?;
    let n_features = matrix.n_features();
    let mut pool = NullPool {
        scores: Vec::with_capacity(n_features * n_rounds),
        rounds_completed: 0,
        n_features,
    };
    if n_rounds == 0 {
        return Ok(pool);
    }

    let time = Instant::now();
    for (r, round_seed) in round_seeds(seed, n_rounds).into_iter().enumerate() {
        if !running.load(Ordering::Relaxed) {
            warn!(
                "Null estimation stopped after {} of {} rounds",
                pool.rounds_completed, n_rounds
            );
            break;
        }
        let mut rng = ChaCha8Rng::seed_from_u64(round_seed);
        let permuted = labels.permuted(&mut rng);
        let outcomes = score_features(matrix, &permuted, statistic, 0..n_features);
        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        pool.scores
            .extend(outcomes.into_iter().map(|o| o.unwrap_or(f64::NAN)));
        pool.rounds_completed += 1;
        debug!(
            "Null round {}/{}: {} features scored, {} failed",
            r + 1,
            n_rounds,
            n_features - failed,
            failed
        );
    }

    info!(
        "Null distribution: {} rounds x {} features in {:.2?} (pooled mean {:.3})",
        pool.rounds_completed,
        n_features,
        time.elapsed(),
        pool.mean()
    );
    Ok(pool)
}

use crate::data::{FeatureMatrix, GroupLabels};
use crate::error::{Error, FeatureError, Result};
use crate::statistic::Statistic;
use crate::utils::format_duration;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FeatureFailure {
    pub feature: usize,
    pub reason: String,
}

/// Scores of one ranking pass, indexed by feature
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RankResult {
    /// One score per feature, NaN when the feature could not be scored
    #[serde(with = "crate::utils::serde_float_vec")]
    pub scores: Vec<f64>,
    /// Feature indices by decreasing score, ties by index, failed features excluded
    pub order: Vec<usize>,
    pub failures: Vec<FeatureFailure>,
}

impl RankResult {
    pub fn n_features(&self) -> usize {
        self.scores.len()
    }

    pub fn n_failed(&self) -> usize {
        self.failures.len()
    }

    /// The `k` best features (fewer if fewer were scored)
    pub fn top(&self, k: usize) -> Vec<usize> {
        self.order.iter().take(k).cloned().collect()
    }
}

/// Projected cost of a full run, measured on a calibration window
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CostEstimate {
    pub calibration_features: usize,
    #[serde(with = "crate::utils::serde_float")]
    pub seconds_per_evaluation: f64,
    /// Feature evaluations for the real ranking plus every null round
    pub evaluations: usize,
    #[serde(with = "crate::utils::serde_float")]
    pub projected_seconds: f64,
}

impl CostEstimate {
    pub fn new(calibration_features: usize, elapsed_seconds: f64, n_features: usize, n_rounds: usize) -> CostEstimate {
        let seconds_per_evaluation = if calibration_features > 0 {
            elapsed_seconds / calibration_features as f64
        } else {
            f64::NAN
        };
        let evaluations = n_features * (1 + n_rounds);
        CostEstimate {
            calibration_features,
            seconds_per_evaluation,
            evaluations,
            projected_seconds: seconds_per_evaluation * evaluations as f64,
        }
    }
}

/// Score one feature column in-sample, excluding the objects where it is missing
pub fn score_feature(column: &[f64], labels: &[usize], statistic: &Statistic) -> std::result::Result<f64, FeatureError> {
    let (x, y): (Vec<f64>, Vec<usize>) = column
        .iter()
        .zip(labels)
        .filter(|(v, _)| !v.is_nan())
        .map(|(&v, &label)| (v, label))
        .unzip();
    let score = statistic.score(&x, &y, &x, &y)?;
    if score.is_nan() {
        return Err(FeatureError::Solver("undefined score".to_string()));
    }
    Ok(score)
}

/// Per-feature outcomes for a feature range, in index order
pub fn score_features(
    matrix: &FeatureMatrix,
    labels: &GroupLabels,
    statistic: &Statistic,
    features: std::ops::Range<usize>,
) -> Vec<std::result::Result<f64, FeatureError>> {
    features
        .into_par_iter()
        .map(|j| score_feature(matrix.column(j), labels.as_slice(), statistic))
        .collect()
}

/// The grouping must cover every object and have the class count the
/// statistic was built for
pub(crate) fn check_dimensions(matrix: &FeatureMatrix, labels: &GroupLabels, statistic: &Statistic) -> Result<()> {
    if labels.len() != matrix.n_objects() {
        return Err(Error::DimensionMismatch {
            what: "group labels".to_string(),
            expected: matrix.n_objects(),
            found: labels.len(),
        });
    }
    if labels.num_classes() != statistic.num_classes() {
        return Err(Error::InvalidClassCount {
            statistic: statistic.name().to_string(),
            expected: statistic.num_classes().to_string(),
            found: labels.num_classes(),
        });
    }
    Ok(())
}

/// Decreasing order of the non-NaN scores, stable on feature index
pub fn sort_order(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).filter(|&j| !scores[j].is_nan()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
    order
}

fn assemble(outcomes: Vec<std::result::Result<f64, FeatureError>>) -> Result<RankResult> {
    let mut scores = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for (feature, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(score) => scores.push(score),
            Err(e) => {
                debug!("Feature {} not scored: {}", feature, e);
                scores.push(f64::NAN);
                failures.push(FeatureFailure {
                    feature,
                    reason: e.to_string(),
                });
            }
        }
    }

    if !scores.is_empty() && failures.len() == scores.len() {
        return Err(Error::AllFeaturesFailed {
            n_features: scores.len(),
        });
    }
    if !failures.is_empty() {
        warn!(
            "{} of {} features could not be scored and are left out of the ranking",
            failures.len(),
            scores.len()
        );
    }

    let order = sort_order(&scores);
    Ok(RankResult { scores, order, failures })
}

/// Score every feature of the matrix against the grouping
pub fn rank_all(matrix: &FeatureMatrix, labels: &GroupLabels, statistic: &Statistic) -> Result<RankResult> {
    check_dimensions(matrix, labels, statistic)?;
    assemble(score_features(matrix, labels, statistic, 0..matrix.n_features()))
}

/// Same as [`rank_all`], timing the first `calibration_window` features (scored
/// serially) to project the cost of the real ranking plus `n_rounds` null rounds
pub fn rank_all_calibrated(
    matrix: &FeatureMatrix,
    labels: &GroupLabels,
    statistic: &Statistic,
    calibration_window: usize,
    n_rounds: usize,
) -> Result<(RankResult, CostEstimate)> {
    check_dimensions(matrix, labels, statistic)?;
    let n_features = matrix.n_features();
    let window = calibration_window.min(n_features);

    let time = Instant::now();
    let mut outcomes: Vec<std::result::Result<f64, FeatureError>> = (0..window)
        .map(|j| score_feature(matrix.column(j), labels.as_slice(), statistic))
        .collect();
    let estimate = CostEstimate::new(window, time.elapsed().as_secs_f64(), n_features, n_rounds);

    info!(
        "Calibration on {} features: {:.3e}s per feature, {} evaluations projected to take about {} on one thread",
        window,
        estimate.seconds_per_evaluation,
        estimate.evaluations,
        format_duration(estimate.projected_seconds)
    );

    outcomes.extend(score_features(matrix, labels, statistic, window..n_features));
    Ok((assemble(outcomes)?, estimate))
}

//! One-dimensional classifiers used by the accuracy statistics.
//!
//! Every classifier is fitted on a single feature column and predicts group
//! labels in `1..=num_classes`. Ties between classes are resolved towards the
//! lowest label so that predictions are deterministic.

use crate::error::FeatureError;
use argmin::{
    core::{CostFunction, Error as ArgminError, Executor},
    solver::brent::BrentOpt,
};
use serde::{Deserialize, Serialize};

/// L2 penalty on the logistic slope, keeps the fit finite on separable data
const LOGISTIC_LAMBDA: f64 = 1e-3;
const LOGISTIC_BOUND: f64 = 1e3;
const LOGISTIC_MAX_SWEEPS: usize = 200;
const LOGISTIC_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum ClassifierKind {
    /// Gaussian discriminant with a pooled within-class variance
    linear,
    /// Gaussian discriminant with one variance per class
    quadratic,
    nearest_centroid,
    /// L2-penalized logistic regression, one-vs-rest above two classes
    logistic,
    /// Single threshold maximizing the Youden index (two classes)
    threshold,
}

impl ClassifierKind {
    pub fn label(&self) -> &'static str {
        match self {
            ClassifierKind::linear => "Linear discriminant",
            ClassifierKind::quadratic => "Quadratic discriminant",
            ClassifierKind::nearest_centroid => "Nearest centroid",
            ClassifierKind::logistic => "Logistic regression",
            ClassifierKind::threshold => "Threshold",
        }
    }

    /// Number of classes the classifier can separate (`None` = any)
    pub fn required_classes(&self) -> Option<usize> {
        match self {
            ClassifierKind::threshold => Some(2),
            _ => None,
        }
    }
}

pub trait Classifier {
    /// Fit on one feature column; `y` holds labels in `1..=num_classes`
    fn fit(&mut self, x: &[f64], y: &[usize], num_classes: usize) -> Result<(), FeatureError>;

    fn predict(&self, x: &[f64]) -> Vec<usize>;
}

/// Build a fresh, unfitted classifier of the given kind
pub fn build_classifier(kind: ClassifierKind) -> Box<dyn Classifier> {
    match kind {
        ClassifierKind::linear => Box::new(Discriminant::new(false)),
        ClassifierKind::quadratic => Box::new(Discriminant::new(true)),
        ClassifierKind::nearest_centroid => Box::new(NearestCentroid { means: Vec::new() }),
        ClassifierKind::logistic => Box::new(Logistic { models: Vec::new() }),
        ClassifierKind::threshold => Box::new(Threshold {
            threshold: f64::NEG_INFINITY,
            high_label: 2,
        }),
    }
}

/// Percentage of correct predictions
pub fn accuracy(predicted: &[usize], truth: &[usize]) -> f64 {
    if truth.is_empty() {
        return f64::NAN;
    }
    let correct = predicted.iter().zip(truth).filter(|(p, t)| p == t).count();
    100.0 * correct as f64 / truth.len() as f64
}

/// Unweighted mean of the per-class recalls, in percent, over the classes present in `truth`
pub fn balanced_accuracy(predicted: &[usize], truth: &[usize], num_classes: usize) -> f64 {
    let mut hits = vec![0usize; num_classes];
    let mut totals = vec![0usize; num_classes];
    for (&p, &t) in predicted.iter().zip(truth) {
        totals[t - 1] += 1;
        if p == t {
            hits[t - 1] += 1;
        }
    }
    let recalls: Vec<f64> = hits
        .iter()
        .zip(&totals)
        .filter(|(_, &n)| n > 0)
        .map(|(&h, &n)| h as f64 / n as f64)
        .collect();
    if recalls.is_empty() {
        return f64::NAN;
    }
    100.0 * recalls.iter().sum::<f64>() / recalls.len() as f64
}

pub(crate) fn check_finite(x: &[f64]) -> Result<(), FeatureError> {
    if x.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(FeatureError::NonFiniteInput)
    }
}

#[derive(Clone, Debug)]
struct ClassMoments {
    n: usize,
    mean: f64,
    /// Sum of squared deviations from the class mean
    ss: f64,
}

fn class_moments(x: &[f64], y: &[usize], num_classes: usize, min_members: usize) -> Result<Vec<ClassMoments>, FeatureError> {
    let mut sums = vec![0.0; num_classes];
    let mut counts = vec![0usize; num_classes];
    for (&v, &label) in x.iter().zip(y) {
        sums[label - 1] += v;
        counts[label - 1] += 1;
    }
    if let Some(class) = counts.iter().position(|&n| n < min_members) {
        return Err(FeatureError::DegenerateClass {
            class,
            needed: min_members,
            found: counts[class],
        });
    }
    let means: Vec<f64> = sums.iter().zip(&counts).map(|(s, &n)| s / n as f64).collect();
    let mut ss = vec![0.0; num_classes];
    for (&v, &label) in x.iter().zip(y) {
        ss[label - 1] += (v - means[label - 1]).powi(2);
    }
    Ok((0..num_classes)
        .map(|k| ClassMoments {
            n: counts[k],
            mean: means[k],
            ss: ss[k],
        })
        .collect())
}

/// Zero-based index of the largest value, first one on ties
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (k, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = k;
        }
    }
    best
}

//-----------------------------------------------------------------------------
// Gaussian discriminants

struct Discriminant {
    per_class_variance: bool,
    means: Vec<f64>,
    variances: Vec<f64>,
    log_priors: Vec<f64>,
}

impl Discriminant {
    fn new(per_class_variance: bool) -> Discriminant {
        Discriminant {
            per_class_variance,
            means: Vec::new(),
            variances: Vec::new(),
            log_priors: Vec::new(),
        }
    }

    fn discriminants(&self, v: f64) -> Vec<f64> {
        (0..self.means.len())
            .map(|k| {
                let var = self.variances[k];
                if var > 0.0 {
                    let log_scale = if self.per_class_variance { -0.5 * var.ln() } else { 0.0 };
                    log_scale - (v - self.means[k]).powi(2) / (2.0 * var) + self.log_priors[k]
                } else {
                    // Vanishing pooled variance: nearest mean decides
                    -(v - self.means[k]).abs()
                }
            })
            .collect()
    }
}

impl Classifier for Discriminant {
    fn fit(&mut self, x: &[f64], y: &[usize], num_classes: usize) -> Result<(), FeatureError> {
        check_finite(x)?;
        let min_members = if self.per_class_variance { 2 } else { 1 };
        let moments = class_moments(x, y, num_classes, min_members)?;
        let n = x.len() as f64;

        self.variances = if self.per_class_variance {
            let variances: Vec<f64> = moments.iter().map(|m| m.ss / (m.n - 1) as f64).collect();
            if variances.iter().any(|&v| v <= 0.0) {
                return Err(FeatureError::ZeroVariance);
            }
            variances
        } else {
            let dof = x.len().saturating_sub(num_classes);
            let pooled = if dof > 0 {
                moments.iter().map(|m| m.ss).sum::<f64>() / dof as f64
            } else {
                0.0
            };
            vec![pooled; num_classes]
        };
        self.means = moments.iter().map(|m| m.mean).collect();
        self.log_priors = moments.iter().map(|m| (m.n as f64 / n).ln()).collect();
        Ok(())
    }

    fn predict(&self, x: &[f64]) -> Vec<usize> {
        x.iter().map(|&v| argmax(&self.discriminants(v)) + 1).collect()
    }
}

//-----------------------------------------------------------------------------
// Nearest centroid

struct NearestCentroid {
    means: Vec<f64>,
}

impl Classifier for NearestCentroid {
    fn fit(&mut self, x: &[f64], y: &[usize], num_classes: usize) -> Result<(), FeatureError> {
        check_finite(x)?;
        self.means = class_moments(x, y, num_classes, 1)?.iter().map(|m| m.mean).collect();
        Ok(())
    }

    fn predict(&self, x: &[f64]) -> Vec<usize> {
        x.iter()
            .map(|&v| {
                let closeness: Vec<f64> = self.means.iter().map(|m| -(v - m).abs()).collect();
                argmax(&closeness) + 1
            })
            .collect()
    }
}

//-----------------------------------------------------------------------------
// Threshold (decision stump)

struct Threshold {
    threshold: f64,
    /// Label predicted above the threshold
    high_label: usize,
}

impl Classifier for Threshold {
    fn fit(&mut self, x: &[f64], y: &[usize], num_classes: usize) -> Result<(), FeatureError> {
        check_finite(x)?;
        class_moments(x, y, num_classes, 1)?;

        let mut combined: Vec<(f64, usize)> = x.iter().cloned().zip(y.iter().cloned()).collect();
        combined.sort_by(|a, b| a.0.total_cmp(&b.0));

        let n1 = y.iter().filter(|&&label| label == 1).count() as f64;
        let n2 = y.iter().filter(|&&label| label == 2).count() as f64;

        // Everything above the threshold: Youden index of 0 in both directions
        let mut best_threshold = f64::NEG_INFINITY;
        let mut best_youden_index = 0.0_f64;
        let mut seen_1 = 0.0;
        let mut seen_2 = 0.0;

        let mut i = 0;
        while i < combined.len() {
            let value = combined[i].0;
            while i < combined.len() && combined[i].0 == value {
                if combined[i].1 == 1 {
                    seen_1 += 1.0;
                } else {
                    seen_2 += 1.0;
                }
                i += 1;
            }
            if i == combined.len() {
                break;
            }
            // Class 2 above the cut: sensitivity on class 2 + specificity on class 1 - 1
            let youden_index = (n2 - seen_2) / n2 + seen_1 / n1 - 1.0;
            if youden_index.abs() > best_youden_index.abs() {
                best_youden_index = youden_index;
                best_threshold = (value + combined[i].0) / 2.0;
            }
        }

        self.threshold = best_threshold;
        self.high_label = if best_youden_index < 0.0 { 1 } else { 2 };
        Ok(())
    }

    fn predict(&self, x: &[f64]) -> Vec<usize> {
        let low_label = 3 - self.high_label;
        x.iter()
            .map(|&v| if v > self.threshold { self.high_label } else { low_label })
            .collect()
    }
}

//-----------------------------------------------------------------------------
// Logistic regression

/// Penalized negative log-likelihood of a binary logistic model on a standardized feature
struct LogisticLoss<'a> {
    z: &'a [f64],
    positive: &'a [bool],
}

impl LogisticLoss<'_> {
    fn value(&self, intercept: f64, slope: f64) -> f64 {
        let nll: f64 = self
            .z
            .iter()
            .zip(self.positive)
            .map(|(&z, &is_positive)| {
                let margin = intercept + slope * z;
                let signed = if is_positive { -margin } else { margin };
                // log(1 + exp(signed)), stable for large |signed|
                if signed > 0.0 {
                    signed + (-signed).exp().ln_1p()
                } else {
                    signed.exp().ln_1p()
                }
            })
            .sum();
        nll + 0.5 * LOGISTIC_LAMBDA * slope * slope
    }
}

// One coordinate of the logistic loss, the other one held fixed
struct CoordinateCost<'a> {
    loss: &'a LogisticLoss<'a>,
    other: f64,
    is_slope: bool,
}

impl CostFunction for CoordinateCost<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, value: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok(if self.is_slope {
            self.loss.value(self.other, *value)
        } else {
            self.loss.value(*value, self.other)
        })
    }
}

fn minimize_coordinate(loss: &LogisticLoss, other: f64, is_slope: bool) -> Result<f64, FeatureError> {
    let solver = BrentOpt::new(-LOGISTIC_BOUND, LOGISTIC_BOUND);
    let cost = CoordinateCost { loss, other, is_slope };
    let res = Executor::new(cost, solver)
        .configure(|state| state.max_iters(100))
        .run()
        .map_err(|e| FeatureError::Solver(e.to_string()))?;
    res.state
        .param
        .ok_or_else(|| FeatureError::Solver("Brent optimization returned no parameter".to_string()))
}

/// Cyclic coordinate descent with a Brent line search per coordinate
fn fit_binary_logistic(z: &[f64], positive: &[bool]) -> Result<(f64, f64), FeatureError> {
    let loss = LogisticLoss { z, positive };
    let mut intercept = 0.0;
    let mut slope = 0.0;
    for _ in 0..LOGISTIC_MAX_SWEEPS {
        let new_intercept = minimize_coordinate(&loss, slope, false)?;
        let new_slope = minimize_coordinate(&loss, new_intercept, true)?;
        let change = (new_intercept - intercept).abs() + (new_slope - slope).abs();
        intercept = new_intercept;
        slope = new_slope;
        if change < LOGISTIC_TOLERANCE {
            return Ok((intercept, slope));
        }
    }
    Err(FeatureError::NotConverged {
        iterations: LOGISTIC_MAX_SWEEPS,
    })
}

struct Logistic {
    /// (center, scale, intercept, slope) per binary model
    models: Vec<(f64, f64, f64, f64)>,
}

impl Classifier for Logistic {
    fn fit(&mut self, x: &[f64], y: &[usize], num_classes: usize) -> Result<(), FeatureError> {
        check_finite(x)?;
        class_moments(x, y, num_classes, 1)?;

        let n = x.len() as f64;
        let center = x.iter().sum::<f64>() / n;
        let sd = (x.iter().map(|v| (v - center).powi(2)).sum::<f64>() / n).sqrt();
        let scale = if sd > 0.0 { sd } else { 1.0 };
        let z: Vec<f64> = x.iter().map(|v| (v - center) / scale).collect();

        // Two classes: a single model for class 2 against class 1
        let positives: Vec<usize> = if num_classes == 2 { vec![2] } else { (1..=num_classes).collect() };
        self.models = Vec::with_capacity(positives.len());
        for positive_label in positives {
            let positive: Vec<bool> = y.iter().map(|&label| label == positive_label).collect();
            let (intercept, slope) = fit_binary_logistic(&z, &positive)?;
            self.models.push((center, scale, intercept, slope));
        }
        Ok(())
    }

    fn predict(&self, x: &[f64]) -> Vec<usize> {
        x.iter()
            .map(|&v| {
                let margins: Vec<f64> = self
                    .models
                    .iter()
                    .map(|&(center, scale, intercept, slope)| intercept + slope * (v - center) / scale)
                    .collect();
                if margins.len() == 1 {
                    if margins[0] > 0.0 { 2 } else { 1 }
                } else {
                    argmax(&margins) + 1
                }
            })
            .collect()
    }
}

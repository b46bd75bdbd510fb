//! Per-feature test statistics.
//!
//! A statistic is chosen by name once, validated against the grouping, and
//! resolved into a [`Statistic`] holding a boxed scorer. The ranking engine
//! then calls [`Statistic::score`] for every feature column.

use crate::classifier::{accuracy, balanced_accuracy, build_classifier, check_finite, ClassifierKind};
use crate::error::{Error, FeatureError, Result};
use crate::utils::{doubled_ranks, mean_and_variance};
use log::warn;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::fmt;
use std::str::FromStr;

/// Above this total sample count the exact rank-sum distribution is replaced by
/// the normal approximation (the exact count grows as N^3 per feature).
pub const EXACT_RANKSUM_MAX_SAMPLES: usize = 50;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum StatisticName {
    linear,
    linear_balanced,
    quadratic,
    quadratic_balanced,
    nearest_centroid,
    nearest_centroid_balanced,
    logistic,
    logistic_balanced,
    threshold,
    threshold_balanced,
    ttest,
    ustat_p_approx,
    ustat_p_exact,
}

const ALL_STATISTICS: [StatisticName; 13] = [
    StatisticName::linear,
    StatisticName::linear_balanced,
    StatisticName::quadratic,
    StatisticName::quadratic_balanced,
    StatisticName::nearest_centroid,
    StatisticName::nearest_centroid_balanced,
    StatisticName::logistic,
    StatisticName::logistic_balanced,
    StatisticName::threshold,
    StatisticName::threshold_balanced,
    StatisticName::ttest,
    StatisticName::ustat_p_approx,
    StatisticName::ustat_p_exact,
];

impl StatisticName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticName::linear => "linear",
            StatisticName::linear_balanced => "linear_balanced",
            StatisticName::quadratic => "quadratic",
            StatisticName::quadratic_balanced => "quadratic_balanced",
            StatisticName::nearest_centroid => "nearest_centroid",
            StatisticName::nearest_centroid_balanced => "nearest_centroid_balanced",
            StatisticName::logistic => "logistic",
            StatisticName::logistic_balanced => "logistic_balanced",
            StatisticName::threshold => "threshold",
            StatisticName::threshold_balanced => "threshold_balanced",
            StatisticName::ttest => "ttest",
            StatisticName::ustat_p_approx => "ustat_p_approx",
            StatisticName::ustat_p_exact => "ustat_p_exact",
        }
    }

    pub fn known_names() -> Vec<&'static str> {
        ALL_STATISTICS.iter().map(|name| name.as_str()).collect()
    }

    /// Classifier and balanced flag for the accuracy families
    pub fn classifier(&self) -> Option<(ClassifierKind, bool)> {
        match self {
            StatisticName::linear => Some((ClassifierKind::linear, false)),
            StatisticName::linear_balanced => Some((ClassifierKind::linear, true)),
            StatisticName::quadratic => Some((ClassifierKind::quadratic, false)),
            StatisticName::quadratic_balanced => Some((ClassifierKind::quadratic, true)),
            StatisticName::nearest_centroid => Some((ClassifierKind::nearest_centroid, false)),
            StatisticName::nearest_centroid_balanced => Some((ClassifierKind::nearest_centroid, true)),
            StatisticName::logistic => Some((ClassifierKind::logistic, false)),
            StatisticName::logistic_balanced => Some((ClassifierKind::logistic, true)),
            StatisticName::threshold => Some((ClassifierKind::threshold, false)),
            StatisticName::threshold_balanced => Some((ClassifierKind::threshold, true)),
            StatisticName::ttest | StatisticName::ustat_p_approx | StatisticName::ustat_p_exact => None,
        }
    }

    /// Families comparing exactly two groups
    pub fn is_two_sample(&self) -> bool {
        match self.classifier() {
            Some((kind, _)) => kind.required_classes() == Some(2),
            None => true,
        }
    }
}

impl FromStr for StatisticName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        ALL_STATISTICS
            .iter()
            .find(|name| name.as_str() == wanted)
            .copied()
            .ok_or_else(|| Error::UnsupportedStatistic(s.to_string()))
    }
}

impl fmt::Display for StatisticName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scores one feature: fit on the training arrays, evaluate on the test arrays.
/// Labels are in `1..=num_classes`; inputs are the objects kept for this feature.
pub trait TestStatistic: Send + Sync {
    fn score(&self, train_x: &[f64], train_y: &[usize], test_x: &[f64], test_y: &[usize]) -> std::result::Result<f64, FeatureError>;
}

struct ClassifierAccuracy {
    kind: ClassifierKind,
    balanced: bool,
    num_classes: usize,
}

impl TestStatistic for ClassifierAccuracy {
    fn score(&self, train_x: &[f64], train_y: &[usize], test_x: &[f64], test_y: &[usize]) -> std::result::Result<f64, FeatureError> {
        let mut classifier = build_classifier(self.kind);
        classifier.fit(train_x, train_y, self.num_classes)?;
        check_finite(test_x)?;
        let predicted = classifier.predict(test_x);
        Ok(if self.balanced {
            balanced_accuracy(&predicted, test_y, self.num_classes)
        } else {
            accuracy(&predicted, test_y)
        })
    }
}

fn split_two_groups(x: &[f64], y: &[usize], min_members: usize) -> std::result::Result<(Vec<f64>, Vec<f64>), FeatureError> {
    let mut class_1 = Vec::new();
    let mut class_2 = Vec::new();
    for (&value, &label) in x.iter().zip(y) {
        match label {
            1 => class_1.push(value),
            2 => class_2.push(value),
            _ => {}
        }
    }
    for (class, members) in [&class_1, &class_2].iter().enumerate() {
        if members.len() < min_members {
            return Err(FeatureError::DegenerateClass {
                class,
                needed: min_members,
                found: members.len(),
            });
        }
    }
    Ok((class_1, class_2))
}

/// Welch's two-sample t between group 1 and group 2, as a magnitude.
/// Computed on the training arrays only.
struct WelchT;

impl TestStatistic for WelchT {
    fn score(&self, train_x: &[f64], train_y: &[usize], _test_x: &[f64], _test_y: &[usize]) -> std::result::Result<f64, FeatureError> {
        check_finite(train_x)?;
        let (class_1, class_2) = split_two_groups(train_x, train_y, 2)?;
        let (mean_1, var_1) = mean_and_variance(&class_1);
        let (mean_2, var_2) = mean_and_variance(&class_2);
        let standard_error = (var_1 / class_1.len() as f64 + var_2 / class_2.len() as f64).sqrt();
        if standard_error <= 0.0 {
            return Err(FeatureError::ZeroVariance);
        }
        Ok(((mean_1 - mean_2) / standard_error).abs())
    }
}

/// Mann-Whitney U two-sided p-value, scored as -log10(p)
struct RankSum {
    exact: bool,
}

impl TestStatistic for RankSum {
    fn score(&self, train_x: &[f64], train_y: &[usize], _test_x: &[f64], _test_y: &[usize]) -> std::result::Result<f64, FeatureError> {
        check_finite(train_x)?;
        split_two_groups(train_x, train_y, 1)?;

        let (x, in_first): (Vec<f64>, Vec<bool>) = train_x
            .iter()
            .zip(train_y)
            .filter(|(_, &label)| label == 1 || label == 2)
            .map(|(&v, &label)| (v, label == 1))
            .unzip();
        let (ranks, tie_correction) = doubled_ranks(&x);

        let p_value = if self.exact {
            exact_ranksum_p(&ranks, &in_first)
        } else {
            approximate_ranksum_p(&ranks, &in_first, tie_correction)
        };
        Ok(-p_value.max(f64::MIN_POSITIVE).log10())
    }
}

/// Normal approximation with tie and continuity correction
fn approximate_ranksum_p(doubled: &[usize], in_first: &[bool], tie_correction: f64) -> f64 {
    let n1 = in_first.iter().filter(|&&f| f).count() as f64;
    let n2 = in_first.len() as f64 - n1;
    let n = n1 + n2;

    let rank_sum_1 = doubled
        .iter()
        .zip(in_first)
        .filter(|(_, &f)| f)
        .map(|(&r, _)| r as f64 / 2.0)
        .sum::<f64>();
    let u_stat = rank_sum_1 - n1 * (n1 + 1.0) / 2.0;
    let mean_u = n1 * n2 / 2.0;
    let var_u = n1 * n2 / 12.0 * ((n + 1.0) - tie_correction / (n * (n - 1.0)));
    if var_u <= 0.0 {
        // Every value tied
        return 1.0;
    }
    let z = ((u_stat - mean_u).abs() - 0.5).max(0.0) / var_u.sqrt();
    erfc(z / std::f64::consts::SQRT_2).min(1.0)
}

/// Exact two-sided p-value: distribution of the rank sum of the smaller group over
/// all equally likely assignments, counted on the observed (tied) ranks
fn exact_ranksum_p(doubled: &[usize], in_first: &[bool]) -> f64 {
    let n_first = in_first.iter().filter(|&&f| f).count();
    let use_first = n_first * 2 <= in_first.len();
    let k = if use_first { n_first } else { in_first.len() - n_first };
    let observed: usize = doubled
        .iter()
        .zip(in_first)
        .filter(|(_, &f)| f == use_first)
        .map(|(&r, _)| r)
        .sum();
    let max_sum: usize = doubled.iter().sum();

    // counts[j][s]: number of j-subsets with doubled rank sum s
    let mut counts = vec![vec![0.0f64; max_sum + 1]; k + 1];
    counts[0][0] = 1.0;
    for (seen, &r) in doubled.iter().enumerate() {
        for j in (1..=k.min(seen + 1)).rev() {
            let (lower, upper) = counts.split_at_mut(j);
            let previous = &lower[j - 1];
            let current = &mut upper[0];
            for s in (r..=max_sum).rev() {
                current[s] += previous[s - r];
            }
        }
    }

    let total: f64 = counts[k].iter().sum();
    let lower_tail: f64 = counts[k][..=observed].iter().sum();
    let upper_tail: f64 = counts[k][observed..].iter().sum();
    (2.0 * lower_tail.min(upper_tail) / total).min(1.0)
}

/// A validated statistic, ready to score feature columns
pub struct Statistic {
    name: StatisticName,
    num_classes: usize,
    balanced: bool,
    display_name: String,
    unit: &'static str,
    chance_line: f64,
    scorer: Box<dyn TestStatistic>,
}

impl Statistic {
    /// Resolve a statistic by name for a grouping with `class_sizes[k]` members in class k+1
    pub fn build(name: &str, num_classes: usize, class_sizes: &[usize]) -> Result<Statistic> {
        let name: StatisticName = name.parse()?;
        Statistic::from_name(name, num_classes, class_sizes)
    }

    pub fn from_name(name: StatisticName, num_classes: usize, class_sizes: &[usize]) -> Result<Statistic> {
        if class_sizes.len() != num_classes {
            return Err(Error::DimensionMismatch {
                what: "class sizes".to_string(),
                expected: num_classes,
                found: class_sizes.len(),
            });
        }
        if num_classes < 2 {
            return Err(Error::InvalidClassCount {
                statistic: name.to_string(),
                expected: "at least 2".to_string(),
                found: num_classes,
            });
        }
        if name.is_two_sample() && num_classes != 2 {
            return Err(Error::InvalidClassCount {
                statistic: name.to_string(),
                expected: "exactly 2".to_string(),
                found: num_classes,
            });
        }
        if let Some(empty) = class_sizes.iter().position(|&n| n == 0) {
            return Err(Error::EmptyGroup { class: empty + 1 });
        }
        let equal_sizes = class_sizes.iter().all(|&n| n == class_sizes[0]);

        let statistic = match name.classifier() {
            Some((kind, requested_balanced)) => {
                let balanced = if !requested_balanced && !equal_sizes {
                    warn!(
                        "Unequal group sizes {:?}: {} is scored with balanced accuracy instead of accuracy",
                        class_sizes,
                        kind.label()
                    );
                    true
                } else {
                    requested_balanced
                };
                Statistic {
                    name,
                    num_classes,
                    balanced,
                    display_name: format!(
                        "{} {}",
                        kind.label(),
                        if balanced { "balanced accuracy" } else { "accuracy" }
                    ),
                    unit: "%",
                    chance_line: 100.0 / num_classes as f64,
                    scorer: Box::new(ClassifierAccuracy {
                        kind,
                        balanced,
                        num_classes,
                    }),
                }
            }
            None if name == StatisticName::ttest => Statistic {
                name,
                num_classes,
                balanced: false,
                display_name: "Welch's t-statistic".to_string(),
                unit: "t",
                chance_line: 0.0,
                scorer: Box::new(WelchT),
            },
            None => {
                let total: usize = class_sizes.iter().sum();
                let exact = name == StatisticName::ustat_p_exact && total <= EXACT_RANKSUM_MAX_SAMPLES;
                if name == StatisticName::ustat_p_exact && !exact {
                    warn!(
                        "{} objects exceed the exact Mann-Whitney limit of {}: using the normal approximation",
                        total, EXACT_RANKSUM_MAX_SAMPLES
                    );
                }
                Statistic {
                    name,
                    num_classes,
                    balanced: false,
                    display_name: format!(
                        "Mann-Whitney U test ({})",
                        if exact { "exact" } else { "normal approximation" }
                    ),
                    unit: "-log10(p)",
                    chance_line: f64::NAN,
                    scorer: Box::new(RankSum { exact }),
                }
            }
        };
        Ok(statistic)
    }

    pub fn score(&self, train_x: &[f64], train_y: &[usize], test_x: &[f64], test_y: &[usize]) -> std::result::Result<f64, FeatureError> {
        self.scorer.score(train_x, train_y, test_x, test_y)
    }

    pub fn name(&self) -> StatisticName {
        self.name
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// True when accuracy is averaged per class (requested or forced by unequal groups)
    pub fn is_balanced(&self) -> bool {
        self.balanced
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn unit(&self) -> &str {
        self.unit
    }

    pub fn chance_line(&self) -> f64 {
        self.chance_line
    }

    pub fn is_accuracy(&self) -> bool {
        self.name.classifier().is_some()
    }
}

impl fmt::Debug for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Statistic")
            .field("name", &self.name)
            .field("num_classes", &self.num_classes)
            .field("balanced", &self.balanced)
            .field("display_name", &self.display_name)
            .field("unit", &self.unit)
            .field("chance_line", &self.chance_line)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<usize> {
        vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 2]
    }

    fn informative() -> Vec<f64> {
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 11.0, 12.0, 13.0, 14.0, 15.0]
    }

    fn noise() -> Vec<f64> {
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 1.0, 2.0, 3.0, 4.0, 5.0]
    }

    fn in_sample(statistic: &Statistic, x: &[f64]) -> f64 {
        let y = labels();
        statistic.score(x, &y, x, &y).unwrap()
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("linear".parse::<StatisticName>().unwrap(), StatisticName::linear);
        assert_eq!(" TTEST ".parse::<StatisticName>().unwrap(), StatisticName::ttest);
        assert_eq!(
            "svm".parse::<StatisticName>(),
            Err(Error::UnsupportedStatistic("svm".to_string()))
        );
        assert_eq!(StatisticName::known_names().len(), 13);
    }

    #[test]
    fn test_build_validation() {
        assert!(matches!(
            Statistic::build("forest", 2, &[5, 5]),
            Err(Error::UnsupportedStatistic(_))
        ));
        assert!(matches!(
            Statistic::build("ttest", 3, &[5, 5, 5]),
            Err(Error::InvalidClassCount { found: 3, .. })
        ));
        assert!(matches!(
            Statistic::build("threshold_balanced", 3, &[5, 5, 5]),
            Err(Error::InvalidClassCount { .. })
        ));
        assert!(matches!(
            Statistic::build("linear", 1, &[5]),
            Err(Error::InvalidClassCount { found: 1, .. })
        ));
        assert_eq!(
            Statistic::build("linear", 3, &[5, 0, 5]).unwrap_err(),
            Error::EmptyGroup { class: 2 }
        );
        assert!(Statistic::build("linear", 3, &[5, 5, 5]).is_ok());
    }

    #[test]
    fn test_metadata() {
        let linear = Statistic::build("linear", 2, &[5, 5]).unwrap();
        assert_eq!(linear.chance_line(), 50.0);
        assert_eq!(linear.unit(), "%");
        assert!(!linear.is_balanced());
        assert_eq!(linear.display_name(), "Linear discriminant accuracy");

        let three = Statistic::build("nearest_centroid", 3, &[4, 4, 4]).unwrap();
        assert!((three.chance_line() - 100.0 / 3.0).abs() < 1e-12);

        let ttest = Statistic::build("ttest", 2, &[5, 5]).unwrap();
        assert_eq!(ttest.chance_line(), 0.0);
        assert_eq!(ttest.unit(), "t");

        let ranksum = Statistic::build("ustat_p_approx", 2, &[5, 5]).unwrap();
        assert!(ranksum.chance_line().is_nan());
        assert_eq!(ranksum.unit(), "-log10(p)");
    }

    #[test]
    fn test_unequal_groups_switch_to_balanced() {
        let statistic = Statistic::build("linear", 2, &[6, 4]).unwrap();
        assert!(statistic.is_balanced());
        assert_eq!(statistic.name(), StatisticName::linear);
        assert!(statistic.display_name().contains("balanced"));
    }

    #[test]
    fn test_accuracy_scores() {
        let statistic = Statistic::build("linear", 2, &[5, 5]).unwrap();
        assert_eq!(in_sample(&statistic, &informative()), 100.0);
        assert_eq!(in_sample(&statistic, &noise()), 50.0);
        let mirrored: Vec<f64> = informative().iter().map(|v| -v).collect();
        assert_eq!(in_sample(&statistic, &mirrored), 100.0);
    }

    #[test]
    fn test_welch_t() {
        let statistic = Statistic::build("ttest", 2, &[5, 5]).unwrap();
        assert!((in_sample(&statistic, &informative()) - 10.0).abs() < 1e-12);
        assert_eq!(in_sample(&statistic, &noise()), 0.0);

        let y = vec![1, 2, 2];
        assert_eq!(
            statistic.score(&[1.0, 2.0, 3.0], &y, &[1.0, 2.0, 3.0], &y),
            Err(FeatureError::DegenerateClass { class: 0, needed: 2, found: 1 })
        );
    }

    #[test]
    fn test_ranksum_exact_small_case() {
        let statistic = Statistic::build("ustat_p_exact", 2, &[3, 3]).unwrap();
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let y = vec![1, 1, 1, 2, 2, 2];
        // 1 of the 20 assignments reaches the minimum, two-sided p = 0.1
        let score = statistic.score(&x, &y, &x, &y).unwrap();
        assert!((score - 1.0).abs() < 1e-12);

        // Identical groups: p = 1
        let tied = vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0];
        assert!(statistic.score(&tied, &y, &tied, &y).unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_ranksum_approx() {
        let statistic = Statistic::build("ustat_p_approx", 2, &[3, 3]).unwrap();
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let y = vec![1, 1, 1, 2, 2, 2];
        // z = 4 / sqrt(5.25), p close to 0.081
        let score = statistic.score(&x, &y, &x, &y).unwrap();
        assert!(score > 1.05 && score < 1.15, "score {}", score);

        let constant = vec![2.0; 6];
        assert_eq!(statistic.score(&constant, &y, &constant, &y).unwrap(), 0.0);
    }

    #[test]
    fn test_exact_falls_back_above_limit() {
        let n = EXACT_RANKSUM_MAX_SAMPLES;
        let statistic = Statistic::build("ustat_p_exact", 2, &[n, n]).unwrap();
        assert!(statistic.display_name().contains("approximation"));
        assert_eq!(statistic.name(), StatisticName::ustat_p_exact);
    }

    #[test]
    fn test_exact_and_approx_agree_roughly() {
        let exact = Statistic::build("ustat_p_exact", 2, &[10, 10]).unwrap();
        let approx = Statistic::build("ustat_p_approx", 2, &[10, 10]).unwrap();
        let x: Vec<f64> = (0..20).map(|i| ((i * 7) % 20) as f64 + if i < 10 { 0.0 } else { 3.5 }).collect();
        let y: Vec<usize> = (0..20).map(|i| if i < 10 { 1 } else { 2 }).collect();
        let a = exact.score(&x, &y, &x, &y).unwrap();
        let b = approx.score(&x, &y, &x, &y).unwrap();
        assert!((a - b).abs() < 0.3, "exact {} approx {}", a, b);
    }
}

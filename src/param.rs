use crate::clustering::DissimilarityMetric;
use crate::statistic::StatisticName;
use log::warn;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs::File;
use std::io::BufReader;

// Field definitions and associated default values

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Param {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub ranking: Ranking,
    #[serde(default)]
    pub null: Null,
    #[serde(default)]
    pub significance: Significance,
    #[serde(default)]
    pub clustering: Clustering,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct General {
    #[serde(default = "seed_default")]
    pub seed: u64,
    #[serde(default = "one_default")]
    pub thread_number: usize,
    #[serde(default = "log_base_default")]
    pub log_base: String,
    #[serde(default = "log_suffix_default")]
    pub log_suffix: String,
    #[serde(default = "log_level_default")]
    pub log_level: String,
    #[serde(default = "true_default")]
    pub display_colorful: bool,
    #[serde(default = "save_experiment_default")]
    pub save_exp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Data {
    #[serde(default = "empty_string")]
    pub X: String,
    #[serde(default = "empty_string")]
    pub y: String,
    #[serde(default = "true_default")]
    pub features_in_rows: bool,
    #[serde(default = "class_names_default")]
    pub classes: Vec<String>,
    #[serde(default = "empty_string")]
    pub feature_annotations: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Ranking {
    /// Name of the statistic, checked against the known families
    #[serde(default = "statistic_default")]
    pub statistic: String,
    #[serde(default = "n_top_features_default")]
    pub n_top_features: usize,
    /// Features timed serially before the parallel pass to project the run cost
    #[serde(default = "calibration_window_default")]
    pub calibration_window: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Null {
    /// Label permutation rounds (0 disables the null model)
    #[serde(default = "uzero_default")]
    pub n_rounds: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Significance {
    /// q-value below which a feature is reported significant
    #[serde(default = "significance_threshold_default")]
    pub threshold: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Clustering {
    #[serde(default = "clustering_threshold_default")]
    pub threshold: f64,
    #[serde(default = "metric_default")]
    pub metric: DissimilarityMetric,
    /// Stored distances to use instead of computing them
    #[serde(default = "empty_string")]
    pub distances: String,
    /// Where to store the distances between all features, for later runs
    #[serde(default = "empty_string")]
    pub save_distances: String,
}

// Default section definitions

impl Default for General {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Data {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Ranking {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Null {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Significance {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Clustering {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Param {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Param {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn get(param_file: String) -> Result<Param, Box<dyn Error>> {
    let param_file_reader = File::open(param_file)?;
    let param_reader = BufReader::new(param_file_reader);

    let mut config: Param = serde_yaml::from_reader(param_reader)?;

    validate(&mut config)?;

    Ok(config)
}

pub fn validate(param: &mut Param) -> Result<(), String> {
    if !param.general.log_base.is_empty() {
        param.general.display_colorful = false;
    }

    param
        .ranking
        .statistic
        .parse::<StatisticName>()
        .map_err(|e| e.to_string())?;

    if param.general.thread_number == 0 {
        return Err("Invalid thread_number=0. At least one thread is needed.".to_string());
    }

    if param.ranking.n_top_features == 0 {
        return Err("Invalid n_top_features=0. At least one feature must be kept for clustering.".to_string());
    }

    if param.significance.threshold <= 0.0 || param.significance.threshold >= 1.0 {
        return Err(format!(
            "Invalid significance threshold={:.3}. Must be in range (0, 1).",
            param.significance.threshold
        ));
    }

    if !param.clustering.threshold.is_finite() || param.clustering.threshold < 0.0 {
        return Err(format!(
            "Invalid clustering threshold={}. Must be a non-negative number.",
            param.clustering.threshold
        ));
    }

    if param.data.X.is_empty() != param.data.y.is_empty() {
        return Err("Both X and y must be provided together.".to_string());
    }

    const MIN_ROUNDS: usize = 10;
    if param.null.n_rounds > 0 && param.null.n_rounds < MIN_ROUNDS {
        warn!(
            "Only {} permutation rounds: the smallest reachable p-value is limited by the pool size. \
            Consider n_rounds >= {}.",
            param.null.n_rounds, MIN_ROUNDS
        );
    }

    Ok(())
}

// Default value definitions

fn seed_default() -> u64 {
    4815162342
}
fn empty_string() -> String {
    "".to_string()
}
fn save_experiment_default() -> String {
    "".to_string()
}
fn log_base_default() -> String {
    "".to_string()
}
fn log_suffix_default() -> String {
    "log".to_string()
}
fn log_level_default() -> String {
    "info".to_string()
}
fn true_default() -> bool {
    true
}
fn class_names_default() -> Vec<String> {
    Vec::new()
}
fn statistic_default() -> String {
    "linear".to_string()
}
fn n_top_features_default() -> usize {
    40
}
fn calibration_window_default() -> usize {
    100
}
fn significance_threshold_default() -> f64 {
    0.05
}
fn clustering_threshold_default() -> f64 {
    0.2
}
fn metric_default() -> DissimilarityMetric {
    DissimilarityMetric::abs_correlation
}
fn uzero_default() -> usize {
    0
}
fn one_default() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let param = Param::new();
        assert_eq!(param.ranking.statistic, "linear");
        assert_eq!(param.ranking.n_top_features, 40);
        assert_eq!(param.ranking.calibration_window, 100);
        assert_eq!(param.null.n_rounds, 0);
        assert_eq!(param.significance.threshold, 0.05);
        assert_eq!(param.clustering.threshold, 0.2);
        assert_eq!(param.clustering.metric, DissimilarityMetric::abs_correlation);
        assert_eq!(param.general.thread_number, 1);
        assert!(param.data.features_in_rows);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = "
ranking:
  statistic: ustat_p_exact
  n_top_features: 10
null:
  n_rounds: 50
clustering:
  metric: euclidean
";
        let mut param: Param = serde_yaml::from_str(yaml).unwrap();
        assert!(validate(&mut param).is_ok());
        assert_eq!(param.ranking.statistic, "ustat_p_exact");
        assert_eq!(param.ranking.n_top_features, 10);
        assert_eq!(param.ranking.calibration_window, 100);
        assert_eq!(param.null.n_rounds, 50);
        assert_eq!(param.clustering.metric, DissimilarityMetric::euclidean);
        assert_eq!(param.general.seed, 4815162342);
    }

    #[test]
    fn test_validation_errors() {
        let mut param = Param::new();
        param.ranking.statistic = "svm".to_string();
        assert!(validate(&mut param).unwrap_err().contains("'svm'"));

        let mut param = Param::new();
        param.significance.threshold = 1.5;
        assert!(validate(&mut param).is_err());

        let mut param = Param::new();
        param.clustering.threshold = -0.1;
        assert!(validate(&mut param).is_err());

        let mut param = Param::new();
        param.data.X = "X.tsv".to_string();
        assert!(validate(&mut param).is_err());

        let mut param = Param::new();
        param.general.log_base = "run".to_string();
        assert!(validate(&mut param).is_ok());
        assert!(!param.general.display_colorful);
    }
}

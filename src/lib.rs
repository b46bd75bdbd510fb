#![allow(non_snake_case)]

pub mod classifier;
pub mod clustering;
pub mod data;
pub mod error;
pub mod experiment;
pub mod null;
pub mod param;
pub mod ranking;
pub mod significance;
pub mod statistic;
pub mod utils;

use crate::clustering::{cluster_features, DistanceStore};
use crate::experiment::{Experiment, StatisticSummary};
use crate::null::estimate_null;
use crate::ranking::rank_all_calibrated;
use crate::significance::significance;
use crate::statistic::Statistic;
use chrono::Local;
use data::Data;
use log::{debug, warn};
use param::Param;
use rayon::ThreadPoolBuilder;

use std::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Load the dataset named in `param` and run the whole pipeline on it
pub fn run(param: &Param, running: Arc<AtomicBool>) -> Result<Experiment, Box<dyn Error>> {
    let mut data = Data::new();
    data.load_data(&param.data.X, &param.data.y, param.data.features_in_rows)?;
    data.set_classes(param.data.classes.clone());
    if !param.data.feature_annotations.is_empty() {
        data.load_feature_annotations(&param.data.feature_annotations)?;
    }
    cinfo!(param.general.display_colorful, "\x1b[2;97m{:?}\x1b[0m", data);

    run_on_data(&data, param, running)
}

/// Rank every feature, estimate the null model when rounds are requested,
/// then cluster the top features
pub fn run_on_data(data: &Data, param: &Param, running: Arc<AtomicBool>) -> Result<Experiment, Box<dyn Error>> {
    let start = std::time::Instant::now();
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    // Every validation happens before the first feature is scored
    let labels = data.group_labels()?;
    let class_sizes = labels.class_sizes();
    let statistic = Statistic::build(&param.ranking.statistic, labels.num_classes(), &class_sizes)?;
    let stored_distances = if param.clustering.distances.is_empty() {
        None
    } else {
        let store = DistanceStore::load(&param.clustering.distances)?;
        store.check(&data.fingerprint())?;
        Some(store)
    };

    let pool = ThreadPoolBuilder::new()
        .num_threads(param.general.thread_number)
        .build()?;

    cinfo!(
        param.general.display_colorful,
        "Ranking {} features with \x1b[1;96m{}\x1b[0m\n-----------------------------------------------------",
        data.feature_len,
        statistic.display_name()
    );
    let (ranking, cost) = pool.install(|| {
        rank_all_calibrated(
            &data.X,
            &labels,
            &statistic,
            param.ranking.calibration_window,
            param.null.n_rounds,
        )
    })?;

    let (null_pool, significance) = if param.null.n_rounds > 0 {
        cinfo!(
            param.general.display_colorful,
            "Estimating the null distribution over {} label permutations...",
            param.null.n_rounds
        );
        let null_pool = pool.install(|| {
            estimate_null(
                &data.X,
                &labels,
                &statistic,
                param.null.n_rounds,
                param.general.seed,
                &running,
            )
        })?;
        let significance = if null_pool.is_empty() {
            warn!("No permutation round completed: p-values are not computed");
            None
        } else {
            let result = significance(&ranking, &null_pool)?;
            cinfo!(
                param.general.display_colorful,
                "{} features significant at q < {}",
                result.n_significant(param.significance.threshold),
                param.significance.threshold
            );
            Some(result)
        };
        (Some(null_pool), significance)
    } else {
        debug!("No null rounds requested");
        (None, None)
    };

    let fingerprint = data.fingerprint();
    if !param.clustering.save_distances.is_empty() {
        let store = pool.install(|| DistanceStore::compute(&data.X, &fingerprint, param.clustering.metric));
        store.save(&param.clustering.save_distances)?;
        cinfo!(
            param.general.display_colorful,
            "Distances between all features saved to {}",
            param.clustering.save_distances
        );
    }

    let top_features = ranking.top(param.ranking.n_top_features);
    let clusters = pool.install(|| {
        cluster_features(
            &data.X,
            &top_features,
            param.clustering.metric,
            stored_distances.as_ref(),
            &fingerprint,
            param.clustering.threshold,
        )
    })?;
    cinfo!(
        param.general.display_colorful,
        "Top {} features form {} clusters at threshold {}",
        top_features.len(),
        clusters.n_clusters(),
        param.clustering.threshold
    );

    let featrank_version = format!(
        "{}#{}",
        env!("CARGO_PKG_VERSION"),
        option_env!("FEATRANK_GIT_SHA").unwrap_or("unknown")
    );
    let output_name = param
        .general
        .save_exp
        .split('.')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("featrank");
    let class_names = (1..=labels.num_classes()).map(|k| data.class_name(k)).collect();

    Ok(Experiment {
        id: format!("{}_{}_{}", output_name, statistic.name(), timestamp),
        timestamp,
        featrank_version,
        parameters: param.clone(),
        statistic: StatisticSummary::from(&statistic),
        feature_names: data.feature_names.clone(),
        class_names,
        class_sizes,
        data_fingerprint: fingerprint,
        ranking,
        cost,
        null_pool,
        significance,
        top_features,
        clusters,
        execution_time: start.elapsed().as_secs_f64(),
    })
}

//! Redundancy clustering of the top-ranked features.
//!
//! Average-linkage agglomerative clustering on a feature dissimilarity
//! matrix, cut flat at a height threshold. Dissimilarities come either from a
//! precomputed [`DistanceStore`] or are computed on demand from the columns.

use crate::data::FeatureMatrix;
use crate::error::{Error, Result};
use crate::utils::pairwise_complete_correlation;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum DissimilarityMetric {
    /// 1 - |r|: correlated and anti-correlated features are redundant
    abs_correlation,
    /// 1 - r
    correlation,
    euclidean,
}

/// Dissimilarity between two feature columns over their complete pairs.
/// Undefined values are returned as +inf so that they never merge.
pub fn dissimilarity(a: &[f64], b: &[f64], metric: DissimilarityMetric) -> f64 {
    let d = match metric {
        DissimilarityMetric::abs_correlation => 1.0 - pairwise_complete_correlation(a, b).abs(),
        DissimilarityMetric::correlation => 1.0 - pairwise_complete_correlation(a, b),
        DissimilarityMetric::euclidean => {
            let mut complete = 0;
            let mut sum_sq = 0.0;
            for (x, y) in a.iter().zip(b) {
                if !x.is_nan() && !y.is_nan() {
                    complete += 1;
                    sum_sq += (x - y).powi(2);
                }
            }
            if complete == 0 {
                f64::NAN
            } else {
                sum_sq.sqrt()
            }
        }
    };
    if d.is_nan() {
        f64::INFINITY
    } else {
        d.max(0.0)
    }
}

/// Full symmetric dissimilarity matrix between the given feature columns
pub fn dissimilarity_matrix(matrix: &FeatureMatrix, features: &[usize], metric: DissimilarityMetric) -> Vec<Vec<f64>> {
    features
        .par_iter()
        .map(|&a| {
            features
                .iter()
                .map(|&b| {
                    if a == b {
                        0.0
                    } else {
                        dissimilarity(matrix.column(a), matrix.column(b), metric)
                    }
                })
                .collect()
        })
        .collect()
}

/// Condensed index of pair (i, j), i < j, in an upper triangle of size n
#[inline]
fn condensed_index(n: usize, i: usize, j: usize) -> usize {
    debug_assert!(i < j && j < n);
    i * n - i * (i + 1) / 2 + j - i - 1
}

/// Precomputed pairwise dissimilarities for every feature of a dataset.
///
/// The store remembers the fingerprint of the feature set it was computed
/// on; using it against another feature set is refused.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DistanceStore {
    pub fingerprint: String,
    pub metric: DissimilarityMetric,
    pub n_features: usize,
    #[serde(with = "crate::utils::serde_float_vec")]
    condensed: Vec<f64>,
}

impl DistanceStore {
    pub fn compute(matrix: &FeatureMatrix, fingerprint: &str, metric: DissimilarityMetric) -> DistanceStore {
        let n = matrix.n_features();
        let rows: Vec<Vec<f64>> = (0..n)
            .into_par_iter()
            .map(|i| {
                ((i + 1)..n)
                    .map(|j| dissimilarity(matrix.column(i), matrix.column(j), metric))
                    .collect()
            })
            .collect();
        info!("Computed {} pairwise feature dissimilarities ({:?})", n * n.saturating_sub(1) / 2, metric);
        DistanceStore {
            fingerprint: fingerprint.to_string(),
            metric,
            n_features: n,
            condensed: rows.into_iter().flatten().collect(),
        }
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        match i.cmp(&j) {
            std::cmp::Ordering::Equal => 0.0,
            std::cmp::Ordering::Less => self.condensed[condensed_index(self.n_features, i, j)],
            std::cmp::Ordering::Greater => self.condensed[condensed_index(self.n_features, j, i)],
        }
    }

    /// Refuse a store computed for another feature set
    pub fn check(&self, fingerprint: &str) -> Result<()> {
        if self.fingerprint != fingerprint {
            return Err(Error::StaleDistances {
                expected: fingerprint.to_string(),
                found: self.fingerprint.clone(),
            });
        }
        Ok(())
    }

    /// Square dissimilarity matrix restricted to `features`
    pub fn restrict(&self, features: &[usize]) -> Result<Vec<Vec<f64>>> {
        if let Some(&bad) = features.iter().find(|&&j| j >= self.n_features) {
            return Err(Error::DimensionMismatch {
                what: "feature index in distance store".to_string(),
                expected: self.n_features,
                found: bad,
            });
        }
        Ok(features
            .iter()
            .map(|&a| features.iter().map(|&b| self.get(a, b)).collect())
            .collect())
    }

    /// Saves the store as JSON or bincode depending on the file extension
    pub fn save(&self, path: &str) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let writer = BufWriter::new(File::create(path)?);
        match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::to_writer(writer, self)?,
            _ => bincode::serialize_into(writer, self)?,
        }
        Ok(())
    }

    pub fn load(path: &str) -> std::result::Result<DistanceStore, Box<dyn std::error::Error>> {
        let reader = BufReader::new(File::open(path)?);
        let store: DistanceStore = match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_reader(reader)?,
            _ => bincode::deserialize_from(reader)?,
        };
        if store.condensed.len() != store.n_features * store.n_features.saturating_sub(1) / 2 {
            return Err(format!("Corrupted distance store {}: wrong number of pairs", path).into());
        }
        Ok(store)
    }
}

/// One merge of the dendrogram. Leaves are 0..n (positions in the clustered
/// feature list), the cluster formed at merge m has id n + m.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Merge {
    pub cluster_a: usize,
    pub cluster_b: usize,
    #[serde(with = "crate::utils::serde_float")]
    pub distance: f64,
    pub size: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClusterAssignment {
    /// Clustered feature indices, in the order given
    pub features: Vec<usize>,
    /// Disjoint non-empty groups of feature indices, ordered by first member position
    pub groups: Vec<Vec<usize>>,
    pub merges: Vec<Merge>,
    pub threshold: f64,
}

impl ClusterAssignment {
    pub fn n_clusters(&self) -> usize {
        self.groups.len()
    }

    /// Position of the group holding `feature`
    pub fn group_of(&self, feature: usize) -> Option<usize> {
        self.groups.iter().position(|g| g.contains(&feature))
    }
}

/// Average-linkage agglomeration (Lance-Williams update) over a square dissimilarity matrix.
/// NaN dissimilarities are read as infinite.
pub fn average_linkage(dist: &[Vec<f64>]) -> Vec<Merge> {
    let n = dist.len();
    if n < 2 {
        return Vec::new();
    }
    let mut condensed = vec![0.0_f64; n * (n - 1) / 2];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = dist[i][j];
            condensed[condensed_index(n, i, j)] = if d.is_nan() { f64::INFINITY } else { d };
        }
    }

    let mut active = vec![true; n];
    let mut sizes = vec![1_usize; n];
    let mut merges = Vec::with_capacity(n - 1);

    for _step in 0..(n - 1) {
        let active_indices: Vec<usize> = (0..n).filter(|&i| active[i]).collect();

        // Closest pair; the first pair is taken when every distance is infinite
        let mut best: Option<(usize, usize, f64)> = None;
        for ai in 0..active_indices.len() {
            for aj in (ai + 1)..active_indices.len() {
                let ci = active_indices[ai];
                let cj = active_indices[aj];
                let d = condensed[condensed_index(n, ci, cj)];
                if best.map_or(true, |(_, _, best_d)| d < best_d) {
                    best = Some((ci, cj, d));
                }
            }
        }
        let Some((best_i, best_j, best_d)) = best else {
            break;
        };

        let si = sizes[best_i];
        let sj = sizes[best_j];
        merges.push(Merge {
            cluster_a: best_i,
            cluster_b: best_j,
            distance: best_d,
            size: si + sj,
        });

        for &ck in &active_indices {
            if ck == best_i || ck == best_j {
                continue;
            }
            let d_ik = condensed[condensed_index(n, best_i.min(ck), best_i.max(ck))];
            let d_jk = condensed[condensed_index(n, best_j.min(ck), best_j.max(ck))];
            let d_new = (si as f64 * d_ik + sj as f64 * d_jk) / (si + sj) as f64;
            condensed[condensed_index(n, best_i.min(ck), best_i.max(ck))] = d_new;
        }

        // best_i now stands for the merged cluster
        active[best_j] = false;
        sizes[best_i] = si + sj;
    }

    // Sequential ids: leaves 0..n, merged clusters n, n+1, ...
    let mut id_map: Vec<usize> = (0..n).collect();
    for (m, merge) in merges.iter_mut().enumerate() {
        let a = merge.cluster_a;
        let b = merge.cluster_b;
        merge.cluster_a = id_map[a];
        merge.cluster_b = id_map[b];
        id_map[a] = n + m;
    }
    merges
}

/// Flat labels keeping only the merges at height <= threshold.
/// Labels are numbered by first appearance.
pub fn cut_at_threshold(merges: &[Merge], n: usize, threshold: f64) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..(2 * n)).collect();

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    // Average-linkage heights never decrease, so the first merge above the threshold ends the cut
    for (m, merge) in merges.iter().enumerate() {
        if !(merge.distance <= threshold) {
            break;
        }
        let new_id = n + m;
        let ra = find(&mut parent, merge.cluster_a);
        let rb = find(&mut parent, merge.cluster_b);
        parent[ra] = new_id;
        parent[rb] = new_id;
    }

    let mut label_map = HashMap::new();
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let root = find(&mut parent, i);
        let next_label = label_map.len();
        labels.push(*label_map.entry(root).or_insert(next_label));
    }
    labels
}

/// Group `features` so that features closer than `threshold` (average linkage) share a group.
/// `dist[a][b]` is the dissimilarity between `features[a]` and `features[b]`.
pub fn cluster(features: &[usize], dist: &[Vec<f64>], threshold: f64) -> Result<ClusterAssignment> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(Error::InvalidParameter {
            name: "clustering.threshold".to_string(),
            message: format!("must be a non-negative finite number, got {}", threshold),
        });
    }
    if dist.len() != features.len() {
        return Err(Error::DimensionMismatch {
            what: "dissimilarity matrix rows".to_string(),
            expected: features.len(),
            found: dist.len(),
        });
    }
    if let Some(row) = dist.iter().find(|row| row.len() != features.len()) {
        return Err(Error::DimensionMismatch {
            what: "dissimilarity matrix columns".to_string(),
            expected: features.len(),
            found: row.len(),
        });
    }

    let n = features.len();
    if n < 2 {
        return Ok(ClusterAssignment {
            features: features.to_vec(),
            groups: if n == 1 { vec![features.to_vec()] } else { Vec::new() },
            merges: Vec::new(),
            threshold,
        });
    }

    let merges = average_linkage(dist);
    let labels = cut_at_threshold(&merges, n, threshold);
    let n_groups = labels.iter().max().map_or(0, |&m| m + 1);
    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); n_groups];
    for (position, &label) in labels.iter().enumerate() {
        groups[label].push(features[position]);
    }
    debug!("{} features grouped into {} clusters at threshold {}", n, n_groups, threshold);

    Ok(ClusterAssignment {
        features: features.to_vec(),
        groups,
        merges,
        threshold,
    })
}

/// Cluster `features`, taking dissimilarities from `store` when given (after
/// checking it against `fingerprint`) or computing them with `metric`
pub fn cluster_features(
    matrix: &FeatureMatrix,
    features: &[usize],
    metric: DissimilarityMetric,
    store: Option<&DistanceStore>,
    fingerprint: &str,
    threshold: f64,
) -> Result<ClusterAssignment> {
    let dist = match store {
        Some(store) => {
            store.check(fingerprint)?;
            if store.metric != metric {
                warn!(
                    "Stored distances use {:?} while clustering.metric is {:?}: the stored metric is used",
                    store.metric, metric
                );
            }
            store.restrict(features)?
        }
        None => dissimilarity_matrix(matrix, features, metric),
    };
    cluster(features, &dist, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redundant_matrix() -> FeatureMatrix {
        let base = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let scaled: Vec<f64> = base.iter().map(|v| 2.0 * v + 1.0).collect();
        let alternating = vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let mirrored: Vec<f64> = base.iter().map(|v| -v).collect();
        FeatureMatrix::from_columns(vec![base, scaled, alternating, mirrored]).unwrap()
    }

    #[test]
    fn test_dissimilarity_metrics() {
        let a = [1.0, 2.0, 3.0];
        let b = [3.0, 2.0, 1.0];
        assert!(dissimilarity(&a, &b, DissimilarityMetric::abs_correlation).abs() < 1e-12);
        assert!((dissimilarity(&a, &b, DissimilarityMetric::correlation) - 2.0).abs() < 1e-12);
        assert!((dissimilarity(&a, &b, DissimilarityMetric::euclidean) - 8.0f64.sqrt()).abs() < 1e-12);
        let constant = [1.0, 1.0, 1.0];
        assert_eq!(dissimilarity(&a, &constant, DissimilarityMetric::abs_correlation), f64::INFINITY);
    }

    #[test]
    fn test_cluster_redundant_features() {
        let matrix = redundant_matrix();
        let features = vec![0, 1, 2, 3];
        let dist = dissimilarity_matrix(&matrix, &features, DissimilarityMetric::abs_correlation);
        let assignment = cluster(&features, &dist, 0.2).unwrap();
        assert_eq!(assignment.groups, vec![vec![0, 1, 3], vec![2]]);
        assert_eq!(assignment.merges.len(), 3);
        assert_eq!(assignment.group_of(3), Some(0));

        let dist = dissimilarity_matrix(&matrix, &features, DissimilarityMetric::correlation);
        let assignment = cluster(&features, &dist, 0.2).unwrap();
        assert_eq!(assignment.groups, vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn test_partition_property() {
        let matrix = redundant_matrix();
        let features = vec![3, 0, 2, 1];
        let dist = dissimilarity_matrix(&matrix, &features, DissimilarityMetric::abs_correlation);
        for threshold in [0.0, 0.2, 0.5, 1.0, 10.0] {
            let assignment = cluster(&features, &dist, threshold).unwrap();
            let mut members: Vec<usize> = assignment.groups.iter().flatten().cloned().collect();
            assert!(assignment.groups.iter().all(|g| !g.is_empty()));
            members.sort();
            assert_eq!(members, vec![0, 1, 2, 3]);
        }
        // Groups follow the order of the given features
        let assignment = cluster(&features, &dist, 0.2).unwrap();
        assert_eq!(assignment.groups, vec![vec![3, 0, 1], vec![2]]);
    }

    #[test]
    fn test_trivial_sizes() {
        let single = cluster(&[7], &[vec![0.0]], 0.2).unwrap();
        assert_eq!(single.groups, vec![vec![7]]);
        assert!(single.merges.is_empty());
        let empty = cluster(&[], &[], 0.2).unwrap();
        assert!(empty.groups.is_empty());
    }

    #[test]
    fn test_infinite_distances_never_merge() {
        let inf = f64::INFINITY;
        let dist = vec![vec![0.0, inf, 0.1], vec![inf, 0.0, inf], vec![0.1, inf, 0.0]];
        let assignment = cluster(&[0, 1, 2], &dist, 1.0).unwrap();
        assert_eq!(assignment.groups, vec![vec![0, 2], vec![1]]);
        assert_eq!(assignment.merges.len(), 2);
    }

    #[test]
    fn test_nan_dissimilarity_does_not_block_other_merges() {
        let nan = f64::NAN;
        let dist = vec![
            vec![0.0, nan, 0.9, 0.9],
            vec![nan, 0.0, 0.9, 0.9],
            vec![0.9, 0.9, 0.0, 0.05],
            vec![0.9, 0.9, 0.05, 0.0],
        ];
        let assignment = cluster(&[10, 11, 12, 13], &dist, 0.2).unwrap();
        assert_eq!(assignment.groups, vec![vec![10], vec![11], vec![12, 13]]);
        assert_eq!(assignment.merges[0].distance, 0.05);
        assert!(assignment.merges.iter().all(|m| !m.distance.is_nan()));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(cluster(&[0, 1], &[vec![0.0, 1.0]], 0.2), Err(Error::DimensionMismatch { .. })));
        assert!(matches!(
            cluster(&[0, 1], &[vec![0.0, 1.0], vec![1.0, 0.0]], f64::NAN),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_distance_store() {
        let matrix = redundant_matrix();
        let store = DistanceStore::compute(&matrix, "abc", DissimilarityMetric::abs_correlation);
        let direct = dissimilarity_matrix(&matrix, &[2, 0, 3], DissimilarityMetric::abs_correlation);
        assert_eq!(store.restrict(&[2, 0, 3]).unwrap(), direct);
        assert!(store.check("abc").is_ok());
        assert!(matches!(store.check("other"), Err(Error::StaleDistances { .. })));
        assert!(store.restrict(&[4]).is_err());

        let from_store = cluster_features(&matrix, &[0, 1, 2, 3], DissimilarityMetric::abs_correlation, Some(&store), "abc", 0.2).unwrap();
        let on_demand = cluster_features(&matrix, &[0, 1, 2, 3], DissimilarityMetric::abs_correlation, None, "abc", 0.2).unwrap();
        assert_eq!(from_store, on_demand);
        assert!(cluster_features(&matrix, &[0, 1], DissimilarityMetric::abs_correlation, Some(&store), "xyz", 0.2).is_err());
    }

    #[test]
    fn test_distance_store_save_and_load() {
        let matrix = redundant_matrix();
        let store = DistanceStore::compute(&matrix, "abc", DissimilarityMetric::euclidean);
        for ext in ["json", "bin"] {
            let path = std::env::temp_dir().join(format!("featrank_distances_{}.{}", std::process::id(), ext));
            let path = path.to_str().unwrap().to_string();
            store.save(&path).unwrap();
            let loaded = DistanceStore::load(&path).unwrap();
            assert_eq!(loaded.fingerprint, store.fingerprint);
            assert_eq!(loaded.metric, store.metric);
            assert_eq!(loaded.n_features, store.n_features);
            assert_eq!(loaded.condensed.len(), store.condensed.len());
            for (a, b) in loaded.condensed.iter().zip(&store.condensed) {
                assert!((a - b).abs() < 1e-12);
            }
            std::fs::remove_file(&path).unwrap();
        }
    }
}

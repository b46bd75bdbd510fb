use crate::error::{Error, Result};
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};

/// Objects-by-features matrix, stored column-major so that a feature is a
/// contiguous slice. NaN marks a missing entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    #[serde(with = "crate::utils::serde_float_vec")]
    values: Vec<f64>,
    n_objects: usize,
    n_features: usize,
}

impl FeatureMatrix {
    /// Build from feature columns (one `Vec` per feature, each of length N)
    pub fn from_columns(columns: Vec<Vec<f64>>) -> Result<FeatureMatrix> {
        let n_features = columns.len();
        let n_objects = columns.first().map(|c| c.len()).unwrap_or(0);
        let mut values = Vec::with_capacity(n_objects * n_features);
        for (j, column) in columns.into_iter().enumerate() {
            if column.len() != n_objects {
                return Err(Error::DimensionMismatch {
                    what: format!("feature column #{}", j),
                    expected: n_objects,
                    found: column.len(),
                });
            }
            values.extend(column);
        }
        Ok(FeatureMatrix {
            values,
            n_objects,
            n_features,
        })
    }

    /// Build from object rows (one `Vec` per object, each of length M)
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<FeatureMatrix> {
        let n_objects = rows.len();
        let n_features = rows.first().map(|r| r.len()).unwrap_or(0);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_features {
                return Err(Error::DimensionMismatch {
                    what: format!("object row #{}", i),
                    expected: n_features,
                    found: row.len(),
                });
            }
        }
        let mut values = Vec::with_capacity(n_objects * n_features);
        for j in 0..n_features {
            values.extend(rows.iter().map(|row| row[j]));
        }
        Ok(FeatureMatrix {
            values,
            n_objects,
            n_features,
        })
    }

    pub fn n_objects(&self) -> usize {
        self.n_objects
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn column(&self, j: usize) -> &[f64] {
        let start = j * self.n_objects;
        &self.values[start..start + self.n_objects]
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[j * self.n_objects + i]
    }

    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_nan()).count()
    }
}

/// Group assignment of every object, labels in `1..=num_classes`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupLabels {
    labels: Vec<usize>,
    num_classes: usize,
}

impl GroupLabels {
    /// Validate labels against `num_classes`: every label must be in range
    /// and every class must have at least one member.
    pub fn new(labels: Vec<usize>, num_classes: usize) -> Result<GroupLabels> {
        for (object, &label) in labels.iter().enumerate() {
            if label == 0 || label > num_classes {
                return Err(Error::LabelOutOfRange {
                    object,
                    label,
                    num_classes,
                });
            }
        }
        let group_labels = GroupLabels { labels, num_classes };
        if let Some(empty) = group_labels.class_sizes().iter().position(|&n| n == 0) {
            return Err(Error::EmptyGroup { class: empty + 1 });
        }
        Ok(group_labels)
    }

    /// Number of classes taken as the largest label
    pub fn from_labels(labels: Vec<usize>) -> Result<GroupLabels> {
        let num_classes = labels.iter().copied().max().unwrap_or(0);
        GroupLabels::new(labels, num_classes)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn class_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_classes];
        for &label in &self.labels {
            sizes[label - 1] += 1;
        }
        sizes
    }

    pub fn is_balanced(&self) -> bool {
        let sizes = self.class_sizes();
        sizes.windows(2).all(|w| w[0] == w[1])
    }

    /// Full re-shuffle of the label vector (class sizes are preserved)
    pub fn permuted<R: Rng + ?Sized>(&self, rng: &mut R) -> GroupLabels {
        let mut labels = self.labels.clone();
        labels.shuffle(rng);
        GroupLabels {
            labels,
            num_classes: self.num_classes,
        }
    }
}

/// Optional per-feature annotation row (TSV with `id`, `name`, `keywords`)
#[derive(Debug, Deserialize)]
struct FeatureAnnotation {
    id: String,
    name: String,
    #[serde(default)]
    keywords: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Data {
    pub X: FeatureMatrix,
    pub y: Vec<usize>,                 // Group of each object, in 1..=K
    pub features: Vec<String>,         // Stable feature identifiers
    pub feature_names: Vec<String>,    // Display names (default to identifiers)
    pub keywords: Vec<Vec<String>>,    // Free-text tags per feature
    pub samples: Vec<String>,          // Object display identifiers
    pub classes: Vec<String>,
    pub feature_len: usize,
    pub sample_len: usize,
}

impl Data {
    /// Create a new `Data` instance with default values
    pub fn new() -> Data {
        Data {
            X: FeatureMatrix {
                values: Vec::new(),
                n_objects: 0,
                n_features: 0,
            },
            y: Vec::new(),
            features: Vec::new(),
            feature_names: Vec::new(),
            keywords: Vec::new(),
            samples: Vec::new(),
            classes: Vec::new(),
            feature_len: 0,
            sample_len: 0,
        }
    }

    /// Build a dataset from in-memory parts, naming features and objects by position
    pub fn from_parts(X: FeatureMatrix, y: Vec<usize>) -> Result<Data> {
        if X.n_objects() != y.len() {
            return Err(Error::DimensionMismatch {
                what: "group labels".to_string(),
                expected: X.n_objects(),
                found: y.len(),
            });
        }
        let features: Vec<String> = (0..X.n_features()).map(|j| format!("feature_{}", j)).collect();
        let samples: Vec<String> = (0..X.n_objects()).map(|i| format!("object_{}", i)).collect();
        Ok(Data {
            feature_len: X.n_features(),
            sample_len: X.n_objects(),
            feature_names: features.clone(),
            keywords: vec![Vec::new(); X.n_features()],
            features,
            samples,
            classes: Vec::new(),
            X,
            y,
        })
    }

    /// Load data from a matrix TSV and a group TSV (`object<TAB>group`, with header).
    ///
    /// With `features_in_rows`, the matrix header holds object names and each
    /// line starts with a feature identifier; otherwise the header holds
    /// feature identifiers and each line starts with an object name.
    /// Empty, `NA` or unparsable cells are read as missing.
    pub fn load_data(&mut self, X_path: &str, y_path: &str, features_in_rows: bool) -> std::result::Result<(), Box<dyn StdError>> {
        info!("Loading files {} and {}...", X_path, y_path);
        let reader_X = BufReader::new(File::open(X_path)?);
        let mut lines = reader_X.lines();

        let header = match lines.next() {
            Some(line) => line?,
            None => return Err(format!("{} is empty", X_path).into()),
        };
        let header_names: Vec<String> = trim_eol(&header).split('\t').skip(1).map(String::from).collect();

        let mut row_names: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<f64>> = Vec::new();
        for line in lines {
            let line = line?;
            let trimmed = trim_eol(&line);
            if trimmed.is_empty() {
                continue;
            }
            let mut fields = trimmed.split('\t');
            if let Some(name) = fields.next() {
                row_names.push(name.to_string());
            }
            let mut values: Vec<f64> = fields.map(parse_cell).collect();
            values.resize(header_names.len(), f64::NAN);
            rows.push(values);
        }

        let (features, samples, X) = if features_in_rows {
            (row_names, header_names, FeatureMatrix::from_columns(rows)?)
        } else {
            (header_names, row_names, FeatureMatrix::from_rows(&rows)?)
        };

        let reader_y = BufReader::new(File::open(y_path)?);
        let mut y_map: HashMap<String, usize> = HashMap::new();
        for line in reader_y.lines().skip(1) {
            let line = line?;
            let mut fields = trim_eol(&line).split('\t');
            if let (Some(sample_name), Some(value)) = (fields.next(), fields.next()) {
                let group: usize = value.trim().parse()?;
                y_map.insert(sample_name.to_string(), group);
            }
        }

        // Reorder groups to match the object order of the matrix
        let mut y = Vec::with_capacity(samples.len());
        for sample_name in &samples {
            match y_map.get(sample_name) {
                Some(&group) => y.push(group),
                None => return Err(format!("No group available for object {}", sample_name).into()),
            }
        }

        self.feature_len = features.len();
        self.sample_len = samples.len();
        self.feature_names = features.clone();
        self.keywords = vec![Vec::new(); features.len()];
        self.features = features;
        self.samples = samples;
        self.X = X;
        self.y = y;

        let missing = self.X.missing_count();
        if missing > 0 {
            warn!("{} missing values: the affected objects are excluded feature by feature", missing);
        }

        Ok(())
    }

    /// Read feature display names and keywords from a TSV with columns `id`, `name`, `keywords`
    pub fn load_feature_annotations(&mut self, path: &str) -> std::result::Result<(), Box<dyn StdError>> {
        let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
        let index: HashMap<&str, usize> = self.features.iter().enumerate().map(|(j, f)| (f.as_str(), j)).collect();

        let mut unknown = 0;
        let mut updates: Vec<(usize, FeatureAnnotation)> = Vec::new();
        for record in reader.deserialize() {
            let annotation: FeatureAnnotation = record?;
            match index.get(annotation.id.as_str()) {
                Some(&j) => updates.push((j, annotation)),
                None => unknown += 1,
            }
        }
        if unknown > 0 {
            warn!("{} annotations refer to features absent from the matrix", unknown);
        }

        for (j, annotation) in updates {
            self.feature_names[j] = annotation.name;
            self.keywords[j] = annotation
                .keywords
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
        Ok(())
    }

    pub fn set_classes(&mut self, classes: Vec<String>) {
        self.classes = classes;
    }

    /// Validated grouping of the objects; the number of classes is taken from
    /// the class names when set, from the largest label otherwise.
    pub fn group_labels(&self) -> Result<GroupLabels> {
        if self.classes.is_empty() {
            GroupLabels::from_labels(self.y.clone())
        } else {
            GroupLabels::new(self.y.clone(), self.classes.len())
        }
    }

    /// Display name of a class (1-based label)
    pub fn class_name(&self, label: usize) -> String {
        self.classes
            .get(label.wrapping_sub(1))
            .cloned()
            .unwrap_or_else(|| format!("group {}", label))
    }

    /// SHA-256 of the feature identifiers and object names, used to detect
    /// stale precomputed artifacts
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for feature in &self.features {
            hasher.update(feature.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"\x00");
        for sample in &self.samples {
            hasher.update(sample.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

fn trim_eol(line: &str) -> &str {
    line.strip_suffix("\r\n")
        .or_else(|| line.strip_suffix('\n'))
        .or_else(|| line.strip_suffix('\r'))
        .unwrap_or(line)
}

/// Cut `text` to at most `max_chars` characters, ending with "..." when cut
fn truncate_display(text: String, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        text
    }
}

fn parse_cell(value: &str) -> f64 {
    value.trim().parse::<f64>().unwrap_or(f64::NAN)
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Features: {}   Objects: {}", self.feature_len, self.sample_len)?;

        let samples_string = self.samples.join("\t");
        let truncated_samples = truncate_display(samples_string, 100);

        writeln!(f, "X:                  {}", truncated_samples)?;
        // Limit to the first 20 features
        for j in (0..self.feature_len).take(20) {
            let row_display: String = self
                .X
                .column(j)
                .iter()
                .map(|v| if v.is_nan() { "NA".to_string() } else { format!("{:.2}", v) })
                .collect::<Vec<_>>()
                .join("\t");

            let truncated_row = truncate_display(row_display, 80);

            writeln!(f, "{:<20} {}", self.feature_names[j], truncated_row)?;
        }

        writeln!(f, "\ny:")?;
        for (i, group) in self.y.iter().take(20).enumerate() {
            writeln!(f, "{}\t{}", self.samples[i], group)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::io::Write;

    fn write_temp(name: &str, content: &str) -> String {
        let path = std::env::temp_dir().join(format!("featrank_{}_{}", std::process::id(), name));
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_from_rows_and_columns_agree() {
        let by_rows = FeatureMatrix::from_rows(&[vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 30.0]]).unwrap();
        let by_columns = FeatureMatrix::from_columns(vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]]).unwrap();
        assert_eq!(by_rows, by_columns);
        assert_eq!(by_rows.column(1), &[10.0, 20.0, 30.0]);
        assert_eq!(by_rows.get(2, 0), 3.0);
    }

    #[test]
    fn test_ragged_columns_rejected() {
        let result = FeatureMatrix::from_columns(vec![vec![1.0, 2.0], vec![1.0]]);
        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_group_labels_validation() {
        assert!(matches!(
            GroupLabels::new(vec![1, 2, 3], 2),
            Err(Error::LabelOutOfRange { object: 2, label: 3, .. })
        ));
        assert!(matches!(GroupLabels::new(vec![1, 1, 3], 3), Err(Error::EmptyGroup { class: 2 })));
        assert!(matches!(GroupLabels::new(vec![0, 1], 2), Err(Error::LabelOutOfRange { .. })));
        let labels = GroupLabels::from_labels(vec![1, 2, 2, 1, 2]).unwrap();
        assert_eq!(labels.num_classes(), 2);
        assert_eq!(labels.class_sizes(), vec![2, 3]);
        assert!(!labels.is_balanced());
    }

    #[test]
    fn test_permutation_preserves_class_sizes() {
        let labels = GroupLabels::from_labels(vec![1, 1, 1, 2, 2, 2, 3, 3]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let permuted = labels.permuted(&mut rng);
        assert_eq!(permuted.class_sizes(), labels.class_sizes());
        assert_eq!(permuted.len(), labels.len());

        let mut rng_again = ChaCha8Rng::seed_from_u64(42);
        assert_eq!(labels.permuted(&mut rng_again), permuted);
    }

    #[test]
    fn test_load_data_features_in_rows() {
        let x = write_temp("x_rows.tsv", "feature\ts1\ts2\ts3\nf1\t1.0\t2.0\t3.0\nf2\tNA\t5\t6\n");
        let y = write_temp("y_rows.tsv", "sample\tgroup\ns3\t2\ns1\t1\ns2\t1\n");
        let mut data = Data::new();
        data.load_data(&x, &y, true).unwrap();

        assert_eq!(data.feature_len, 2);
        assert_eq!(data.sample_len, 3);
        assert_eq!(data.features, vec!["f1", "f2"]);
        assert_eq!(data.y, vec![1, 1, 2]);
        assert!(data.X.get(0, 1).is_nan());
        assert_eq!(data.X.column(0), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_load_data_features_in_columns() {
        let x = write_temp("x_cols.tsv", "sample\tf1\tf2\ns1\t1\t4\ns2\t2\t5\n");
        let y = write_temp("y_cols.tsv", "sample\tgroup\ns1\t1\ns2\t2\n");
        let mut data = Data::new();
        data.load_data(&x, &y, false).unwrap();
        assert_eq!(data.features, vec!["f1", "f2"]);
        assert_eq!(data.X.column(1), &[4.0, 5.0]);
    }

    #[test]
    fn test_load_data_missing_group_is_an_error() {
        let x = write_temp("x_missing.tsv", "feature\ts1\ts2\nf1\t1\t2\n");
        let y = write_temp("y_missing.tsv", "sample\tgroup\ns1\t1\n");
        let mut data = Data::new();
        assert!(data.load_data(&x, &y, true).is_err());
    }

    #[test]
    fn test_feature_annotations() {
        let matrix = FeatureMatrix::from_columns(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let mut data = Data::from_parts(matrix, vec![1, 2]).unwrap();
        let annotations = write_temp(
            "annotations.tsv",
            "id\tname\tkeywords\nfeature_1\tSpectral entropy\tspectral, entropy\nunknown\tx\t\n",
        );
        data.load_feature_annotations(&annotations).unwrap();
        assert_eq!(data.feature_names, vec!["feature_0", "Spectral entropy"]);
        assert_eq!(data.keywords[1], vec!["spectral", "entropy"]);
        assert!(data.keywords[0].is_empty());
    }

    #[test]
    fn test_fingerprint_tracks_feature_set() {
        let matrix = FeatureMatrix::from_columns(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let data = Data::from_parts(matrix, vec![1, 2]).unwrap();
        let same_names = Data::from_parts(
            FeatureMatrix::from_columns(vec![vec![5.0, 6.0], vec![7.0, 8.0]]).unwrap(),
            vec![2, 1],
        )
        .unwrap();
        let fewer_objects = Data::from_parts(
            FeatureMatrix::from_columns(vec![vec![1.0], vec![3.0]]).unwrap(),
            vec![1],
        )
        .unwrap();
        assert_eq!(data.fingerprint(), same_names.fingerprint());
        assert_ne!(data.fingerprint(), fewer_objects.fingerprint());
        assert_eq!(data.fingerprint().len(), 64);
    }

    #[test]
    fn test_group_labels_from_class_names() {
        let matrix = FeatureMatrix::from_columns(vec![vec![1.0, 2.0]]).unwrap();
        let mut data = Data::from_parts(matrix, vec![1, 1]).unwrap();
        data.set_classes(vec!["healthy".to_string(), "sick".to_string()]);
        assert!(matches!(data.group_labels(), Err(Error::EmptyGroup { class: 2 })));
        assert_eq!(data.class_name(2), "sick");
        assert_eq!(data.class_name(5), "group 5");
    }

    #[test]
    fn test_display_truncates_non_ascii_names() {
        let matrix = FeatureMatrix::from_columns(vec![vec![1.5; 60], vec![2.25; 60]]).unwrap();
        let mut data = Data::from_parts(matrix, (0..60).map(|i| 1 + i % 2).collect()).unwrap();
        data.samples = vec!["é".to_string(); 60];
        data.feature_names = vec!["spectral entropy µ".to_string(), "β band".to_string()];
        let text = format!("{:?}", data);
        assert!(text.contains("Features: 2   Objects: 60"));
        assert!(text.contains("β band"));
        let samples_line = text.lines().find(|line| line.starts_with("X:")).unwrap();
        assert!(samples_line.ends_with("..."));
    }

    #[test]
    fn test_truncate_display_counts_characters() {
        assert_eq!(truncate_display("ééééé".to_string(), 5), "ééééé");
        assert_eq!(truncate_display("éééééé".to_string(), 5), "éé...");
    }
}

use std::error;
use std::fmt;

/// Fatal errors of a ranking pass. Validation errors are raised before any
/// scoring begins; only `AllFeaturesFailed` is raised after the batch ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The statistic name is not one of the supported families
    UnsupportedStatistic(String),
    /// The statistic cannot be formed with the observed number of classes
    InvalidClassCount {
        statistic: String,
        expected: String,
        found: usize,
    },
    /// A class has no member (classes are numbered from 1)
    EmptyGroup { class: usize },
    /// A label lies outside `1..=num_classes`
    LabelOutOfRange {
        object: usize,
        label: usize,
        num_classes: usize,
    },
    /// Every feature failed to score
    AllFeaturesFailed { n_features: usize },
    /// Significance was requested without any permutation round
    EmptyNullPool,
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },
    /// A stored distance structure does not match the current feature set
    StaleDistances { expected: String, found: String },
    InvalidParameter { name: String, message: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnsupportedStatistic(name) => write!(
                f,
                "Unsupported statistic '{}'. Known statistics: {}",
                name,
                crate::statistic::StatisticName::known_names().join(", ")
            ),
            Error::InvalidClassCount {
                statistic,
                expected,
                found,
            } => write!(
                f,
                "Statistic '{}' requires {} classes but the grouping has {}",
                statistic, expected, found
            ),
            Error::EmptyGroup { class } => {
                write!(f, "Group {} has no member: every class needs at least one object", class)
            }
            Error::LabelOutOfRange {
                object,
                label,
                num_classes,
            } => write!(
                f,
                "Object #{} has group label {} outside 1..={}",
                object, label, num_classes
            ),
            Error::AllFeaturesFailed { n_features } => write!(
                f,
                "All {} features failed to score for this grouping: the data may be entirely missing or degenerate",
                n_features
            ),
            Error::EmptyNullPool => write!(
                f,
                "No permutation round was computed: p-values and q-values need at least one null round"
            ),
            Error::DimensionMismatch {
                what,
                expected,
                found,
            } => write!(f, "Dimension mismatch for {}: expected {}, found {}", what, expected, found),
            Error::StaleDistances { expected, found } => write!(
                f,
                "Stored distances were computed for another feature set (fingerprint {} instead of {}): regenerate them",
                found, expected
            ),
            Error::InvalidParameter { name, message } => {
                write!(f, "Invalid parameter {}: {}", name, message)
            }
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure to score one feature. Recovered locally as a NaN score.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureError {
    NonFiniteInput,
    /// Not enough usable objects left in a class (zero-based class index)
    DegenerateClass { class: usize, needed: usize, found: usize },
    ZeroVariance,
    NotConverged { iterations: usize },
    Solver(String),
}

impl fmt::Display for FeatureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FeatureError::NonFiniteInput => write!(f, "non-finite value in input"),
            FeatureError::DegenerateClass { class, needed, found } => write!(
                f,
                "group {} has {} usable objects ({} needed)",
                class + 1,
                found,
                needed
            ),
            FeatureError::ZeroVariance => write!(f, "zero variance"),
            FeatureError::NotConverged { iterations } => {
                write!(f, "solver did not converge after {} iterations", iterations)
            }
            FeatureError::Solver(message) => write!(f, "solver error: {}", message),
        }
    }
}

impl error::Error for FeatureError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_distinct_per_kind() {
        let all_failed = Error::AllFeaturesFailed { n_features: 3 }.to_string();
        let empty_pool = Error::EmptyNullPool.to_string();
        let empty_group = Error::EmptyGroup { class: 2 }.to_string();
        assert!(all_failed.contains("All 3 features"));
        assert!(empty_pool.contains("permutation"));
        assert!(empty_group.contains("Group 2"));
        assert_ne!(all_failed, empty_pool);
    }

    #[test]
    fn test_unsupported_statistic_lists_known_names() {
        let message = Error::UnsupportedStatistic("svm".to_string()).to_string();
        assert!(message.contains("'svm'"));
        assert!(message.contains("ttest"));
    }

    #[test]
    fn test_degenerate_class_is_one_based() {
        let message = FeatureError::DegenerateClass { class: 0, needed: 2, found: 1 }.to_string();
        assert_eq!(message, "group 1 has 1 usable objects (2 needed)");
    }
}

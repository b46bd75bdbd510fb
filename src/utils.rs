use std::cmp::Ordering;

/// info! that keeps ANSI colors only when the display is colorful (log files get plain text)
#[macro_export]
macro_rules! cinfo {
    ($colorful:expr, $($arg:tt)*) => {
        if $colorful {
            log::info!($($arg)*);
        } else {
            log::info!("{}", $crate::utils::strip_ansi(&format!($($arg)*)));
        }
    };
}

/// Remove `ESC[...m` color sequences
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            for next in chars.by_ref() {
                if next == 'm' {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Mean and unbiased variance (NaN variance below two values)
pub fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, f64::NAN);
    }
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance)
}

/// Ranks with ties averaged, returned doubled so they stay integers (rank r is stored as 2r).
/// Also returns the tie correction term sum(t^3 - t) over tie groups.
pub fn doubled_ranks(values: &[f64]) -> (Vec<usize>, f64) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(Ordering::Equal));

    let mut ranks = vec![0usize; values.len()];
    let mut tie_correction = 0.0;
    let mut i = 0;
    while i < order.len() {
        let start = i;
        while i + 1 < order.len() && values[order[i]] == values[order[i + 1]] {
            i += 1;
        }
        // Average of 1-based ranks start+1..=i+1, doubled
        let rank = start + i + 2;
        for &j in &order[start..=i] {
            ranks[j] = rank;
        }
        let t = (i - start + 1) as f64;
        tie_correction += t * t * t - t;
        i += 1;
    }
    (ranks, tie_correction)
}

/// Pearson correlation over the positions where both vectors are non-NaN.
/// NaN when fewer than two complete pairs remain or one side is constant.
pub fn pairwise_complete_correlation(a: &[f64], b: &[f64]) -> f64 {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b)
        .filter(|(x, y)| !x.is_nan() && !y.is_nan())
        .map(|(&x, &y)| (x, y))
        .collect();
    if pairs.len() < 2 {
        return f64::NAN;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in &pairs {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return f64::NAN;
    }
    (cov / (var_a * var_b).sqrt()).clamp(-1.0, 1.0)
}

/// Serde adapter for f64 values that may be NaN or infinite. JSON has no
/// representation for them, so human readable formats store them as "NaN",
/// "inf" or "-inf"; binary formats keep the raw float.
pub mod serde_float {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Readable {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() && !value.is_finite() {
            serializer.serialize_str(&value.to_string())
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        if deserializer.is_human_readable() {
            match Readable::deserialize(deserializer)? {
                Readable::Number(v) => Ok(v),
                Readable::Text(t) => t.parse().map_err(serde::de::Error::custom),
            }
        } else {
            f64::deserialize(deserializer)
        }
    }
}

/// [`serde_float`] for vectors
pub mod serde_float_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Float(#[serde(with = "super::serde_float")] f64);

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|&v| Float(v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Ok(Vec::<Float>::deserialize(deserializer)?
            .into_iter()
            .map(|f| f.0)
            .collect())
    }
}

/// Human readable duration for cost projections
pub fn format_duration(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "unknown".to_string();
    }
    if seconds < 60.0 {
        format!("{:.2}s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.1}min", seconds / 60.0)
    } else {
        format!("{:.1}h", seconds / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;96mfeature\x1b[0m 12"), "feature 12");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_doubled_ranks_with_ties() {
        let (ranks, tie) = doubled_ranks(&[3.0, 1.0, 3.0, 2.0]);
        // ranks 4, 1, 4, 2 with the two 3.0 sharing 3.5
        assert_eq!(ranks, vec![7, 2, 7, 4]);
        assert_eq!(tie, 6.0);
    }

    #[test]
    fn test_mean_and_variance() {
        let (mean, var) = mean_and_variance(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(mean, 2.5);
        assert!((var - 5.0 / 3.0).abs() < 1e-12);
        assert!(mean_and_variance(&[1.0]).1.is_nan());
    }

    #[test]
    fn test_pairwise_complete_correlation() {
        let a = vec![1.0, 2.0, f64::NAN, 4.0];
        let b = vec![2.0, 4.0, 100.0, 8.0];
        assert!((pairwise_complete_correlation(&a, &b) - 1.0).abs() < 1e-12);
        let reversed: Vec<f64> = b.iter().map(|v| -v).collect();
        assert!((pairwise_complete_correlation(&a, &reversed) + 1.0).abs() < 1e-12);
        assert!(pairwise_complete_correlation(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_nan());
    }

    #[derive(serde::Serialize, serde::Deserialize, Debug)]
    struct Scores {
        #[serde(with = "serde_float_vec")]
        values: Vec<f64>,
        #[serde(with = "serde_float")]
        single: f64,
    }

    #[test]
    fn test_non_finite_floats_survive_json_and_bincode() {
        let scores = Scores {
            values: vec![1.5, f64::NAN, f64::INFINITY, f64::NEG_INFINITY],
            single: f64::NAN,
        };
        let json = serde_json::to_string(&scores).unwrap();
        assert!(json.contains("\"NaN\""));
        let back: Scores = serde_json::from_str(&json).unwrap();
        assert_eq!(back.values[0], 1.5);
        assert!(back.values[1].is_nan());
        assert_eq!(back.values[2], f64::INFINITY);
        assert_eq!(back.values[3], f64::NEG_INFINITY);
        assert!(back.single.is_nan());

        let bytes = bincode::serialize(&scores).unwrap();
        let back: Scores = bincode::deserialize(&bytes).unwrap();
        assert!(back.values[1].is_nan());
        assert_eq!(back.values[2], f64::INFINITY);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(1.5), "1.50s");
        assert_eq!(format_duration(120.0), "2.0min");
        assert_eq!(format_duration(7200.0), "2.0h");
    }
}

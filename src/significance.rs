use crate::error::{Error, Result};
use crate::null::NullPool;
use crate::ranking::RankResult;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SignificanceResult {
    /// Empirical p-value per feature against the pooled null (NaN for unscored features)
    #[serde(with = "crate::utils::serde_float_vec")]
    pub p_values: Vec<f64>,
    /// Benjamini-Hochberg adjusted p-values
    #[serde(with = "crate::utils::serde_float_vec")]
    pub q_values: Vec<f64>,
}

impl SignificanceResult {
    /// Features whose q-value falls below `threshold`
    pub fn significant(&self, threshold: f64) -> Vec<bool> {
        self.q_values.iter().map(|&q| q < threshold).collect()
    }

    pub fn n_significant(&self, threshold: f64) -> usize {
        self.significant(threshold).iter().filter(|&&s| s).count()
    }
}

/// Fraction of the finite pooled null scores at least as large as each real score
pub fn empirical_p_values(real_scores: &[f64], pool: &NullPool) -> Result<Vec<f64>> {
    if pool.is_empty() {
        return Err(Error::EmptyNullPool);
    }
    let mut null = pool.finite_scores();
    if null.is_empty() {
        return Err(Error::EmptyNullPool);
    }
    null.sort_by(|a, b| a.total_cmp(b));
    let n = null.len() as f64;

    Ok(real_scores
        .iter()
        .map(|&score| {
            if score.is_nan() {
                return f64::NAN;
            }
            let below = null.partition_point(|&v| v < score);
            (null.len() - below) as f64 / n
        })
        .collect())
}

/// Benjamini-Hochberg step-up adjustment. NaN p-values are left out of the
/// family and stay NaN.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let mut valid: Vec<usize> = (0..p_values.len()).filter(|&i| p_values[i].is_finite()).collect();
    let mut q_values = vec![f64::NAN; p_values.len()];
    if valid.is_empty() {
        return q_values;
    }
    valid.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let m = valid.len() as f64;
    let mut running_min = 1.0f64;
    for (rank, &i) in valid.iter().enumerate().rev() {
        let adjusted = p_values[i] * m / (rank + 1) as f64;
        running_min = running_min.min(adjusted);
        q_values[i] = running_min.clamp(0.0, 1.0);
    }
    q_values
}

/// p-values and q-values for a real ranking against its null pool
pub fn significance(real: &RankResult, pool: &NullPool) -> Result<SignificanceResult> {
    let p_values = empirical_p_values(&real.scores, pool)?;
    let q_values = benjamini_hochberg(&p_values);
    info!(
        "Significance computed from {} pooled null scores",
        pool.finite_scores().len()
    );
    Ok(SignificanceResult { p_values, q_values })
}

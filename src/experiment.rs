use crate::clustering::ClusterAssignment;
use crate::null::NullPool;
use crate::param::Param;
use crate::ranking::{CostEstimate, RankResult};
use crate::significance::SignificanceResult;
use crate::statistic::{Statistic, StatisticName};
use crate::utils::{format_duration, strip_ansi};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What was computed, kept with the results so that a saved experiment can be read alone
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatisticSummary {
    pub name: StatisticName,
    pub display_name: String,
    pub unit: String,
    #[serde(with = "crate::utils::serde_float")]
    pub chance_line: f64,
    /// Balanced accuracy was used (requested or forced by unequal group sizes)
    pub balanced: bool,
}

impl From<&Statistic> for StatisticSummary {
    fn from(statistic: &Statistic) -> Self {
        StatisticSummary {
            name: statistic.name(),
            display_name: statistic.display_name().to_string(),
            unit: statistic.unit().to_string(),
            chance_line: statistic.chance_line(),
            balanced: statistic.is_balanced(),
        }
    }
}

/// Complete experiment data and results
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Experiment {
    /// Experiment ID, i.e., output name, statistic and timestamp
    pub id: String,
    pub timestamp: String,
    /// featrank version and git hash used
    pub featrank_version: String,
    pub parameters: Param,

    pub statistic: StatisticSummary,
    pub feature_names: Vec<String>,
    pub class_names: Vec<String>,
    pub class_sizes: Vec<usize>,
    /// Fingerprint of the feature set, as required by stored distances
    pub data_fingerprint: String,

    pub ranking: RankResult,
    pub cost: CostEstimate,

    /// Permutation scores, when null rounds were requested
    pub null_pool: Option<NullPool>,
    pub significance: Option<SignificanceResult>,

    /// Best features by decreasing score, as clustered
    pub top_features: Vec<usize>,
    pub clusters: ClusterAssignment,

    /// Execution time in seconds
    pub execution_time: f64,
}

impl Experiment {
    /// Significance flags at the configured threshold, if a null model was run
    pub fn significant(&self) -> Option<Vec<bool>> {
        self.significance
            .as_ref()
            .map(|s| s.significant(self.parameters.significance.threshold))
    }

    fn feature_label(&self, j: usize) -> String {
        self.feature_names
            .get(j)
            .cloned()
            .unwrap_or_else(|| format!("feature_{}", j))
    }

    /// Report of the top features and their redundancy groups
    pub fn display_results(&self) -> String {
        let colorful = self.parameters.general.display_colorful;
        let mut text = String::new();
        text.push_str(&format!(
            "\n=============== Experiment {} ===============\n\n",
            self.id
        ));
        text.push_str(&format!("featrank version: v{}\n", self.featrank_version));
        text.push_str(&format!("Timestamp: {}\n", self.timestamp));
        text.push_str(&format!("Execution time: {:.2}s\n", self.execution_time));
        text.push_str(&format!(
            "Statistic: {} [{}], chance level {}\n",
            self.statistic.display_name,
            self.statistic.unit,
            if self.statistic.chance_line.is_nan() {
                "undefined".to_string()
            } else {
                format!("{:.2}", self.statistic.chance_line)
            }
        ));
        text.push_str(&format!(
            "Groups: {}\n",
            self.class_sizes
                .iter()
                .enumerate()
                .map(|(k, n)| format!("{} (n={})", self.class_names.get(k).cloned().unwrap_or_else(|| (k + 1).to_string()), n))
                .collect::<Vec<_>>()
                .join(", ")
        ));
        text.push_str(&format!(
            "{} features scored, {} failed ({} evaluations, projected {})\n",
            self.ranking.n_features() - self.ranking.n_failed(),
            self.ranking.n_failed(),
            self.cost.evaluations,
            format_duration(self.cost.projected_seconds)
        ));
        if let Some(pool) = &self.null_pool {
            text.push_str(&format!(
                "Null model: {} rounds, {} pooled scores, mean {:.3}\n",
                pool.rounds_completed,
                pool.finite_scores().len(),
                pool.mean()
            ));
        }

        text.push_str(&format!(
            "\n\x1b[1;93mTop {} features\x1b[0m\n",
            self.top_features.len()
        ));
        let flags = self.significant();
        for (rank, &j) in self.top_features.iter().enumerate() {
            let mut line = format!(
                "#{:<4} {:>8.3} {:<40}",
                rank + 1,
                self.ranking.scores[j],
                self.feature_label(j)
            );
            if let Some(sig) = &self.significance {
                let marker = match &flags {
                    Some(f) if f[j] => "\x1b[1;92m*\x1b[0m",
                    _ => " ",
                };
                line.push_str(&format!(" p={:.4} q={:.4} {}", sig.p_values[j], sig.q_values[j], marker));
            }
            if let Some(group) = self.clusters.group_of(j) {
                line.push_str(&format!(" [cluster {}]", group + 1));
            }
            text.push_str(&line);
            text.push('\n');
        }

        text.push_str(&format!(
            "\n\x1b[1;93m{} clusters at threshold {}\x1b[0m\n",
            self.clusters.n_clusters(),
            self.clusters.threshold
        ));
        for (g, group) in self.clusters.groups.iter().enumerate() {
            let members: Vec<String> = group.iter().map(|&j| self.feature_label(j)).collect();
            text.push_str(&format!("Cluster {}: {}\n", g + 1, members.join(", ")));
        }

        if colorful {
            text
        } else {
            strip_ansi(&text)
        }
    }

    /// Write the report next to `path`: JSON for `.json`, bincode for
    /// `.bin`/`.bincode`. Any other extension is replaced by `.bin`.
    pub fn save_auto<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let path = path.as_ref();
        match ReportFormat::from_path(path) {
            Some(ReportFormat::Json) => std::fs::write(path, serde_json::to_string_pretty(self)?)?,
            Some(ReportFormat::Bincode) => std::fs::write(path, bincode::serialize(self)?)?,
            None => {
                let bin_path = path.with_extension("bin");
                warn!(
                    "No report format for {}: writing bincode to {}",
                    path.display(),
                    bin_path.display()
                );
                std::fs::write(bin_path, bincode::serialize(self)?)?;
            }
        }
        Ok(())
    }

    /// Read a report written by [`Experiment::save_auto`]. Files without a
    /// known extension are tried as bincode, then JSON.
    pub fn load_auto<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        match ReportFormat::from_path(path) {
            Some(format) => format.read(path),
            None => ReportFormat::Bincode
                .read(path)
                .or_else(|_| ReportFormat::Json.read(path))
                .map_err(|_| {
                    Box::<dyn std::error::Error>::from(format!(
                        "{} is neither a bincode nor a JSON report",
                        path.display()
                    ))
                }),
        }
    }
}

#[derive(Clone, Copy)]
enum ReportFormat {
    Json,
    Bincode,
}

impl ReportFormat {
    fn from_path(path: &Path) -> Option<ReportFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(ReportFormat::Json),
            "bin" | "bincode" => Some(ReportFormat::Bincode),
            _ => None,
        }
    }

    fn read(self, path: &Path) -> Result<Experiment, Box<dyn std::error::Error>> {
        Ok(match self {
            ReportFormat::Json => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            ReportFormat::Bincode => bincode::deserialize(&std::fs::read(path)?)?,
        })
    }
}

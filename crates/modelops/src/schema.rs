use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MODEL_FILE: &str = "best_model.json";
pub const METADATA_FILE: &str = "model_metadata.json";
pub const SCHEMA_FILE: &str = "column_schema.json";
pub const MANIFEST_FILE: &str = "manifest.json";

pub const MODEL_TYPE: &str = "gradient_boosted_trees";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    pub rel_path: String,
    pub size: u64,
    pub blake3: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub subsample: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 3,
            min_samples_leaf: 1,
            subsample: 1.0,
        }
    }
}

impl Hyperparameters {
    /// Flat string map, the shape experiment trackers take.
    pub fn to_params(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("n_estimators".to_string(), self.n_estimators.to_string()),
            ("learning_rate".to_string(), self.learning_rate.to_string()),
            ("max_depth".to_string(), self.max_depth.to_string()),
            ("min_samples_leaf".to_string(), self.min_samples_leaf.to_string()),
            ("subsample".to_string(), self.subsample.to_string()),
        ])
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    #[default]
    F1,
    Recall,
}

impl TargetMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F1 => "f1",
            Self::Recall => "recall",
        }
    }
}

impl fmt::Display for TargetMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f1" | "f1_score" => Ok(Self::F1),
            "recall" => Ok(Self::Recall),
            other => Err(format!("unknown target metric `{other}` (expected f1 or recall)")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

impl ClassMetrics {
    pub fn score(&self, target: TargetMetric) -> f64 {
        match target {
            TargetMetric::F1 => self.f1_score,
            TargetMetric::Recall => self.recall,
        }
    }

    /// `prefix_accuracy`, `prefix_f1_score`, ... for tracker uploads.
    pub fn to_metrics(&self, prefix: &str) -> BTreeMap<String, f64> {
        BTreeMap::from([
            (format!("{prefix}_accuracy"), self.accuracy),
            (format!("{prefix}_precision"), self.precision),
            (format!("{prefix}_recall"), self.recall),
            (format!("{prefix}_f1_score"), self.f1_score),
        ])
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CvScore {
    pub mean: f64,
    pub std: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub cv: CvScore,
    pub validation: ClassMetrics,
    pub test: ClassMetrics,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_type: String,
    pub hyperparameters: Hyperparameters,
    pub metrics: ModelMetrics,
    pub target_metric: TargetMetric,
    pub schema_version: String,
    pub feature_columns: Vec<String>,
    pub label_column: String,
    /// Raw label values for encoded classes 0 and 1.
    pub label_values: [String; 2],
    /// Encoded class ("0"/"1") to display name.
    pub class_mapping: BTreeMap<String, String>,
    pub training_samples: usize,
    pub n_trials: usize,
    pub cv_folds: usize,
    pub seed: u64,
    pub trained_at: DateTime<Utc>,
}

impl ModelMetadata {
    pub fn class_name(&self, class: u8) -> &str {
        self.class_mapping
            .get(&class.to_string())
            .map(String::as_str)
            .unwrap_or_else(|| self.label_values[usize::from(class.min(1))].as_str())
    }
}

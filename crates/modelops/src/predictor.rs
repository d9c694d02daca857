use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{load_artifact, ModelArtifact, ModelOpsError};

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Load(#[from] ModelOpsError),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub features: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Raw label value as it appears in the training data.
    pub predicted_label: String,
    /// Display name from the class mapping.
    pub predicted_class: String,
    /// Probability of the predicted class.
    pub probability: f64,
    /// Display name to probability, for both classes.
    pub probabilities: BTreeMap<String, f64>,
    /// Features whose value falls outside the range seen during preparation.
    pub out_of_range: Vec<String>,
}

pub struct Predictor {
    artifact: ModelArtifact,
    features: Vec<String>,
}

impl Predictor {
    pub fn load(dir: &Path) -> Result<Self, PredictError> {
        let predictor = Self::from_artifact(load_artifact(dir)?)?;
        info!(
            dir = %dir.display(),
            schema_version = %predictor.schema_version(),
            features = predictor.features.len(),
            "predictor: loaded"
        );
        Ok(predictor)
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, PredictError> {
        if artifact.schema.version != artifact.metadata.schema_version {
            return Err(PredictError::SchemaMismatch(format!(
                "model was trained on schema {} but the bundled schema is {}",
                artifact.metadata.schema_version, artifact.schema.version
            )));
        }
        let features: Vec<String> =
            artifact.schema.feature_columns().into_iter().map(str::to_string).collect();
        if features != artifact.metadata.feature_columns {
            return Err(PredictError::SchemaMismatch(format!(
                "metadata features {:?} differ from schema features {features:?}",
                artifact.metadata.feature_columns
            )));
        }
        Ok(Self { artifact, features })
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn schema_version(&self) -> &str {
        &self.artifact.schema.version
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.features
    }

    pub fn predict(&self, req: &PredictRequest) -> Result<Prediction, PredictError> {
        if let Some(version) = &req.schema_version {
            if version != self.schema_version() {
                return Err(PredictError::SchemaMismatch(format!(
                    "request targets schema {version}, model serves {}",
                    self.schema_version()
                )));
            }
        }

        let missing: Vec<&str> = self
            .features
            .iter()
            .filter(|f| !req.features.contains_key(*f))
            .map(String::as_str)
            .collect();
        let unexpected: Vec<&str> = req
            .features
            .keys()
            .filter(|k| !self.features.contains(k))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(PredictError::SchemaMismatch(format!(
                "missing features {missing:?}, unexpected features {unexpected:?}"
            )));
        }

        let mut row = Vec::with_capacity(self.features.len());
        let mut out_of_range = Vec::new();
        for name in &self.features {
            let value = req.features[name];
            if !value.is_finite() {
                return Err(PredictError::InvalidInput(format!("{name} is not a finite number")));
            }
            let range = self.artifact.schema.column(name).and_then(|c| c.valid_range);
            if range.is_some_and(|r| !r.contains(value)) {
                out_of_range.push(name.clone());
            }
            row.push(value);
        }

        let meta = &self.artifact.metadata;
        let p1 = self.artifact.model.predict_proba(&row);
        let class = u8::from(p1 >= 0.5);
        let probabilities = BTreeMap::from([
            (meta.class_name(0).to_string(), 1.0 - p1),
            (meta.class_name(1).to_string(), p1),
        ]);
        let prediction = Prediction {
            predicted_label: meta.label_values[usize::from(class)].clone(),
            predicted_class: meta.class_name(class).to_string(),
            probability: if class == 1 { p1 } else { 1.0 - p1 },
            probabilities,
            out_of_range,
        };
        debug!(
            class = %prediction.predicted_class,
            p = prediction.probability,
            "predictor: scored"
        );
        Ok(prediction)
    }
}

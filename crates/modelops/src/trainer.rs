use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info};

use crate::gbm::validate_params;
use crate::metrics::evaluate;
use crate::search::cross_validate;
use crate::{
    ClassMetrics, Dataset, GradientBoostedTrees, ModelArtifact, ModelMetadata, ModelMetrics,
    ModelOpsError, Result, SearchSpace, Searcher, TargetMetric, TrainingData, Trial, MODEL_TYPE,
};

#[derive(Clone, Debug)]
pub struct TrainConfig {
    pub trials: usize,
    pub cv_folds: usize,
    pub target: TargetMetric,
    pub seed: u64,
    pub space: SearchSpace,
    /// Raw label value to display name, e.g. `"1" -> "Faulty"`.
    pub class_names: BTreeMap<String, String>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            trials: 20,
            cv_folds: 5,
            target: TargetMetric::F1,
            seed: 42,
            space: SearchSpace::default(),
            class_names: BTreeMap::from([
                ("0".to_string(), "Normal".to_string()),
                ("1".to_string(), "Faulty".to_string()),
            ]),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrainingOutcome {
    pub artifact: ModelArtifact,
    pub trials: Vec<Trial>,
    pub best_trial: usize,
}

fn score_split(model: &GradientBoostedTrees, data: &Dataset) -> ClassMetrics {
    let predicted: Vec<u8> = data.rows.iter().map(|r| model.predict(r)).collect();
    evaluate(&data.labels, &predicted)
}

/// Runs the search on the train split, refits the best configuration and
/// scores it on validation and test.
pub fn train(
    data: &TrainingData,
    cfg: &TrainConfig,
    searcher: &mut dyn Searcher,
) -> Result<TrainingOutcome> {
    if cfg.trials == 0 {
        return Err(ModelOpsError::Config("trials must be at least 1".into()));
    }
    cfg.space.validate()?;
    if data.train.is_empty() || data.val.is_empty() || data.test.is_empty() {
        return Err(ModelOpsError::Dataset(
            "train, val and test splits must all be non-empty".into(),
        ));
    }

    let label = &data.schema.label;
    let negative = label
        .classes
        .iter()
        .find(|c| **c != label.positive)
        .cloned()
        .unwrap_or_default();
    let label_values = [negative, label.positive.clone()];
    let class_mapping = label_values
        .iter()
        .enumerate()
        .map(|(class, raw)| {
            let name = cfg.class_names.get(raw).cloned().unwrap_or_else(|| raw.clone());
            (class.to_string(), name)
        })
        .collect::<BTreeMap<String, String>>();
    if class_mapping.get("0") == class_mapping.get("1") {
        return Err(ModelOpsError::Config(format!(
            "both classes are named `{}`",
            class_mapping.get("1").map(String::as_str).unwrap_or_default()
        )));
    }

    info!(
        searcher = searcher.name(),
        trials = cfg.trials,
        folds = cfg.cv_folds,
        target = %cfg.target,
        train_rows = data.train.len(),
        "train: search started"
    );

    let mut trials: Vec<Trial> = Vec::with_capacity(cfg.trials);
    let mut best: Option<usize> = None;
    for number in 0..cfg.trials {
        let params = searcher.suggest(&cfg.space, &trials);
        validate_params(&params)?;
        let (score, fold_scores) =
            cross_validate(&data.train, &params, cfg.cv_folds, cfg.target, cfg.seed)?;
        debug!(trial = number, mean = score.mean, std = score.std, ?params, "train: trial scored");

        // strict: ties keep the earlier trial
        if best.map_or(true, |b| score.mean > trials[b].score.mean) {
            best = Some(number);
        }
        trials.push(Trial { number, params, score, fold_scores });
    }
    let best_trial = best.unwrap_or(0);
    let best_params = trials[best_trial].params.clone();
    info!(trial = best_trial, score = trials[best_trial].score.mean, "train: best configuration");

    let model =
        GradientBoostedTrees::fit(&data.train.rows, &data.train.labels, &best_params, cfg.seed)?;
    let validation = score_split(&model, &data.val);
    let test = score_split(&model, &data.test);
    info!(
        val_f1 = validation.f1_score,
        test_f1 = test.f1_score,
        test_recall = test.recall,
        "train: evaluated"
    );


    let metadata = ModelMetadata {
        model_type: MODEL_TYPE.to_string(),
        hyperparameters: best_params,
        metrics: ModelMetrics {
            cv: trials[best_trial].score,
            validation,
            test,
        },
        target_metric: cfg.target,
        schema_version: data.schema.version.clone(),
        feature_columns: data.feature_columns(),
        label_column: label.column.clone(),
        label_values,
        class_mapping,
        training_samples: data.train.len(),
        n_trials: trials.len(),
        cv_folds: cfg.cv_folds,
        seed: cfg.seed,
        trained_at: Utc::now(),
    };

    Ok(TrainingOutcome {
        artifact: ModelArtifact {
            model,
            metadata,
            schema: data.schema.clone(),
        },
        trials,
        best_trial,
    })
}

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use dataprep::{verify_outputs, PrepSummary, ARTIFACTS_DIR, PROCESSED_DIR};
use modelops::{artifact_files, load_artifact, save_artifact, RandomSearch, TrainingOutcome};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::hub::{HubUploader, RepoRef, RepoType, UploadReceipt, UploadTarget};
use crate::tracking::{ExperimentTracker, RunStatus};

/// Files a deployment directory must hold before it is pushed to the Space.
pub const DEPLOY_REQUIRED: [&str; 2] = ["Dockerfile", "README.md"];

pub const RAW_PATH_IN_REPO: &str = "raw";

fn target(repo: RepoRef, path_in_repo: &str, commit_message: impl Into<String>) -> UploadTarget {
    UploadTarget {
        repo,
        path_in_repo: path_in_repo.to_string(),
        commit_message: commit_message.into(),
    }
}

/// Uploads the raw CSV to the dataset repo, creating the repo if needed.
pub async fn register_dataset(cfg: &AppConfig, hub: &dyn HubUploader) -> Result<UploadReceipt> {
    let raw = &cfg.raw_data_file;
    if !raw.is_file() {
        bail!("raw data file not found at {}", raw.display());
    }
    let repo = RepoRef::new(cfg.dataset_repo()?, RepoType::Dataset);
    hub.ensure_repo(&repo).await.context("register-data: ensure dataset repo")?;
    let receipt = hub
        .upload(raw, &target(repo, RAW_PATH_IN_REPO, "Register raw engine data"))
        .await
        .context("register-data: upload failed")?;
    info!(repo=%receipt.repo_id, files=receipt.files.len(), "register-data: done");
    Ok(receipt)
}

/// Local half of data preparation: analyze, split and write under `DATA_DIR`.
pub fn prepare_local(cfg: &AppConfig) -> Result<PrepSummary> {
    let summary = dataprep::prepare(&cfg.raw_data_file, &cfg.data_dir, &cfg.prep)
        .with_context(|| format!("prepare: {}", cfg.raw_data_file.display()))?;
    info!(
        rows_read = summary.rows_read,
        rows_rejected = summary.rows_rejected,
        rows_removed = summary.rows_removed,
        schema_version = %summary.schema_version,
        "prepare: done"
    );
    Ok(summary)
}

/// Uploads `processed/` and `artifacts/` from a completed preparation.
pub async fn push_dataset(cfg: &AppConfig, hub: &dyn HubUploader) -> Result<Vec<UploadReceipt>> {
    let missing = verify_outputs(&cfg.data_dir);
    if !missing.is_empty() {
        bail!("push-data: prepared outputs missing under {}: {missing:?}", cfg.data_dir.display());
    }
    let repo = RepoRef::new(cfg.dataset_repo()?, RepoType::Dataset);
    hub.ensure_repo(&repo).await.context("push-data: ensure dataset repo")?;

    let mut receipts = Vec::new();
    for dir in [PROCESSED_DIR, ARTIFACTS_DIR] {
        let upload = target(repo.clone(), dir, format!("Upload {dir} data"));
        let receipt = hub
            .upload(&cfg.data_dir.join(dir), &upload)
            .await
            .with_context(|| format!("push-data: upload of {dir}/ failed"))?;
        receipts.push(receipt);
    }
    info!(repo=%repo.repo_id, "push-data: done");
    Ok(receipts)
}

/// Prepares locally, then uploads when a hub is given. An upload failure
/// fails the stage but leaves the local outputs in place for `push-data`.
pub async fn prepare_data(cfg: &AppConfig, hub: Option<&dyn HubUploader>) -> Result<PrepSummary> {
    let summary = prepare_local(cfg)?;
    if let Some(hub) = hub {
        if let Err(e) = push_dataset(cfg, hub).await {
            warn!(
                data_dir=%cfg.data_dir.display(),
                "prepare: upload failed, local outputs kept; rerun `push-data`"
            );
            return Err(e);
        }
    }
    Ok(summary)
}

fn run_params(cfg: &AppConfig, outcome: &TrainingOutcome) -> BTreeMap<String, String> {
    let meta = &outcome.artifact.metadata;
    let mut params = meta.hyperparameters.to_params();
    params.insert("model_type".into(), meta.model_type.clone());
    params.insert("target_metric".into(), meta.target_metric.to_string());
    params.insert("n_trials".into(), meta.n_trials.to_string());
    params.insert("cv_folds".into(), meta.cv_folds.to_string());
    params.insert("seed".into(), meta.seed.to_string());
    params.insert("schema_version".into(), meta.schema_version.clone());
    params.insert("split_seed".into(), cfg.prep.seed.to_string());
    params.insert("outlier_method".into(), cfg.prep.outliers.method.to_string());
    params.insert("outlier_policy".into(), cfg.prep.outliers.policy.to_string());
    params
}

/// Trains on the prepared splits, saves the artifact under `MODEL_DIR` and
/// records the run (every trial, final metrics, artifact files). The model is
/// saved before anything is logged, so a tracker failure leaves it in place.
pub async fn train_model(
    cfg: &AppConfig,
    tracker: &mut dyn ExperimentTracker,
) -> Result<TrainingOutcome> {
    let data = modelops::load_processed(&cfg.data_dir)
        .with_context(|| format!("train: loading prepared data from {}", cfg.data_dir.display()))?;

    let run_id = tracker.start_run("train").await.context("train: start tracking run")?;
    info!(tracker = tracker.name(), run_id=%run_id, "train: started");

    let train_cfg = cfg.train.clone();
    let trained = tokio::task::spawn_blocking(move || {
        let mut searcher = RandomSearch::new(train_cfg.seed);
        modelops::train(&data, &train_cfg, &mut searcher)
    })
    .await
    .context("train: worker panicked")
    .and_then(|r| r.context("train: search failed"));

    let outcome = match trained {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Err(end) = tracker.end_run(RunStatus::Failed).await {
                warn!(error=%end, "train: could not close tracking run");
            }
            return Err(e);
        }
    };

    if let Err(e) = save_artifact(&cfg.model_dir, &outcome.artifact) {
        if let Err(end) = tracker.end_run(RunStatus::Failed).await {
            warn!(error=%end, "train: could not close tracking run");
        }
        return Err(e)
            .with_context(|| format!("train: saving model to {}", cfg.model_dir.display()));
    }

    let logged = log_run(cfg, tracker, &outcome).await;
    let status = if logged.is_ok() { RunStatus::Finished } else { RunStatus::Failed };
    tracker.end_run(status).await.context("train: end tracking run")?;
    logged?;

    let test = &outcome.artifact.metadata.metrics.test;
    info!(
        best_trial = outcome.best_trial,
        test_f1 = test.f1_score,
        test_recall = test.recall,
        model_dir=%cfg.model_dir.display(),
        "train: done"
    );
    Ok(outcome)
}

async fn log_run(
    cfg: &AppConfig,
    tracker: &mut dyn ExperimentTracker,
    outcome: &TrainingOutcome,
) -> Result<()> {
    let target = outcome.artifact.metadata.target_metric;
    for trial in &outcome.trials {
        let metrics = BTreeMap::from([
            (format!("trial_cv_{target}"), trial.score.mean),
            (format!("trial_cv_{target}_std"), trial.score.std),
        ]);
        tracker
            .log_metrics(&metrics, Some(trial.number as u64))
            .await
            .with_context(|| format!("train: log trial {}", trial.number))?;
    }

    tracker.log_params(&run_params(cfg, outcome)).await.context("train: log params")?;

    let m = &outcome.artifact.metadata.metrics;
    let mut metrics = m.validation.to_metrics("val");
    metrics.extend(m.test.to_metrics("test"));
    metrics.insert(format!("cv_{target}_mean"), m.cv.mean);
    metrics.insert(format!("cv_{target}_std"), m.cv.std);
    tracker.log_metrics(&metrics, None).await.context("train: log metrics")?;

    for file in artifact_files() {
        tracker
            .log_artifact(&cfg.model_dir.join(file), "model")
            .await
            .with_context(|| format!("train: log artifact {file}"))?;
    }
    Ok(())
}

/// Verifies the saved artifact and uploads it to the model repo.
pub async fn register_model(cfg: &AppConfig, hub: &dyn HubUploader) -> Result<UploadReceipt> {
    let artifact = load_artifact(&cfg.model_dir)
        .with_context(|| format!("register-model: no valid model at {}", cfg.model_dir.display()))?;
    let repo = RepoRef::new(cfg.model_repo()?, RepoType::Model);
    hub.ensure_repo(&repo).await.context("register-model: ensure model repo")?;
    let message = format!("Register model (schema {})", artifact.schema.version);
    let receipt = hub
        .upload(&cfg.model_dir, &target(repo, "", message))
        .await
        .context("register-model: upload failed")?;
    info!(repo=%receipt.repo_id, files=receipt.files.len(), "register-model: done");
    Ok(receipt)
}

/// Required deployment files missing from `dir`.
pub fn missing_deploy_files(dir: &Path) -> Vec<&'static str> {
    DEPLOY_REQUIRED.into_iter().filter(|f| !dir.join(f).is_file()).collect()
}

/// Uploads the deployment directory to the Space.
pub async fn deploy_app(cfg: &AppConfig, hub: &dyn HubUploader) -> Result<UploadReceipt> {
    let dir = &cfg.deploy_dir;
    if !dir.is_dir() {
        bail!("deploy: deployment folder not found at {}", dir.display());
    }
    let missing = missing_deploy_files(dir);
    if !missing.is_empty() {
        bail!("deploy: missing files in {}: {missing:?}", dir.display());
    }
    let repo = RepoRef::new(cfg.space()?, RepoType::Space);
    hub.ensure_repo(&repo).await.context("deploy: ensure space")?;
    let receipt = hub
        .upload(dir, &target(repo, "", "Deploy inference app"))
        .await
        .context("deploy: upload failed")?;
    info!(space=%receipt.repo_id, files=receipt.files.len(), "deploy: done");
    Ok(receipt)
}

/// Runs the enabled stages in order. Configuration is checked up front so a
/// missing token fails before any work is done.
pub async fn run_all(
    cfg: &AppConfig,
    hub: &dyn HubUploader,
    tracker: &mut dyn ExperimentTracker,
) -> Result<()> {
    cfg.validate_for_run()?;
    let s = cfg.stages;
    info!(
        data_registration = s.data_registration,
        data_prep = s.data_prep,
        model_training = s.model_training,
        deployment = s.deployment,
        "run: starting"
    );

    if s.data_registration {
        register_dataset(cfg, hub).await?;
    }
    if s.data_prep {
        prepare_data(cfg, Some(hub)).await?;
    }
    if s.model_training {
        train_model(cfg, tracker).await?;
        register_model(cfg, hub).await?;
    }
    if s.deployment {
        deploy_app(cfg, hub).await?;
    }
    info!("run: complete");
    Ok(())
}

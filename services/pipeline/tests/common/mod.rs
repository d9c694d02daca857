#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use pipeline::hub::{collect_files, HubUploader, RepoRef, UploadError, UploadReceipt, UploadTarget};
use pipeline::tracking::{ExperimentTracker, RunStatus, TrackingError};
use pipeline::AppConfig;

pub const FEATURES: [&str; 3] = ["Engine rpm", "Lub oil pressure", "Coolant temp"];

pub fn engine_csv(normal: usize, faulty: usize) -> String {
    let mut s = format!("{},Engine Condition\n", FEATURES.join(","));
    for i in 0..normal + faulty {
        let faulty_row = i >= normal;
        let rpm = if faulty_row { 1500 + (i * 37) % 400 } else { 600 + (i * 37) % 400 };
        let oil = 3.0 + ((i * 13) % 10) as f64 / 10.0;
        let temp = if faulty_row { 95.0 } else { 78.0 } + ((i * 7) % 5) as f64;
        s.push_str(&format!("{rpm},{oil},{temp},{}\n", u8::from(faulty_row)));
    }
    s
}

/// Config rooted in `root` with the raw CSV written and every stage toggle on.
pub fn config(root: &Path, extra: &[(&str, &str)]) -> AppConfig {
    let raw = root.join("data/engine_data.csv");
    std::fs::create_dir_all(raw.parent().unwrap()).unwrap();
    std::fs::write(&raw, engine_csv(160, 40)).unwrap();

    let mut vars: HashMap<String, String> = [
        ("DATA_DIR", root.join("data")),
        ("RAW_DATA_FILE", raw),
        ("MODEL_DIR", root.join("models")),
        ("DEPLOY_DIR", root.join("deployment")),
        ("TRACKING_DIR", root.join("mlruns")),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.display().to_string()))
    .collect();
    for (k, v) in [
        ("OUTLIER_POLICY", "keep"),
        ("TRAIN_TRIALS", "2"),
        ("CV_FOLDS", "3"),
        ("HF_TOKEN", "hf_test"),
        ("HF_DATASET_REPO_ID", "me/engine-data"),
        ("HF_MODEL_REPO_ID", "me/engine-model"),
        ("HF_SPACE_ID", "me/engine-app"),
    ]
    .into_iter()
    .chain(extra.iter().copied())
    {
        vars.insert(k.to_string(), v.to_string());
    }
    AppConfig::from_lookup(|k| vars.get(k).cloned()).unwrap()
}

pub fn write_deploy_dir(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
    std::fs::write(dir.join("README.md"), "---\nsdk: docker\n---\n").unwrap();
}

#[derive(Clone, Debug)]
pub struct Upload {
    pub local: PathBuf,
    pub target: UploadTarget,
    pub files: Vec<String>,
}

/// Records calls instead of talking to a hub; optionally fails every upload.
#[derive(Default)]
pub struct RecordingHub {
    pub fail_uploads: bool,
    pub repos: Mutex<Vec<RepoRef>>,
    pub uploads: Mutex<Vec<Upload>>,
}

impl RecordingHub {
    pub fn failing() -> Self {
        Self { fail_uploads: true, ..Default::default() }
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl HubUploader for RecordingHub {
    async fn ensure_repo(&self, repo: &RepoRef) -> Result<(), UploadError> {
        self.repos.lock().unwrap().push(repo.clone());
        Ok(())
    }

    async fn upload(
        &self,
        local: &Path,
        target: &UploadTarget,
    ) -> Result<UploadReceipt, UploadError> {
        if self.fail_uploads {
            return Err(UploadError::Http { status: 503, body: "hub unavailable".into() });
        }
        let files: Vec<String> =
            collect_files(local, &target.path_in_repo)?.into_iter().map(|(_, rel)| rel).collect();
        self.uploads.lock().unwrap().push(Upload {
            local: local.to_path_buf(),
            target: target.clone(),
            files: files.clone(),
        });
        Ok(UploadReceipt {
            repo_id: target.repo.repo_id.clone(),
            repo_type: target.repo.repo_type,
            files,
            commit_url: None,
        })
    }
}

/// Opens runs but answers every logging call with a 503.
#[derive(Default)]
pub struct UnavailableTracker {
    pub ended: Vec<RunStatus>,
}

fn unavailable() -> TrackingError {
    TrackingError::Http { status: 503, body: "tracking server unavailable".into() }
}

#[async_trait]
impl ExperimentTracker for UnavailableTracker {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn start_run(&mut self, _run_name: &str) -> Result<String, TrackingError> {
        Ok("run-1".into())
    }

    async fn log_params(
        &mut self,
        _params: &BTreeMap<String, String>,
    ) -> Result<(), TrackingError> {
        Err(unavailable())
    }

    async fn log_metrics(
        &mut self,
        _metrics: &BTreeMap<String, f64>,
        _step: Option<u64>,
    ) -> Result<(), TrackingError> {
        Err(unavailable())
    }

    async fn log_artifact(
        &mut self,
        _local: &Path,
        _artifact_path: &str,
    ) -> Result<(), TrackingError> {
        Err(unavailable())
    }

    async fn end_run(&mut self, status: RunStatus) -> Result<(), TrackingError> {
        self.ended.push(status);
        Ok(())
    }
}

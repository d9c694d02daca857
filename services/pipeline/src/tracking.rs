use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("no active run")]
    NoActiveRun,
    #[error("tracking server returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("tracking request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected tracking response: {0}")]
    Protocol(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }
}

/// Records one training run. Implementations hold the active run id.
#[async_trait]
pub trait ExperimentTracker: Send {
    fn name(&self) -> &str;
    async fn start_run(&mut self, run_name: &str) -> Result<String, TrackingError>;
    async fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<(), TrackingError>;
    async fn log_metrics(
        &mut self,
        metrics: &BTreeMap<String, f64>,
        step: Option<u64>,
    ) -> Result<(), TrackingError>;
    async fn log_artifact(
        &mut self,
        local: &Path,
        artifact_path: &str,
    ) -> Result<(), TrackingError>;
    async fn end_run(&mut self, status: RunStatus) -> Result<(), TrackingError>;
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// MLflow tracking server over its REST API (`/api/2.0/mlflow`).
pub struct MlflowTracker {
    base_url: String,
    experiment_name: String,
    client: reqwest::Client,
    experiment_id: Option<String>,
    run_id: Option<String>,
}

impl MlflowTracker {
    pub fn new(base_url: impl Into<String>, experiment_name: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            experiment_name: experiment_name.into(),
            client: reqwest::Client::new(),
            experiment_id: None,
            run_id: None,
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{path}", self.base_url)
    }

    async fn check(resp: reqwest::Response) -> Result<serde_json::Value, TrackingError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TrackingError::Http { status: status.as_u16(), body });
        }
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text).map_err(|e| TrackingError::Protocol(e.to_string()))
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, TrackingError> {
        let resp = self.client.post(self.api(path)).json(&body).send().await?;
        Self::check(resp).await
    }

    async fn experiment_id(&mut self) -> Result<String, TrackingError> {
        if let Some(id) = &self.experiment_id {
            return Ok(id.clone());
        }
        let url = format!(
            "{}?experiment_name={}",
            self.api("experiments/get-by-name"),
            urlencoding::encode(&self.experiment_name)
        );
        let resp = self.client.get(url).send().await?;
        let id = (if resp.status() == reqwest::StatusCode::NOT_FOUND {
            let created = self
                .post("experiments/create", json!({ "name": self.experiment_name }))
                .await?;
            info!(experiment=%self.experiment_name, "mlflow: experiment created");
            created["experiment_id"].as_str().map(str::to_string)
        } else {
            let found = Self::check(resp).await?;
            found["experiment"]["experiment_id"].as_str().map(str::to_string)
        })
        .ok_or_else(|| TrackingError::Protocol("missing experiment_id".into()))?;
        self.experiment_id = Some(id.clone());
        Ok(id)
    }

    fn run_id(&self) -> Result<&str, TrackingError> {
        self.run_id.as_deref().ok_or(TrackingError::NoActiveRun)
    }
}

#[async_trait]
impl ExperimentTracker for MlflowTracker {
    fn name(&self) -> &str {
        "mlflow"
    }

    async fn start_run(&mut self, run_name: &str) -> Result<String, TrackingError> {
        let experiment_id = self.experiment_id().await?;
        let created = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": now_ms(),
                }),
            )
            .await?;
        let run_id = created["run"]["info"]["run_id"]
            .as_str()
            .ok_or_else(|| TrackingError::Protocol("missing run_id".into()))?
            .to_string();
        info!(run_id=%run_id, experiment=%self.experiment_name, "mlflow: run started");
        self.run_id = Some(run_id.clone());
        Ok(run_id)
    }

    async fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<(), TrackingError> {
        let run_id = self.run_id()?.to_string();
        let params: Vec<_> = params.iter().map(|(k, v)| json!({ "key": k, "value": v })).collect();
        self.post("runs/log-batch", json!({ "run_id": run_id, "params": params })).await?;
        Ok(())
    }

    async fn log_metrics(
        &mut self,
        metrics: &BTreeMap<String, f64>,
        step: Option<u64>,
    ) -> Result<(), TrackingError> {
        let run_id = self.run_id()?.to_string();
        let ts = now_ms();
        let metrics: Vec<_> = metrics
            .iter()
            .map(|(k, v)| {
                json!({ "key": k, "value": v, "timestamp": ts, "step": step.unwrap_or(0) })
            })
            .collect();
        self.post("runs/log-batch", json!({ "run_id": run_id, "metrics": metrics })).await?;
        Ok(())
    }

    async fn log_artifact(
        &mut self,
        local: &Path,
        artifact_path: &str,
    ) -> Result<(), TrackingError> {
        let run_id = self.run_id()?.to_string();
        let experiment_id = self.experiment_id().await?;
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TrackingError::Protocol(format!("{} has no file name", local.display()))
            })?;
        let dest = [artifact_path.trim_matches('/'), file_name.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{experiment_id}/{run_id}/artifacts/{dest}",
            self.base_url
        );
        let bytes = tokio::fs::read(local).await?;
        let resp = self.client.put(url).body(bytes).send().await?;
        Self::check(resp).await?;
        debug!(artifact=%dest, "mlflow: artifact logged");
        Ok(())
    }

    async fn end_run(&mut self, status: RunStatus) -> Result<(), TrackingError> {
        let run_id = self.run_id()?.to_string();
        self.post(
            "runs/update",
            json!({ "run_id": run_id, "status": status.as_str(), "end_time": now_ms() }),
        )
        .await?;
        info!(run_id=%run_id, status=status.as_str(), "mlflow: run ended");
        self.run_id = None;
        Ok(())
    }
}

/// One line of a local run log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Start { run_id: String, run_name: String, experiment: String, at: i64 },
    Params { params: BTreeMap<String, String> },
    Metrics { metrics: BTreeMap<String, f64>, step: Option<u64>, at: i64 },
    Artifact { path: String },
    End { status: RunStatus, at: i64 },
}

/// Fallback when no tracking server is configured: each run is an NDJSON
/// file under `<dir>/<experiment>/`, artifacts copied next to it.
pub struct LocalTracker {
    root: PathBuf,
    experiment_name: String,
    run: Option<(String, PathBuf)>,
}

impl LocalTracker {
    pub fn new(dir: impl Into<PathBuf>, experiment_name: impl Into<String>) -> Self {
        Self { root: dir.into(), experiment_name: experiment_name.into(), run: None }
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.root.join(&self.experiment_name)
    }

    pub fn read_run(path: &Path) -> Result<Vec<RunEvent>, TrackingError> {
        std::fs::read_to_string(path)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| TrackingError::Protocol(e.to_string())))
            .collect()
    }

    fn append(&self, event: &RunEvent) -> Result<(), TrackingError> {
        let (_, log) = self.run.as_ref().ok_or(TrackingError::NoActiveRun)?;
        let mut line =
            serde_json::to_vec(event).map_err(|e| TrackingError::Protocol(e.to_string()))?;
        line.push(b'\n');
        let mut f = std::fs::OpenOptions::new().create(true).append(true).open(log)?;
        f.write_all(&line)?;
        Ok(())
    }
}

#[async_trait]
impl ExperimentTracker for LocalTracker {
    fn name(&self) -> &str {
        "local"
    }

    async fn start_run(&mut self, run_name: &str) -> Result<String, TrackingError> {
        let dir = self.experiment_dir();
        std::fs::create_dir_all(&dir)?;
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let log = dir.join(format!("{run_id}.ndjson"));
        self.run = Some((run_id.clone(), log.clone()));
        self.append(&RunEvent::Start {
            run_id: run_id.clone(),
            run_name: run_name.to_string(),
            experiment: self.experiment_name.clone(),
            at: now_ms(),
        })?;
        info!(run_id=%run_id, log=%log.display(), "tracking: local run started");
        Ok(run_id)
    }

    async fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<(), TrackingError> {
        self.append(&RunEvent::Params { params: params.clone() })
    }

    async fn log_metrics(
        &mut self,
        metrics: &BTreeMap<String, f64>,
        step: Option<u64>,
    ) -> Result<(), TrackingError> {
        self.append(&RunEvent::Metrics { metrics: metrics.clone(), step, at: now_ms() })
    }

    async fn log_artifact(
        &mut self,
        local: &Path,
        artifact_path: &str,
    ) -> Result<(), TrackingError> {
        let (run_id, _) = self.run.as_ref().ok_or(TrackingError::NoActiveRun)?;
        let file_name = local
            .file_name()
            .ok_or_else(|| {
                TrackingError::Protocol(format!("{} has no file name", local.display()))
            })?;
        let dest_dir = self.experiment_dir().join(run_id).join(artifact_path.trim_matches('/'));
        std::fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(file_name);
        std::fs::copy(local, &dest)?;
        self.append(&RunEvent::Artifact { path: dest.display().to_string() })
    }

    async fn end_run(&mut self, status: RunStatus) -> Result<(), TrackingError> {
        self.append(&RunEvent::End { status, at: now_ms() })?;
        if let Some((run_id, _)) = self.run.take() {
            info!(run_id=%run_id, status=status.as_str(), "tracking: local run ended");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_run_is_an_ndjson_log() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("best_model.json");
        std::fs::write(&artifact, "{}").unwrap();

        let mut t = LocalTracker::new(dir.path().join("mlruns"), "engine");
        let run_id = t.start_run("train").await.unwrap();
        t.log_params(&BTreeMap::from([("max_depth".to_string(), "3".to_string())])).await.unwrap();
        t.log_metrics(&BTreeMap::from([("cv_f1".to_string(), 0.8)]), Some(2)).await.unwrap();
        t.log_artifact(&artifact, "model").await.unwrap();
        t.end_run(RunStatus::Finished).await.unwrap();

        let log = dir.path().join("mlruns/engine").join(format!("{run_id}.ndjson"));
        let events = LocalTracker::read_run(&log).unwrap();
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], RunEvent::Start { .. }));
        assert!(matches!(&events[2], RunEvent::Metrics { step: Some(2), .. }));
        assert!(matches!(events[4], RunEvent::End { status: RunStatus::Finished, .. }));
        let copied = dir.path().join("mlruns/engine").join(&run_id).join("model/best_model.json");
        assert!(copied.is_file());
    }

    #[tokio::test]
    async fn logging_without_a_run_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = LocalTracker::new(dir.path(), "engine");
        assert!(matches!(t.log_params(&BTreeMap::new()).await, Err(TrackingError::NoActiveRun)));
        assert!(matches!(t.end_run(RunStatus::Failed).await, Err(TrackingError::NoActiveRun)));
    }
}

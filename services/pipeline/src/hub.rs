use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    Dataset,
    Model,
    Space,
}

impl RepoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::Model => "model",
            Self::Space => "space",
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoRef {
    pub repo_id: String,
    pub repo_type: RepoType,
}

impl RepoRef {
    pub fn new(repo_id: impl Into<String>, repo_type: RepoType) -> Self {
        Self { repo_id: repo_id.into(), repo_type }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadTarget {
    pub repo: RepoRef,
    /// Directory inside the repo; empty for the repo root.
    pub path_in_repo: String,
    pub commit_message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub repo_id: String,
    pub repo_type: RepoType,
    pub files: Vec<String>,
    pub commit_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("nothing to upload at {0}")]
    NothingToUpload(PathBuf),
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("hub rejected credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error("hub returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("hub request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Pushes local files to a hosted repository.
#[async_trait]
pub trait HubUploader: Send + Sync {
    /// Creates the repository when it does not exist yet.
    async fn ensure_repo(&self, repo: &RepoRef) -> Result<(), UploadError>;
    /// Uploads a single file or every file under a directory in one commit.
    async fn upload(
        &self,
        local: &Path,
        target: &UploadTarget,
    ) -> Result<UploadReceipt, UploadError>;
}

/// Files under `local` as `(absolute path, repo path)`, sorted by repo path.
/// Hidden entries (staging directories, dotfiles) are skipped.
pub fn collect_files(
    local: &Path,
    path_in_repo: &str,
) -> Result<Vec<(PathBuf, String)>, UploadError> {
    let io = |source| UploadError::Io { path: local.to_path_buf(), source };
    let prefix = path_in_repo.trim_matches('/');
    let join = |rel: &str| {
        if prefix.is_empty() {
            rel.to_string()
        } else {
            format!("{prefix}/{rel}")
        }
    };

    let meta = std::fs::metadata(local).map_err(io)?;
    if meta.is_file() {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::NothingToUpload(local.to_path_buf()))?;
        return Ok(vec![(local.to_path_buf(), join(&name))]);
    }

    let mut out = Vec::new();
    let mut stack = vec![(local.to_path_buf(), String::new())];
    while let Some((dir, rel_dir)) = stack.pop() {
        for entry in std::fs::read_dir(&dir).map_err(io)? {
            let entry = entry.map_err(io)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let rel = if rel_dir.is_empty() { name } else { format!("{rel_dir}/{name}") };
            let kind = entry.file_type().map_err(io)?;
            if kind.is_dir() {
                stack.push((entry.path(), rel));
            } else if kind.is_file() {
                out.push((entry.path(), join(&rel)));
            }
        }
    }
    if out.is_empty() {
        return Err(UploadError::NothingToUpload(local.to_path_buf()));
    }
    out.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(out)
}

/// Hugging Face Hub client using the NDJSON commit endpoint, so each upload
/// is a single commit regardless of file count.
pub struct HfHubClient {
    endpoint: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponse {
    commit_url: Option<String>,
}

impl HfHubClient {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    fn commit_url(&self, repo: &RepoRef) -> String {
        format!("{}/api/{}s/{}/commit/main", self.endpoint, repo.repo_type, repo.repo_id)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, UploadError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(UploadError::Unauthorized(status.as_u16()));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(UploadError::Http { status: status.as_u16(), body })
    }
}

/// Commit body: a header line, then one base64 line per file.
pub fn commit_payload(summary: &str, files: &[(String, Vec<u8>)]) -> String {
    let mut lines = Vec::with_capacity(files.len() + 1);
    lines.push(serde_json::json!({
        "key": "header",
        "value": { "summary": summary, "description": "" }
    }));
    for (path, bytes) in files {
        lines.push(serde_json::json!({
            "key": "file",
            "value": { "content": BASE64.encode(bytes), "path": path, "encoding": "base64" }
        }));
    }
    let mut body = lines.iter().map(|l| l.to_string()).collect::<Vec<_>>().join("\n");
    body.push('\n');
    body
}

#[async_trait]
impl HubUploader for HfHubClient {
    async fn ensure_repo(&self, repo: &RepoRef) -> Result<(), UploadError> {
        let (organization, name) = match repo.repo_id.split_once('/') {
            Some((org, name)) => (Some(org), name),
            None => (None, repo.repo_id.as_str()),
        };
        let mut body = serde_json::json!({
            "name": name,
            "organization": organization,
            "type": repo.repo_type.as_str(),
            "private": false,
        });
        if repo.repo_type == RepoType::Space {
            body["sdk"] = serde_json::json!("docker");
        }

        let resp = self
            .client
            .post(format!("{}/api/repos/create", self.endpoint))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            debug!(repo=%repo.repo_id, kind=%repo.repo_type, "hub: repo exists");
            return Ok(());
        }
        Self::check(resp).await?;
        info!(repo=%repo.repo_id, kind=%repo.repo_type, "hub: repo created");
        Ok(())
    }

    async fn upload(
        &self,
        local: &Path,
        target: &UploadTarget,
    ) -> Result<UploadReceipt, UploadError> {
        let listed = collect_files(local, &target.path_in_repo)?;
        let mut files = Vec::with_capacity(listed.len());
        for (abs, rel) in listed {
            let bytes = tokio::fs::read(&abs)
                .await
                .map_err(|source| UploadError::Io { path: abs.clone(), source })?;
            files.push((rel, bytes));
        }
        let total: usize = files.iter().map(|(_, b)| b.len()).sum();

        let resp = self
            .client
            .post(self.commit_url(&target.repo))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(commit_payload(&target.commit_message, &files))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let commit: CommitResponse =
            resp.json().await.unwrap_or(CommitResponse { commit_url: None });

        info!(
            repo=%target.repo.repo_id,
            kind=%target.repo.repo_type,
            files=files.len(),
            bytes=total,
            "hub: uploaded"
        );
        Ok(UploadReceipt {
            repo_id: target.repo.repo_id.clone(),
            repo_type: target.repo.repo_type,
            files: files.into_iter().map(|(rel, _)| rel).collect(),
            commit_url: commit.commit_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_nested_files_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::create_dir_all(dir.path().join(".staging-x")).unwrap();
        std::fs::write(dir.path().join("b.csv"), "b").unwrap();
        std::fs::write(dir.path().join("sub/a.json"), "a").unwrap();
        std::fs::write(dir.path().join(".staging-x/junk"), "j").unwrap();

        let files: Vec<String> = collect_files(dir.path(), "processed/")
            .unwrap()
            .into_iter()
            .map(|(_, rel)| rel)
            .collect();
        assert_eq!(files, vec!["processed/b.csv", "processed/sub/a.json"]);
    }

    #[test]
    fn single_file_keeps_its_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_data.csv");
        std::fs::write(&path, "x").unwrap();
        let files = collect_files(&path, "").unwrap();
        assert_eq!(files[0].1, "engine_data.csv");
    }

    #[test]
    fn empty_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(collect_files(dir.path(), ""), Err(UploadError::NothingToUpload(_))));
    }

    #[test]
    fn payload_is_header_then_files() {
        let body = commit_payload("add splits", &[("a.csv".into(), b"1,2\n".to_vec())]);
        let lines: Vec<serde_json::Value> =
            body.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["key"], "header");
        assert_eq!(lines[0]["value"]["summary"], "add splits");
        assert_eq!(lines[1]["value"]["path"], "a.csv");
        assert_eq!(lines[1]["value"]["encoding"], "base64");
        assert_eq!(lines[1]["value"]["content"], BASE64.encode(b"1,2\n"));
    }
}

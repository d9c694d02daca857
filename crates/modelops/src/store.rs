use std::fs;
use std::path::{Path, PathBuf};

use dataprep::{read_json, write_json, ColumnSchema, DataPrepError};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    build_manifest, verify_manifest, GradientBoostedTrees, Manifest, ModelMetadata, MANIFEST_FILE,
    METADATA_FILE, MODEL_FILE, SCHEMA_FILE,
};

#[derive(Debug, Error)]
pub enum ModelOpsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    DataPrep(#[from] DataPrepError),
    #[error("Dataset error: {0}")]
    Dataset(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Integrity error: {0}")]
    Integrity(String),
}

pub type Result<T> = std::result::Result<T, ModelOpsError>;

/// Everything the serving side needs, persisted together in one directory.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelArtifact {
    pub model: GradientBoostedTrees,
    pub metadata: ModelMetadata,
    pub schema: ColumnSchema,
}

pub fn artifact_files() -> [&'static str; 4] {
    [MODEL_FILE, METADATA_FILE, SCHEMA_FILE, MANIFEST_FILE]
}

fn staging_dir(dir: &Path, tag: &str) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| ModelOpsError::Config(format!("{} has no directory name", dir.display())))?
        .to_string_lossy()
        .into_owned();
    let parent = dir.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    Ok(parent.join(format!(".{name}.{tag}-{}", uuid::Uuid::new_v4())))
}

fn discard(staging: &Path) {
    if let Err(err) = fs::remove_dir_all(staging) {
        warn!(dir=%staging.display(), error=%err, "store: staging cleanup failed");
    }
}

/// Writes the artifact into a sibling staging directory, seals it with a
/// manifest, then swaps it in place of `dir`.
pub fn save_artifact(dir: &Path, artifact: &ModelArtifact) -> Result<Manifest> {
    if artifact.metadata.schema_version != artifact.schema.version {
        return Err(ModelOpsError::Integrity(format!(
            "metadata schema version {} does not match schema {}",
            artifact.metadata.schema_version, artifact.schema.version
        )));
    }
    if let Some(parent) = dir.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let staging = staging_dir(dir, "staging")?;
    fs::create_dir_all(&staging)?;

    let written = (|| -> Result<Manifest> {
        write_json(&staging.join(MODEL_FILE), &artifact.model)?;
        write_json(&staging.join(METADATA_FILE), &artifact.metadata)?;
        write_json(&staging.join(SCHEMA_FILE), &artifact.schema)?;
        let manifest = build_manifest(&staging)?;
        write_json(&staging.join(MANIFEST_FILE), &manifest)?;
        Ok(manifest)
    })();
    let manifest = match written {
        Ok(m) => m,
        Err(e) => {
            discard(&staging);
            return Err(e);
        }
    };

    let previous = staging_dir(dir, "previous")?;
    if dir.exists() {
        fs::rename(dir, &previous)?;
    }
    if let Err(e) = fs::rename(&staging, dir) {
        if previous.exists() {
            if let Err(err) = fs::rename(&previous, dir) {
                warn!(dir=%dir.display(), error=%err, "store: could not restore previous artifact");
            }
        }
        discard(&staging);
        return Err(e.into());
    }
    if previous.exists() {
        fs::remove_dir_all(&previous)?;
    }

    info!(
        dir = %dir.display(),
        manifest_hash = %manifest.manifest_hash,
        schema_version = %artifact.schema.version,
        "store: artifact saved"
    );
    Ok(manifest)
}

/// Loads and integrity-checks an artifact directory. Whether the bundled
/// schema is the one the model was trained on is left to the caller.
pub fn load_artifact(dir: &Path) -> Result<ModelArtifact> {
    let manifest: Manifest = read_json(&dir.join(MANIFEST_FILE))?;
    verify_manifest(dir, &manifest)?;

    let model: GradientBoostedTrees = read_json(&dir.join(MODEL_FILE))?;
    let metadata: ModelMetadata = read_json(&dir.join(METADATA_FILE))?;
    let schema: ColumnSchema = read_json(&dir.join(SCHEMA_FILE))?;

    if !schema.verify_version() {
        return Err(ModelOpsError::Integrity(
            "column schema version does not match its contents".into(),
        ));
    }
    if model.n_features != metadata.feature_columns.len() {
        return Err(ModelOpsError::Integrity(format!(
            "model expects {} features, metadata lists {}",
            model.n_features,
            metadata.feature_columns.len()
        )));
    }
    Ok(ModelArtifact { model, metadata, schema })
}

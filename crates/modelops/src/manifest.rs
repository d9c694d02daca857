use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ModelFile, ModelOpsError, Result, MANIFEST_FILE};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<ModelFile>,
    pub manifest_hash: String,
}

/// Deterministic manifest hash:
/// - sort by rel_path (bytewise)
/// - hash bytes: "<rel_path>\n<size>\n<blake3>\n" for each file
pub fn manifest_hash(mut files: Vec<ModelFile>) -> String {
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    let mut hasher = blake3::Hasher::new();
    for f in files {
        hasher.update(f.rel_path.as_bytes());
        hasher.update(b"\n");
        hasher.update(f.size.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(f.blake3.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize().as_bytes())
}

fn describe(dir: &Path, rel_path: &str) -> Result<ModelFile> {
    let bytes = std::fs::read(dir.join(rel_path))?;
    Ok(ModelFile {
        rel_path: rel_path.to_string(),
        size: bytes.len() as u64,
        blake3: blake3::hash(&bytes).to_hex().to_string(),
    })
}

/// Describes every regular file directly under `dir` except the manifest itself.
pub fn build_manifest(dir: &Path) -> Result<Manifest> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == MANIFEST_FILE {
            continue;
        }
        files.push(describe(dir, &name)?);
    }
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    let manifest_hash = manifest_hash(files.clone());
    Ok(Manifest { files, manifest_hash })
}

/// Re-hashes the listed files and compares against the manifest.
pub fn verify_manifest(dir: &Path, manifest: &Manifest) -> Result<()> {
    for expected in &manifest.files {
        let actual = describe(dir, &expected.rel_path).map_err(|_| {
            ModelOpsError::Integrity(format!("{} is missing", expected.rel_path))
        })?;
        if &actual != expected {
            return Err(ModelOpsError::Integrity(format!(
                "{} changed since publication",
                expected.rel_path
            )));
        }
    }
    if manifest_hash(manifest.files.clone()) != manifest.manifest_hash {
        return Err(ModelOpsError::Integrity("manifest hash does not match its file list".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(rel_path: &str, size: u64) -> ModelFile {
        ModelFile {
            rel_path: rel_path.into(),
            size,
            blake3: "00".into(),
        }
    }

    #[test]
    fn test_manifest_hash_deterministic() {
        let files1 = vec![file("b.json", 2), file("a.json", 1)];
        let files2 = vec![file("a.json", 1), file("b.json", 2)];
        assert_eq!(manifest_hash(files1), manifest_hash(files2));
    }

    #[test]
    fn test_manifest_hash_changes_on_size() {
        assert_ne!(manifest_hash(vec![file("a.json", 1)]), manifest_hash(vec![file("a.json", 2)]));
    }

    #[test]
    fn detects_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("best_model.json"), b"{}").unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"ignored").unwrap();

        let m = build_manifest(dir.path()).unwrap();
        assert_eq!(m.files.len(), 1);
        verify_manifest(dir.path(), &m).unwrap();

        std::fs::write(dir.path().join("best_model.json"), b"{ }").unwrap();
        assert!(matches!(verify_manifest(dir.path(), &m), Err(ModelOpsError::Integrity(_))));
    }
}

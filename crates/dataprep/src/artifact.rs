use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::{DataPrepError, Result};

/// Pretty-printed JSON with a trailing newline, so artifacts diff cleanly.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes =
        serde_json::to_vec_pretty(value).map_err(|e| DataPrepError::Ser(e.to_string()))?;
    bytes.push(b'\n');
    std::fs::write(path, bytes)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| DataPrepError::Ser(format!("{}: {e}", path.display())))
}

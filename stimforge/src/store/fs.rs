//! Filesystem stores under a state directory.
//!
//! Layout:
//!
//! ```text
//! <state_dir>/units/<id>.json          one pretty JSON record per unit
//! <state_dir>/artifacts/<id>/<name>    generated images and videos
//! ```
//!
//! Every write goes to a temporary sibling first and is then renamed into
//! place, so readers never observe a partially written file.

use super::{read_external, verify, ArtifactStore, StateStore};
use crate::core::{ArtifactRef, StimulusUnit};
use crate::errors::StoreError;
use crate::utils::sha256_hex;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let display = path.display().to_string();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent.display().to_string(), e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::io(tmp.display().to_string(), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(display, e))
}

/// Unit records as JSON files.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    dir: PathBuf,
}

impl FsStateStore {
    /// Creates a store rooted at `<state_dir>/units`.
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("units"),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn load(&self, id: &str) -> Result<Option<StimulusUnit>, StoreError> {
        let path = self.path(id);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path.display().to_string(), e)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }

    async fn save(&self, unit: &StimulusUnit) -> Result<(), StoreError> {
        let path = self.path(&unit.id);
        let content = serde_json::to_vec_pretty(unit).map_err(|e| StoreError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        write_atomic(&path, &content).await
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(self.dir.display().to_string(), e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(self.dir.display().to_string(), e))?
        {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Artifact files under `<state_dir>/artifacts`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    /// Creates a store rooted at `<state_dir>/artifacts`.
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("artifacts"),
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, unit_id: &str, name: &str, bytes: &[u8]) -> Result<ArtifactRef, StoreError> {
        let path = self.dir.join(unit_id).join(name);
        write_atomic(&path, bytes).await?;
        Ok(ArtifactRef::stored(
            path.display().to_string(),
            sha256_hex(bytes),
        ))
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        let bytes = read_external(&artifact.location).await?;
        verify(artifact, bytes)
    }
}

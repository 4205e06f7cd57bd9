//! In-memory stores for tests and dry runs.

use super::{read_external, verify, ArtifactStore, StateStore};
use crate::core::{ArtifactRef, StimulusUnit};
use crate::errors::StoreError;
use crate::utils::sha256_hex;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory unit records.
///
/// With history enabled every saved snapshot is kept, so tests can check
/// invariants over each state the orchestrator ever persisted.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    units: DashMap<String, StimulusUnit>,
    saves: AtomicUsize,
    history: Option<Mutex<Vec<StimulusUnit>>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that keeps every saved snapshot.
    #[must_use]
    pub fn with_history() -> Self {
        Self {
            history: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    /// Number of saves performed.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Every snapshot saved so far, in save order.
    #[must_use]
    pub fn history(&self) -> Vec<StimulusUnit> {
        self.history
            .as_ref()
            .map(|h| h.lock().clone())
            .unwrap_or_default()
    }

    /// Returns the current record for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<StimulusUnit> {
        self.units.get(id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, id: &str) -> Result<Option<StimulusUnit>, StoreError> {
        Ok(self.get(id))
    }

    async fn save(&self, unit: &StimulusUnit) -> Result<(), StoreError> {
        self.units.insert(unit.id.clone(), unit.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        if let Some(history) = &self.history {
            history.lock().push(unit.clone());
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<_> = self.units.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// In-memory artifact bytes, addressed as `mem://<unit>/<name>`.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Overwrites the bytes at `location` without updating any digest.
    pub fn tamper(&self, location: &str, bytes: Vec<u8>) {
        self.blobs.insert(location.to_string(), bytes);
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, unit_id: &str, name: &str, bytes: &[u8]) -> Result<ArtifactRef, StoreError> {
        let location = format!("mem://{unit_id}/{name}");
        self.blobs.insert(location.clone(), bytes.to_vec());
        Ok(ArtifactRef::stored(location, sha256_hex(bytes)))
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        let stored = self
            .blobs
            .get(&artifact.location)
            .map(|entry| entry.value().clone());
        let bytes = match stored {
            Some(bytes) => bytes,
            None if artifact.location.starts_with("mem://") => {
                return Err(StoreError::NotFound(artifact.location.clone()));
            }
            None => read_external(&artifact.location).await?,
        };
        verify(artifact, bytes)
    }
}

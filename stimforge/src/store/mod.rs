//! Durable unit records and generated artifacts.
//!
//! The orchestrator is the only writer. A unit record is saved whole and
//! atomically after every status transition, so a crash can lose at most
//! the result of the call that was in flight.

mod fs;
mod memory;

pub use fs::{FsArtifactStore, FsStateStore};
pub use memory::{InMemoryArtifactStore, InMemoryStateStore};

use crate::core::{ArtifactRef, StimulusUnit};
use crate::errors::StoreError;
use crate::utils::sha256_hex;
use async_trait::async_trait;

/// Persistence for unit records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads a unit record, or `None` if it was never saved.
    async fn load(&self, id: &str) -> Result<Option<StimulusUnit>, StoreError>;

    /// Atomically replaces the record for `unit.id`.
    async fn save(&self, unit: &StimulusUnit) -> Result<(), StoreError>;

    /// Lists the ids of every saved unit, sorted.
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// Byte storage for generated images and videos.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` for `unit_id` under `name` and returns a digest-bearing
    /// reference.
    async fn put(&self, unit_id: &str, name: &str, bytes: &[u8]) -> Result<ArtifactRef, StoreError>;

    /// Reads an artifact, verifying its digest when the reference has one.
    ///
    /// References without a digest are external files read from disk.
    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError>;
}

/// Checks `bytes` against the digest recorded in `artifact`.
pub(crate) fn verify(artifact: &ArtifactRef, bytes: Vec<u8>) -> Result<Vec<u8>, StoreError> {
    if let Some(expected) = &artifact.sha256 {
        let actual = sha256_hex(&bytes);
        if &actual != expected {
            return Err(StoreError::DigestMismatch {
                location: artifact.location.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(bytes)
}

/// Reads a file this crate did not write.
pub(crate) async fn read_external(location: &str) -> Result<Vec<u8>, StoreError> {
    match tokio::fs::read(location).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StoreError::NotFound(location.to_string()))
        }
        Err(e) => Err(StoreError::io(location, e)),
    }
}

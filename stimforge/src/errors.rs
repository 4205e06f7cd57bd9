//! Error types for the stimulus pipeline.
//!
//! Two layers live here. [`StimforgeError`] is what the crate's public
//! entry points return: configuration problems, store failures, illegal
//! state transitions. [`StageError`] is the per-stage failure taxonomy
//! (derivation, consistency, generation, transient) that the orchestrator
//! records on a unit instead of propagating.

use crate::core::{Anchor, FailureKind, FailureReason, StageId};
use std::time::Duration;
use thiserror::Error;

/// The main error type for stimforge operations.
#[derive(Debug, Error)]
pub enum StimforgeError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The state or artifact store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A stage status transition was rejected.
    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// No record exists for the requested unit.
    #[error("Unknown stimulus unit: {0}")]
    UnknownUnit(String),

    /// An operator re-run was refused.
    #[error("Rerun refused for unit '{unit}' stage '{stage}': {reason}")]
    RerunRefused {
        /// The unit identifier.
        unit: String,
        /// The stage that was requested.
        stage: StageId,
        /// Why the request was refused.
        reason: String,
    },

    /// The batch was cancelled.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A unit driver task panicked or was aborted.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the state and artifact stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure at a specific path.
    #[error("Store I/O error at {path}: {source}")]
    Io {
        /// The path being read or written.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A persisted record could not be decoded or encoded.
    #[error("Corrupt record at {path}: {message}")]
    Corrupt {
        /// The record location.
        path: String,
        /// Decoder message.
        message: String,
    },

    /// The referenced artifact does not exist.
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// The artifact bytes do not match the recorded digest.
    #[error("Artifact digest mismatch for {location}: expected {expected}, found {actual}")]
    DigestMismatch {
        /// Artifact location.
        location: String,
        /// Digest recorded when the artifact was written.
        expected: String,
        /// Digest of the bytes just read.
        actual: String,
    },
}

impl StoreError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Raised when a stage status change would break the state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The edge is not part of the stage state machine.
    #[error("Illegal transition for stage '{stage}': {from} -> {to}")]
    Illegal {
        /// The stage.
        stage: StageId,
        /// Current status label.
        from: String,
        /// Requested status label.
        to: String,
    },

    /// A predecessor has not reached `Done`.
    #[error("Stage '{stage}' cannot become {to}: predecessor '{predecessor}' is {status}")]
    PredecessorNotDone {
        /// The stage being moved.
        stage: StageId,
        /// Requested status label.
        to: String,
        /// The blocking predecessor.
        predecessor: StageId,
        /// The predecessor's current status label.
        status: String,
    },
}

/// Errors that can occur while deriving descriptions.
#[derive(Debug, Clone, Error)]
pub enum DerivationError {
    /// The source image could not be read.
    #[error("Source image unavailable: {0}")]
    SourceUnavailable(String),

    /// The VLM returned nothing usable.
    #[error("VLM returned empty output for {anchor}")]
    EmptyOutput {
        /// The anchor being described.
        anchor: Anchor,
    },

    /// The VLM refused the content.
    #[error("VLM refused to describe {anchor}: {message}")]
    Refused {
        /// The anchor being described.
        anchor: Anchor,
        /// Refusal text, if any.
        message: String,
    },

    /// The description did not match the expected schema.
    #[error("Description for {anchor} failed schema check: {message}")]
    Schema {
        /// The anchor being described.
        anchor: Anchor,
        /// What was wrong.
        message: String,
    },

    /// The description leaks identity-revealing content.
    #[error("Description for {anchor} contains identity marker '{marker}'")]
    IdentityMarker {
        /// The anchor being described.
        anchor: Anchor,
        /// The matched text.
        marker: String,
    },

    /// The VLM service failed with a non-transient error.
    #[error("VLM service error: {0}")]
    Service(String),
}

/// Pixel-lock and mask-boundary violations.
#[derive(Debug, Clone, Error)]
pub enum ConsistencyError {
    /// Out-of-mask pixels drifted beyond tolerance.
    #[error("Out-of-mask difference {difference:.4} for {anchor} exceeds tolerance {tolerance:.4}")]
    PixelLock {
        /// The variant being checked.
        anchor: Anchor,
        /// Measured mean absolute difference in [0, 1].
        difference: f64,
        /// Configured tolerance.
        tolerance: f64,
    },

    /// Two images that must be aligned have different sizes.
    #[error("Dimension mismatch for {what}: expected {expected:?}, found {actual:?}")]
    DimensionMismatch {
        /// What was compared.
        what: String,
        /// Master anchor dimensions.
        expected: (u32, u32),
        /// Offending dimensions.
        actual: (u32, u32),
    },

    /// The ROI mask covers too little or too much of the frame.
    #[error("ROI mask coverage {coverage:.4} outside [{min:.4}, {max:.4}]")]
    MaskCoverage {
        /// Fraction of pixels inside the mask.
        coverage: f64,
        /// Minimum allowed fraction.
        min: f64,
        /// Maximum allowed fraction.
        max: f64,
    },

    /// No mask could be obtained.
    #[error("ROI mask unavailable: {0}")]
    MaskUnavailable(String),

    /// Image bytes could not be decoded.
    #[error("Could not decode {what}: {message}")]
    Decode {
        /// What was being decoded.
        what: String,
        /// Decoder message.
        message: String,
    },
}

/// External generation failures and acceptance-bound violations.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    /// The returned clip is too short or too long.
    #[error("Clip duration {actual:.2}s outside [{min:.2}, {max:.2}]s")]
    DurationOutOfRange {
        /// Reported duration.
        actual: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// The service rejected the request.
    #[error("Generation service rejected request ({status}): {message}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Service message.
        message: String,
    },

    /// The service refused the content.
    #[error("Generation refused by service: {0}")]
    Refused(String),

    /// The response was missing required fields.
    #[error("Generation service returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Failures that are expected to clear up on their own.
#[derive(Debug, Clone, Error)]
pub enum TransientError {
    /// The call exceeded its timeout.
    #[error("External call timed out after {0:?}")]
    Timeout(Duration),

    /// The provider asked us to slow down.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The provider was temporarily unreachable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// What an external service boundary can return.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Retryable failure.
    #[error("{0}")]
    Transient(#[from] TransientError),

    /// Content was refused by the provider.
    #[error("Request refused: {0}")]
    Refused(String),

    /// The provider rejected the request.
    #[error("Request rejected ({status}): {message}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Provider message.
        message: String,
    },

    /// The response could not be understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    /// Maps a service failure onto the generation taxonomy.
    pub fn into_generation(self) -> StageError {
        match self {
            Self::Transient(e) => StageError::Transient(e),
            Self::Refused(message) => GenerationError::Refused(message).into(),
            Self::Rejected { status, message } => {
                GenerationError::Rejected { status, message }.into()
            }
            Self::InvalidResponse(message) => GenerationError::InvalidResponse(message).into(),
        }
    }

    /// Maps a VLM failure onto the derivation taxonomy.
    pub fn into_derivation(self, anchor: Anchor) -> StageError {
        match self {
            Self::Transient(e) => StageError::Transient(e),
            Self::Refused(message) => DerivationError::Refused { anchor, message }.into(),
            other => DerivationError::Service(other.to_string()).into(),
        }
    }
}

/// A failed stage attempt.
#[derive(Debug, Error)]
pub enum StageError {
    /// Description extraction or derivation failed.
    #[error("{0}")]
    Derivation(#[from] DerivationError),

    /// Pixel-lock or mask-boundary violation.
    #[error("{0}")]
    Consistency(#[from] ConsistencyError),

    /// Generation failed or produced out-of-bounds output.
    #[error("{0}")]
    Generation(#[from] GenerationError),

    /// Timeout or rate limiting.
    #[error("{0}")]
    Transient(#[from] TransientError),

    /// Durable storage failed; the run cannot continue safely.
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl StageError {
    /// Returns the persisted failure reason, or `None` for store failures,
    /// which are never recorded on a unit.
    #[must_use]
    pub fn failure_reason(&self) -> Option<FailureReason> {
        let message = self.to_string();
        let (kind, code) = match self {
            Self::Derivation(e) => (
                FailureKind::Derivation,
                match e {
                    DerivationError::SourceUnavailable(_) => "source_unavailable",
                    DerivationError::EmptyOutput { .. } => "empty_output",
                    DerivationError::Refused { .. } => "refused",
                    DerivationError::Schema { .. } => "schema",
                    DerivationError::IdentityMarker { .. } => "identity_marker",
                    DerivationError::Service(_) => "service_error",
                },
            ),
            Self::Consistency(e) => (
                FailureKind::Consistency,
                match e {
                    ConsistencyError::PixelLock { .. } => "pixel_lock",
                    ConsistencyError::DimensionMismatch { .. } => "dimension_mismatch",
                    ConsistencyError::MaskCoverage { .. } => "mask_coverage",
                    ConsistencyError::MaskUnavailable(_) => "mask_unavailable",
                    ConsistencyError::Decode { .. } => "decode",
                },
            ),
            Self::Generation(e) => (
                FailureKind::Generation,
                match e {
                    GenerationError::DurationOutOfRange { .. } => "duration_out_of_range",
                    GenerationError::Rejected { .. } => "rejected",
                    GenerationError::Refused(_) => "refused",
                    GenerationError::InvalidResponse(_) => "invalid_response",
                },
            ),
            Self::Transient(e) => (
                FailureKind::Transient,
                match e {
                    TransientError::Timeout(_) => "timeout",
                    TransientError::RateLimited(_) => "rate_limited",
                    TransientError::Unavailable(_) => "unavailable",
                },
            ),
            Self::Store(_) => return None,
        };
        Some(FailureReason::new(kind, code, message))
    }
}

//! Stage status and failure reason types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad category of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout or rate limit; retried with backoff.
    Transient,
    /// Description extraction or derivation produced invalid output.
    Derivation,
    /// Pixel-lock or mask-boundary violation.
    Consistency,
    /// External service error or output outside acceptance bounds.
    Generation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Derivation => write!(f, "derivation"),
            Self::Consistency => write!(f, "consistency"),
            Self::Generation => write!(f, "generation"),
        }
    }
}

/// How a failed attempt may be retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Same inputs, after a backoff delay.
    Backoff,
    /// Only with adjusted parameters (a new seed).
    Adjusted,
    /// Needs an operator.
    Never,
}

/// Why a stage attempt failed. Persisted on the unit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Failure category.
    pub kind: FailureKind,
    /// Machine-readable code, e.g. `duration_out_of_range`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl FailureReason {
    /// Creates a new failure reason.
    #[must_use]
    pub fn new(kind: FailureKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Classifies how this failure may be retried.
    ///
    /// Mask problems need a human to supply or fix the mask, so they are
    /// never retried even though they are consistency failures.
    #[must_use]
    pub fn retry_class(&self) -> RetryClass {
        match self.kind {
            FailureKind::Transient => RetryClass::Backoff,
            FailureKind::Consistency => match self.code.as_str() {
                "pixel_lock" | "decode" => RetryClass::Adjusted,
                _ => RetryClass::Never,
            },
            FailureKind::Generation if self.code == "duration_out_of_range" => {
                RetryClass::Adjusted
            }
            FailureKind::Generation | FailureKind::Derivation => RetryClass::Never,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.code)
    }
}

/// The execution status of one stage of a stimulus unit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for predecessors or for its turn.
    #[default]
    Pending,
    /// An external call for this stage is in flight.
    Running,
    /// Completed; terminal.
    Done,
    /// The last attempt failed.
    Failed(FailureReason),
    /// Excluded after the retry budget ran out; terminal.
    Skipped,
}

impl StageStatus {
    /// Short label used in logs and errors.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed(_) => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }

    /// Returns true if the stage completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Returns the failure reason if the stage is `Failed`.
    #[must_use]
    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Returns true if `next` is an edge of the stage state machine.
    ///
    /// `Running -> Pending` only happens when recovering a record that an
    /// interrupted process left mid-call.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Skipped)
                | (Self::Running, Self::Done | Self::Failed(_) | Self::Pending)
                | (Self::Failed(_), Self::Pending | Self::Skipped)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed({reason})"),
            other => write!(f, "{}", other.label()),
        }
    }
}

//! Batch execution.
//!
//! This module provides:
//! - The per-unit stage state machine and the batch driver
//! - The shared admission gate for external calls
//! - Retry classification and backoff
//! - Dry-run planning and the end-of-batch report

mod admission;
mod orchestrator;
mod plan;
mod report;
mod retry;

#[cfg(test)]
mod integration_tests;

pub use admission::AdmissionGate;
pub use orchestrator::Orchestrator;
pub use plan::{plan_batch, plan_unit, BatchPlan, StagePlan, UnitPlan};
pub use report::{BatchReport, UnitOutcome};
pub use retry::{
    decide, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision, RetryState,
};

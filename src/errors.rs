//! Typed error hierarchy.
//!
//! - `RunnerError`: infrastructure failures of the process runner that happen
//!   before a job exists to record them on
//! - `OrchestratorError`: pipeline registration and phase failures
//!
//! HTTP mapping lives with the router in `api::ApiError`.

use pentest_common::Phase;
use thiserror::Error;

/// Errors the process runner returns instead of a failed job outcome.
///
/// Execution failures (spawn, I/O, analysis bookkeeping) never surface here;
/// they become `ToolOutcome::Failed`.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to record tool_start event: {0:#}")]
    StartEvent(#[source] anyhow::Error),

    #[error("Failed to create tool job: {0:#}")]
    JobCreate(#[source] anyhow::Error),
}

/// Errors from the phase orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("A pentest is already running for target {target_id}")]
    AlreadyRunning { target_id: i64 },

    #[error("Target {target_id} not found")]
    TargetNotFound { target_id: i64 },

    #[error("Phase {phase} failed: {source:#}")]
    Phase {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error("Store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

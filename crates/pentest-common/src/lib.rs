//! Domain types shared between the store, the runtime and the control API.

pub mod models;

pub use models::{
    Event, EventKind, Finding, JobStatus, NewFinding, Phase, Severity, Target, TargetStatus,
    ToolJob,
};

/// Current UTC time as an RFC 3339 string, the timestamp format used in every table.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

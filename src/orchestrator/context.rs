use pentest_common::{Phase, Target};
use serde::Serialize;
use serde_json::Value;

use crate::agents::PhaseResult;

/// Mutable state of one pipeline run, owned by its orchestrator task.
///
/// Agents receive it by shared reference only; results flow back through
/// [`RunContext::merge_result`] on the orchestrator side.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub target_id: i64,
    pub target_name: String,
    pub target_url: String,
    /// Phase name → accumulated result object.
    pub results: serde_json::Map<String, Value>,
    pub exploit_approved: bool,
}

impl RunContext {
    pub fn new(target: &Target) -> Self {
        Self {
            target_id: target.id,
            target_name: target.name.clone(),
            target_url: target.target_url.clone(),
            results: serde_json::Map::new(),
            exploit_approved: false,
        }
    }

    /// Merge `result` into `results[phase]`. Keys from a later call win.
    pub fn merge_result(&mut self, phase: Phase, result: PhaseResult) {
        let slot = self
            .results
            .entry(phase.as_str())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        match slot {
            Value::Object(existing) => existing.extend(result),
            other => *other = Value::Object(result),
        }
    }

    pub fn result(&self, phase: Phase) -> Option<&PhaseResult> {
        self.results.get(phase.as_str()).and_then(Value::as_object)
    }
}

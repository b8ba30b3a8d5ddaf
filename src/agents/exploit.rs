use anyhow::Result;
use async_trait::async_trait;
use pentest_common::{EventKind, NewFinding, Phase, Severity};
use serde_json::json;

use super::{AgentContext, PhaseAgent, PhaseResult, TargetEndpoint, ToolSummary, object};
use crate::config::ToolCommand;
use crate::orchestrator::RunContext;
use crate::runner::truncate_chars;

/// Status value that tells the orchestrator to hold for human approval.
pub const AWAITING_APPROVAL: &str = "awaiting_approval";

/// Validates candidate findings by running exploitation tools, but only once
/// the run carries `exploit_approved`.
pub struct ExploitAgent {
    tools: Vec<ToolCommand>,
}

impl ExploitAgent {
    pub fn new(tools: Vec<ToolCommand>) -> Self {
        Self { tools }
    }
}

/// Whether a phase result asks the orchestrator to wait for approval.
pub fn is_awaiting_approval(result: &PhaseResult) -> bool {
    result.get("status").and_then(|s| s.as_str()) == Some(AWAITING_APPROVAL)
}

fn confirms_exploit(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("is vulnerable") || lower.contains("injectable")
}

#[async_trait]
impl PhaseAgent for ExploitAgent {
    fn phase(&self) -> Phase {
        Phase::Exploit
    }

    async fn run(&self, ctx: &AgentContext, run: &RunContext) -> Result<PhaseResult> {
        let candidates: Vec<_> = ctx
            .findings()
            .await?
            .into_iter()
            .filter(|f| f.severity >= Severity::Medium)
            .map(|f| {
                json!({
                    "id": f.id,
                    "type": f.finding_type,
                    "title": f.title,
                    "severity": f.severity,
                })
            })
            .collect();

        if !run.exploit_approved {
            ctx.log(
                EventKind::Decision,
                format!(
                    "Exploit validation requires human approval. {} candidate findings queued.",
                    candidates.len()
                ),
            )
            .await?;
            return Ok(object(json!({
                "status": AWAITING_APPROVAL,
                "candidates": candidates,
            })));
        }

        ctx.log(
            EventKind::Decision,
            format!(
                "Exploit validation approved. Validating {} candidate findings.",
                candidates.len()
            ),
        )
        .await?;

        let mut endpoint = TargetEndpoint::parse(&run.target_url)?;
        if let Some(base_url) = run
            .result(Phase::Recon)
            .and_then(|recon| recon.get("base_url"))
            .and_then(|v| v.as_str())
        {
            endpoint.base_url = base_url.to_string();
        }

        let mut validated = Vec::new();
        let mut tool_summaries = Vec::with_capacity(self.tools.len());
        for tool in &self.tools {
            let outcome = ctx.run_tool(tool, &endpoint).await?;
            tool_summaries.push(ToolSummary::new(&tool.name, &outcome));
            if !outcome.is_completed() {
                continue;
            }
            let confirmed: Vec<&str> = outcome
                .transcript()
                .lines()
                .map(str::trim)
                .filter(|l| confirms_exploit(l))
                .collect();
            if confirmed.is_empty() {
                continue;
            }
            let stored = ctx
                .add_finding(
                    NewFinding::new(
                        "sqli",
                        format!("Confirmed exploitable injection ({})", tool.name),
                        Severity::Critical,
                    )
                    .with_job(outcome.job_id())
                    .with_description(truncate_chars(outcome.analysis(), 2000))
                    .with_evidence(truncate_chars(&confirmed.join("\n"), 3000))
                    .validated(),
                )
                .await?;
            validated.push(json!({
                "id": stored.id,
                "title": stored.title,
                "tool": tool.name,
            }));
        }

        ctx.log(
            EventKind::Finding,
            format!(
                "Exploit validation complete. {} findings confirmed.",
                validated.len()
            ),
        )
        .await?;

        Ok(object(json!({
            "status": "executed",
            "validated": validated,
            "tools": tool_summaries,
        })))
    }
}

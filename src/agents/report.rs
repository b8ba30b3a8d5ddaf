use anyhow::Result;
use async_trait::async_trait;
use pentest_common::{EventKind, Finding, Phase, Severity};
use serde_json::json;

use super::{AgentContext, PhaseAgent, PhaseResult, object};
use crate::orchestrator::RunContext;

const MAX_PROMPT_FINDINGS: usize = 40;

/// Scores the accumulated findings and asks the analyzer for an executive summary.
pub struct ReportAgent;

/// Sum of severity weights, capped at 100.
pub fn risk_score(findings: &[Finding]) -> f64 {
    let total: u32 = findings.iter().map(|f| f.severity.risk_weight()).sum();
    f64::from(total.min(100))
}

fn severity_counts(findings: &[Finding]) -> serde_json::Map<String, serde_json::Value> {
    Severity::ALL
        .iter()
        .map(|sev| {
            let count = findings.iter().filter(|f| f.severity == *sev).count();
            (sev.as_str().to_string(), json!(count))
        })
        .collect()
}

#[async_trait]
impl PhaseAgent for ReportAgent {
    fn phase(&self) -> Phase {
        Phase::Report
    }

    async fn run(&self, ctx: &AgentContext, run: &RunContext) -> Result<PhaseResult> {
        ctx.log(EventKind::Thinking, "Generating penetration test report...")
            .await?;

        let mut findings = ctx.findings().await?;
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));
        let score = risk_score(&findings);
        let counts = severity_counts(&findings);
        let validated = findings.iter().filter(|f| f.is_validated).count();

        let listing: Vec<String> = findings
            .iter()
            .take(MAX_PROMPT_FINDINGS)
            .map(|f| {
                format!(
                    "- [{}]{} {}",
                    f.severity,
                    if f.is_validated { " (validated)" } else { "" },
                    f.title
                )
            })
            .collect();
        let recon_summary = run
            .result(Phase::Recon)
            .and_then(|r| r.get("summary"))
            .and_then(|s| s.as_str())
            .unwrap_or("");
        let prompt = format!(
            "You are a penetration tester writing the executive summary of a report for {}.\n\n\
             Risk score: {}/100\n\
             Findings ({} total, {} validated):\n{}\n\n\
             Reconnaissance notes:\n{}\n\n\
             Write a short executive summary covering overall risk, the most serious issues, \
             and prioritized remediation steps.",
            run.target_url,
            score,
            findings.len(),
            validated,
            listing.join("\n"),
            recon_summary,
        );
        let summary = ctx.ask_llm(&prompt).await?;
        ctx.log(EventKind::Decision, "Executive summary generated")
            .await?;
        ctx.log(
            EventKind::Finding,
            format!("Report generated. Risk score: {}/100", score),
        )
        .await?;

        Ok(object(json!({
            "risk_score": score,
            "severity_counts": counts,
            "total_findings": findings.len(),
            "validated_findings": validated,
            "summary": summary,
        })))
    }
}

use anyhow::Result;
use async_trait::async_trait;
use pentest_common::{EventKind, NewFinding, Phase, Severity};
use serde_json::json;

use super::{AgentContext, PhaseAgent, PhaseResult, TargetEndpoint, ToolSummary, object};
use crate::config::ToolCommand;
use crate::orchestrator::RunContext;
use crate::runner::truncate_chars;

const MAX_FINDINGS_PER_TOOL: usize = 30;
const MAX_TITLE_CHARS: usize = 200;

/// Runs scanners against the surface recon found and turns their output into findings.
pub struct VulnScanAgent {
    tools: Vec<ToolCommand>,
}

impl VulnScanAgent {
    pub fn new(tools: Vec<ToolCommand>) -> Self {
        Self { tools }
    }
}

/// A scanner line promoted to a finding.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannerHit {
    pub finding_type: &'static str,
    pub title: String,
    pub severity: Severity,
    pub line: String,
}

/// Pick finding-worthy lines out of scanner output.
pub fn parse_scanner_output(transcript: &str) -> Vec<ScannerHit> {
    let mut hits = Vec::new();
    for line in transcript.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('-') {
            continue;
        }
        let lower = trimmed.to_lowercase();

        if lower.contains("is vulnerable") || lower.contains("injectable") {
            hits.push(ScannerHit {
                finding_type: "sqli",
                title: truncate_chars(trimmed, MAX_TITLE_CHARS).to_string(),
                severity: Severity::Critical,
                line: trimmed.to_string(),
            });
        } else if trimmed.contains("+ ") || trimmed.contains("OSVDB") || trimmed.contains("VULNERABLE") {
            let (finding_type, severity) = classify(&lower);
            let title = trimmed.strip_prefix("+ ").unwrap_or(trimmed);
            hits.push(ScannerHit {
                finding_type,
                title: truncate_chars(title, MAX_TITLE_CHARS).to_string(),
                severity,
                line: trimmed.to_string(),
            });
        }
        if hits.len() >= MAX_FINDINGS_PER_TOOL {
            break;
        }
    }
    hits
}

fn classify(lower: &str) -> (&'static str, Severity) {
    if lower.contains("sql") || lower.contains("injection") {
        ("sqli", Severity::High)
    } else if lower.contains("xss") || lower.contains("cross-site") {
        ("xss", Severity::High)
    } else {
        ("misconfig", Severity::Medium)
    }
}

#[async_trait]
impl PhaseAgent for VulnScanAgent {
    fn phase(&self) -> Phase {
        Phase::VulnScan
    }

    async fn run(&self, ctx: &AgentContext, run: &RunContext) -> Result<PhaseResult> {
        let mut endpoint = TargetEndpoint::parse(&run.target_url)?;
        if let Some(base_url) = run
            .result(Phase::Recon)
            .and_then(|recon| recon.get("base_url"))
            .and_then(|v| v.as_str())
        {
            endpoint.base_url = base_url.to_string();
        }
        ctx.log(
            EventKind::Thinking,
            format!("Starting vulnerability assessment on {}", endpoint.base_url),
        )
        .await?;

        let mut vulnerabilities = Vec::new();
        let mut tool_summaries = Vec::with_capacity(self.tools.len());
        for tool in &self.tools {
            ctx.log(EventKind::Decision, format!("Running {} scan", tool.name))
                .await?;
            let outcome = ctx.run_tool(tool, &endpoint).await?;
            tool_summaries.push(ToolSummary::new(&tool.name, &outcome));
            if !outcome.is_completed() {
                continue;
            }

            let hits = parse_scanner_output(outcome.transcript());
            ctx.log(
                EventKind::Thinking,
                format!("Parsed {} findings from {}", hits.len(), tool.name),
            )
            .await?;
            for hit in hits {
                let stored = ctx
                    .add_finding(
                        NewFinding::new(hit.finding_type, hit.title, hit.severity)
                            .with_job(outcome.job_id())
                            .with_description(format!("Reported by {}", tool.name))
                            .with_evidence(hit.line),
                    )
                    .await?;
                vulnerabilities.push(json!({
                    "id": stored.id,
                    "type": stored.finding_type,
                    "title": stored.title,
                    "severity": stored.severity,
                    "tool": tool.name,
                }));
            }
        }

        let analyses: Vec<String> = tool_summaries
            .iter()
            .map(|s| format!("{}: {}", s.tool, truncate_chars(&s.analysis, 1500)))
            .collect();
        let prompt = format!(
            "You are a penetration tester. Summarize the vulnerability assessment of {}.\n\n\
             {} potential vulnerabilities were parsed from scanner output.\n\n\
             Tool analyses:\n{}\n\n\
             Prioritize the findings by exploitability and impact and suggest which ones to validate.",
            endpoint.base_url,
            vulnerabilities.len(),
            analyses.join("\n\n"),
        );
        let summary = ctx.ask_llm(&prompt).await?;
        ctx.log(
            EventKind::Decision,
            format!("Vulnerability Assessment Summary:\n{}", summary),
        )
        .await?;

        Ok(object(json!({
            "base_url": endpoint.base_url,
            "vulnerabilities": vulnerabilities,
            "tools": tool_summaries,
            "summary": summary,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::runtime_with_target;

    const NIKTO_SAMPLE: &str = "\
- Nikto v2.5.0
---------------------------------------------------------------------------
+ Target IP:          10.0.0.5
# comment line
+ /login.php: Cookie PHPSESSID created without the httponly flag.
+ /search.php?q=<script>: Cross-site scripting (XSS) reflected.
+ /item.php?id=1: SQL injection possible in id parameter.
OSVDB-3092: /admin/: This might be interesting.

";

    #[test]
    fn test_parse_nikto_lines() {
        let hits = parse_scanner_output(NIKTO_SAMPLE);
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].title, "Target IP:          10.0.0.5");
        assert_eq!(hits[0].severity, Severity::Medium);
        assert_eq!(hits[1].finding_type, "misconfig");
        assert_eq!(hits[2].finding_type, "xss");
        assert_eq!(hits[2].severity, Severity::High);
        assert_eq!(hits[3].finding_type, "sqli");
        assert_eq!(hits[3].severity, Severity::High);
        assert_eq!(hits[4].title, "OSVDB-3092: /admin/: This might be interesting.");
    }

    #[test]
    fn test_parse_confirmed_injection_is_critical() {
        let hits = parse_scanner_output("[INFO] GET parameter 'id' is vulnerable. Do you want to keep testing?");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].severity, Severity::Critical);
        assert_eq!(hits[0].finding_type, "sqli");

        let hits = parse_scanner_output("parameter 'q' appears to be 'MySQL >= 5.0 AND error-based' INJECTABLE");
        assert_eq!(hits[0].severity, Severity::Critical);
    }

    #[test]
    fn test_parse_caps_findings_and_title_length() {
        let noisy: String = (0..50).map(|i| format!("+ finding {}\n", i)).collect();
        assert_eq!(parse_scanner_output(&noisy).len(), MAX_FINDINGS_PER_TOOL);

        let long = format!("+ {}", "x".repeat(500));
        let hits = parse_scanner_output(&long);
        assert_eq!(hits[0].title.chars().count(), MAX_TITLE_CHARS);
        assert_eq!(hits[0].line.len(), 502);
    }

    #[test]
    fn test_parse_ignores_plain_output() {
        assert!(parse_scanner_output("Starting scan\nScan done\n").is_empty());
    }

    #[tokio::test]
    async fn test_vuln_scan_uses_recon_base_url_and_stores_findings() {
        let (runtime, _, target) = runtime_with_target("http://10.0.0.5/app");
        let agent = VulnScanAgent::new(vec![ToolCommand::new(
            "nikto",
            "echo '+ /item.php: SQL injection in id' # {base_url}",
            10,
        )]);
        let mut run = RunContext::new(&target);
        run.merge_result(
            Phase::Recon,
            object(json!({"base_url": "http://10.0.0.5:8080"})),
        );
        let ctx = runtime.agent_context(target.id, Phase::VulnScan);

        let result = agent.run(&ctx, &run).await.unwrap();
        assert_eq!(result["base_url"], "http://10.0.0.5:8080");
        let vulns = result["vulnerabilities"].as_array().unwrap();
        assert_eq!(vulns.len(), 1);
        assert_eq!(vulns[0]["severity"], "high");
        assert_eq!(vulns[0]["tool"], "nikto");

        let findings = ctx.findings().await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].title, "/item.php: SQL injection in id");
        assert!(findings[0].job_id.is_some());

        let jobs = runtime
            .db
            .call(move |db| db.list_tool_jobs(target.id))
            .await
            .unwrap();
        assert!(jobs[0].command.ends_with("# http://10.0.0.5:8080"));
    }

    #[tokio::test]
    async fn test_vuln_scan_skips_failed_tools() {
        let (runtime, _, target) = runtime_with_target("http://10.0.0.5");
        let agent = VulnScanAgent::new(vec![ToolCommand::new("nikto", "echo '+ x'", 10)]);
        let cfg = crate::config::RunnerConfig {
            shell: "/nonexistent/shell".to_string(),
            ..Default::default()
        };
        let runtime = crate::runtime::Runtime::new(runtime.db.clone(), runtime.analyzer.clone(), &cfg);
        let ctx = runtime.agent_context(target.id, Phase::VulnScan);

        let result = agent.run(&ctx, &RunContext::new(&target)).await.unwrap();
        assert!(result["vulnerabilities"].as_array().unwrap().is_empty());
        assert_eq!(result["tools"][0]["status"], "failed");
    }
}

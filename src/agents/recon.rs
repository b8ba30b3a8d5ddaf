use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use pentest_common::{EventKind, NewFinding, Phase, Severity};
use regex::Regex;
use serde_json::json;

use super::{AgentContext, PhaseAgent, PhaseResult, TargetEndpoint, ToolSummary, object};
use crate::config::ToolCommand;
use crate::orchestrator::RunContext;
use crate::runner::truncate_chars;

/// `80/tcp   open  http` style lines from nmap's normal output.
static OPEN_PORT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,5}/(?:tcp|udp))\s+open\b").unwrap());

/// Maps the attack surface: ports, technologies, WAF presence, reachable paths.
pub struct ReconAgent {
    tools: Vec<ToolCommand>,
}

impl ReconAgent {
    pub fn new(tools: Vec<ToolCommand>) -> Self {
        Self { tools }
    }
}

/// Facts scraped from recon transcripts.
#[derive(Debug, Default, PartialEq)]
pub struct Surface {
    pub open_ports: Vec<String>,
    pub port_lines: Vec<String>,
    pub directories: Vec<String>,
    pub waf_detected: Option<bool>,
}

impl Surface {
    pub fn absorb(&mut self, transcript: &str) {
        for line in transcript.lines() {
            if let Some(caps) = OPEN_PORT_REGEX.captures(line) {
                let port = caps[1].to_string();
                if !self.open_ports.contains(&port) {
                    self.open_ports.push(port);
                    self.port_lines.push(line.trim().to_string());
                }
                continue;
            }
            if line.contains("No WAF") {
                self.waf_detected = Some(false);
            } else if line.contains("is behind") {
                self.waf_detected = Some(true);
            }
            let trimmed = line.trim();
            if trimmed.starts_with('/') || trimmed.contains("(Status:") {
                self.directories.push(trimmed.to_string());
            }
        }
    }
}

#[async_trait]
impl PhaseAgent for ReconAgent {
    fn phase(&self) -> Phase {
        Phase::Recon
    }

    async fn run(&self, ctx: &AgentContext, run: &RunContext) -> Result<PhaseResult> {
        let endpoint = TargetEndpoint::parse(&run.target_url)?;
        ctx.log(
            EventKind::Thinking,
            format!("Starting reconnaissance on {}", run.target_url),
        )
        .await?;

        let mut surface = Surface::default();
        let mut tool_summaries = Vec::with_capacity(self.tools.len());
        let mut technology_notes = String::new();
        for (step, tool) in self.tools.iter().enumerate() {
            ctx.log(
                EventKind::Decision,
                format!("Step {}: running {}", step + 1, tool.name),
            )
            .await?;
            let outcome = ctx.run_tool(tool, &endpoint).await?;
            if outcome.is_completed() {
                surface.absorb(outcome.transcript());
                if tool.name == "whatweb" {
                    technology_notes = truncate_chars(outcome.transcript(), 2000).to_string();
                }
            }
            tool_summaries.push(ToolSummary::new(&tool.name, &outcome));
        }

        let prompt = format!(
            "You are a penetration tester. Summarize the reconnaissance findings for {}.\n\n\
             Open ports: {:?}\n\
             WAF detected: {}\n\
             Technology fingerprint: {}\n\
             Directories found: {:?}\n\n\
             List the key technologies, potential attack surface, and recommended vulnerability checks.",
            run.target_url,
            surface.open_ports,
            surface
                .waf_detected
                .map(|w| w.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            technology_notes,
            surface.directories.iter().take(30).collect::<Vec<_>>(),
        );
        let summary = ctx.ask_llm(&prompt).await?;
        ctx.log(EventKind::Decision, format!("Recon Summary:\n{}", summary))
            .await?;

        if !surface.open_ports.is_empty() {
            let shown: Vec<&str> = surface.open_ports.iter().take(10).map(String::as_str).collect();
            ctx.add_finding(
                NewFinding::new(
                    "info_disclosure",
                    format!("Open ports discovered: {}", shown.join(", ")),
                    Severity::Info,
                )
                .with_description(format!(
                    "Port scan revealed {} open ports on {}.",
                    surface.open_ports.len(),
                    endpoint.host
                ))
                .with_evidence(truncate_chars(&surface.port_lines.join("\n"), 3000)),
            )
            .await?;
        }
        if surface.waf_detected == Some(false) {
            ctx.add_finding(
                NewFinding::new("misconfig", "No Web Application Firewall detected", Severity::Low)
                    .with_description(
                        "No WAF was detected in front of the application, leaving it more \
                         exposed to web attacks.",
                    ),
            )
            .await?;
        }

        ctx.log(
            EventKind::Finding,
            format!(
                "Recon complete. Found {} open ports, {} directories.",
                surface.open_ports.len(),
                surface.directories.len()
            ),
        )
        .await?;

        Ok(object(json!({
            "host": endpoint.host,
            "port": endpoint.port,
            "base_url": endpoint.base_url,
            "open_ports": surface.open_ports,
            "directories": surface.directories,
            "waf_detected": surface.waf_detected,
            "tools": tool_summaries,
            "summary": summary,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::runtime_with_target;

    const NMAP_SAMPLE: &str = "\
Starting Nmap 7.94
PORT     STATE  SERVICE VERSION
22/tcp   open   ssh     OpenSSH 9.6
80/tcp   open   http    nginx 1.25
443/tcp  closed https
8080/tcp open   http-proxy
Nmap done: 1 IP address (1 host up)";

    #[test]
    fn test_surface_parses_open_ports() {
        let mut surface = Surface::default();
        surface.absorb(NMAP_SAMPLE);
        assert_eq!(surface.open_ports, vec!["22/tcp", "80/tcp", "8080/tcp"]);
        assert_eq!(surface.port_lines[1], "80/tcp   open   http    nginx 1.25");
        assert!(surface.directories.is_empty());
        assert_eq!(surface.waf_detected, None);
    }

    #[test]
    fn test_surface_dedups_ports_across_tools() {
        let mut surface = Surface::default();
        surface.absorb("80/tcp open http");
        surface.absorb("80/tcp open http\n3306/tcp open mysql");
        assert_eq!(surface.open_ports, vec!["80/tcp", "3306/tcp"]);
    }

    #[test]
    fn test_surface_detects_waf_and_directories() {
        let mut surface = Surface::default();
        surface.absorb("[-] No WAF detected by the generic detection");
        surface.absorb("/admin (Status: 301) [Size: 0]\n/.git/HEAD (Status: 200)");
        assert_eq!(surface.waf_detected, Some(false));
        assert_eq!(surface.directories.len(), 2);

        let mut behind = Surface::default();
        behind.absorb("[+] The site http://t is behind Cloudflare (Cloudflare Inc.) WAF.");
        assert_eq!(behind.waf_detected, Some(true));
    }

    #[tokio::test]
    async fn test_recon_runs_tools_and_records_findings() {
        let (runtime, analyzer, target) = runtime_with_target("http://127.0.0.1:8080/app");
        let agent = ReconAgent::new(vec![
            ToolCommand::new("nmap", "printf '22/tcp open ssh\\n80/tcp open http\\n' # {host}", 10),
            ToolCommand::new("wafw00f", "echo 'No WAF detected' {base_url}", 10),
        ]);
        let ctx = runtime.agent_context(target.id, Phase::Recon);
        let run = RunContext::new(&target);

        let result = agent.run(&ctx, &run).await.unwrap();
        assert_eq!(result["host"], "127.0.0.1");
        assert_eq!(result["port"], 8080);
        assert_eq!(result["base_url"], "http://127.0.0.1:8080");
        assert_eq!(result["open_ports"], json!(["22/tcp", "80/tcp"]));
        assert_eq!(result["waf_detected"], false);
        assert_eq!(result["summary"], "canned analysis");
        assert_eq!(result["tools"].as_array().unwrap().len(), 2);

        let findings = ctx.findings().await.unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].title, "Open ports discovered: 22/tcp, 80/tcp");
        assert_eq!(findings[0].severity, Severity::Info);
        assert_eq!(findings[1].severity, Severity::Low);

        // One analysis per tool plus the recon summary.
        assert_eq!(analyzer.prompts().len(), 3);
        let jobs = runtime
            .db
            .call(move |db| db.list_tool_jobs(target.id))
            .await
            .unwrap();
        assert_eq!(jobs[0].command, "printf '22/tcp open ssh\\n80/tcp open http\\n' # 127.0.0.1");
        assert_eq!(jobs[1].command, "echo 'No WAF detected' http://127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_recon_rejects_unparseable_target() {
        let (runtime, _, target) = runtime_with_target("http://");
        let agent = ReconAgent::new(vec![]);
        let ctx = runtime.agent_context(target.id, Phase::Recon);
        assert!(agent.run(&ctx, &RunContext::new(&target)).await.is_err());
    }
}

//! Phase agents: the per-phase logic the orchestrator sequences.
//!
//! Agents never spawn processes or touch the live channel directly. Every
//! side effect goes through the [`AgentContext`] handed to them.

pub mod exploit;
pub mod recon;
pub mod report;
pub mod vuln_scan;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pentest_common::{Event, EventKind, Finding, NewFinding, Phase};
use serde::Serialize;

use crate::config::{ToolCommand, ToolsConfig};
use crate::db::DbHandle;
use crate::llm::{self, Analyzer};
use crate::orchestrator::RunContext;
use crate::runner::{ToolOutcome, ToolRunner};
use crate::sink::EventSink;

pub use exploit::ExploitAgent;
pub use recon::ReconAgent;
pub use report::ReportAgent;
pub use vuln_scan::VulnScanAgent;

/// JSON object an agent returns; merged into `RunContext.results[phase]`.
pub type PhaseResult = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait PhaseAgent: Send + Sync {
    fn phase(&self) -> Phase;

    /// Execute the phase against a read-only snapshot of the run.
    ///
    /// May be invoked more than once per run (the exploit phase resumes after
    /// approval) and may create new jobs and events on every call.
    async fn run(&self, ctx: &AgentContext, run: &RunContext) -> Result<PhaseResult>;
}

/// The four agents of one pipeline, one per phase.
#[derive(Clone)]
pub struct PhaseAgents {
    pub recon: Arc<dyn PhaseAgent>,
    pub vuln_scan: Arc<dyn PhaseAgent>,
    pub exploit: Arc<dyn PhaseAgent>,
    pub report: Arc<dyn PhaseAgent>,
}

impl PhaseAgents {
    /// Reference agents driven by the configured tool templates.
    pub fn standard(tools: &ToolsConfig) -> Self {
        Self {
            recon: Arc::new(ReconAgent::new(tools.recon.clone())),
            vuln_scan: Arc::new(VulnScanAgent::new(tools.vuln_scan.clone())),
            exploit: Arc::new(ExploitAgent::new(tools.exploit.clone())),
            report: Arc::new(ReportAgent),
        }
    }

    pub fn get(&self, phase: Phase) -> &Arc<dyn PhaseAgent> {
        match phase {
            Phase::Recon => &self.recon,
            Phase::VulnScan => &self.vuln_scan,
            Phase::Exploit => &self.exploit,
            Phase::Report => &self.report,
        }
    }
}

// ── Agent context ────────────────────────────────────────────────────

/// Handles an agent may use while running one phase for one target.
#[derive(Clone)]
pub struct AgentContext {
    target_id: i64,
    phase: Phase,
    db: DbHandle,
    sink: Arc<EventSink>,
    runner: Arc<ToolRunner>,
    analyzer: Arc<dyn Analyzer>,
    default_timeout_secs: u64,
}

impl AgentContext {
    pub fn new(
        target_id: i64,
        phase: Phase,
        db: DbHandle,
        sink: Arc<EventSink>,
        runner: Arc<ToolRunner>,
        analyzer: Arc<dyn Analyzer>,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            target_id,
            phase,
            db,
            sink,
            runner,
            analyzer,
            default_timeout_secs,
        }
    }

    pub fn target_id(&self) -> i64 {
        self.target_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub async fn log(&self, kind: EventKind, message: impl Into<String>) -> Result<Event> {
        self.sink
            .record(self.target_id, self.phase, kind, message, None)
            .await
    }

    pub async fn ask_llm(&self, prompt: &str) -> Result<String> {
        llm::ask_llm(
            self.analyzer.as_ref(),
            &self.sink,
            self.target_id,
            self.phase,
            prompt,
        )
        .await
    }

    /// Render a tool template against `endpoint` and run it.
    pub async fn run_tool(&self, tool: &ToolCommand, endpoint: &TargetEndpoint) -> Result<ToolOutcome> {
        let command = endpoint.render(&tool.command)?;
        let timeout = tool.timeout(self.default_timeout_secs);
        self.runner
            .execute(self.target_id, self.phase, &tool.name, &command, timeout)
            .await
            .with_context(|| format!("Failed to start {}", tool.name))
    }

    /// Store a finding and announce it as a `finding` event.
    pub async fn add_finding(&self, finding: NewFinding) -> Result<Finding> {
        let target_id = self.target_id;
        let stored = self
            .db
            .call(move |db| db.create_finding(target_id, &finding))
            .await?;
        self.sink
            .record(
                self.target_id,
                self.phase,
                EventKind::Finding,
                format!("[{}] {}", stored.severity, stored.title),
                stored.job_id,
            )
            .await?;
        Ok(stored)
    }

    pub async fn findings(&self) -> Result<Vec<Finding>> {
        let target_id = self.target_id;
        self.db.call(move |db| db.list_findings(target_id)).await
    }
}

/// Unwrap a `json!({...})` literal into a phase result object.
pub fn object(value: serde_json::Value) -> PhaseResult {
    match value {
        serde_json::Value::Object(map) => map,
        _ => PhaseResult::new(),
    }
}

/// Per-tool summary stored in phase results.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub tool: String,
    pub job_id: i64,
    pub status: &'static str,
    pub timed_out: bool,
    pub analysis: String,
}

impl ToolSummary {
    pub fn new(tool: &str, outcome: &ToolOutcome) -> Self {
        Self {
            tool: tool.to_string(),
            job_id: outcome.job_id(),
            status: if outcome.is_completed() { "completed" } else { "failed" },
            timed_out: outcome.timed_out(),
            analysis: outcome.analysis().to_string(),
        }
    }
}

// ── Target endpoint and command templates ────────────────────────────

/// Connection details derived from a target URL, substituted into tool templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetEndpoint {
    pub target_url: String,
    pub host: String,
    pub port: u16,
    pub base_url: String,
}

impl TargetEndpoint {
    /// Parse a target URL. A bare host (`example.com:8080`) is treated as `http://`.
    pub fn parse(target_url: &str) -> Result<Self> {
        let trimmed = target_url.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };
        let url = reqwest::Url::parse(&with_scheme)
            .with_context(|| format!("Invalid target URL '{}'", target_url))?;
        let host = url
            .host_str()
            .with_context(|| format!("Target URL '{}' has no host", target_url))?
            .to_string();
        let port = url
            .port_or_known_default()
            .with_context(|| format!("Target URL '{}' has no port", target_url))?;
        let base_url = match url.port() {
            Some(explicit) => format!("{}://{}:{}", url.scheme(), host, explicit),
            None => format!("{}://{}", url.scheme(), host),
        };
        Ok(Self {
            target_url: trimmed.to_string(),
            host,
            port,
            base_url,
        })
    }

    /// Substitute `{host}`, `{port}`, `{base_url}` and `{target_url}`; values are shell-quoted.
    pub fn render(&self, template: &str) -> Result<String> {
        let port = self.port.to_string();
        render_template(
            template,
            &[
                ("host", self.host.as_str()),
                ("port", port.as_str()),
                ("base_url", self.base_url.as_str()),
                ("target_url", self.target_url.as_str()),
            ],
        )
    }
}

/// Single-pass placeholder substitution. Unknown `{...}` sequences are kept verbatim.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let matched = vars.iter().find(|(name, _)| {
            tail.len() > name.len() + 1
                && tail[1..].starts_with(name)
                && tail[1 + name.len()..].starts_with('}')
        });
        match matched {
            Some((name, value)) => {
                let quoted = shlex::try_quote(value)
                    .with_context(|| format!("Cannot shell-quote value for {{{}}}", name))?;
                out.push_str(&quoted);
                rest = &tail[name.len() + 2..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Phases ───────────────────────────────────────────────────────────

/// One stage of a pentest pipeline. Phases always run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Recon,
    VulnScan,
    Exploit,
    Report,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Recon, Phase::VulnScan, Phase::Exploit, Phase::Report];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recon => "recon",
            Self::VulnScan => "vuln_scan",
            Self::Exploit => "exploit",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recon" => Ok(Self::Recon),
            "vuln_scan" => Ok(Self::VulnScan),
            "exploit" => Ok(Self::Exploit),
            "report" => Ok(Self::Report),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

// ── Targets ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Idle,
    Scanning,
    Completed,
    Failed,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "scanning" => Ok(Self::Scanning),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid target status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub target_url: String,
    pub status: TargetStatus,
    pub created_at: String,
}

// ── Tool jobs ────────────────────────────────────────────────────────

/// Lifecycle of one external tool invocation: `pending -> running -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolJob {
    pub id: i64,
    pub target_id: i64,
    pub phase: Phase,
    pub tool_name: String,
    pub command: String,
    pub status: JobStatus,
    pub raw_output: Option<String>,
    pub ai_analysis: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

// ── Events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolStart,
    ToolOutput,
    Thinking,
    Decision,
    Finding,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolStart => "tool_start",
            Self::ToolOutput => "tool_output",
            Self::Thinking => "thinking",
            Self::Decision => "decision",
            Self::Finding => "finding",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_start" => Ok(Self::ToolStart),
            "tool_output" => Ok(Self::ToolOutput),
            "thinking" => Ok(Self::Thinking),
            "decision" => Ok(Self::Decision),
            "finding" => Ok(Self::Finding),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid event kind: {}", s)),
        }
    }
}

/// Append-only audit record. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: i64,
    pub target_id: i64,
    pub job_id: Option<i64>,
    pub phase: Phase,
    #[serde(rename = "log_type")]
    pub kind: EventKind,
    pub message: String,
    pub created_at: String,
}

// ── Findings ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Contribution of one finding of this severity to the 0-100 risk score.
    pub fn risk_weight(&self) -> u32 {
        match self {
            Self::Critical => 25,
            Self::High => 15,
            Self::Medium => 8,
            Self::Low => 3,
            Self::Info => 1,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub id: i64,
    pub target_id: i64,
    pub job_id: Option<i64>,
    pub finding_type: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub evidence: Option<String>,
    pub is_validated: bool,
    pub created_at: String,
}

/// Insert payload for [`Finding`]; ids and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFinding {
    pub job_id: Option<i64>,
    pub finding_type: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub evidence: Option<String>,
    pub is_validated: bool,
}

impl NewFinding {
    pub fn new(finding_type: &str, title: impl Into<String>, severity: Severity) -> Self {
        Self {
            job_id: None,
            finding_type: finding_type.to_string(),
            title: title.into(),
            description: String::new(),
            severity,
            evidence: None,
            is_validated: false,
        }
    }

    pub fn with_job(mut self, job_id: i64) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }

    pub fn validated(mut self) -> Self {
        self.is_validated = true;
        self
    }
}

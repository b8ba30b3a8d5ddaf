//! Layered configuration: `pentest.toml` → environment → CLI flags.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//!
//! [store]
//! db_path = ".pentest/pentest.db"
//!
//! [llm]
//! base_url = "http://localhost:11434"
//! model = "gemma3:4b"
//! request_timeout_secs = 120
//!
//! [runner]
//! default_timeout_secs = 300
//! analysis_char_limit = 8000
//! live_buffer = 1024
//!
//! [[tools.recon]]
//! name = "nmap"
//! command = "nmap -sV -T4 --top-ports 1000 {host}"
//! timeout_secs = 120
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! dir = ".pentest/logs"
//! ```
//!
//! Every section is optional. Tool command templates accept `{host}`,
//! `{port}`, `{base_url}` and `{target_url}`; values are shell-quoted when
//! substituted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "pentest.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PentestConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ── Sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".pentest/pentest.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "gemma3:4b".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            model: default_llm_model(),
            request_timeout_secs: default_llm_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Shell used to run tool commands as `<shell> -c <command>`.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Per-read timeout applied to tools that do not set their own.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Leading characters of a transcript embedded in the analysis prompt.
    #[serde(default = "default_analysis_char_limit")]
    pub analysis_char_limit: usize,
    /// Messages queued per live subscriber before it is dropped as lagging.
    #[serde(default = "default_live_buffer")]
    pub live_buffer: usize,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_analysis_char_limit() -> usize {
    8000
}

fn default_live_buffer() -> usize {
    crate::sink::SUBSCRIBER_BUFFER
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            default_timeout_secs: default_timeout_secs(),
            analysis_char_limit: default_analysis_char_limit(),
            live_buffer: default_live_buffer(),
        }
    }
}

/// One external tool invocation template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ToolCommand {
    pub fn new(name: &str, command: &str, timeout_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            timeout_secs: Some(timeout_secs),
        }
    }

    pub fn timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(default_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_recon_tools")]
    pub recon: Vec<ToolCommand>,
    #[serde(default = "default_vuln_scan_tools")]
    pub vuln_scan: Vec<ToolCommand>,
    #[serde(default = "default_exploit_tools")]
    pub exploit: Vec<ToolCommand>,
}

fn default_recon_tools() -> Vec<ToolCommand> {
    vec![
        ToolCommand::new("nmap", "nmap -sV -sC -T4 --top-ports 1000 -oN - {host}", 120),
        ToolCommand::new("whatweb", "whatweb -a 3 --color=never {base_url}", 60),
        ToolCommand::new("wafw00f", "wafw00f {base_url}", 30),
        ToolCommand::new(
            "gobuster",
            "gobuster dir -u {base_url} -w /usr/share/seclists/Discovery/Web-Content/common.txt \
             -t 20 --no-color --timeout 10s -q",
            120,
        ),
    ]
}

fn default_vuln_scan_tools() -> Vec<ToolCommand> {
    vec![ToolCommand::new(
        "nikto",
        "nikto -h {base_url} -Tuning 1234567890abcde -maxtime 180 -nointeractive",
        200,
    )]
}

fn default_exploit_tools() -> Vec<ToolCommand> {
    vec![ToolCommand::new(
        "sqlmap",
        "sqlmap -u {base_url} --crawl=2 --batch --level=2 --risk=1 --threads=3 --timeout=15 \
         --forms --smart",
        180,
    )]
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            recon: default_recon_tools(),
            vuln_scan: default_vuln_scan_tools(),
            exploit: default_exploit_tools(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, a daily-rolling log file is also written here.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────────

impl PentestConfig {
    /// Load from an explicit path, or from `pentest.toml` in the working
    /// directory if present, then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pentest.toml")
    }

    /// Apply `PENTEST_*` overrides using the given variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("PENTEST_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("PENTEST_LLM_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = lookup("PENTEST_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(port) = lookup("PENTEST_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid PENTEST_PORT '{}'", port))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.llm.model.trim().is_empty() {
            anyhow::bail!("llm.model must not be empty");
        }
        if self.llm.request_timeout_secs == 0 {
            anyhow::bail!("llm.request_timeout_secs must be greater than zero");
        }
        if self.runner.default_timeout_secs == 0 {
            anyhow::bail!("runner.default_timeout_secs must be greater than zero");
        }
        if self.runner.analysis_char_limit == 0 {
            anyhow::bail!("runner.analysis_char_limit must be greater than zero");
        }
        if self.runner.live_buffer == 0 {
            anyhow::bail!("runner.live_buffer must be greater than zero");
        }
        for (section, tools) in [
            ("recon", &self.tools.recon),
            ("vuln_scan", &self.tools.vuln_scan),
            ("exploit", &self.tools.exploit),
        ] {
            for tool in tools {
                if tool.command.trim().is_empty() {
                    anyhow::bail!("tools.{}.{}: command must not be empty", section, tool.name);
                }
                if tool.timeout_secs == Some(0) {
                    anyhow::bail!(
                        "tools.{}.{}: timeout_secs must be greater than zero",
                        section,
                        tool.name
                    );
                }
            }
        }
        Ok(())
    }

    /// Render the effective configuration, used by `init` to write a starter file.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize pentest.toml")
    }
}

//! Process runner: executes one external command under a per-read timeout,
//! streams every output line through the event sink, and asks the analyzer
//! about the transcript.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pentest_common::{EventKind, JobStatus, Phase};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::db::DbHandle;
use crate::errors::RunnerError;
use crate::llm::{Analyzer, ask_llm};
use crate::sink::EventSink;

/// Final transcript line written when a tool is killed for going quiet.
pub const TIMEOUT_MARKER: &str = "[TIMEOUT - process killed]";

/// Result of one tool invocation. Execution failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Completed {
        job_id: i64,
        transcript: String,
        analysis: String,
        timed_out: bool,
        exit_code: Option<i32>,
    },
    Failed {
        job_id: i64,
        reason: String,
    },
}

impl ToolOutcome {
    pub fn job_id(&self) -> i64 {
        match self {
            Self::Completed { job_id, .. } | Self::Failed { job_id, .. } => *job_id,
        }
    }

    /// Captured output, or the failure reason for a failed job.
    pub fn transcript(&self) -> &str {
        match self {
            Self::Completed { transcript, .. } => transcript,
            Self::Failed { reason, .. } => reason,
        }
    }

    pub fn analysis(&self) -> &str {
        match self {
            Self::Completed { analysis, .. } => analysis,
            Self::Failed { .. } => "",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, Self::Completed { timed_out: true, .. })
    }
}

/// Identifies the job a runner step belongs to.
#[derive(Debug, Clone, Copy)]
struct JobScope {
    target_id: i64,
    phase: Phase,
    job_id: i64,
}

struct Capture {
    transcript: String,
    timed_out: bool,
    exit_code: Option<i32>,
}

pub struct ToolRunner {
    db: DbHandle,
    sink: Arc<EventSink>,
    analyzer: Arc<dyn Analyzer>,
    shell: String,
    analysis_char_limit: usize,
}

impl ToolRunner {
    pub fn new(
        db: DbHandle,
        sink: Arc<EventSink>,
        analyzer: Arc<dyn Analyzer>,
        config: &RunnerConfig,
    ) -> Self {
        Self {
            db,
            sink,
            analyzer,
            shell: config.shell.clone(),
            analysis_char_limit: config.analysis_char_limit,
        }
    }

    /// Run `command` to completion or timeout and record the job.
    ///
    /// `timeout` bounds the silence between two output lines (and the final
    /// wait for exit), not the total runtime. Only failures to write the
    /// `tool_start` event or the initial job row are returned as `Err`.
    pub async fn execute(
        &self,
        target_id: i64,
        phase: Phase,
        tool_name: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ToolOutcome, RunnerError> {
        self.sink
            .record(
                target_id,
                phase,
                EventKind::ToolStart,
                format!("Running: {}", command),
                None,
            )
            .await
            .map_err(RunnerError::StartEvent)?;

        let job = {
            let (tool, cmd) = (tool_name.to_string(), command.to_string());
            self.db
                .call(move |db| db.create_tool_job(target_id, phase, &tool, &cmd))
                .await
                .map_err(RunnerError::JobCreate)?
        };
        let scope = JobScope {
            target_id,
            phase,
            job_id: job.id,
        };
        info!(target_id, job_id = job.id, %phase, tool = tool_name, "tool started");

        match self.run_job(scope, tool_name, command, timeout).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Ok(self.fail_job(scope, tool_name, e).await),
        }
    }

    async fn run_job(
        &self,
        scope: JobScope,
        tool_name: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ToolOutcome> {
        let capture = self.capture(scope, command, timeout).await?;
        if capture.timed_out {
            warn!(
                target_id = scope.target_id,
                job_id = scope.job_id,
                tool = tool_name,
                timeout_secs = timeout.as_secs_f64(),
                "tool timed out; process group killed"
            );
        }

        let excerpt = truncate_chars(&capture.transcript, self.analysis_char_limit);
        let prompt = analysis_prompt(tool_name, command, excerpt);
        let analysis = ask_llm(
            self.analyzer.as_ref(),
            &self.sink,
            scope.target_id,
            scope.phase,
            &prompt,
        )
        .await?;
        self.sink
            .record(
                scope.target_id,
                scope.phase,
                EventKind::Decision,
                format!("AI Analysis:\n{}", analysis),
                Some(scope.job_id),
            )
            .await?;

        let applied = {
            let (transcript, analysis) = (capture.transcript.clone(), analysis.clone());
            let job_id = scope.job_id;
            self.db
                .call(move |db| {
                    db.finish_tool_job(job_id, JobStatus::Completed, &transcript, Some(&analysis))
                })
                .await?
        };
        if !applied {
            warn!(job_id = scope.job_id, "tool job already terminal; completion not recorded");
        }
        info!(
            target_id = scope.target_id,
            job_id = scope.job_id,
            tool = tool_name,
            exit_code = ?capture.exit_code,
            timed_out = capture.timed_out,
            "tool completed"
        );

        Ok(ToolOutcome::Completed {
            job_id: scope.job_id,
            transcript: capture.transcript,
            analysis,
            timed_out: capture.timed_out,
            exit_code: capture.exit_code,
        })
    }

    async fn fail_job(&self, scope: JobScope, tool_name: &str, err: anyhow::Error) -> ToolOutcome {
        let reason = format!("Tool execution failed: {:#}", err);
        error!(
            target_id = scope.target_id,
            job_id = scope.job_id,
            tool = tool_name,
            error = %reason,
            "tool failed"
        );

        if let Err(e) = self
            .sink
            .record(
                scope.target_id,
                scope.phase,
                EventKind::Error,
                reason.clone(),
                Some(scope.job_id),
            )
            .await
        {
            warn!(job_id = scope.job_id, error = %format!("{:#}", e), "failed to record error event");
        }

        let job_id = scope.job_id;
        let transcript = reason.clone();
        match self
            .db
            .call(move |db| db.finish_tool_job(job_id, JobStatus::Failed, &transcript, None))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(job_id, "tool job already terminal; failure not recorded"),
            Err(e) => error!(job_id, error = %format!("{:#}", e), "failed to mark tool job failed"),
        }

        ToolOutcome::Failed { job_id, reason }
    }

    /// Spawn the command and stream its merged output until EOF or timeout.
    async fn capture(&self, scope: JobScope, command: &str, timeout: Duration) -> Result<Capture> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(merged_script(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        put_in_own_process_group(&mut cmd);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn `{} -c {}`", self.shell, command))?;
        let mut process = ProcessGuard::new(child);

        let job_id = scope.job_id;
        self.db
            .call(move |db| db.mark_tool_job_running(job_id))
            .await?;

        let stdout = process
            .child
            .stdout
            .take()
            .context("Tool stdout was not captured")?;
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        let mut lines: Vec<String> = Vec::new();
        let mut timed_out = false;
        loop {
            buf.clear();
            match tokio::time::timeout(timeout, reader.read_until(b'\n', &mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    self.sink
                        .record(
                            scope.target_id,
                            scope.phase,
                            EventKind::ToolOutput,
                            line.clone(),
                            Some(scope.job_id),
                        )
                        .await?;
                    lines.push(line);
                }
                Ok(Err(e)) => return Err(e).context("Failed to read tool output"),
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let exit_code = if timed_out {
            process.terminate().await;
            None
        } else {
            match tokio::time::timeout(timeout, process.child.wait()).await {
                Ok(status) => status.context("Failed to wait for tool process")?.code(),
                Err(_) => {
                    timed_out = true;
                    process.terminate().await;
                    None
                }
            }
        };

        if timed_out {
            self.sink
                .record(
                    scope.target_id,
                    scope.phase,
                    EventKind::ToolOutput,
                    TIMEOUT_MARKER,
                    Some(scope.job_id),
                )
                .await?;
            lines.push(TIMEOUT_MARKER.to_string());
        }

        Ok(Capture {
            transcript: lines.join("\n"),
            timed_out,
            exit_code,
        })
    }
}

/// Owns a spawned tool and kills its whole process group if dropped early.
struct ProcessGuard {
    child: Child,
}

impl ProcessGuard {
    fn new(child: Child) -> Self {
        Self { child }
    }

    fn kill_group(&self) {
        // `id()` is None once the child has been reaped, so a recycled pid is never signalled.
        if let Some(pid) = self.child.id() {
            kill_process_group(pid);
        }
    }

    async fn terminate(&mut self) {
        self.kill_group();
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "tool process already gone");
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.kill_group();
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: kill(2) has no memory-safety preconditions. The child was spawned
    // with process_group(0), so its pid is also its pgid.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(unix)]
fn put_in_own_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn put_in_own_process_group(_cmd: &mut Command) {}

/// Script that points the shell's stderr at its stdout before running
/// `command`, so both streams share one pipe in write order.
fn merged_script(command: &str) -> String {
    format!("exec 2>&1\n{}", command)
}

/// Longest prefix of `s` with at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub fn analysis_prompt(tool_name: &str, command: &str, transcript: &str) -> String {
    format!(
        "You are a penetration tester analyzing tool output. Tool: {}\n\
         Command: {}\n\n\
         Output:\n{}\n\n\
         Provide a concise analysis: what was found, potential vulnerabilities, \
         and recommended next steps. Be specific about any findings.",
        tool_name, command, transcript
    )
}

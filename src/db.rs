use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use pentest_common::{
    Event, EventKind, Finding, JobStatus, NewFinding, Phase, Severity, Target, TargetStatus,
    ToolJob, now_rfc3339,
};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Async-safe handle to the pentest database.
///
/// Wraps `PentestDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PentestDb>>,
}

impl DbHandle {
    pub fn new(db: PentestDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open an on-disk database, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        Ok(Self::new(PentestDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(PentestDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PentestDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PentestDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct PentestDb {
    conn: Connection,
}

impl PentestDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure SQLite connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS targets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    target_url TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'idle',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tool_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    target_id INTEGER NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    tool_name TEXT NOT NULL,
                    command TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    raw_output TEXT,
                    ai_analysis TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    target_id INTEGER NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
                    job_id INTEGER REFERENCES tool_jobs(id) ON DELETE SET NULL,
                    phase TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    message TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS findings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    target_id INTEGER NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
                    job_id INTEGER REFERENCES tool_jobs(id) ON DELETE SET NULL,
                    finding_type TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    severity TEXT NOT NULL,
                    evidence TEXT,
                    is_validated INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tool_jobs_target ON tool_jobs(target_id);
                CREATE INDEX IF NOT EXISTS idx_events_target ON events(target_id, id);
                CREATE INDEX IF NOT EXISTS idx_events_job ON events(job_id);
                CREATE INDEX IF NOT EXISTS idx_findings_target ON findings(target_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Targets ───────────────────────────────────────────────────────

    pub fn create_target(&self, name: &str, target_url: &str) -> Result<Target> {
        self.conn
            .execute(
                "INSERT INTO targets (name, target_url, status, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, target_url, TargetStatus::Idle.as_str(), now_rfc3339()],
            )
            .context("Failed to insert target")?;
        let id = self.conn.last_insert_rowid();
        self.get_target(id)?
            .context("Target not found after insert")
    }

    pub fn get_target(&self, id: i64) -> Result<Option<Target>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, target_url, status, created_at FROM targets WHERE id = ?1",
                params![id],
                TargetRow::from_row,
            )
            .optional()
            .context("Failed to query target")?;
        row.map(TargetRow::into_target).transpose()
    }

    pub fn list_targets(&self) -> Result<Vec<Target>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, target_url, status, created_at FROM targets ORDER BY id")
            .context("Failed to prepare list_targets")?;
        let rows = stmt
            .query_map([], TargetRow::from_row)
            .context("Failed to query targets")?;
        let mut targets = Vec::new();
        for row in rows {
            targets.push(row.context("Failed to read target row")?.into_target()?);
        }
        Ok(targets)
    }

    pub fn update_target_status(&self, id: i64, status: TargetStatus) -> Result<Target> {
        let changed = self
            .conn
            .execute(
                "UPDATE targets SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update target status")?;
        if changed == 0 {
            anyhow::bail!("Target {} not found", id);
        }
        self.get_target(id)?
            .context("Target not found after status update")
    }

    // ── Tool jobs ─────────────────────────────────────────────────────

    /// Insert a job in `pending` state. Called before the process is spawned.
    pub fn create_tool_job(
        &self,
        target_id: i64,
        phase: Phase,
        tool_name: &str,
        command: &str,
    ) -> Result<ToolJob> {
        self.conn
            .execute(
                "INSERT INTO tool_jobs (target_id, phase, tool_name, command, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    target_id,
                    phase.as_str(),
                    tool_name,
                    command,
                    JobStatus::Pending.as_str(),
                    now_rfc3339()
                ],
            )
            .context("Failed to insert tool job")?;
        let id = self.conn.last_insert_rowid();
        self.get_tool_job(id)?
            .context("Tool job not found after insert")
    }

    /// Move a pending job to `running`. Returns false if the job had already left `pending`.
    pub fn mark_tool_job_running(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE tool_jobs SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![JobStatus::Running.as_str(), id, JobStatus::Pending.as_str()],
            )
            .context("Failed to mark tool job running")?;
        Ok(changed == 1)
    }

    /// Write the terminal status of a job. Guarded on `completed_at IS NULL` so
    /// only the first terminal write lands; returns whether this call applied.
    pub fn finish_tool_job(
        &self,
        id: i64,
        status: JobStatus,
        raw_output: &str,
        ai_analysis: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            anyhow::bail!("finish_tool_job requires a terminal status, got '{}'", status);
        }
        let changed = self
            .conn
            .execute(
                "UPDATE tool_jobs SET status = ?1, raw_output = ?2, ai_analysis = ?3, completed_at = ?4 \
                 WHERE id = ?5 AND completed_at IS NULL",
                params![status.as_str(), raw_output, ai_analysis, now_rfc3339(), id],
            )
            .context("Failed to finish tool job")?;
        Ok(changed == 1)
    }

    pub fn get_tool_job(&self, id: i64) -> Result<Option<ToolJob>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, target_id, phase, tool_name, command, status, raw_output, ai_analysis, \
                 created_at, completed_at FROM tool_jobs WHERE id = ?1",
                params![id],
                ToolJobRow::from_row,
            )
            .optional()
            .context("Failed to query tool job")?;
        row.map(ToolJobRow::into_tool_job).transpose()
    }

    pub fn list_tool_jobs(&self, target_id: i64) -> Result<Vec<ToolJob>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, target_id, phase, tool_name, command, status, raw_output, ai_analysis, \
                 created_at, completed_at FROM tool_jobs WHERE target_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_tool_jobs")?;
        let rows = stmt
            .query_map(params![target_id], ToolJobRow::from_row)
            .context("Failed to query tool jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read tool job row")?.into_tool_job()?);
        }
        Ok(jobs)
    }

    // ── Events ────────────────────────────────────────────────────────

    pub fn create_event(
        &self,
        target_id: i64,
        job_id: Option<i64>,
        phase: Phase,
        kind: EventKind,
        message: &str,
    ) -> Result<Event> {
        let created_at = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO events (target_id, job_id, phase, kind, message, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    target_id,
                    job_id,
                    phase.as_str(),
                    kind.as_str(),
                    message,
                    created_at
                ],
            )
            .context("Failed to insert event")?;
        Ok(Event {
            id: self.conn.last_insert_rowid(),
            target_id,
            job_id,
            phase,
            kind,
            message: message.to_string(),
            created_at,
        })
    }

    /// Most recent `limit` events for a target, returned oldest first.
    pub fn list_events(&self, target_id: i64, limit: i64) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, target_id, job_id, phase, kind, message, created_at FROM ( \
                     SELECT * FROM events WHERE target_id = ?1 ORDER BY id DESC LIMIT ?2 \
                 ) ORDER BY id",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![target_id, limit], EventRow::from_row)
            .context("Failed to query events")?;
        collect_events(rows)
    }

    pub fn list_job_events(&self, job_id: i64) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, target_id, job_id, phase, kind, message, created_at FROM events \
                 WHERE job_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_job_events")?;
        let rows = stmt
            .query_map(params![job_id], EventRow::from_row)
            .context("Failed to query job events")?;
        collect_events(rows)
    }

    // ── Findings ──────────────────────────────────────────────────────

    pub fn create_finding(&self, target_id: i64, finding: &NewFinding) -> Result<Finding> {
        let created_at = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO findings (target_id, job_id, finding_type, title, description, severity, \
                 evidence, is_validated, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    target_id,
                    finding.job_id,
                    finding.finding_type,
                    finding.title,
                    finding.description,
                    finding.severity.as_str(),
                    finding.evidence,
                    finding.is_validated,
                    created_at
                ],
            )
            .context("Failed to insert finding")?;
        Ok(Finding {
            id: self.conn.last_insert_rowid(),
            target_id,
            job_id: finding.job_id,
            finding_type: finding.finding_type.clone(),
            title: finding.title.clone(),
            description: finding.description.clone(),
            severity: finding.severity,
            evidence: finding.evidence.clone(),
            is_validated: finding.is_validated,
            created_at,
        })
    }

    pub fn list_findings(&self, target_id: i64) -> Result<Vec<Finding>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, target_id, job_id, finding_type, title, description, severity, evidence, \
                 is_validated, created_at FROM findings WHERE target_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_findings")?;
        let rows = stmt
            .query_map(params![target_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, bool>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })
            .context("Failed to query findings")?;
        let mut findings = Vec::new();
        for row in rows {
            let (
                id,
                target_id,
                job_id,
                finding_type,
                title,
                description,
                severity_str,
                evidence,
                is_validated,
                created_at,
            ) = row?;
            findings.push(Finding {
                id,
                target_id,
                job_id,
                finding_type,
                title,
                description,
                severity: Severity::from_str(&severity_str).map_err(|_| {
                    anyhow::anyhow!("invalid severity in database: '{}'", severity_str)
                })?,
                evidence,
                is_validated,
                created_at,
            });
        }
        Ok(findings)
    }
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<EventRow>>,
) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for row in rows {
        events.push(row.context("Failed to read event row")?.into_event()?);
    }
    Ok(events)
}

/// Intermediate row structs for reading typed enums stored as TEXT.
struct TargetRow {
    id: i64,
    name: String,
    target_url: String,
    status: String,
    created_at: String,
}

impl TargetRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            target_url: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_target(self) -> Result<Target> {
        let status = TargetStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse target status")?;
        Ok(Target {
            id: self.id,
            name: self.name,
            target_url: self.target_url,
            status,
            created_at: self.created_at,
        })
    }
}

struct ToolJobRow {
    id: i64,
    target_id: i64,
    phase: String,
    tool_name: String,
    command: String,
    status: String,
    raw_output: Option<String>,
    ai_analysis: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl ToolJobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target_id: row.get(1)?,
            phase: row.get(2)?,
            tool_name: row.get(3)?,
            command: row.get(4)?,
            status: row.get(5)?,
            raw_output: row.get(6)?,
            ai_analysis: row.get(7)?,
            created_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_tool_job(self) -> Result<ToolJob> {
        let phase = Phase::from_str(&self.phase)
            .map_err(|_| anyhow::anyhow!("invalid phase in database: '{}'", self.phase))?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|_| anyhow::anyhow!("invalid job status in database: '{}'", self.status))?;
        Ok(ToolJob {
            id: self.id,
            target_id: self.target_id,
            phase,
            tool_name: self.tool_name,
            command: self.command,
            status,
            raw_output: self.raw_output,
            ai_analysis: self.ai_analysis,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

struct EventRow {
    id: i64,
    target_id: i64,
    job_id: Option<i64>,
    phase: String,
    kind: String,
    message: String,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target_id: row.get(1)?,
            job_id: row.get(2)?,
            phase: row.get(3)?,
            kind: row.get(4)?,
            message: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        let phase = Phase::from_str(&self.phase)
            .map_err(|_| anyhow::anyhow!("invalid phase in database: '{}'", self.phase))?;
        let kind = EventKind::from_str(&self.kind)
            .map_err(|_| anyhow::anyhow!("invalid event kind in database: '{}'", self.kind))?;
        Ok(Event {
            id: self.id,
            target_id: self.target_id,
            job_id: self.job_id,
            phase,
            kind,
            message: self.message,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

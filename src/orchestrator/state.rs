use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

/// Position of a run in the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Starting,
    Recon,
    VulnScan,
    Exploit,
    Report,
    Completed,
    Cancelled,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Recon => "recon",
            Self::VulnScan => "vuln_scan",
            Self::Exploit => "exploit",
            Self::Report => "report",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "recon" => Ok(Self::Recon),
            "vuln_scan" => Ok(Self::VulnScan),
            "exploit" => Ok(Self::Exploit),
            "report" => Ok(Self::Report),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run phase: {}", s)),
        }
    }
}

impl From<pentest_common::Phase> for RunPhase {
    fn from(phase: pentest_common::Phase) -> Self {
        use pentest_common::Phase;
        match phase {
            Phase::Recon => Self::Recon,
            Phase::VulnScan => Self::VulnScan,
            Phase::Exploit => Self::Exploit,
            Phase::Report => Self::Report,
        }
    }
}

// ── Approval gate ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSignal {
    Pending,
    Approved,
    Cancelled,
}

/// Single-shot release for the exploit approval wait.
///
/// Approval only moves `Pending → Approved`; cancellation overwrites any
/// state, so a cancel racing an approval always wins.
pub struct ApprovalGate {
    tx: watch::Sender<GateSignal>,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateSignal::Pending);
        Self { tx }
    }

    pub fn signal(&self) -> GateSignal {
        *self.tx.borrow()
    }

    /// Returns false if the gate was already released.
    pub fn approve(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == GateSignal::Pending {
                *state = GateSignal::Approved;
                true
            } else {
                false
            }
        })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(GateSignal::Cancelled);
    }

    /// Resolve once the gate leaves `Pending`. Returns immediately if it already has.
    pub async fn wait(&self) -> GateSignal {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|state| *state != GateSignal::Pending).await {
            Ok(state) => *state,
            Err(_) => GateSignal::Cancelled,
        }
    }
}

// ── Run control ──────────────────────────────────────────────────────

/// Externally observable snapshot of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub target_id: i64,
    pub current_phase: RunPhase,
    pub waiting_for_approval: bool,
    pub cancelled: bool,
}

/// Shared handle between a running orchestrator and its external controllers.
pub struct RunControl {
    run_id: Uuid,
    target_id: i64,
    phase: Mutex<RunPhase>,
    waiting: AtomicBool,
    cancelled: AtomicBool,
    gate: ApprovalGate,
}

impl RunControl {
    pub fn new(target_id: i64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            target_id,
            phase: Mutex::new(RunPhase::Starting),
            waiting: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            gate: ApprovalGate::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn target_id(&self) -> i64 {
        self.target_id
    }

    pub fn current_phase(&self) -> RunPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_phase(&self, phase: RunPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Release the approval wait. A no-op (returning false) unless the run is waiting.
    pub fn approve(&self) -> bool {
        if !self.is_waiting() {
            return false;
        }
        self.gate.approve()
    }

    /// Flag the run for cancellation and release any approval wait.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.gate.cancel();
    }

    pub(crate) fn begin_waiting(&self) {
        self.waiting.store(true, Ordering::SeqCst);
    }

    /// Suspend until `approve` or `cancel`. Cancellation takes precedence.
    pub(crate) async fn wait_for_approval(&self) -> GateSignal {
        let signal = self.gate.wait().await;
        self.waiting.store(false, Ordering::SeqCst);
        if self.is_cancelled() {
            GateSignal::Cancelled
        } else {
            signal
        }
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.run_id,
            target_id: self.target_id,
            current_phase: self.current_phase(),
            waiting_for_approval: self.is_waiting(),
            cancelled: self.is_cancelled(),
        }
    }
}

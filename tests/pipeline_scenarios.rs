//! Full pipeline runs: approval gate, cancellation and failure handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pentest_common::{Phase, Severity, TargetStatus};
use pentest_orchestrator::agents::{
    AgentContext, ExploitAgent, PhaseAgent, PhaseAgents, PhaseResult, ReconAgent, ReportAgent,
    VulnScanAgent,
};
use pentest_orchestrator::config::{RunnerConfig, ToolCommand};
use pentest_orchestrator::db::DbHandle;
use pentest_orchestrator::errors::OrchestratorError;
use pentest_orchestrator::llm::Analyzer;
use pentest_orchestrator::orchestrator::{RunContext, RunOutcome, RunPhase};
use pentest_orchestrator::runtime::Runtime;
use serde_json::json;
use tempfile::TempDir;

struct FixedAnalyzer;

#[async_trait]
impl Analyzer for FixedAnalyzer {
    async fn analyze(&self, _prompt: &str) -> String {
        "analysis".to_string()
    }
}

fn setup() -> (TempDir, Runtime, i64) {
    let dir = TempDir::new().unwrap();
    let db = DbHandle::open(&dir.path().join("pentest.db")).unwrap();
    let target = db
        .lock_sync()
        .unwrap()
        .create_target("lab", "http://127.0.0.1:8080")
        .unwrap();
    let runtime = Runtime::new(db, Arc::new(FixedAnalyzer), &RunnerConfig::default());
    (dir, runtime, target.id)
}

async fn target_status(runtime: &Runtime, target_id: i64) -> TargetStatus {
    runtime
        .db
        .call(move |db| db.get_target(target_id))
        .await
        .unwrap()
        .unwrap()
        .status
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Agent that counts invocations, optionally sleeps, and gates or fails on demand.
struct Probe {
    phase: Phase,
    calls: Arc<AtomicUsize>,
    delay: Duration,
    gate: bool,
    fail: bool,
}

impl Probe {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            gate: false,
            fail: false,
        }
    }
}

#[async_trait]
impl PhaseAgent for Probe {
    fn phase(&self) -> Phase {
        self.phase
    }

    async fn run(&self, _ctx: &AgentContext, run: &RunContext) -> anyhow::Result<PhaseResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            anyhow::bail!("{} blew up", self.phase);
        }
        let status = if self.gate && !run.exploit_approved {
            "awaiting_approval"
        } else {
            "done"
        };
        Ok(match json!({"status": status, "risk_score": 40.0}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        })
    }
}

struct Probes {
    recon: Arc<AtomicUsize>,
    vuln_scan: Arc<AtomicUsize>,
    exploit: Arc<AtomicUsize>,
    report: Arc<AtomicUsize>,
}

fn probe_agents(configure: impl Fn(&mut Probe)) -> (PhaseAgents, Probes) {
    let build = |phase: Phase| {
        let mut probe = Probe::new(phase);
        probe.gate = phase == Phase::Exploit;
        configure(&mut probe);
        let calls = probe.calls.clone();
        (Arc::new(probe) as Arc<dyn PhaseAgent>, calls)
    };
    let (recon, recon_calls) = build(Phase::Recon);
    let (vuln_scan, vuln_calls) = build(Phase::VulnScan);
    let (exploit, exploit_calls) = build(Phase::Exploit);
    let (report, report_calls) = build(Phase::Report);
    (
        PhaseAgents {
            recon,
            vuln_scan,
            exploit,
            report,
        },
        Probes {
            recon: recon_calls,
            vuln_scan: vuln_calls,
            exploit: exploit_calls,
            report: report_calls,
        },
    )
}

#[tokio::test]
async fn approval_after_100ms_resumes_exploit_and_completes() {
    let (_dir, runtime, target_id) = setup();
    let (agents, probes) = probe_agents(|_| {});

    let (control, handle) = runtime.start_pentest(agents, target_id).await.unwrap();
    wait_until(|| control.is_waiting()).await;
    assert_eq!(control.current_phase(), RunPhase::Exploit);
    assert_eq!(probes.exploit.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let released = Instant::now();
    assert!(control.approve());
    let outcome = handle.await.unwrap().unwrap();
    assert!(released.elapsed() < Duration::from_secs(2));

    let RunOutcome::Completed { report, context } = outcome else {
        panic!("expected completion");
    };
    assert!(context.exploit_approved);
    assert_eq!(context.result(Phase::Exploit).unwrap()["status"], "done");
    assert_eq!(report["risk_score"], 40.0);
    assert_eq!(probes.exploit.load(Ordering::SeqCst), 2);
    assert_eq!(probes.report.load(Ordering::SeqCst), 1);
    assert_eq!(target_status(&runtime, target_id).await, TargetStatus::Completed);
    assert!(runtime.registry.get(target_id).is_none());
}

#[tokio::test]
async fn cancel_during_recon_stops_before_vuln_scan() {
    let (_dir, runtime, target_id) = setup();
    let (agents, probes) = probe_agents(|probe| {
        if probe.phase == Phase::Recon {
            probe.delay = Duration::from_millis(300);
        }
    });

    let (control, handle) = runtime.start_pentest(agents, target_id).await.unwrap();
    wait_until(|| probes.recon.load(Ordering::SeqCst) == 1).await;
    assert!(runtime.registry.cancel(target_id));

    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
    assert!(outcome.context().result(Phase::Recon).is_some());
    assert_eq!(probes.vuln_scan.load(Ordering::SeqCst), 0);
    assert_eq!(control.current_phase(), RunPhase::Cancelled);
    assert_eq!(target_status(&runtime, target_id).await, TargetStatus::Failed);
    assert!(runtime.registry.is_empty());
}

#[tokio::test]
async fn cancel_while_waiting_never_reaches_report() {
    let (_dir, runtime, target_id) = setup();
    let (agents, probes) = probe_agents(|_| {});
    let mut live = runtime.sink.subscribe(target_id);

    let (control, handle) = runtime.start_pentest(agents, target_id).await.unwrap();
    wait_until(|| control.is_waiting()).await;

    control.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("cancel must release the approval wait")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
    assert!(!outcome.context().exploit_approved);
    assert_eq!(probes.exploit.load(Ordering::SeqCst), 1);
    assert_eq!(probes.report.load(Ordering::SeqCst), 0);
    assert!(!control.approve());

    let mut last = None;
    while let Some(raw) = live.try_recv() {
        last = Some(serde_json::from_str::<serde_json::Value>(&raw).unwrap());
    }
    let last = last.unwrap();
    assert_eq!(last["type"], "phase_update");
    assert_eq!(last["phase"], "cancelled");
    assert_eq!(last["message"], "Pentest cancelled by user");
}

#[tokio::test]
async fn failing_phase_deregisters_and_marks_target_failed() {
    let (_dir, runtime, target_id) = setup();
    let (agents, probes) = probe_agents(|probe| probe.fail = probe.phase == Phase::Recon);

    let (_control, handle) = runtime.start_pentest(agents, target_id).await.unwrap();
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Phase {
            phase: Phase::Recon,
            ..
        }
    ));
    assert!(err.to_string().contains("recon blew up"));
    assert_eq!(probes.vuln_scan.load(Ordering::SeqCst), 0);
    assert!(runtime.registry.get(target_id).is_none());
    assert_eq!(target_status(&runtime, target_id).await, TargetStatus::Failed);

    // A fresh run is accepted once the failed one is gone.
    let (agents, _) = probe_agents(|_| {});
    let (control, handle) = runtime.start_pentest(agents, target_id).await.unwrap();
    control.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn second_run_for_same_target_is_rejected() {
    let (_dir, runtime, target_id) = setup();
    let (agents, _) = probe_agents(|_| {});

    let (control, handle) = runtime
        .start_pentest(agents.clone(), target_id)
        .await
        .unwrap();
    let second = runtime.start_pentest(agents, target_id).await;
    assert!(matches!(
        second,
        Err(OrchestratorError::AlreadyRunning { .. })
    ));

    control.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_target_is_rejected() {
    let (_dir, runtime, _) = setup();
    let (agents, _) = probe_agents(|_| {});
    let result = runtime.start_pentest(agents, 9999).await;
    assert!(matches!(
        result,
        Err(OrchestratorError::TargetNotFound { target_id: 9999 })
    ));
}

#[tokio::test]
async fn concurrent_targets_run_independently() {
    let (_dir, runtime, first) = setup();
    let second = runtime
        .db
        .call(|db| db.create_target("other", "http://127.0.0.2"))
        .await
        .unwrap()
        .id;
    let (agents, _) = probe_agents(|_| {});

    let (control_a, handle_a) = runtime.start_pentest(agents.clone(), first).await.unwrap();
    let (control_b, handle_b) = runtime.start_pentest(agents, second).await.unwrap();
    wait_until(|| control_a.is_waiting() && control_b.is_waiting()).await;
    assert_eq!(runtime.registry.len(), 2);

    control_a.approve();
    control_b.cancel();
    assert!(handle_a.await.unwrap().unwrap().is_completed());
    assert!(!handle_b.await.unwrap().unwrap().is_completed());
    assert_eq!(target_status(&runtime, first).await, TargetStatus::Completed);
    assert_eq!(target_status(&runtime, second).await, TargetStatus::Failed);
}

#[tokio::test]
async fn standard_agents_drive_shell_tools_end_to_end() {
    let (_dir, runtime, target_id) = setup();
    let agents = PhaseAgents {
        recon: Arc::new(ReconAgent::new(vec![ToolCommand::new(
            "nmap",
            "printf '80/tcp open http\\n' # {host}",
            10,
        )])),
        vuln_scan: Arc::new(VulnScanAgent::new(vec![ToolCommand::new(
            "nikto",
            "echo '+ /item.php?id=1: SQL injection in id' # {base_url}",
            10,
        )])),
        exploit: Arc::new(ExploitAgent::new(vec![ToolCommand::new(
            "sqlmap",
            "echo \"parameter 'id' is vulnerable\" # {base_url}",
            10,
        )])),
        report: Arc::new(ReportAgent),
    };

    let (control, handle) = runtime.start_pentest(agents, target_id).await.unwrap();
    wait_until(|| control.is_waiting()).await;
    let candidates = runtime
        .db
        .call(move |db| db.list_findings(target_id))
        .await
        .unwrap();
    assert!(candidates.iter().any(|f| f.severity == Severity::High));
    assert!(control.approve());

    let outcome = handle.await.unwrap().unwrap();
    let RunOutcome::Completed { report, context } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(context.result(Phase::Exploit).unwrap()["status"], "executed");
    // info (1) + high (15) + validated critical (25)
    assert_eq!(report["risk_score"], 41.0);
    assert_eq!(report["validated_findings"], 1);

    let jobs = runtime
        .db
        .call(move |db| db.list_tool_jobs(target_id))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.completed_at.is_some()));
}

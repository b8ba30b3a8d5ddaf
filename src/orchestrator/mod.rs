//! Phase orchestrator: sequences recon → vuln_scan → exploit → report for
//! one target.
//!
//! | Module     | Purpose                                                    |
//! |------------|------------------------------------------------------------|
//! | `context`  | `RunContext`, the per-run accumulator of phase results      |
//! | `state`    | `RunPhase`, the approval gate and the shared `RunControl`  |
//! | `registry` | `RunRegistry`, one active run per target                   |
//!
//! A run registers itself before it starts and deregisters through a drop
//! guard, so every exit path (completion, cancellation, failure, panic)
//! leaves the registry clean. Cancellation is checked at phase boundaries
//! and also releases the exploit approval wait.

pub mod context;
pub mod registry;
pub mod state;

use std::sync::Arc;

use pentest_common::{Phase, Target, TargetStatus};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agents::exploit::is_awaiting_approval;
use crate::agents::{PhaseAgents, PhaseResult};
use crate::errors::OrchestratorError;
use crate::runtime::Runtime;
use crate::ws::WsMessage;

pub use context::RunContext;
pub use registry::{Registration, RunRegistry};
pub use state::{ApprovalGate, GateSignal, RunControl, RunPhase, RunStatus};

/// Terminal result of a run that did not fail.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        report: PhaseResult,
        context: RunContext,
    },
    Cancelled {
        context: RunContext,
    },
}

impl RunOutcome {
    pub fn context(&self) -> &RunContext {
        match self {
            Self::Completed { context, .. } | Self::Cancelled { context } => context,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

pub type RunHandle = JoinHandle<Result<RunOutcome, OrchestratorError>>;

enum Flow {
    Completed(PhaseResult),
    Cancelled,
}

pub struct PentestOrchestrator {
    runtime: Runtime,
    agents: PhaseAgents,
    target: Target,
    control: Arc<RunControl>,
}

impl PentestOrchestrator {
    pub fn new(runtime: Runtime, agents: PhaseAgents, target: Target) -> Self {
        let control = Arc::new(RunControl::new(target.id));
        Self {
            runtime,
            agents,
            target,
            control,
        }
    }

    pub fn control(&self) -> Arc<RunControl> {
        self.control.clone()
    }

    /// Register and drive the pipeline on the current task.
    pub async fn run(self) -> Result<RunOutcome, OrchestratorError> {
        let registration = self.runtime.registry.register(self.control.clone())?;
        self.execute(registration).await
    }

    /// Register synchronously, then drive the pipeline on a new task.
    pub fn spawn(self) -> Result<RunHandle, OrchestratorError> {
        let registration = self.runtime.registry.register(self.control.clone())?;
        Ok(tokio::spawn(self.execute(registration)))
    }

    async fn execute(self, registration: Registration) -> Result<RunOutcome, OrchestratorError> {
        let mut run = RunContext::new(&self.target);
        let outcome = match self.drive(&mut run).await {
            Ok(Flow::Completed(report)) => Ok(RunOutcome::Completed {
                report,
                context: run,
            }),
            Ok(Flow::Cancelled) => {
                self.finish_cancelled().await;
                Ok(RunOutcome::Cancelled { context: run })
            }
            Err(e) => {
                self.finish_failed(&e).await;
                Err(e)
            }
        };
        drop(registration);
        outcome
    }

    async fn drive(&self, run: &mut RunContext) -> Result<Flow, OrchestratorError> {
        self.set_target_status(TargetStatus::Scanning).await?;
        self.announce("starting", "Pentest initiated");

        for (phase, message) in [
            (Phase::Recon, "Starting reconnaissance..."),
            (Phase::VulnScan, "Starting vulnerability assessment..."),
        ] {
            if self.control.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            self.enter(phase, message);
            self.invoke(phase, run).await?;
        }

        if self.control.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        self.enter(Phase::Exploit, "Starting exploit validation...");
        let first = self.invoke(Phase::Exploit, run).await?;
        if is_awaiting_approval(&first) {
            self.control.begin_waiting();
            self.announce("exploit", "Exploit validation - awaiting approval...");
            info!(target_id = self.target.id, "waiting for exploit approval");
            if self.control.wait_for_approval().await == GateSignal::Cancelled {
                return Ok(Flow::Cancelled);
            }
            run.exploit_approved = true;
            self.announce("exploit", "Exploit validation approved - running exploits...");
            self.invoke(Phase::Exploit, run).await?;
        }

        if self.control.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        self.enter(Phase::Report, "Generating penetration test report...");
        let report = self.invoke(Phase::Report, run).await?;

        self.set_target_status(TargetStatus::Completed).await?;
        self.control.set_phase(RunPhase::Completed);
        let risk = report
            .get("risk_score")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        self.announce(
            "completed",
            format!("Pentest complete! Risk score: {}/100", risk),
        );
        info!(target_id = self.target.id, risk, "pentest completed");
        Ok(Flow::Completed(report))
    }

    /// Run one phase agent and merge its result into the context.
    async fn invoke(
        &self,
        phase: Phase,
        run: &mut RunContext,
    ) -> Result<PhaseResult, OrchestratorError> {
        let ctx = self.runtime.agent_context(self.target.id, phase);
        let result = self
            .agents
            .get(phase)
            .run(&ctx, run)
            .await
            .map_err(|source| OrchestratorError::Phase { phase, source })?;
        run.merge_result(phase, result.clone());
        Ok(result)
    }

    fn enter(&self, phase: Phase, message: &str) {
        self.control.set_phase(phase.into());
        self.announce(phase.as_str(), message);
    }

    fn announce(&self, phase: &str, message: impl Into<String>) {
        let msg = WsMessage::PhaseUpdate {
            target_id: self.target.id,
            phase: phase.to_string(),
            message: message.into(),
        };
        self.runtime.sink.broadcast(self.target.id, &msg);
    }

    async fn set_target_status(&self, status: TargetStatus) -> Result<(), OrchestratorError> {
        let target_id = self.target.id;
        self.runtime
            .db
            .call(move |db| db.update_target_status(target_id, status))
            .await
            .map(|_| ())
            .map_err(OrchestratorError::Store)
    }

    async fn finish_cancelled(&self) {
        self.control.set_phase(RunPhase::Cancelled);
        if let Err(e) = self.set_target_status(TargetStatus::Failed).await {
            warn!(target_id = self.target.id, "failed to mark cancelled target: {:#}", e);
        }
        self.announce("cancelled", "Pentest cancelled by user");
        info!(target_id = self.target.id, "pentest cancelled");
    }

    async fn finish_failed(&self, err: &OrchestratorError) {
        self.control.set_phase(RunPhase::Failed);
        if let Err(e) = self.set_target_status(TargetStatus::Failed).await {
            warn!(target_id = self.target.id, "failed to mark failed target: {:#}", e);
        }
        self.announce("error", format!("Pentest failed: {}", err));
        error!(target_id = self.target.id, "pentest failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentContext, PhaseAgent, object};
    use crate::testing::runtime_with_target;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Agent returning a fixed result, optionally gating on approval or failing.
    struct Scripted {
        phase: Phase,
        gate: bool,
        fail: bool,
    }

    #[async_trait]
    impl PhaseAgent for Scripted {
        fn phase(&self) -> Phase {
            self.phase
        }

        async fn run(&self, _ctx: &AgentContext, run: &RunContext) -> anyhow::Result<PhaseResult> {
            if self.fail {
                anyhow::bail!("scripted failure");
            }
            if self.gate && !run.exploit_approved {
                return Ok(object(json!({"status": "awaiting_approval"})));
            }
            Ok(object(json!({
                "status": "done",
                "risk_score": 12.0,
                "approved_seen": run.exploit_approved,
            })))
        }
    }

    fn agents(fail_at: Option<Phase>) -> PhaseAgents {
        let make = |phase: Phase| -> Arc<dyn PhaseAgent> {
            Arc::new(Scripted {
                phase,
                gate: phase == Phase::Exploit,
                fail: fail_at == Some(phase),
            })
        };
        PhaseAgents {
            recon: make(Phase::Recon),
            vuln_scan: make(Phase::VulnScan),
            exploit: make(Phase::Exploit),
            report: make(Phase::Report),
        }
    }

    #[tokio::test]
    async fn test_pipeline_waits_for_approval_then_completes() {
        let (runtime, _, target) = runtime_with_target("http://t");
        let mut sub = runtime.sink.subscribe(target.id);
        let orchestrator = PentestOrchestrator::new(runtime.clone(), agents(None), target.clone());
        let control = orchestrator.control();
        let handle = orchestrator.spawn().unwrap();

        while !control.is_waiting() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(control.current_phase(), RunPhase::Exploit);
        assert!(control.approve());

        let outcome = handle.await.unwrap().unwrap();
        let RunOutcome::Completed { report, context } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(report["risk_score"], 12.0);
        assert!(context.exploit_approved);
        assert_eq!(context.result(Phase::Exploit).unwrap()["approved_seen"], true);
        assert_eq!(control.current_phase(), RunPhase::Completed);
        assert!(runtime.registry.is_empty());

        let stored = runtime
            .db
            .call(move |db| db.get_target(target.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TargetStatus::Completed);

        let mut phases = Vec::new();
        while let Some(raw) = sub.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            phases.push(value["phase"].as_str().unwrap().to_string());
        }
        assert_eq!(
            phases,
            vec!["starting", "recon", "vuln_scan", "exploit", "exploit", "exploit", "report", "completed"]
        );
    }

    #[tokio::test]
    async fn test_failing_phase_marks_target_failed() {
        let (runtime, _, target) = runtime_with_target("http://t");
        let orchestrator =
            PentestOrchestrator::new(runtime.clone(), agents(Some(Phase::VulnScan)), target.clone());
        let control = orchestrator.control();

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Phase {
                phase: Phase::VulnScan,
                ..
            }
        ));
        assert!(err.to_string().contains("scripted failure"));
        assert_eq!(control.current_phase(), RunPhase::Failed);
        assert!(runtime.registry.get(target.id).is_none());

        let stored = runtime
            .db
            .call(move |db| db.get_target(target.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TargetStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_all_phases() {
        let (runtime, _, target) = runtime_with_target("http://t");
        let orchestrator = PentestOrchestrator::new(runtime.clone(), agents(None), target.clone());
        orchestrator.control().cancel();

        let outcome = orchestrator.run().await.unwrap();
        assert!(!outcome.is_completed());
        assert!(outcome.context().results.is_empty());
    }

    #[tokio::test]
    async fn test_second_spawn_for_target_is_rejected() {
        let (runtime, _, target) = runtime_with_target("http://t");
        let first = PentestOrchestrator::new(runtime.clone(), agents(None), target.clone());
        let control = first.control();
        let handle = first.spawn().unwrap();

        let second = PentestOrchestrator::new(runtime.clone(), agents(None), target.clone());
        assert!(matches!(
            second.spawn(),
            Err(OrchestratorError::AlreadyRunning { .. })
        ));

        control.cancel();
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
        assert!(runtime.registry.is_empty());
    }
}

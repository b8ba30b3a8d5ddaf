use std::sync::Arc;

use pentest_common::Phase;
use tracing::info;

use crate::agents::{AgentContext, PhaseAgents};
use crate::config::RunnerConfig;
use crate::db::DbHandle;
use crate::errors::OrchestratorError;
use crate::llm::Analyzer;
use crate::orchestrator::{PentestOrchestrator, RunControl, RunHandle, RunRegistry};
use crate::runner::ToolRunner;
use crate::sink::EventSink;

/// Process-wide services shared by every pipeline.
#[derive(Clone)]
pub struct Runtime {
    pub db: DbHandle,
    pub sink: Arc<EventSink>,
    pub analyzer: Arc<dyn Analyzer>,
    pub runner: Arc<ToolRunner>,
    pub registry: RunRegistry,
    default_timeout_secs: u64,
}

impl Runtime {
    pub fn new(db: DbHandle, analyzer: Arc<dyn Analyzer>, config: &RunnerConfig) -> Self {
        let sink = Arc::new(EventSink::with_buffer(db.clone(), config.live_buffer));
        let runner = Arc::new(ToolRunner::new(
            db.clone(),
            sink.clone(),
            analyzer.clone(),
            config,
        ));
        Self {
            db,
            sink,
            analyzer,
            runner,
            registry: RunRegistry::default(),
            default_timeout_secs: config.default_timeout_secs,
        }
    }

    pub fn agent_context(&self, target_id: i64, phase: Phase) -> AgentContext {
        AgentContext::new(
            target_id,
            phase,
            self.db.clone(),
            self.sink.clone(),
            self.runner.clone(),
            self.analyzer.clone(),
            self.default_timeout_secs,
        )
    }

    /// Look up the target and start its pipeline in the background.
    ///
    /// The run is registered before this returns, so an immediate
    /// approve/cancel for the target always finds it.
    pub async fn start_pentest(
        &self,
        agents: PhaseAgents,
        target_id: i64,
    ) -> Result<(Arc<RunControl>, RunHandle), OrchestratorError> {
        let target = self
            .db
            .call(move |db| db.get_target(target_id))
            .await
            .map_err(OrchestratorError::Store)?
            .ok_or(OrchestratorError::TargetNotFound { target_id })?;
        let orchestrator = PentestOrchestrator::new(self.clone(), agents, target);
        let control = orchestrator.control();
        let handle = orchestrator.spawn()?;
        info!(target_id, run_id = %control.run_id(), "pentest started");
        Ok((control, handle))
    }
}

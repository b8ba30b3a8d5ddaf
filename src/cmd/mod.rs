//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `init`   | `Init`           |
//! | `scan`   | `Scan`           |
//! | `config` | `Config`         |

pub mod config;
pub mod init;
pub mod scan;
pub mod serve;

pub use config::cmd_config;
pub use init::cmd_init;
pub use scan::cmd_scan;
pub use serve::cmd_serve;

use std::sync::Arc;

use anyhow::{Context, Result};
use pentest_orchestrator::agents::PhaseAgents;
use pentest_orchestrator::api::AppState;
use pentest_orchestrator::config::PentestConfig;
use pentest_orchestrator::db::DbHandle;
use pentest_orchestrator::llm::OllamaAnalyzer;
use pentest_orchestrator::runtime::Runtime;

/// Open the store and wire the runtime, analyzer and standard agents.
pub fn build_state(config: &PentestConfig) -> Result<Arc<AppState>> {
    let db = DbHandle::open(&config.store.db_path).with_context(|| {
        format!(
            "Failed to open database at {}",
            config.store.db_path.display()
        )
    })?;
    let analyzer = Arc::new(OllamaAnalyzer::new(&config.llm)?);
    let runtime = Runtime::new(db, analyzer, &config.runner);
    Ok(Arc::new(AppState {
        runtime,
        agents: PhaseAgents::standard(&config.tools),
    }))
}

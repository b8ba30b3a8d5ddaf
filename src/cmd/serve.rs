//! HTTP/WebSocket control server — `pentest serve`.

use anyhow::Result;
use pentest_orchestrator::config::PentestConfig;
use pentest_orchestrator::server::{self, ServerConfig};
use tracing::info;

pub async fn cmd_serve(config: &PentestConfig) -> Result<()> {
    let state = super::build_state(config)?;
    info!(
        db = %config.store.db_path.display(),
        model = %config.llm.model,
        "starting control server"
    );
    server::start_server(
        ServerConfig {
            host: config.server.host.clone(),
            port: config.server.port,
        },
        state,
    )
    .await
}

//! Project bootstrap — `pentest init`.

use std::path::Path;

use anyhow::{Context, Result};
use pentest_orchestrator::config::{DEFAULT_CONFIG_FILE, PentestConfig};
use pentest_orchestrator::db::DbHandle;

pub fn cmd_init(config_path: Option<&Path>, config: &PentestConfig, force: bool) -> Result<()> {
    let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    if path.exists() && !force {
        println!(
            "{} already exists, leaving it untouched (use --force to overwrite)",
            path.display()
        );
    } else {
        std::fs::write(path, config.to_toml()?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote default configuration to {}", path.display());
    }

    DbHandle::open(&config.store.db_path)?;
    println!(
        "Database initialized at {}",
        config.store.db_path.display()
    );
    Ok(())
}

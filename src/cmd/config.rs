//! Configuration view and validation commands — `pentest config`.

use anyhow::Result;
use pentest_orchestrator::config::PentestConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &PentestConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            // Loading already ran validation; report what will be used.
            config.validate()?;
            println!("Configuration is valid.");
            println!(
                "  tools: {} recon, {} vuln_scan, {} exploit",
                config.tools.recon.len(),
                config.tools.vuln_scan.len(),
                config.tools.exploit.len()
            );
            println!("  llm: {} at {}", config.llm.model, config.llm.base_url);
        }
    }
    Ok(())
}

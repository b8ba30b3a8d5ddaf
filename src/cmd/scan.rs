//! One-shot pipeline run in the foreground — `pentest scan <url>`.

use std::sync::Arc;

use anyhow::{Context, Result};
use pentest_orchestrator::agents::TargetEndpoint;
use pentest_orchestrator::config::PentestConfig;
use pentest_orchestrator::orchestrator::{RunControl, RunOutcome};
use pentest_orchestrator::ws::WsMessage;

pub async fn cmd_scan(
    config: &PentestConfig,
    url: &str,
    name: Option<&str>,
    auto_approve: bool,
) -> Result<()> {
    let state = super::build_state(config)?;
    let endpoint = TargetEndpoint::parse(url)?;
    let name = name
        .map(str::to_string)
        .unwrap_or_else(|| endpoint.host.clone());
    let target_url = endpoint.target_url.clone();
    let target = state
        .runtime
        .db
        .call(move |db| db.create_target(&name, &target_url))
        .await?;
    println!("Target #{} created: {}", target.id, target.target_url);

    let mut live = state.runtime.sink.subscribe(target.id);
    let (control, mut handle) = state
        .runtime
        .start_pentest(state.agents.clone(), target.id)
        .await?;

    let mut streaming = true;
    let mut prompted = false;
    let outcome = loop {
        tokio::select! {
            msg = live.recv(), if streaming => {
                match msg {
                    Some(raw) => print_live(&raw),
                    None => {
                        eprintln!("Live output fell behind; waiting for the run to finish.");
                        streaming = false;
                    }
                }
                if control.is_waiting() && !prompted {
                    prompted = true;
                    request_approval(control.clone(), auto_approve);
                }
            }
            result = &mut handle => {
                break result.context("Pentest task panicked")??;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nCancelling pentest...");
                control.cancel();
            }
        }
    };

    while let Some(raw) = live.try_recv() {
        print_live(&raw);
    }
    print_outcome(&outcome);
    Ok(())
}

fn request_approval(control: Arc<RunControl>, auto_approve: bool) {
    if auto_approve {
        println!("Auto-approving exploit validation.");
        control.approve();
        return;
    }
    tokio::spawn(async move {
        println!("Run exploit validation against this target? [y/N]");
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) if line.trim().eq_ignore_ascii_case("y") => {
                control.approve();
            }
            _ => {
                println!("Exploit validation declined.");
                control.cancel();
            }
        }
    });
}

fn print_live(raw: &str) {
    match serde_json::from_str::<WsMessage>(raw) {
        Ok(WsMessage::AgentLog {
            phase,
            log_type,
            message,
            ..
        }) => println!("[{}] {}: {}", phase, log_type, message),
        Ok(WsMessage::PhaseUpdate { phase, message, .. }) => {
            println!("==> [{}] {}", phase, message)
        }
        Err(_) => println!("{}", raw),
    }
}

fn print_outcome(outcome: &RunOutcome) {
    println!();
    match outcome {
        RunOutcome::Completed { report, .. } => {
            println!("Pentest completed.");
            if let Some(score) = report.get("risk_score") {
                println!("  Risk score:     {}/100", score);
            }
            if let Some(total) = report.get("total_findings") {
                println!("  Findings:       {}", total);
            }
            if let Some(summary) = report.get("summary").and_then(|s| s.as_str()) {
                println!();
                println!("{}", summary);
            }
        }
        RunOutcome::Cancelled { .. } => println!("Pentest cancelled."),
    }
}

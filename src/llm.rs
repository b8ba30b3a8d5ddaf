//! AI-analysis boundary. A single prompt in, text out; failures degrade to a
//! sentinel string so analysis can never fail a tool job or a phase.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pentest_common::{EventKind, Phase};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::sink::EventSink;

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Produce analysis text for `prompt`. Never fails; see [`unavailable`].
    async fn analyze(&self, prompt: &str) -> String;
}

/// Sentinel returned in place of analysis when the model cannot be reached.
pub fn unavailable(reason: impl std::fmt::Display) -> String {
    format!("[LLM unavailable: {}]", reason)
}

/// Record the `thinking` event, then ask the analyzer.
///
/// Only the event write can fail; the analyzer itself degrades to the sentinel.
pub async fn ask_llm(
    analyzer: &dyn Analyzer,
    sink: &EventSink,
    target_id: i64,
    phase: Phase,
    prompt: &str,
) -> Result<String> {
    sink.record(target_id, phase, EventKind::Thinking, "AI is analyzing...", None)
        .await?;
    Ok(analyzer.analyze(prompt).await)
}

// ── Ollama ───────────────────────────────────────────────────────────

/// Analyzer backed by an Ollama-compatible `/api/chat` endpoint.
pub struct OllamaAnalyzer {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaAnalyzer {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Self::with_timeout(&config.base_url, &config.model, config.request_timeout())
    }

    pub fn with_timeout(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client for Ollama")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }

    async fn chat(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .context("Failed to connect to Ollama")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama error ({}): {}", status, error_body.trim());
        }

        let api_response: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        api_response
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .context("Ollama response has no message content")
    }
}

#[async_trait]
impl Analyzer for OllamaAnalyzer {
    async fn analyze(&self, prompt: &str) -> String {
        match self.chat(prompt).await {
            Ok(text) => {
                debug!(model = %self.model, chars = text.len(), "analysis received");
                text
            }
            Err(e) => {
                warn!(model = %self.model, error = %format!("{:#}", e), "LLM unavailable");
                unavailable(format!("{:#}", e))
            }
        }
    }
}

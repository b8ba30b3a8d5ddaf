//! Test doubles shared by unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pentest_common::Target;

use crate::config::RunnerConfig;
use crate::db::DbHandle;
use crate::llm::Analyzer;
use crate::runtime::Runtime;

/// Analyzer that answers every prompt with the same text and keeps the prompts.
pub struct CannedAnalyzer {
    reply: String,
    prompts: Mutex<Vec<String>>,
}

impl CannedAnalyzer {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Analyzer for CannedAnalyzer {
    async fn analyze(&self, prompt: &str) -> String {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.reply.clone()
    }
}

/// In-memory runtime with one target already created.
pub fn runtime_with_target(target_url: &str) -> (Runtime, Arc<CannedAnalyzer>, Target) {
    let db = DbHandle::in_memory().unwrap();
    let target = db
        .lock_sync()
        .unwrap()
        .create_target("test-target", target_url)
        .unwrap();
    let analyzer = Arc::new(CannedAnalyzer::new("canned analysis"));
    let runtime = Runtime::new(db, analyzer.clone(), &RunnerConfig::default());
    (runtime, analyzer, target)
}

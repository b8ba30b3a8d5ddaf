pub mod agents;
pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod runner;
pub mod runtime;
pub mod server;
pub mod sink;
pub mod ws;

#[cfg(test)]
mod testing;

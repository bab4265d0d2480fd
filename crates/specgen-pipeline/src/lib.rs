pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod pricing;
pub mod refine;
pub mod types;
pub mod validate;

//! lorapt: continual pretraining of causal language models with low-rank adapters
//!
//! The crate turns raw text corpora into fixed-length training blocks,
//! collates them fault-tolerantly, discovers adapter targets, and drives a
//! pluggable numeric backend through the do-train / do-eval lifecycle.

pub mod cli;
pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod inference;
pub mod lora;
#[cfg(test)]
pub(crate) mod test_logs;
pub mod tokenizer;
pub mod training;

// Re-export commonly used types
pub use config::{ModelType, QuantMode, RunConfig};
pub use data::{BlockChunker, FaultTolerantCollator, SentinelChunker};
pub use error::{Error, Result};
pub use lora::{find_all_linear_names, LoraConfig, ModuleGraph};
pub use training::{BackendRegistry, Orchestrator, ResumeManager, ResumeState};

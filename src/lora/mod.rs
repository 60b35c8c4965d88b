//! Low-rank adapter configuration and target resolution
//!
//! This module provides:
//! - `LoraConfig`: the adapter description handed to the backend
//! - `targets`: discovery of adapter-eligible linear layers
//! - `module_graph`: a module tree reconstructed from checkpoint headers

pub mod module_graph;
pub mod targets;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::{PeftArguments, QuantMode, TargetModules};
use crate::error::{Error, Result};

pub use module_graph::{Module, ModuleGraph, TensorSpec};
pub use targets::{find_all_linear_names, Capability, ModuleNode};

/// File the adapter configuration is persisted under
pub const ADAPTER_CONFIG_NAME: &str = "adapter_config.json";

/// Task the adapter is trained for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    #[default]
    CausalLm,
}

/// Adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub task_type: TaskType,
    /// Low-rank dimension
    pub r: usize,
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    /// `None` lets the backend choose its per-architecture defaults
    pub target_modules: Option<Vec<String>>,
    /// Modules kept fully trainable and saved alongside the adapter
    pub modules_to_save: Option<Vec<String>>,
    pub inference_mode: bool,
}

impl LoraConfig {
    /// Build from arguments plus the already resolved target list
    pub fn new(peft: &PeftArguments, target_modules: Option<Vec<String>>) -> Result<Self> {
        let config = Self {
            task_type: TaskType::CausalLm,
            r: peft.lora_rank,
            lora_alpha: peft.lora_alpha,
            lora_dropout: peft.lora_dropout,
            target_modules,
            modules_to_save: peft.modules_to_save(),
            inference_mode: false,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(Error::config("Invalid rank 0: must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(Error::config(format!(
                "Invalid dropout {}: must be in [0, 1)",
                self.lora_dropout
            )));
        }
        if matches!(&self.target_modules, Some(targets) if targets.is_empty()) {
            return Err(Error::config("target_modules resolved to an empty list"));
        }
        Ok(())
    }

    /// Output scaling applied to the low-rank update
    pub fn scaling(&self) -> f32 {
        self.lora_alpha / self.r as f32
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(ADAPTER_CONFIG_NAME), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let raw = fs::read_to_string(dir.join(ADAPTER_CONFIG_NAME))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Turn the requested target modules into a concrete list
///
/// `all` walks the model; explicit names pass through; unset defers to the
/// backend.
pub fn resolve_target_modules(
    peft: &PeftArguments,
    root: &dyn ModuleNode,
    quant: QuantMode,
) -> Result<Option<Vec<String>>> {
    match peft.target_modules() {
        TargetModules::Unset => {
            warn!("No target_modules given, the backend will pick its defaults");
            Ok(None)
        }
        TargetModules::Named(names) => Ok(Some(names)),
        TargetModules::All => {
            let names = find_all_linear_names(root, quant);
            if names.is_empty() {
                return Err(Error::config(format!(
                    "target_modules=all found no eligible linear layers for quantization {:?}",
                    quant
                )));
            }
            info!(targets = ?names, "Resolved target_modules=all");
            Ok(Some(names))
        }
    }
}

/// Trainable vs. total parameter counts of a model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterCounts {
    pub trainable: u64,
    pub total: u64,
}

impl ParameterCounts {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl std::fmt::Display for ParameterCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

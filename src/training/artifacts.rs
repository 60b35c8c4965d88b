//! Persisted run artifacts
//!
//! A finished run leaves the model (or adapter) weights, the tokenizer and
//! a bincode snapshot of the arguments in the output directory. Every
//! checkpoint gets the adapter weights and the same snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::backend::CausalLm;
use super::checkpoint::{checkpoint_dir_name, rotate_checkpoints};
use crate::config::{PeftArguments, TrainingArguments};
use crate::constants::files::TRAINING_ARGS_NAME;
use crate::error::Result;
use crate::tokenizer::TextTokenizer;

/// Arguments a run was started with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArgsSnapshot {
    pub saved_at: DateTime<Utc>,
    pub training: TrainingArguments,
    pub peft: PeftArguments,
}

impl TrainingArgsSnapshot {
    pub fn new(training: &TrainingArguments, peft: &PeftArguments) -> Self {
        Self {
            saved_at: Utc::now(),
            training: training.clone(),
            peft: peft.clone(),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(TRAINING_ARGS_NAME);
        fs::write(&path, bincode::serialize(self)?)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(bincode::deserialize(&fs::read(path)?)?)
    }
}

/// Save model weights, tokenizer and arguments to `output_dir`
pub fn save_model(
    output_dir: &Path,
    model: &dyn CausalLm,
    tokenizer: &dyn TextTokenizer,
    snapshot: &TrainingArgsSnapshot,
) -> Result<()> {
    info!(output_dir = %output_dir.display(), "Saving model checkpoint");
    fs::create_dir_all(output_dir)?;
    model.save_pretrained(output_dir)?;
    tokenizer.save_pretrained(output_dir)?;
    snapshot.save(output_dir)?;
    Ok(())
}

/// Checkpoint hook for adapter training
///
/// Saves only the adapter weights plus the argument snapshot, then prunes
/// old checkpoints down to `save_total_limit`.
#[derive(Debug, Clone)]
pub struct AdapterCheckpointSaver {
    snapshot: TrainingArgsSnapshot,
}

impl AdapterCheckpointSaver {
    pub fn new(snapshot: TrainingArgsSnapshot) -> Self {
        Self { snapshot }
    }

    /// Save adapter and arguments into `dir`
    pub fn save(&self, dir: &Path, model: &dyn CausalLm) -> Result<()> {
        fs::create_dir_all(dir)?;
        self.snapshot.save(dir)?;
        model.save_pretrained(dir)?;
        Ok(())
    }

    /// Save `checkpoint-<step>` under the output directory and rotate
    pub async fn save_checkpoint(&self, step: usize, model: &dyn CausalLm) -> Result<PathBuf> {
        let output_dir = &self.snapshot.training.output_dir;
        let dir = output_dir.join(checkpoint_dir_name(step));
        self.save(&dir, model)?;
        info!(checkpoint = %dir.display(), step, "Saved adapter checkpoint");

        if let Some(limit) = self.snapshot.training.save_total_limit {
            rotate_checkpoints(output_dir, limit.max(1)).await?;
        }
        Ok(dir)
    }
}

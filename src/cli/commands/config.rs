//! Options shared by every command

use clap::Args;
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::config::{DistributedEnv, RunConfig};
use crate::error::Result;

/// Logging configuration that can be set via CLI or env vars
#[derive(Debug, Clone, Default, Args, Deserialize)]
pub struct LoggingConfig {
    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    #[serde(skip)]
    pub verbose: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", env = "LORAPT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log filter directives
    #[arg(long = "log-filter", env = "LORAPT_LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Mirror logs into this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn get_effective_level(&self) -> &str {
        match (self.verbose, self.log_level.as_deref()) {
            (v, _) if v >= 2 => "trace",
            (1, _) => "debug",
            (0, Some(level)) => level,
            _ => "info",
        }
    }
}

/// Run configuration: config file plus flag overrides
///
/// Flags left unset keep the value from the embedded defaults, the file or
/// `LORAPT__SECTION__KEY` variables.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// TOML file layered over the built-in defaults
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Model family (bloom, chatglm, llama)
    #[arg(long = "model-type")]
    pub model_type: Option<String>,

    #[arg(long = "model-name-or-path")]
    pub model_name_or_path: Option<PathBuf>,

    #[arg(long = "tokenizer-name-or-path")]
    pub tokenizer_name_or_path: Option<PathBuf>,

    #[arg(long = "cache-dir")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long = "load-in-8bit")]
    pub load_in_8bit: bool,

    #[arg(long = "load-in-4bit")]
    pub load_in_4bit: bool,

    #[arg(long = "train-file-dir")]
    pub train_file_dir: Option<PathBuf>,

    #[arg(long = "validation-file-dir")]
    pub validation_file_dir: Option<PathBuf>,

    #[arg(long = "block-size")]
    pub block_size: Option<usize>,

    #[arg(long = "max-train-samples")]
    pub max_train_samples: Option<i64>,

    #[arg(long = "max-eval-samples")]
    pub max_eval_samples: Option<i64>,

    #[arg(long = "streaming")]
    pub streaming: bool,

    #[arg(long = "preprocessing-num-workers")]
    pub preprocessing_num_workers: Option<usize>,

    #[arg(long = "overwrite-cache")]
    pub overwrite_cache: bool,

    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,

    #[arg(long = "overwrite-output-dir")]
    pub overwrite_output_dir: bool,

    #[arg(long = "resume-from-checkpoint")]
    pub resume_from_checkpoint: Option<PathBuf>,

    /// Train all parameters instead of an adapter
    #[arg(long = "full-parameters")]
    pub full_parameters: bool,

    /// Comma separated module names, or "all"
    #[arg(long = "target-modules")]
    pub target_modules: Option<String>,

    #[arg(long = "lora-rank")]
    pub lora_rank: Option<usize>,

    #[arg(long = "lora-alpha")]
    pub lora_alpha: Option<f64>,

    #[arg(long = "lora-dropout")]
    pub lora_dropout: Option<f64>,

    #[arg(long = "modules-to-save")]
    pub modules_to_save: Option<String>,

    #[arg(long = "peft-path")]
    pub peft_path: Option<PathBuf>,

    #[arg(long = "gradient-checkpointing")]
    pub gradient_checkpointing: bool,

    #[arg(long = "seed")]
    pub seed: Option<u64>,
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn set<T: Into<config::Value>>(
    builder: ConfigBuilder<DefaultState>,
    key: &str,
    value: Option<T>,
) -> Result<ConfigBuilder<DefaultState>> {
    Ok(match value {
        Some(value) => builder.set_override(key, value)?,
        None => builder,
    })
}

impl RunArgs {
    /// Layer the flags over defaults, file and environment
    pub fn builder(&self) -> Result<ConfigBuilder<DefaultState>> {
        let b = RunConfig::builder(self.config.as_deref());
        let b = set(b, "model.model_type", self.model_type.clone())?;
        let b = set(b, "model.model_name_or_path", self.model_name_or_path.as_deref().map(path_value))?;
        let b = set(
            b,
            "model.tokenizer_name_or_path",
            self.tokenizer_name_or_path.as_deref().map(path_value),
        )?;
        let b = set(b, "model.cache_dir", self.cache_dir.as_deref().map(path_value))?;
        let b = set(b, "model.load_in_8bit", self.load_in_8bit.then_some(true))?;
        let b = set(b, "model.load_in_4bit", self.load_in_4bit.then_some(true))?;

        let b = set(b, "data.train_file_dir", self.train_file_dir.as_deref().map(path_value))?;
        let b = set(
            b,
            "data.validation_file_dir",
            self.validation_file_dir.as_deref().map(path_value),
        )?;
        let b = set(b, "data.block_size", self.block_size.map(|v| v as u64))?;
        let b = set(b, "data.max_train_samples", self.max_train_samples)?;
        let b = set(b, "data.max_eval_samples", self.max_eval_samples)?;
        let b = set(b, "data.streaming", self.streaming.then_some(true))?;
        let b = set(
            b,
            "data.preprocessing_num_workers",
            self.preprocessing_num_workers.map(|v| v as u64),
        )?;
        let b = set(b, "data.overwrite_cache", self.overwrite_cache.then_some(true))?;

        let b = set(b, "training.output_dir", self.output_dir.as_deref().map(path_value))?;
        let b = set(b, "training.overwrite_output_dir", self.overwrite_output_dir.then_some(true))?;
        let b = set(
            b,
            "training.resume_from_checkpoint",
            self.resume_from_checkpoint.as_deref().map(path_value),
        )?;
        let b = set(b, "training.gradient_checkpointing", self.gradient_checkpointing.then_some(true))?;
        let b = set(b, "training.seed", self.seed)?;

        let b = set(b, "peft.use_peft", self.full_parameters.then_some(false))?;
        let b = set(b, "peft.target_modules", self.target_modules.clone())?;
        let b = set(b, "peft.lora_rank", self.lora_rank.map(|v| v as u64))?;
        let b = set(b, "peft.lora_alpha", self.lora_alpha)?;
        let b = set(b, "peft.lora_dropout", self.lora_dropout)?;
        let b = set(b, "peft.modules_to_save", self.modules_to_save.clone())?;
        set(b, "peft.peft_path", self.peft_path.as_deref().map(path_value))
    }

    /// Resolved configuration with the launcher's distributed environment
    pub fn load(&self) -> Result<RunConfig> {
        let mut config = RunConfig::from_builder(self.builder()?)?;
        config.distributed = DistributedEnv::from_env();
        Ok(config)
    }
}

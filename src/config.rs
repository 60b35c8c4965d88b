//! Configuration management for lorapt runs.
//!
//! Configuration is layered through the `config` crate:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file (`--config`)
//! 3. Environment variables (`LORAPT__<SECTION>__<KEY>`, e.g. `LORAPT__DATA__BLOCK_SIZE`)
//! 4. Command-line overrides
//!
//! Later sources override earlier ones. The resulting [`RunConfig`] is checked
//! by [`RunConfig::validate`] before anything expensive happens; the process
//! environment of a distributed launch is read once into [`DistributedEnv`].

use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Model families the loader knows how to instantiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Bloom,
    ChatGlm,
    Llama,
}

impl ModelType {
    pub const ALL: [ModelType; 3] = [ModelType::Bloom, ModelType::ChatGlm, ModelType::Llama];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Bloom => "bloom",
            ModelType::ChatGlm => "chatglm",
            ModelType::Llama => "llama",
        }
    }

    /// Comma separated list used in error messages
    pub fn available() -> String {
        Self::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bloom" => Ok(ModelType::Bloom),
            "chatglm" => Ok(ModelType::ChatGlm),
            "llama" => Ok(ModelType::Llama),
            other => Err(Error::config(format!(
                "Unknown model_type '{}'. Available model types are {}",
                other,
                Self::available()
            ))),
        }
    }
}

/// Element type the base model is loaded under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorchDtype {
    /// Derived from the checkpoint's own weights
    Auto,
    Bfloat16,
    Float16,
    Float32,
}

/// Weight quantization the base model is loaded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuantMode {
    #[default]
    None,
    Int8,
    Int4,
}

/// Where model weights are placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceMap {
    /// Let the backend spread the model over the visible devices
    Auto,
    /// Whole model on one device ordinal
    Single(usize),
    /// Backend specific strategy name, passed through untouched
    Named(String),
}

/// Arguments pertaining to which model/config/tokenizer we are going to train
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArguments {
    /// One of bloom, chatglm, llama
    pub model_type: Option<String>,
    /// Base model checkpoint for weights initialization
    pub model_name_or_path: Option<PathBuf>,
    /// Tokenizer location, defaults to the base model
    pub tokenizer_name_or_path: Option<PathBuf>,
    pub load_in_8bit: bool,
    pub load_in_4bit: bool,
    pub cache_dir: Option<PathBuf>,
    pub use_fast_tokenizer: bool,
    pub torch_dtype: Option<TorchDtype>,
    /// `auto` or a backend specific placement string
    pub device_map: String,
    pub trust_remote_code: bool,
}

impl Default for ModelArguments {
    fn default() -> Self {
        Self {
            model_type: None,
            model_name_or_path: None,
            tokenizer_name_or_path: None,
            load_in_8bit: false,
            load_in_4bit: false,
            cache_dir: None,
            use_fast_tokenizer: false,
            torch_dtype: None,
            device_map: "auto".to_string(),
            trust_remote_code: true,
        }
    }
}

/// Arguments pertaining to what data we are going to train and evaluate on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataArguments {
    /// Named dataset resolved by the backend's hub loader
    pub dataset_name: Option<String>,
    pub dataset_config_name: Option<String>,
    /// Folder searched recursively for `*.txt` training files
    pub train_file_dir: Option<PathBuf>,
    /// Folder searched recursively for `*.txt` evaluation files
    pub validation_file_dir: Option<PathBuf>,
    /// Truncate the number of training blocks; values <= 0 are ignored
    pub max_train_samples: Option<i64>,
    /// Truncate the number of evaluation blocks; values <= 0 are ignored
    pub max_eval_samples: Option<i64>,
    pub streaming: bool,
    /// Training block length; `None` derives it from the tokenizer
    pub block_size: Option<usize>,
    pub overwrite_cache: bool,
    /// Percentage (0-100) of the train rows used for validation when no
    /// validation source is configured
    pub validation_split_percentage: f64,
    pub preprocessing_num_workers: Option<usize>,
    pub keep_linebreaks: bool,
    /// Keep each document's BOS/EOS around every block instead of plain
    /// concatenation
    pub preserve_sentinels: bool,
}

impl Default for DataArguments {
    fn default() -> Self {
        Self {
            dataset_name: None,
            dataset_config_name: None,
            train_file_dir: None,
            validation_file_dir: None,
            max_train_samples: None,
            max_eval_samples: None,
            streaming: false,
            block_size: Some(crate::constants::data::DEFAULT_BLOCK_SIZE),
            overwrite_cache: false,
            validation_split_percentage: 5.0,
            preprocessing_num_workers: None,
            keep_linebreaks: true,
            preserve_sentinels: false,
        }
    }
}

impl DataArguments {
    pub fn max_train_samples(&self) -> Option<usize> {
        positive(self.max_train_samples)
    }

    pub fn max_eval_samples(&self) -> Option<usize> {
        positive(self.max_eval_samples)
    }
}

fn positive(value: Option<i64>) -> Option<usize> {
    value.filter(|v| *v > 0).map(|v| v as usize)
}

/// Low-rank adapter hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeftArguments {
    pub use_peft: bool,
    /// Comma separated module names, or `all` for every eligible linear layer
    pub target_modules: Option<String>,
    pub lora_rank: usize,
    pub lora_dropout: f32,
    pub lora_alpha: f32,
    /// Comma separated modules kept fully trainable and saved with the adapter
    pub modules_to_save: Option<String>,
    /// Previously trained adapter to continue from
    pub peft_path: Option<PathBuf>,
}

impl Default for PeftArguments {
    fn default() -> Self {
        Self {
            use_peft: true,
            target_modules: Some("all".to_string()),
            lora_rank: 8,
            lora_dropout: 0.05,
            lora_alpha: 32.0,
            modules_to_save: None,
            peft_path: None,
        }
    }
}

/// How adapter target modules were requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetModules {
    /// Let the backend pick its defaults
    Unset,
    /// Every eligible linear layer, found by the target resolver
    All,
    Named(Vec<String>),
}

impl PeftArguments {
    pub fn target_modules(&self) -> TargetModules {
        match self.target_modules.as_deref().map(split_list) {
            None => TargetModules::Unset,
            Some(names) if names.is_empty() => TargetModules::Unset,
            Some(names) if names.iter().any(|n| n == "all") => TargetModules::All,
            Some(names) => TargetModules::Named(names),
        }
    }

    pub fn modules_to_save(&self) -> Option<Vec<String>> {
        self.modules_to_save.as_deref().map(split_list)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Trainer loop arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArguments {
    pub output_dir: PathBuf,
    pub overwrite_output_dir: bool,
    pub do_train: bool,
    pub do_eval: bool,
    /// Explicit checkpoint to resume from; wins over auto-detection
    pub resume_from_checkpoint: Option<PathBuf>,
    pub seed: u64,
    pub gradient_checkpointing: bool,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub warmup_steps: usize,
    pub num_train_epochs: f64,
    /// Overrides `num_train_epochs` when set
    pub max_steps: Option<usize>,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub save_total_limit: Option<usize>,
    pub eval_steps: Option<usize>,
    pub fp16: bool,
    pub bf16: bool,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("outputs-pt"),
            overwrite_output_dir: false,
            do_train: false,
            do_eval: false,
            resume_from_checkpoint: None,
            seed: 42,
            gradient_checkpointing: false,
            per_device_train_batch_size: 4,
            per_device_eval_batch_size: 4,
            gradient_accumulation_steps: 1,
            learning_rate: 2e-4,
            weight_decay: 0.0,
            warmup_steps: 0,
            num_train_epochs: 1.0,
            max_steps: None,
            logging_steps: 10,
            save_steps: 500,
            save_total_limit: Some(3),
            eval_steps: None,
            fp16: false,
            bf16: false,
        }
    }
}

/// Process placement of a (possibly) distributed launch
///
/// Sourced once at startup; nothing in the core reads the environment itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedEnv {
    pub world_size: usize,
    pub rank: usize,
    /// `None` when not launched by a distributed launcher
    pub local_rank: Option<usize>,
    /// Number of accelerator devices visible to this process
    pub visible_devices: usize,
    /// Identifier shared by all processes of one launch
    pub run_id: Option<String>,
}

impl Default for DistributedEnv {
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            local_rank: None,
            visible_devices: 0,
            run_id: None,
        }
    }
}

impl DistributedEnv {
    /// Read `WORLD_SIZE`, `RANK`, `LOCAL_RANK`, `CUDA_VISIBLE_DEVICES` and
    /// the launcher's `TORCHELASTIC_RUN_ID`
    pub fn from_env() -> Self {
        let parse = |key: &str| env::var(key).ok().and_then(|v| v.trim().parse::<usize>().ok());
        let visible_devices = env::var("CUDA_VISIBLE_DEVICES")
            .map(|v| count_devices(&v))
            .unwrap_or(0);

        Self {
            world_size: parse("WORLD_SIZE").unwrap_or(1).max(1),
            rank: parse("RANK").unwrap_or(0),
            local_rank: parse("LOCAL_RANK"),
            visible_devices,
            run_id: env::var("TORCHELASTIC_RUN_ID").ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// Local rank 0 (or a non-distributed process) prepares shared artifacts
    pub fn is_local_main_process(&self) -> bool {
        self.local_rank.unwrap_or(0) == 0
    }

    /// Key shared by the processes of one launch
    ///
    /// The launcher's run id when it set one, otherwise the id of the
    /// launcher process that spawned every local rank.
    pub fn launch_id(&self) -> String {
        if let Some(id) = &self.run_id {
            return id.clone();
        }
        match parent_process_id() {
            Some(pid) => format!("ppid{}", pid),
            None => "default".to_string(),
        }
    }
}

#[cfg(unix)]
fn parent_process_id() -> Option<u32> {
    Some(std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn parent_process_id() -> Option<u32> {
    None
}

/// Count the device ordinals in a `CUDA_VISIBLE_DEVICES`-style list
pub fn count_devices(list: &str) -> usize {
    list.split(',').filter(|s| !s.trim().is_empty()).count()
}

/// Complete configuration of one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelArguments,
    pub data: DataArguments,
    pub peft: PeftArguments,
    pub training: TrainingArguments,
    pub distributed: DistributedEnv,
}

impl RunConfig {
    /// Builder seeded with the embedded defaults, the optional user file and
    /// the environment. Callers add CLI overrides before [`RunConfig::from_builder`].
    pub fn builder(file: Option<&Path>) -> ConfigBuilder<DefaultState> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Toml,
        ));

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }

        builder.add_source(
            config::Environment::with_prefix("LORAPT")
                .separator("__")
                .try_parsing(true),
        )
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: RunConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load from defaults, an optional file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::from_builder(Self::builder(file))
    }

    /// Explicit validation of required and conflicting fields.
    pub fn validate(&self) -> Result<()> {
        let model_type = self.model.model_type.as_deref().ok_or_else(|| {
            Error::config(format!(
                "You must specify a valid model_type to run training. Available model types are {}",
                ModelType::available()
            ))
        })?;
        model_type.parse::<ModelType>()?;

        if self.model.model_name_or_path.is_none() {
            return Err(Error::config(
                "You must specify a valid model_name_or_path; continual pretraining starts from a pretrained model",
            ));
        }
        if self.model.load_in_8bit && self.model.load_in_4bit {
            return Err(Error::config("load_in_8bit and load_in_4bit are mutually exclusive"));
        }
        if self.data.block_size == Some(0) {
            return Err(Error::config("block_size must be positive"));
        }
        if !(0.0..100.0).contains(&self.data.validation_split_percentage) {
            return Err(Error::config(format!(
                "validation_split_percentage must be in [0, 100), got {}",
                self.data.validation_split_percentage
            )));
        }
        if self.peft.use_peft {
            if self.peft.lora_rank == 0 {
                return Err(Error::config("lora_rank must be positive"));
            }
            if !(0.0..1.0).contains(&self.peft.lora_dropout) {
                return Err(Error::config(format!(
                    "lora_dropout must be in [0, 1), got {}",
                    self.peft.lora_dropout
                )));
            }
        }

        let has_source = self.data.dataset_name.is_some() || self.data.train_file_dir.is_some();
        if self.training.do_train && !has_source {
            return Err(Error::config("--do_train requires a train dataset"));
        }
        if self.training.do_eval && !has_source && self.data.validation_file_dir.is_none() {
            return Err(Error::config("--do_eval requires a validation dataset"));
        }

        Ok(())
    }

    /// Parsed model family; only valid after [`RunConfig::validate`]
    pub fn model_type(&self) -> Result<ModelType> {
        self.model
            .model_type
            .as_deref()
            .ok_or_else(|| Error::config("model_type is not set"))?
            .parse()
    }

    pub fn model_path(&self) -> Result<&Path> {
        self.model
            .model_name_or_path
            .as_deref()
            .ok_or_else(|| Error::config("model_name_or_path is not set"))
    }

    /// Tokenizer location, falling back to the base model
    pub fn tokenizer_path(&self) -> Result<&Path> {
        match self.model.tokenizer_name_or_path.as_deref() {
            Some(path) => Ok(path),
            None => self.model_path(),
        }
    }

    pub fn quant_mode(&self) -> QuantMode {
        if self.model.load_in_4bit {
            QuantMode::Int4
        } else if self.model.load_in_8bit {
            QuantMode::Int8
        } else {
            QuantMode::None
        }
    }

    /// Placement of the model for this process.
    ///
    /// With more than one process every process owns the device matching its
    /// local rank; otherwise the configured strategy is used.
    pub fn device_map(&self) -> DeviceMap {
        if self.distributed.is_distributed() {
            return DeviceMap::Single(self.distributed.local_rank.unwrap_or(0));
        }
        match self.model.device_map.trim() {
            "" | "auto" => DeviceMap::Auto,
            other => match other.parse::<usize>() {
                Ok(ordinal) => DeviceMap::Single(ordinal),
                Err(_) => DeviceMap::Named(other.to_string()),
            },
        }
    }
}

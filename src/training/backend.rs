//! Numeric backend seam
//!
//! Model math, adapter injection, optimization and generation live behind
//! these traits. The orchestrator and the inference exporter only drive
//! them; a backend is registered per model family in a [`BackendRegistry`].

use async_trait::async_trait;
use ndarray::Array3;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::artifacts::AdapterCheckpointSaver;
use super::metrics::{Metrics, MetricsEngine};
use crate::config::{DeviceMap, ModelType, QuantMode, TorchDtype, TrainingArguments};
use crate::data::{Batch, FaultTolerantCollator, LmDataset, RawDatasets};
use crate::error::{Error, Result};
use crate::inference::GenerationConfig;
use crate::lora::{LoraConfig, ModuleNode, ParameterCounts};
use crate::tokenizer::TextTokenizer;

/// How the base model is materialized
#[derive(Debug, Clone, PartialEq)]
pub struct ModelLoadOptions {
    /// `None` keeps the backend default, `Auto` derives from the weights
    pub torch_dtype: Option<TorchDtype>,
    pub quant: QuantMode,
    pub device_map: DeviceMap,
    /// Device ordinals the model may use; empty leaves the choice to the backend
    pub devices: Vec<usize>,
    pub trust_remote_code: bool,
    pub cache_dir: Option<PathBuf>,
    pub low_cpu_mem_usage: bool,
}

impl Default for ModelLoadOptions {
    fn default() -> Self {
        Self {
            torch_dtype: None,
            quant: QuantMode::None,
            device_map: DeviceMap::Auto,
            devices: Vec::new(),
            trust_remote_code: true,
            cache_dir: None,
            low_cpu_mem_usage: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenizerLoadOptions {
    pub cache_dir: Option<PathBuf>,
    pub use_fast: bool,
    pub trust_remote_code: bool,
}

/// Result of one forward pass
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Mean token cross-entropy, when labels were supplied
    pub loss: Option<f64>,
    /// `[batch, seq, vocab]`
    pub logits: Array3<f32>,
}

/// A loaded causal language model, optionally wrapped with an adapter
pub trait CausalLm: Send + Sync {
    /// Root of the module hierarchy
    fn module_graph(&self) -> &dyn ModuleNode;

    fn forward(&self, batch: &Batch) -> Result<ModelOutput>;

    /// Continue `input_ids`; returns prompt plus generated ids
    fn generate(&self, input_ids: &[u32], config: &GenerationConfig) -> Result<Vec<u32>>;

    fn parameter_counts(&self) -> ParameterCounts;

    /// Rows of the input embedding matrix
    fn input_embedding_rows(&self) -> usize;

    fn resize_token_embeddings(&mut self, rows: usize) -> Result<()>;

    fn gradient_checkpointing_enable(&mut self) -> Result<()>;

    fn set_use_cache(&mut self, use_cache: bool);

    /// Make embedding outputs require gradients so checkpointed
    /// activations of a frozen base still backpropagate into the adapter
    fn enable_input_require_grads(&mut self) -> Result<()>;

    fn set_model_parallel(&mut self, parallel: bool);

    fn save_pretrained(&self, dir: &Path) -> Result<()>;

    /// Evaluation mode; `float32` upcasts weights for CPU execution
    fn prepare_for_inference(&mut self, float32: bool) -> Result<()>;
}

/// Outcome of a training loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainOutput {
    pub global_step: usize,
    pub training_loss: f64,
    pub metrics: Metrics,
}

/// Everything a backend trainer gets besides the model
pub struct TrainerSetup {
    pub args: TrainingArguments,
    pub train_dataset: Option<LmDataset>,
    pub eval_dataset: Option<LmDataset>,
    pub tokenizer: Arc<dyn TextTokenizer>,
    pub collator: FaultTolerantCollator,
    /// Present when evaluation is requested
    pub metrics: Option<MetricsEngine>,
    /// Present when training an adapter; call on every checkpoint
    pub checkpoint_saver: Option<AdapterCheckpointSaver>,
}

#[async_trait]
pub trait Trainer: Send {
    async fn train(&mut self, resume_from_checkpoint: Option<&Path>) -> Result<TrainOutput>;

    async fn evaluate(&mut self) -> Result<Metrics>;

    /// Persist `trainer_state.json` in the output directory
    fn save_state(&self) -> Result<()>;

    fn model(&self) -> &dyn CausalLm;
}

/// A numeric runtime able to load and train one or more model families
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Seed every random number generator the backend owns
    fn set_seed(&self, _seed: u64) {}

    async fn load_model(
        &self,
        model_type: ModelType,
        path: &Path,
        options: &ModelLoadOptions,
    ) -> Result<Box<dyn CausalLm>>;

    async fn load_tokenizer(
        &self,
        model_type: ModelType,
        path: &Path,
        options: &TokenizerLoadOptions,
    ) -> Result<Arc<dyn TextTokenizer>>;

    /// Cast norms to fp32 and freeze the base for quantized training
    fn prepare_model_for_int8_training(&self, model: Box<dyn CausalLm>) -> Result<Box<dyn CausalLm>> {
        Ok(model)
    }

    fn wrap_with_adapter(
        &self,
        model: Box<dyn CausalLm>,
        config: &LoraConfig,
    ) -> Result<Box<dyn CausalLm>>;

    async fn load_adapter(
        &self,
        model: Box<dyn CausalLm>,
        adapter_dir: &Path,
        trainable: bool,
    ) -> Result<Box<dyn CausalLm>>;

    fn create_trainer(
        &self,
        model: Box<dyn CausalLm>,
        setup: TrainerSetup,
    ) -> Result<Box<dyn Trainer>>;

    /// Named datasets from a remote hub
    async fn load_hub_dataset(
        &self,
        name: &str,
        _config_name: Option<&str>,
        _cache_dir: Option<&Path>,
        _streaming: bool,
    ) -> Result<RawDatasets> {
        Err(Error::Unsupported(format!(
            "backend '{}' cannot load hub dataset '{}'",
            self.name(),
            name
        )))
    }
}

/// Backends keyed by the model family they serve
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<ModelType, Arc<dyn Backend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` for every listed family, replacing earlier ones
    pub fn register(&self, model_types: &[ModelType], backend: Arc<dyn Backend>) {
        let mut backends = self.backends.write();
        for model_type in model_types {
            if backends.insert(*model_type, Arc::clone(&backend)).is_some() {
                warn!(model_type = %model_type, "Replacing registered backend");
            }
            info!(model_type = %model_type, backend = backend.name(), "Registered backend");
        }
    }

    pub fn get(&self, model_type: ModelType) -> Result<Arc<dyn Backend>> {
        self.backends.read().get(&model_type).cloned().ok_or_else(|| {
            Error::config(format!(
                "No numeric backend registered for model_type '{}'",
                model_type
            ))
        })
    }

    pub fn model_types(&self) -> Vec<ModelType> {
        let mut types: Vec<ModelType> = self.backends.read().keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

/// Resize the input embeddings when the tokenizer vocabulary differs
///
/// Returns whether a resize happened.
pub fn align_embeddings(model: &mut dyn CausalLm, vocab_size: usize) -> Result<bool> {
    let rows = model.input_embedding_rows();
    if rows == vocab_size {
        return Ok(false);
    }
    warn!(
        model_vocab = rows,
        tokenizer_vocab = vocab_size,
        "Vocab of the base model and tokenizer differ, resizing embeddings"
    );
    model.resize_token_embeddings(vocab_size)?;
    Ok(true)
}

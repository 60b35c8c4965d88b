//! In-memory numeric backend for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ndarray::{Array3, Ix2};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lorapt_core::config::{ModelType, RunConfig};
use lorapt_core::data::{Batch, FeatureRecord};
use lorapt_core::error::{Error, Result};
use lorapt_core::inference::GenerationConfig;
use lorapt_core::lora::{Capability, LoraConfig, Module, ModuleNode, ParameterCounts};
use lorapt_core::tokenizer::{Encoded, SpecialTokens, TextTokenizer};
use lorapt_core::training::{
    Backend, CausalLm, Metrics, ModelLoadOptions, ModelOutput, Predictions, TokenizerLoadOptions,
    TrainOutput, Trainer, TrainerSetup,
};

/// What the fake backend saw during a run
#[derive(Debug, Default)]
pub struct Recorder {
    pub model_loads: AtomicUsize,
    pub tokenizer_loads: AtomicUsize,
    pub seed: Mutex<Option<u64>>,
    pub load_options: Mutex<Option<ModelLoadOptions>>,
    pub adapter: Mutex<Option<LoraConfig>>,
    pub loaded_adapter: Mutex<Option<PathBuf>>,
    pub resume: Mutex<Option<Option<PathBuf>>>,
    pub use_cache: Mutex<Option<bool>>,
    pub gradient_checkpointing: Mutex<bool>,
    pub input_grads: Mutex<bool>,
    pub model_parallel: Mutex<bool>,
    pub int8_prepared: Mutex<bool>,
    pub train_blocks: AtomicUsize,
    pub eval_blocks: AtomicUsize,
}

/// Bytes shifted past three special ids
pub struct FakeTokenizer {
    pub max_length: usize,
}

impl TextTokenizer for FakeTokenizer {
    fn encode(&self, text: &str) -> Result<Encoded> {
        let mut input_ids = vec![1];
        input_ids.extend(text.bytes().map(|b| u32::from(b) + 3));
        input_ids.push(2);
        let attention_mask = vec![1; input_ids.len()];
        Ok(Encoded { input_ids, attention_mask })
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| !skip_special_tokens || id > 2)
            .map(|&id| id.saturating_sub(3) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        259
    }

    fn model_max_length(&self) -> usize {
        self.max_length
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: Some(1),
            eos: Some(2),
            pad: None,
        }
    }

    fn identity(&self) -> String {
        format!("fake-bytes:{}", self.max_length)
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        fs::write(dir.join("tokenizer_config.json"), "{\"model_max_length\": 64}")?;
        Ok(())
    }
}

/// A two-layer decoder skeleton
pub fn decoder_graph() -> Module {
    let mut root = Module::container("");
    root.insert_path("model.embed_tokens", Capability::Embedding);
    for layer in 0..2 {
        for name in ["q_proj", "k_proj", "v_proj", "o_proj"] {
            root.insert_path(&format!("model.layers.{}.self_attn.{}", layer, name), Capability::Linear);
        }
        for name in ["gate_proj", "up_proj", "down_proj"] {
            root.insert_path(&format!("model.layers.{}.mlp.{}", layer, name), Capability::Linear);
        }
        root.insert_path(&format!("model.layers.{}.input_layernorm", layer), Capability::Norm);
    }
    root.insert_path("model.norm", Capability::Norm);
    root.insert_path("lm_head", Capability::Linear);
    root
}

pub struct FakeModel {
    root: Module,
    recorder: Arc<Recorder>,
    adapter: Option<LoraConfig>,
    embedding_rows: usize,
}

impl CausalLm for FakeModel {
    fn module_graph(&self) -> &dyn ModuleNode {
        &self.root
    }

    fn forward(&self, batch: &Batch) -> Result<ModelOutput> {
        let (rows, seq) = match batch.labels().map(|l| l.shape().to_vec()) {
            Some(shape) if shape.len() == 2 => (shape[0], shape[1]),
            _ => return Err(Error::invalid_data("batch without 2-d labels")),
        };
        Ok(ModelOutput {
            loss: Some(0.5),
            logits: Array3::zeros((rows, seq, 4)),
        })
    }

    fn generate(&self, input_ids: &[u32], config: &GenerationConfig) -> Result<Vec<u32>> {
        let mut ids = input_ids.to_vec();
        ids.extend(" done".bytes().map(|b| u32::from(b) + 3));
        ids.extend(config.special_tokens.eos);
        Ok(ids)
    }

    fn parameter_counts(&self) -> ParameterCounts {
        match &self.adapter {
            Some(lora) => ParameterCounts {
                trainable: lora.r as u64 * 1000,
                total: 1_000_000,
            },
            None => ParameterCounts {
                trainable: 1_000_000,
                total: 1_000_000,
            },
        }
    }

    fn input_embedding_rows(&self) -> usize {
        self.embedding_rows
    }

    fn resize_token_embeddings(&mut self, rows: usize) -> Result<()> {
        self.embedding_rows = rows;
        Ok(())
    }

    fn gradient_checkpointing_enable(&mut self) -> Result<()> {
        *self.recorder.gradient_checkpointing.lock().unwrap() = true;
        Ok(())
    }

    fn set_use_cache(&mut self, use_cache: bool) {
        *self.recorder.use_cache.lock().unwrap() = Some(use_cache);
    }

    fn enable_input_require_grads(&mut self) -> Result<()> {
        *self.recorder.input_grads.lock().unwrap() = true;
        Ok(())
    }

    fn set_model_parallel(&mut self, parallel: bool) {
        *self.recorder.model_parallel.lock().unwrap() = parallel;
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        match &self.adapter {
            Some(lora) => {
                lora.save(dir)?;
                fs::write(dir.join("adapter_model.bin"), b"adapter")?;
            }
            None => fs::write(dir.join("pytorch_model.bin"), b"weights")?,
        }
        Ok(())
    }

    fn prepare_for_inference(&mut self, _float32: bool) -> Result<()> {
        Ok(())
    }
}

pub struct FakeTrainer {
    model: Box<dyn CausalLm>,
    setup: TrainerSetup,
    recorder: Arc<Recorder>,
}

fn drain(dataset: Option<lorapt_core::data::LmDataset>) -> Result<Vec<FeatureRecord>> {
    match dataset {
        Some(dataset) => dataset.into_records().collect(),
        None => Ok(Vec::new()),
    }
}

#[async_trait]
impl Trainer for FakeTrainer {
    async fn train(&mut self, resume_from_checkpoint: Option<&Path>) -> Result<TrainOutput> {
        *self.recorder.resume.lock().unwrap() = Some(resume_from_checkpoint.map(Path::to_path_buf));
        let records = drain(self.setup.train_dataset.take())?;
        self.recorder.train_blocks.store(records.len(), Ordering::SeqCst);

        let batch_size = self.setup.args.per_device_train_batch_size.max(1);
        let mut steps = 0;
        for chunk in records.chunks(batch_size) {
            let batch = self.setup.collator.collate(chunk)?;
            self.model.forward(&batch)?;
            steps += 1;
        }
        if let Some(saver) = &self.setup.checkpoint_saver {
            saver.save_checkpoint(steps, self.model.as_ref()).await?;
        }

        let mut metrics = Metrics::new();
        metrics.insert("train_loss".to_string(), 0.5);
        metrics.insert("epoch".to_string(), 1.0);
        Ok(TrainOutput {
            global_step: steps,
            training_loss: 0.5,
            metrics,
        })
    }

    async fn evaluate(&mut self) -> Result<Metrics> {
        let records = drain(self.setup.eval_dataset.take())?;
        self.recorder.eval_blocks.store(records.len(), Ordering::SeqCst);

        let engine = self
            .setup
            .metrics
            .ok_or_else(|| Error::config("evaluation without a metrics engine"))?;
        let mut accuracy = 0.0;
        let mut batches = 0;
        for chunk in records.chunks(self.setup.args.per_device_eval_batch_size.max(1)) {
            let batch = self.setup.collator.collate(chunk)?;
            let labels = batch
                .labels()
                .and_then(|l| l.as_int())
                .ok_or_else(|| Error::invalid_data("missing integer labels"))?
                .clone()
                .into_dimensionality::<Ix2>()?;
            // a perfect next-token predictor
            let mut predictions = labels.clone();
            let seq = labels.ncols();
            for mut row in predictions.rows_mut() {
                let shifted: Vec<i64> = row.iter().skip(1).copied().chain([0]).collect();
                row.assign(&ndarray::Array1::from(shifted));
            }
            debug_assert_eq!(predictions.ncols(), seq);
            accuracy += engine.compute(&Predictions::Ids(predictions), &labels)?["accuracy"];
            batches += 1;
        }

        let mut metrics = Metrics::new();
        metrics.insert("eval_loss".to_string(), 0.5);
        metrics.insert(
            "eval_accuracy".to_string(),
            if batches == 0 { 0.0 } else { accuracy / batches as f64 },
        );
        Ok(metrics)
    }

    fn save_state(&self) -> Result<()> {
        fs::create_dir_all(&self.setup.args.output_dir)?;
        fs::write(
            self.setup.args.output_dir.join("trainer_state.json"),
            "{\"global_step\": 1}",
        )?;
        Ok(())
    }

    fn model(&self) -> &dyn CausalLm {
        self.model.as_ref()
    }
}

pub struct FakeBackend {
    pub recorder: Arc<Recorder>,
    pub max_length: usize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            max_length: 64,
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn set_seed(&self, seed: u64) {
        *self.recorder.seed.lock().unwrap() = Some(seed);
    }

    async fn load_model(
        &self,
        _model_type: ModelType,
        _path: &Path,
        options: &ModelLoadOptions,
    ) -> Result<Box<dyn CausalLm>> {
        self.recorder.model_loads.fetch_add(1, Ordering::SeqCst);
        *self.recorder.load_options.lock().unwrap() = Some(options.clone());
        Ok(Box::new(FakeModel {
            root: decoder_graph(),
            recorder: Arc::clone(&self.recorder),
            adapter: None,
            embedding_rows: 259,
        }))
    }

    async fn load_tokenizer(
        &self,
        _model_type: ModelType,
        _path: &Path,
        _options: &TokenizerLoadOptions,
    ) -> Result<Arc<dyn TextTokenizer>> {
        self.recorder.tokenizer_loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeTokenizer {
            max_length: self.max_length,
        }))
    }

    fn prepare_model_for_int8_training(&self, model: Box<dyn CausalLm>) -> Result<Box<dyn CausalLm>> {
        *self.recorder.int8_prepared.lock().unwrap() = true;
        Ok(model)
    }

    fn wrap_with_adapter(
        &self,
        model: Box<dyn CausalLm>,
        config: &LoraConfig,
    ) -> Result<Box<dyn CausalLm>> {
        *self.recorder.adapter.lock().unwrap() = Some(config.clone());
        Ok(Box::new(FakeModel {
            root: decoder_graph(),
            recorder: Arc::clone(&self.recorder),
            adapter: Some(config.clone()),
            embedding_rows: model.input_embedding_rows(),
        }))
    }

    async fn load_adapter(
        &self,
        model: Box<dyn CausalLm>,
        adapter_dir: &Path,
        _trainable: bool,
    ) -> Result<Box<dyn CausalLm>> {
        *self.recorder.loaded_adapter.lock().unwrap() = Some(adapter_dir.to_path_buf());
        let config = LoraConfig::load(adapter_dir)?;
        Ok(Box::new(FakeModel {
            root: decoder_graph(),
            recorder: Arc::clone(&self.recorder),
            adapter: Some(config),
            embedding_rows: model.input_embedding_rows(),
        }))
    }

    fn create_trainer(
        &self,
        model: Box<dyn CausalLm>,
        setup: TrainerSetup,
    ) -> Result<Box<dyn Trainer>> {
        Ok(Box::new(FakeTrainer {
            model,
            setup,
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

/// Write `files` text files of `lines` lines each under `dir`
pub fn write_corpus(dir: &Path, files: usize, lines: usize) {
    fs::create_dir_all(dir).unwrap();
    for f in 0..files {
        let text: String = (0..lines)
            .map(|l| format!("file {} line {} of the corpus\n", f, l))
            .collect();
        fs::write(dir.join(format!("part-{}.txt", f)), text).unwrap();
    }
}

/// A valid training configuration rooted in `root`
pub fn run_config(root: &Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.model.model_type = Some("llama".to_string());
    config.model.model_name_or_path = Some(root.join("base"));
    config.data.train_file_dir = Some(root.join("train"));
    config.data.block_size = Some(16);
    config.data.validation_split_percentage = 10.0;
    config.training.output_dir = root.join("output");
    config.training.do_train = true;
    config.training.do_eval = true;
    config.training.per_device_train_batch_size = 4;
    config.training.per_device_eval_batch_size = 4;
    config
}

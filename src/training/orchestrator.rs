//! Do-train / do-eval lifecycle
//!
//! Wires the resume manager, dataset builder, adapter resolver, trainer and
//! metrics together around one [`Backend`]. Configuration problems surface
//! before the backend loads anything.

use std::sync::Arc;
use tracing::{info, warn};

use super::artifacts::{save_model, AdapterCheckpointSaver, TrainingArgsSnapshot};
use super::backend::{
    Backend, BackendRegistry, CausalLm, ModelLoadOptions, TokenizerLoadOptions, TrainerSetup,
};
use super::checkpoint::{ResumeManager, ResumeState};
use super::datasets::{resolve_block_size, DatasetBuilder};
use super::metrics::{log_metrics, perplexity, save_metrics, Metrics, MetricsEngine};
use crate::config::{QuantMode, RunConfig};
use crate::data::FaultTolerantCollator;
use crate::error::Result;
use crate::lora::{resolve_target_modules, LoraConfig, ParameterCounts};
use crate::tokenizer::TextTokenizer;

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub resume: ResumeState,
    pub block_size: usize,
    /// Modules that received adapters, when a new adapter was created
    pub target_modules: Option<Vec<String>>,
    pub parameters: ParameterCounts,
    pub train_metrics: Option<Metrics>,
    pub eval_metrics: Option<Metrics>,
}

pub struct Orchestrator {
    config: RunConfig,
    backend: Arc<dyn Backend>,
}

impl Orchestrator {
    /// Validate `config` and pick the backend for its model family
    pub fn new(config: RunConfig, registry: &BackendRegistry) -> Result<Self> {
        config.validate()?;
        let backend = registry.get(config.model_type()?)?;
        Ok(Self { config, backend })
    }

    pub fn with_backend(config: RunConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, backend })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn model_load_options(&self) -> ModelLoadOptions {
        let model = &self.config.model;
        ModelLoadOptions {
            torch_dtype: model.torch_dtype,
            quant: self.config.quant_mode(),
            device_map: self.config.device_map(),
            devices: Vec::new(),
            trust_remote_code: model.trust_remote_code,
            cache_dir: model.cache_dir.clone(),
            low_cpu_mem_usage: true,
        }
    }

    fn tokenizer_load_options(&self) -> TokenizerLoadOptions {
        let model = &self.config.model;
        TokenizerLoadOptions {
            cache_dir: model.cache_dir.clone(),
            use_fast: model.use_fast_tokenizer,
            trust_remote_code: model.trust_remote_code,
        }
    }

    pub async fn run(&self) -> Result<RunReport> {
        let config = &self.config;
        info!(model = ?config.model, "Model args");
        info!(data = ?config.data, "Data args");
        info!(training = ?config.training, "Training args");
        info!(peft = ?config.peft, "Peft args");

        let resume = ResumeManager::new(&config.training).resolve().await?;
        self.backend.set_seed(config.training.seed);

        let model_type = config.model_type()?;
        let tokenizer = self
            .backend
            .load_tokenizer(model_type, config.tokenizer_path()?, &self.tokenizer_load_options())
            .await?;
        log_tokenizer(tokenizer.as_ref());

        let options = self.model_load_options();
        info!(
            backend = self.backend.name(),
            device_map = ?options.device_map,
            quant = ?options.quant,
            "Loading base model"
        );
        let model = self
            .backend
            .load_model(model_type, config.model_path()?, &options)
            .await?;
        let (mut model, target_modules) = self.adapt(model).await?;
        configure_for_training(model.as_mut(), config)?;
        let parameters = model.parameter_counts();
        info!("{}", parameters);

        let block_size = resolve_block_size(config.data.block_size, tokenizer.model_max_length());
        let datasets = DatasetBuilder::new(config, Arc::clone(&tokenizer), block_size)
            .with_backend(self.backend.as_ref())
            .build()
            .await?;
        let train_samples = datasets.train.as_ref().and_then(|d| d.len());
        let eval_samples = datasets.eval.as_ref().and_then(|d| d.len());
        if let Some(n) = train_samples {
            info!(blocks = n, "Num train samples");
        }
        if let Some(n) = eval_samples {
            info!(blocks = n, "Num eval samples");
        }

        let snapshot = TrainingArgsSnapshot::new(&config.training, &config.peft);
        let setup = TrainerSetup {
            args: config.training.clone(),
            train_dataset: datasets.train,
            eval_dataset: datasets.eval,
            tokenizer: Arc::clone(&tokenizer),
            collator: FaultTolerantCollator::new(),
            metrics: config.training.do_eval.then_some(MetricsEngine),
            checkpoint_saver: config
                .peft
                .use_peft
                .then(|| AdapterCheckpointSaver::new(snapshot.clone())),
        };
        let mut trainer = self.backend.create_trainer(model, setup)?;
        let output_dir = config.training.output_dir.as_path();
        let writes_artifacts = config.distributed.rank == 0;

        let mut report = RunReport {
            resume,
            block_size,
            target_modules,
            parameters,
            train_metrics: None,
            eval_metrics: None,
        };

        if config.training.do_train {
            info!("*** Train ***");
            let output = trainer.train(report.resume.checkpoint_path()).await?;
            let mut metrics = output.metrics;
            if let Some(n) = train_samples {
                metrics.insert("train_samples".to_string(), n as f64);
            }
            log_metrics("train", &metrics);
            if writes_artifacts {
                save_metrics(output_dir, "train", &metrics)?;
                trainer.save_state()?;
                save_model(output_dir, trainer.model(), tokenizer.as_ref(), &snapshot)?;
            }
            report.train_metrics = Some(metrics);
        }

        if config.training.do_eval {
            info!("*** Evaluate ***");
            let mut metrics = trainer.evaluate().await?;
            if let Some(n) = eval_samples {
                metrics.insert("eval_samples".to_string(), n as f64);
            }
            if let Some(loss) = metrics.get("eval_loss").copied() {
                metrics.insert("perplexity".to_string(), perplexity(loss));
            }
            log_metrics("eval", &metrics);
            if writes_artifacts {
                save_metrics(output_dir, "eval", &metrics)?;
            }
            report.eval_metrics = Some(metrics);
        }

        Ok(report)
    }

    /// Attach a saved adapter, a freshly configured one, or nothing
    async fn adapt(
        &self,
        model: Box<dyn CausalLm>,
    ) -> Result<(Box<dyn CausalLm>, Option<Vec<String>>)> {
        let peft = &self.config.peft;
        if !peft.use_peft {
            info!("Full parameters training");
            return Ok((model, None));
        }

        let quant = self.config.quant_mode();
        let (model, targets) = match peft.peft_path.as_deref() {
            Some(path) => {
                info!(adapter = %path.display(), "Peft from pre-trained model");
                let model = self.backend.load_adapter(model, path, true).await?;
                (model, None)
            }
            None => {
                info!("Init new peft model");
                let targets = resolve_target_modules(peft, model.module_graph(), quant)?;
                let lora = LoraConfig::new(peft, targets.clone())?;
                info!(
                    target_modules = ?lora.target_modules,
                    lora_rank = lora.r,
                    modules_to_save = ?lora.modules_to_save,
                    "Configured adapter"
                );
                let model = self.backend.wrap_with_adapter(model, &lora)?;
                (model, targets)
            }
        };

        let model = if quant == QuantMode::Int8 {
            self.backend.prepare_model_for_int8_training(model)?
        } else {
            model
        };
        Ok((model, targets))
    }
}

/// Gradient checkpointing, cache, input gradients and model parallelism
fn configure_for_training(model: &mut dyn CausalLm, config: &RunConfig) -> Result<()> {
    if config.training.gradient_checkpointing {
        model.gradient_checkpointing_enable()?;
        model.set_use_cache(false);
    } else {
        model.set_use_cache(true);
    }
    model.enable_input_require_grads()?;

    if !config.distributed.is_distributed() && config.distributed.visible_devices > 1 {
        info!(devices = config.distributed.visible_devices, "Enabling model parallelism");
        model.set_model_parallel(true);
    }
    Ok(())
}

/// Log what preprocessing will see of the tokenizer
pub fn log_tokenizer(tokenizer: &dyn TextTokenizer) {
    let specials = tokenizer.special_tokens();
    if specials.pad.is_none() {
        warn!("Tokenizer has no pad token; batches rely on fixed-length blocks");
    }
    info!(
        vocab_size = tokenizer.vocab_size(),
        model_max_length = tokenizer.model_max_length(),
        identity = %tokenizer.identity(),
        "Tokenizer loaded"
    );
}

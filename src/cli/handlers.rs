//! CLI handlers

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use super::commands::{
    InferCommand, PrepareCommand, ResumeStatusCommand, TargetsCommand, TrainCommand,
};
use crate::config::ModelType;
use crate::inference::{export_predictions, load_examples, GenerationConfig, InferenceOptions, Predictor};
use crate::lora::{find_all_linear_names, ModuleGraph};
use crate::tokenizer::{HfTokenizer, TextTokenizer};
use crate::training::checkpoint::conflict_message;
use crate::training::{
    log_tokenizer, resolve_block_size, BackendRegistry, DatasetBuilder, Orchestrator,
    ResumeManager, ResumeState,
};

pub async fn handle_train(cmd: TrainCommand, registry: &BackendRegistry) -> Result<()> {
    let mut config = cmd.run.load().context("Failed to load configuration")?;
    config.training.do_train |= cmd.do_train;
    config.training.do_eval |= cmd.do_eval;

    let orchestrator = Orchestrator::new(config, registry)?;
    let report = orchestrator.run().await.context("Training run failed")?;

    println!("Block size: {}", report.block_size);
    if let Some(targets) = &report.target_modules {
        println!("Adapter targets: {}", targets.join(","));
    }
    println!("{}", report.parameters);
    for (split, metrics) in [("train", &report.train_metrics), ("eval", &report.eval_metrics)] {
        if let Some(metrics) = metrics {
            println!("{} metrics:", split);
            for (key, value) in metrics {
                println!("  {} = {}", key, value);
            }
        }
    }
    Ok(())
}

pub async fn handle_prepare(cmd: PrepareCommand) -> Result<()> {
    let mut config = cmd.run.load().context("Failed to load configuration")?;
    config.training.do_train =
        config.data.train_file_dir.is_some() || config.data.dataset_name.is_some();
    config.training.do_eval = config.training.do_train || config.data.validation_file_dir.is_some();
    config.validate()?;

    let tokenizer_path = config.tokenizer_path()?;
    let tokenizer: Arc<dyn TextTokenizer> = Arc::new(
        HfTokenizer::from_dir(tokenizer_path)
            .with_context(|| format!("Failed to load tokenizer from {}", tokenizer_path.display()))?,
    );
    log_tokenizer(tokenizer.as_ref());

    let block_size = resolve_block_size(config.data.block_size, tokenizer.model_max_length());
    let prepared = DatasetBuilder::new(&config, tokenizer, block_size).build().await?;

    println!("Block size: {}", block_size);
    for (split, dataset) in [("train", &prepared.train), ("validation", &prepared.eval)] {
        match dataset.as_ref().map(|d| d.len()) {
            Some(Some(blocks)) => println!("{}: {} blocks", split, blocks),
            Some(None) => println!("{}: streaming", split),
            None => {}
        }
    }
    Ok(())
}

pub async fn handle_targets(cmd: TargetsCommand) -> Result<()> {
    let graph = ModuleGraph::from_safetensors_dir(&cmd.model_dir)
        .with_context(|| format!("Failed to read weights in {}", cmd.model_dir.display()))?;
    let targets = find_all_linear_names(&graph.root, cmd.quant.into());
    info!(parameters = graph.total_parameters, "Read module graph");

    for target in &targets {
        println!("{}", target);
    }
    Ok(())
}

pub async fn handle_resume_status(cmd: ResumeStatusCommand) -> Result<()> {
    let mut config = cmd.run.load().context("Failed to load configuration")?;
    config.training.do_train = true;

    let state = ResumeManager::new(&config.training).inspect().await?;
    match &state {
        ResumeState::NoPriorRun => println!("No prior run, training starts from scratch"),
        ResumeState::ResumableCheckpointFound(found) => println!(
            "Resumes from {} (step {})",
            found.path.display(),
            found.step
        ),
        ResumeState::NonEmptyConflictingDirectory { output_dir } => {
            println!("{}", conflict_message(output_dir))
        }
        ResumeState::ExplicitResumeRequested { path, auto_detected } => {
            println!("Resumes from requested checkpoint {}", path.display());
            if let Some(found) = auto_detected {
                println!("  (ignoring detected {})", found.path.display());
            }
        }
    }
    Ok(())
}

pub async fn handle_infer(cmd: InferCommand, registry: &BackendRegistry) -> Result<()> {
    let model_type: ModelType = cmd.model_type.parse()?;
    let backend = registry.get(model_type)?;

    let options = InferenceOptions {
        model_type,
        base_model: cmd.base_model,
        lora_model: cmd.lora_model,
        tokenizer_path: cmd.tokenizer_path,
        data_file: cmd.data_file,
        with_prompt: cmd.with_prompt,
        interactive: cmd.interactive,
        predictions_file: cmd.predictions_file,
        gpus: cmd.gpus,
        only_cpu: cmd.only_cpu,
        resize_emb: cmd.resize_emb,
    };
    let predictor = Predictor::load(backend.as_ref(), &options, GenerationConfig::default())
        .await
        .context("Failed to load model for inference")?;

    if options.interactive {
        let stdin = std::io::stdin();
        predictor.interactive(stdin.lock(), std::io::stdout())?;
    } else {
        let examples = load_examples(options.data_file.as_deref())?;
        let predictions = predictor.predict_batch(&examples)?;
        for (index, prediction) in predictions.iter().enumerate() {
            println!("======={}=======", index);
            println!("Input: {}\n", prediction.input);
            println!("Output: {}\n", prediction.output);
        }
        export_predictions(
            &options.predictions_file,
            &predictions,
            predictor.generation_config(),
        )?;
    }
    Ok(())
}

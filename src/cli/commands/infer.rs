use clap::Args;
use std::path::PathBuf;

use super::config::LoggingConfig;

/// Generate with a base model and an optional adapter
#[derive(Debug, Clone, Args)]
pub struct InferCommand {
    /// Model family (bloom, chatglm, llama)
    #[arg(long = "model-type")]
    pub model_type: String,

    #[arg(long = "base-model")]
    pub base_model: PathBuf,

    /// Adapter directory; omit to run the base model alone
    #[arg(long = "lora-model")]
    pub lora_model: Option<PathBuf>,

    #[arg(long = "tokenizer-path")]
    pub tokenizer_path: Option<PathBuf>,

    /// A file with one instruction per line
    #[arg(long = "data-file")]
    pub data_file: Option<PathBuf>,

    /// Wrap every input in the instruction prompt
    #[arg(long = "with-prompt")]
    pub with_prompt: bool,

    /// Single-turn instruction mode on stdin
    #[arg(long = "interactive")]
    pub interactive: bool,

    #[arg(long = "predictions-file", default_value = "./predictions.json")]
    pub predictions_file: PathBuf,

    #[arg(long = "gpus", default_value = "0")]
    pub gpus: String,

    #[arg(long = "only-cpu")]
    pub only_cpu: bool,

    /// Resize token embeddings to the tokenizer vocabulary
    #[arg(long = "resize-emb")]
    pub resize_emb: bool,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

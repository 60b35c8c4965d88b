use clap::Args;

use super::config::{LoggingConfig, RunArgs};

/// Continual pretraining with an adapter (or all parameters)
#[derive(Debug, Clone, Args)]
pub struct TrainCommand {
    #[command(flatten)]
    pub run: RunArgs,

    /// Run the training loop
    #[arg(long = "do-train")]
    pub do_train: bool,

    /// Evaluate on the validation split
    #[arg(long = "do-eval")]
    pub do_eval: bool,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

/// Tokenize and chunk the corpus into the block cache
#[derive(Debug, Clone, Args)]
pub struct PrepareCommand {
    #[command(flatten)]
    pub run: RunArgs,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

/// Show how a training run would treat the output directory
#[derive(Debug, Clone, Args)]
pub struct ResumeStatusCommand {
    #[command(flatten)]
    pub run: RunArgs,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

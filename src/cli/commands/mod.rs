pub mod config;
pub mod infer;
pub mod targets;
pub mod train;

pub use config::{LoggingConfig, RunArgs};
pub use infer::InferCommand;
pub use targets::{QuantArg, TargetsCommand};
pub use train::{PrepareCommand, ResumeStatusCommand, TrainCommand};

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Continual pretraining run
    Train(TrainCommand),
    /// Build the block cache without a model
    Prepare(PrepareCommand),
    /// Print the adapter targets of a safetensors checkpoint
    Targets(TargetsCommand),
    /// Inspect the output directory for resumable checkpoints
    ResumeStatus(ResumeStatusCommand),
    /// Batch or interactive generation
    Infer(InferCommand),
}

impl Commands {
    pub fn logging(&self) -> &LoggingConfig {
        match self {
            Commands::Train(cmd) => &cmd.logging,
            Commands::Prepare(cmd) => &cmd.logging,
            Commands::Targets(cmd) => &cmd.logging,
            Commands::ResumeStatus(cmd) => &cmd.logging,
            Commands::Infer(cmd) => &cmd.logging,
        }
    }
}

use clap::{Args, ValueEnum};
use std::path::PathBuf;

use super::config::LoggingConfig;
use crate::config::QuantMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum QuantArg {
    #[default]
    None,
    Int8,
    Int4,
}

impl From<QuantArg> for QuantMode {
    fn from(arg: QuantArg) -> Self {
        match arg {
            QuantArg::None => QuantMode::None,
            QuantArg::Int8 => QuantMode::Int8,
            QuantArg::Int4 => QuantMode::Int4,
        }
    }
}

/// List the linear layers that would receive adapters
#[derive(Debug, Clone, Args)]
pub struct TargetsCommand {
    /// Directory holding `*.safetensors` weights
    #[arg(long = "model-dir")]
    pub model_dir: PathBuf,

    /// Weight precision the model would be loaded with
    #[arg(long = "quant", value_enum, default_value_t = QuantArg::None)]
    pub quant: QuantArg,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

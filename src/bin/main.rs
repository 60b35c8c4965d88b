//! lorapt binary.
//!
//! Continual pretraining of causal language models with low-rank adapters,
//! plus dataset preparation and inference export.

use clap::Parser;
use lorapt_core::{
    cli::commands::Commands,
    cli::handlers::{handle_infer, handle_prepare, handle_resume_status, handle_targets, handle_train},
    cli::LoggingConfig,
    training::BackendRegistry,
};
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = logging.get_effective_level();
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(level.parse().unwrap_or(Level::INFO).into())
            .parse_lossy(logging.log_filter.as_deref().unwrap_or(""))
    };

    let stdout = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter());

    let (file, guard) = match &logging.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("--log-file must name a file"))?;
            let appender = tracing_appender::rolling::never(dir.unwrap_or(std::path::Path::new(".")), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_log::LogTracer::init()?;
    let subscriber = tracing_subscriber::registry().with(stdout).with(file);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.command.logging())?;

    info!("lorapt starting up");

    // Numeric backends register here; without one, commands that need a
    // model report a configuration error before loading anything.
    let registry = BackendRegistry::new();

    match cli.command {
        Commands::Train(cmd) => handle_train(cmd, &registry).await?,
        Commands::Prepare(cmd) => handle_prepare(cmd).await?,
        Commands::Targets(cmd) => handle_targets(cmd).await?,
        Commands::ResumeStatus(cmd) => handle_resume_status(cmd).await?,
        Commands::Infer(cmd) => handle_infer(cmd, &registry).await?,
    }

    Ok(())
}

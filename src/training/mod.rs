//! Training orchestration, checkpoint management and metrics

pub mod artifacts;
pub mod backend;
pub mod checkpoint;
pub mod datasets;
pub mod distributed;
pub mod metrics;
pub mod orchestrator;

pub use artifacts::{save_model, AdapterCheckpointSaver, TrainingArgsSnapshot};
pub use backend::{
    align_embeddings, Backend, BackendRegistry, CausalLm, ModelLoadOptions, ModelOutput,
    TokenizerLoadOptions, TrainOutput, Trainer, TrainerSetup,
};
pub use checkpoint::{
    get_last_checkpoint, list_checkpoints, rotate_checkpoints, CheckpointInfo, ResumeManager,
    ResumeState, TrainerState,
};
pub use datasets::{resolve_block_size, DatasetBuilder, PreparedDatasets};
pub use distributed::MainProcessFirst;
pub use metrics::{
    compute_metrics, log_metrics, perplexity, preprocess_logits_for_metrics, save_metrics,
    Metrics, MetricsEngine, Predictions,
};
pub use orchestrator::{log_tokenizer, Orchestrator, RunReport};

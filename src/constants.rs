//! Shared constants for lorapt
//!
//! Centralizes file names, size limits and defaults so the trainer, the
//! inference exporter and the CLI agree on the persisted layout.

/// Names of artifacts persisted in an output directory
pub mod files {
    /// Serialized training arguments written next to model weights
    pub const TRAINING_ARGS_NAME: &str = "training_args.bin";

    /// Trainer state written inside every checkpoint directory
    pub const TRAINER_STATE_NAME: &str = "trainer_state.json";

    /// Merged metrics across all splits
    pub const ALL_RESULTS_NAME: &str = "all_results.json";

    /// Presence of this file marks a directory as carrying a tokenizer
    pub const TOKENIZER_CONFIG_NAME: &str = "tokenizer_config.json";

    /// Serialized tokenizer model
    pub const TOKENIZER_FILE_NAME: &str = "tokenizer.json";

    /// Index of a sharded safetensors checkpoint
    pub const SAFETENSORS_INDEX_NAME: &str = "model.safetensors.index.json";

    /// Inference export file names
    pub const PREDICTIONS_NAME: &str = "predictions.json";
    pub const GENERATION_CONFIG_NAME: &str = "generation_config.json";
}

/// Checkpoint directory naming
pub mod checkpoint {
    /// Checkpoint directories are named `checkpoint-<global step>`
    pub const PREFIX_CHECKPOINT_DIR: &str = "checkpoint";
}

/// Size limits
pub mod limits {
    /// Minimum size for a valid SafeTensors file (8 bytes for header length)
    pub const MIN_SAFETENSORS_SIZE: u64 = 8;
}

/// Preprocessing defaults
pub mod data {
    /// Canonical text column of raw datasets
    pub const TEXT_COLUMN: &str = "text";

    pub const INPUT_IDS: &str = "input_ids";
    pub const ATTENTION_MASK: &str = "attention_mask";
    pub const LABELS: &str = "labels";

    /// Rows handed to one tokenize+chunk map call
    pub const MAP_BATCH_SIZE: usize = 1000;

    /// Block size used when the tokenizer allows something longer
    pub const DEFAULT_BLOCK_SIZE: usize = 1024;

    /// Name of the marker written once the main process has prepared a dataset
    pub const READY_MARKER: &str = ".main_process_ready";
}

/// Adapter injection
pub mod lora {
    /// Fully qualified names containing this marker never get an adapter
    pub const OUTPUT_HEAD_MARKER: &str = "lm_head";
}

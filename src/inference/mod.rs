//! Generation with a trained adapter

pub mod generation;
pub mod predict;

pub use generation::{extract_response, generate_prompt, GenerationConfig, PROMPT_TEMPLATE};
pub use predict::{
    export_predictions, load_examples, InferenceOptions, Prediction, Predictor,
    SAMPLE_INSTRUCTION,
};

//! Decoding parameters and the instruction prompt

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tokenizer::SpecialTokens;

/// Instruction template wrapped around inputs in prompt mode
pub const PROMPT_TEMPLATE: &str = "Below is an instruction that describes a task. \
Write a response that appropriately completes the request.\n\n\
### Instruction:\n\n{instruction}\n\n### Response:\n\n";

/// Marker separating the prompt from the generated answer
pub const RESPONSE_MARKER: &str = "### Response:";

/// Sampling parameters passed to `generate`
///
/// Serialized as-is into `generation_config.json`; the special token ids
/// come from the tokenizer and are not part of the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub do_sample: bool,
    pub num_beams: usize,
    pub repetition_penalty: f32,
    pub max_new_tokens: usize,
    #[serde(skip)]
    pub special_tokens: SpecialTokens,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_k: 40,
            top_p: 0.9,
            do_sample: true,
            num_beams: 1,
            repetition_penalty: 1.3,
            max_new_tokens: 400,
            special_tokens: SpecialTokens::default(),
        }
    }
}

impl GenerationConfig {
    pub fn with_special_tokens(mut self, special_tokens: SpecialTokens) -> Self {
        self.special_tokens = special_tokens;
        self
    }
}

/// Wrap an instruction (and optional input) in [`PROMPT_TEMPLATE`]
pub fn generate_prompt(instruction: &str, input: Option<&str>) -> String {
    let instruction = match input.filter(|i| !i.is_empty()) {
        Some(input) => format!("{}\n{}", instruction, input),
        None => instruction.to_string(),
    };
    PROMPT_TEMPLATE.replace("{instruction}", &instruction)
}

/// Text after the first response marker, trimmed
///
/// Output without a marker is returned trimmed as a whole.
pub fn extract_response(output: &str) -> String {
    match output.split(RESPONSE_MARKER).nth(1) {
        Some(response) => response.trim().to_string(),
        None => {
            warn!("Generated text has no response marker, returning it whole");
            output.trim().to_string()
        }
    }
}

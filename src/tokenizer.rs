//! Tokenizer abstraction
//!
//! `TextTokenizer` is the seam the data pipeline and the inference exporter
//! encode through. `HfTokenizer` implements it over a `tokenizer.json`
//! file plus the optional `tokenizer_config.json` beside it.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::constants::files::{TOKENIZER_CONFIG_NAME, TOKENIZER_FILE_NAME};
use crate::error::{Error, Result};

/// Token ids and attention mask for one text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoded {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

/// Special token ids the generator needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
}

pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Encoded>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Vocabulary size including added tokens
    fn vocab_size(&self) -> usize;

    /// Longest sequence the tokenizer claims to support
    fn model_max_length(&self) -> usize;

    fn special_tokens(&self) -> SpecialTokens;

    /// Stable description of this tokenizer, used in cache fingerprints
    fn identity(&self) -> String;

    fn save_pretrained(&self, dir: &Path) -> Result<()>;
}

/// `model_max_length` reported when the tokenizer config leaves it unset
pub const UNBOUNDED_MODEL_MAX_LENGTH: usize = usize::MAX;

/// Tokenizer backed by the `tokenizers` crate
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    config: Value,
    source: PathBuf,
    model_max_length: usize,
    special: SpecialTokens,
}

impl HfTokenizer {
    /// Load `tokenizer.json` (and `tokenizer_config.json` if present) from `dir`
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let tokenizer_path = dir.join(TOKENIZER_FILE_NAME);
        if !tokenizer_path.exists() {
            return Err(Error::Tokenizer(format!(
                "Tokenizer not found at {}",
                tokenizer_path.display()
            )));
        }
        let inner = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::Tokenizer(format!("Failed to load tokenizer: {}", e)))?;

        let config_path = dir.join(TOKENIZER_CONFIG_NAME);
        let config = if config_path.exists() {
            serde_json::from_str(&fs::read_to_string(&config_path)?)?
        } else {
            debug!(dir = %dir.display(), "No tokenizer config, using defaults");
            Value::Object(Default::default())
        };

        let model_max_length = config
            .get("model_max_length")
            .and_then(Value::as_f64)
            .map(|v| {
                if v >= usize::MAX as f64 {
                    UNBOUNDED_MODEL_MAX_LENGTH
                } else {
                    v as usize
                }
            })
            .unwrap_or(UNBOUNDED_MODEL_MAX_LENGTH);

        let special = SpecialTokens {
            bos: special_token_id(&inner, &config, "bos_token"),
            eos: special_token_id(&inner, &config, "eos_token"),
            pad: special_token_id(&inner, &config, "pad_token"),
        };

        info!(
            path = %tokenizer_path.display(),
            vocab_size = inner.get_vocab_size(true),
            "Loaded tokenizer"
        );

        Ok(Self {
            inner,
            config,
            source: dir.to_path_buf(),
            model_max_length,
            special,
        })
    }
}

/// Special tokens appear either as a plain string or as `{"content": ...}`
fn special_token_id(inner: &tokenizers::Tokenizer, config: &Value, key: &str) -> Option<u32> {
    let token = match config.get(key)? {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("content")?.as_str()?,
        _ => return None,
    };
    inner.token_to_id(token)
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Encoded> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| Error::Tokenizer(format!("Encoding failed: {}", e)))?;
        Ok(Encoded {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Tokenizer(format!("Decoding failed: {}", e)))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn model_max_length(&self) -> usize {
        self.model_max_length
    }

    fn special_tokens(&self) -> SpecialTokens {
        self.special
    }

    fn identity(&self) -> String {
        format!("{}:{}", self.source.display(), self.vocab_size())
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        self.inner
            .save(dir.join(TOKENIZER_FILE_NAME), false)
            .map_err(|e| Error::Tokenizer(format!("Failed to save tokenizer: {}", e)))?;
        fs::write(
            dir.join(TOKENIZER_CONFIG_NAME),
            serde_json::to_string_pretty(&self.config)?,
        )?;
        Ok(())
    }
}

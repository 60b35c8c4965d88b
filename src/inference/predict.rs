//! Text generation with a base model and an optional adapter
//!
//! Batch mode runs every example once and exports `predictions.json` with a
//! sibling `generation_config.json`. Interactive mode is a single-turn loop
//! over any reader/writer pair.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::generation::{extract_response, generate_prompt, GenerationConfig};
use crate::config::{DeviceMap, ModelType, QuantMode, TorchDtype};
use crate::constants::files::{GENERATION_CONFIG_NAME, PREDICTIONS_NAME, TOKENIZER_CONFIG_NAME};
use crate::error::{Error, Result};
use crate::tokenizer::TextTokenizer;
use crate::training::{align_embeddings, Backend, CausalLm, ModelLoadOptions, TokenizerLoadOptions};

/// Example used when no data file is given
pub const SAMPLE_INSTRUCTION: &str = "What is the difference between hepatitis B and hepatitis C?";

#[derive(Debug, Clone)]
pub struct InferenceOptions {
    pub model_type: ModelType,
    pub base_model: PathBuf,
    /// Adapter directory; `None` runs the base model alone
    pub lora_model: Option<PathBuf>,
    pub tokenizer_path: Option<PathBuf>,
    /// One instruction per line
    pub data_file: Option<PathBuf>,
    pub with_prompt: bool,
    pub interactive: bool,
    pub predictions_file: PathBuf,
    /// Comma separated device ordinals
    pub gpus: String,
    pub only_cpu: bool,
    pub resize_emb: bool,
}

impl InferenceOptions {
    pub fn new(model_type: ModelType, base_model: impl Into<PathBuf>) -> Self {
        Self {
            model_type,
            base_model: base_model.into(),
            lora_model: None,
            tokenizer_path: None,
            data_file: None,
            with_prompt: false,
            interactive: false,
            predictions_file: PathBuf::from(".").join(PREDICTIONS_NAME),
            gpus: "0".to_string(),
            only_cpu: false,
            resize_emb: false,
        }
    }

    /// Explicit path, else an adapter directory carrying a tokenizer, else the base model
    pub fn resolve_tokenizer_path(&self) -> PathBuf {
        if let Some(path) = &self.tokenizer_path {
            return path.clone();
        }
        match &self.lora_model {
            Some(dir) if dir.join(TOKENIZER_CONFIG_NAME).exists() => dir.clone(),
            _ => self.base_model.clone(),
        }
    }

    /// Device ordinals parsed from `gpus`; empty means CPU
    pub fn devices(&self) -> Result<Vec<usize>> {
        if self.only_cpu {
            return Ok(Vec::new());
        }
        self.gpus
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|_| Error::config(format!("invalid device ordinal '{}' in gpus", s)))
            })
            .collect()
    }

    pub fn uses_cpu(&self) -> bool {
        self.devices().map_or(false, |devices| devices.is_empty())
    }

    fn model_load_options(&self) -> Result<ModelLoadOptions> {
        let devices = self.devices()?;
        let cpu = devices.is_empty();
        Ok(ModelLoadOptions {
            torch_dtype: Some(if cpu { TorchDtype::Float32 } else { TorchDtype::Float16 }),
            quant: QuantMode::None,
            device_map: if cpu {
                DeviceMap::Named("cpu".to_string())
            } else {
                DeviceMap::Auto
            },
            devices,
            trust_remote_code: true,
            cache_dir: None,
            low_cpu_mem_usage: true,
        })
    }
}

/// One exported generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(rename = "Input")]
    pub input: String,
    #[serde(rename = "Output")]
    pub output: String,
}

/// Read one instruction per line, trimmed; falls back to [`SAMPLE_INSTRUCTION`]
pub fn load_examples(data_file: Option<&Path>) -> Result<Vec<String>> {
    let Some(path) = data_file else {
        return Ok(vec![SAMPLE_INSTRUCTION.to_string()]);
    };
    let examples: Vec<String> = fs::read_to_string(path)?
        .lines()
        .map(|line| line.trim().to_string())
        .collect();
    info!(file = %path.display(), count = examples.len(), "Loaded examples");
    for example in examples.iter().take(10) {
        debug!(example = %example, "Example");
    }
    Ok(examples)
}

/// Write `predictions` and the decoding parameters next to each other
pub fn export_predictions(
    predictions_file: &Path,
    predictions: &[Prediction],
    generation: &GenerationConfig,
) -> Result<PathBuf> {
    let dir = match predictions_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    fs::write(predictions_file, serde_json::to_string_pretty(predictions)?)?;
    let config_path = dir.join(GENERATION_CONFIG_NAME);
    fs::write(&config_path, serde_json::to_string_pretty(generation)?)?;
    info!(
        predictions = %predictions_file.display(),
        generation_config = %config_path.display(),
        "Saved predictions"
    );
    Ok(config_path)
}

/// A model ready for generation
pub struct Predictor {
    model: Box<dyn CausalLm>,
    tokenizer: Arc<dyn TextTokenizer>,
    generation: GenerationConfig,
    with_prompt: bool,
}

impl Predictor {
    pub fn new(
        model: Box<dyn CausalLm>,
        tokenizer: Arc<dyn TextTokenizer>,
        generation: GenerationConfig,
        with_prompt: bool,
    ) -> Self {
        let generation = generation.with_special_tokens(tokenizer.special_tokens());
        Self {
            model,
            tokenizer,
            generation,
            with_prompt,
        }
    }

    /// Load tokenizer, base model and adapter through `backend`
    pub async fn load(
        backend: &dyn Backend,
        options: &InferenceOptions,
        generation: GenerationConfig,
    ) -> Result<Self> {
        let tokenizer_path = options.resolve_tokenizer_path();
        let tokenizer = backend
            .load_tokenizer(
                options.model_type,
                &tokenizer_path,
                &TokenizerLoadOptions {
                    trust_remote_code: true,
                    ..Default::default()
                },
            )
            .await?;

        let load_options = options.model_load_options()?;
        info!(
            base_model = %options.base_model.display(),
            devices = ?load_options.devices,
            "Loading base model for inference"
        );
        let mut model = backend
            .load_model(options.model_type, &options.base_model, &load_options)
            .await?;
        if options.resize_emb {
            align_embeddings(model.as_mut(), tokenizer.vocab_size())?;
        }
        if let Some(dir) = &options.lora_model {
            model = backend.load_adapter(model, dir, false).await?;
            info!(adapter = %dir.display(), "Loaded lora model");
        }
        model.prepare_for_inference(load_options.devices.is_empty())?;

        Ok(Self::new(model, tokenizer, generation, options.with_prompt))
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation
    }

    /// Generate for one example
    pub fn predict(&self, example: &str) -> Result<Prediction> {
        let input = if self.with_prompt {
            generate_prompt(example, None)
        } else {
            example.to_string()
        };
        let encoded = self.tokenizer.encode(&input)?;
        let ids = self.model.generate(&encoded.input_ids, &self.generation)?;
        let decoded = self.tokenizer.decode(&ids, true)?;
        let output = if self.with_prompt {
            extract_response(&decoded)
        } else {
            decoded
        };
        Ok(Prediction { input, output })
    }

    /// Generate for every example in order
    pub fn predict_batch(&self, examples: &[String]) -> Result<Vec<Prediction>> {
        info!(count = examples.len(), "Start inference");
        examples
            .iter()
            .enumerate()
            .map(|(index, example)| {
                let prediction = self.predict(example)?;
                info!(index, input = %example, output = %prediction.output, "Generated");
                Ok(prediction)
            })
            .collect()
    }

    /// Single-turn loop until an empty line or end of input
    ///
    /// Returns the number of answered inputs.
    pub fn interactive<R: BufRead, W: Write>(&self, mut reader: R, mut writer: W) -> Result<usize> {
        writeln!(writer, "Start inference with instruction mode.")?;
        writeln!(writer, "{}", "-".repeat(85))?;
        writeln!(writer, "+ This mode only supports single-turn QA.")?;
        writeln!(writer, "{}", "=".repeat(85))?;

        let mut answered = 0;
        let mut line = String::new();
        loop {
            write!(writer, "Input:")?;
            writer.flush()?;
            line.clear();
            if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
                break;
            }
            let prediction = self.predict(line.trim_end_matches(['\r', '\n']))?;
            writeln!(writer, "Response:  {}\n", prediction.output)?;
            answered += 1;
        }
        Ok(answered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use crate::lora::{Module, ModuleNode, ParameterCounts};
    use crate::test_logs::warnings_during;
    use crate::tokenizer::{Encoded, SpecialTokens};
    use crate::training::ModelOutput;
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Bytes as ids, no special tokens
    struct ByteTokenizer;

    impl TextTokenizer for ByteTokenizer {
        fn encode(&self, text: &str) -> Result<Encoded> {
            let input_ids: Vec<u32> = text.bytes().map(u32::from).collect();
            let attention_mask = vec![1; input_ids.len()];
            Ok(Encoded { input_ids, attention_mask })
        }

        fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
            let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn vocab_size(&self) -> usize {
            256
        }

        fn model_max_length(&self) -> usize {
            4096
        }

        fn special_tokens(&self) -> SpecialTokens {
            SpecialTokens { bos: None, eos: Some(0), pad: None }
        }

        fn identity(&self) -> String {
            "bytes".to_string()
        }

        fn save_pretrained(&self, _dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Appends " ok" to every prompt
    struct EchoModel {
        root: Module,
    }

    impl CausalLm for EchoModel {
        fn module_graph(&self) -> &dyn ModuleNode {
            &self.root
        }

        fn forward(&self, _batch: &Batch) -> Result<ModelOutput> {
            unimplemented!("generation only")
        }

        fn generate(&self, input_ids: &[u32], config: &GenerationConfig) -> Result<Vec<u32>> {
            assert_eq!(config.special_tokens.eos, Some(0));
            let mut ids = input_ids.to_vec();
            ids.extend(" ok".bytes().map(u32::from));
            Ok(ids)
        }

        fn parameter_counts(&self) -> ParameterCounts {
            ParameterCounts::default()
        }

        fn input_embedding_rows(&self) -> usize {
            256
        }

        fn resize_token_embeddings(&mut self, _rows: usize) -> Result<()> {
            Ok(())
        }

        fn gradient_checkpointing_enable(&mut self) -> Result<()> {
            Ok(())
        }

        fn set_use_cache(&mut self, _use_cache: bool) {}

        fn enable_input_require_grads(&mut self) -> Result<()> {
            Ok(())
        }

        fn set_model_parallel(&mut self, _parallel: bool) {}

        fn save_pretrained(&self, _dir: &Path) -> Result<()> {
            Ok(())
        }

        fn prepare_for_inference(&mut self, _float32: bool) -> Result<()> {
            Ok(())
        }
    }

    fn predictor(with_prompt: bool) -> Predictor {
        Predictor::new(
            Box::new(EchoModel { root: Module::container("model") }),
            Arc::new(ByteTokenizer),
            GenerationConfig::default(),
            with_prompt,
        )
    }

    #[test]
    fn test_tokenizer_path_resolution() {
        let temp = TempDir::new().unwrap();
        let adapter = temp.path().join("adapter");
        fs::create_dir_all(&adapter).unwrap();

        let mut options = InferenceOptions::new(ModelType::Llama, temp.path().join("base"));
        options.lora_model = Some(adapter.clone());
        assert_eq!(options.resolve_tokenizer_path(), temp.path().join("base"));

        fs::write(adapter.join(TOKENIZER_CONFIG_NAME), "{}").unwrap();
        assert_eq!(options.resolve_tokenizer_path(), adapter);

        options.tokenizer_path = Some(temp.path().join("tok"));
        assert_eq!(options.resolve_tokenizer_path(), temp.path().join("tok"));
    }

    #[test]
    fn test_cpu_forces_float32() {
        let mut options = InferenceOptions::new(ModelType::Bloom, "/models/bloom");
        assert!(!options.uses_cpu());
        assert_eq!(options.model_load_options().unwrap().torch_dtype, Some(TorchDtype::Float16));

        options.only_cpu = true;
        assert!(options.uses_cpu());
        let load = options.model_load_options().unwrap();
        assert_eq!(load.torch_dtype, Some(TorchDtype::Float32));
        assert_eq!(load.device_map, DeviceMap::Named("cpu".to_string()));
        assert!(load.devices.is_empty());
    }

    #[test]
    fn test_gpus_become_load_option_devices() {
        let mut options = InferenceOptions::new(ModelType::Llama, "/models/llama");
        options.gpus = "0, 2,".to_string();
        let load = options.model_load_options().unwrap();
        assert_eq!(load.devices, vec![0, 2]);
        assert_eq!(load.device_map, DeviceMap::Auto);

        options.gpus = "0,gpu1".to_string();
        assert!(options.model_load_options().unwrap_err().is_config());
        assert!(!options.uses_cpu());
    }

    #[test]
    fn test_predict_with_prompt() {
        let prediction = predictor(true).predict("Say ok").unwrap();
        assert_eq!(prediction.input, generate_prompt("Say ok", None));
        assert_eq!(prediction.output, "ok");

        let raw = predictor(false).predict("Say").unwrap();
        assert_eq!(raw.output, "Say ok");
    }

    #[test]
    fn test_batch_export() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("examples.txt");
        fs::write(&data, "  first \nsecond\n").unwrap();
        let examples = load_examples(Some(&data)).unwrap();
        assert_eq!(examples, vec!["first", "second"]);

        let predictor = predictor(false);
        let predictions = predictor.predict_batch(&examples).unwrap();
        let file = temp.path().join("out/predictions.json");
        let config_path =
            export_predictions(&file, &predictions, predictor.generation_config()).unwrap();

        let saved: Vec<Prediction> =
            serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(saved, predictions);
        assert_eq!(saved[1].output, "second ok");
        let raw = fs::read_to_string(&file).unwrap();
        assert!(raw.contains("\"Input\""));
        let config: GenerationConfig =
            serde_json::from_str(&fs::read_to_string(config_path).unwrap()).unwrap();
        assert_eq!(config.repetition_penalty, 1.3);
    }

    #[test]
    fn test_non_ascii_is_preserved() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("predictions.json");
        let predictions = vec![Prediction {
            input: "乙肝和丙肝的区别？".into(),
            output: "答".into(),
        }];
        export_predictions(&file, &predictions, &GenerationConfig::default()).unwrap();
        assert!(fs::read_to_string(&file).unwrap().contains("乙肝和丙肝的区别？"));
    }

    #[test]
    fn test_interactive_stops_on_empty_line() {
        let input = Cursor::new("hello\nagain\n\nignored\n");
        let mut output = Vec::new();
        let answered = predictor(false).interactive(input, &mut output).unwrap();
        assert_eq!(answered, 2);

        let transcript = String::from_utf8(output).unwrap();
        assert!(transcript.contains("Response:  hello ok"));
        assert!(transcript.contains("Response:  again ok"));
        assert!(!transcript.contains("ignored"));
    }

    #[test]
    fn test_embeddings_resized_only_on_vocab_mismatch() {
        let mut model = EchoModel { root: Module::container("model") };
        let (resized, warnings) = warnings_during(|| align_embeddings(&mut model, 256).unwrap());
        assert!(!resized);
        assert!(warnings.is_empty());

        let (resized, warnings) = warnings_during(|| align_embeddings(&mut model, 300).unwrap());
        assert!(resized);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("resizing embeddings"));
    }

    #[test]
    fn test_default_examples() {
        assert_eq!(load_examples(None).unwrap(), vec![SAMPLE_INSTRUCTION.to_string()]);
    }
}

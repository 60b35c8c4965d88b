//! Building train/eval block datasets for a run
//!
//! Resolves where rows come from (local `*.txt` trees or a backend hub
//! loader), runs the tokenize+chunk pipeline behind the main-process-first
//! barrier, and applies sample limits.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::backend::Backend;
use super::distributed::MainProcessFirst;
use crate::config::{DataArguments, RunConfig};
use crate::constants::data::DEFAULT_BLOCK_SIZE;
use crate::data::cache::{BlockCache, CacheKey};
use crate::data::chunker::{BlockChunker, Chunker, SentinelChunker};
use crate::data::corpus::{discover_text_files, stream_rows};
use crate::data::{BlockDataset, LmDataset, Preprocessor, RawDatasets};
use crate::error::{Error, Result};
use crate::tokenizer::TextTokenizer;

/// Resolve the training block length against the tokenizer's limit
pub fn resolve_block_size(requested: Option<usize>, model_max_length: usize) -> usize {
    match requested {
        None => {
            if model_max_length > DEFAULT_BLOCK_SIZE {
                warn!(
                    model_max_length,
                    "The tokenizer allows long sequences. Picking block_size={} instead; \
                     override with --block_size",
                    DEFAULT_BLOCK_SIZE
                );
                DEFAULT_BLOCK_SIZE
            } else {
                model_max_length
            }
        }
        Some(block_size) if block_size > model_max_length => {
            warn!(
                block_size,
                model_max_length,
                "block_size is larger than the maximum length for the model, using model_max_length"
            );
            model_max_length
        }
        Some(block_size) => block_size,
    }
}

/// Block datasets handed to the trainer
#[derive(Debug, Default)]
pub struct PreparedDatasets {
    pub train: Option<LmDataset>,
    pub eval: Option<LmDataset>,
}

/// Where the rows of one split come from
enum SplitSource {
    Rows(Vec<String>),
    /// Lazily read files, skipping `skip` rows and keeping at most `take`
    Files {
        files: Vec<PathBuf>,
        skip: usize,
        take: Option<usize>,
    },
}

struct SplitSources {
    train: Option<SplitSource>,
    validation: Option<SplitSource>,
    train_files: Vec<PathBuf>,
    validation_files: Vec<PathBuf>,
}

/// Prepares datasets for one run
pub struct DatasetBuilder<'a> {
    config: &'a RunConfig,
    tokenizer: Arc<dyn TextTokenizer>,
    block_size: usize,
    backend: Option<&'a dyn Backend>,
}

impl<'a> DatasetBuilder<'a> {
    pub fn new(config: &'a RunConfig, tokenizer: Arc<dyn TextTokenizer>, block_size: usize) -> Self {
        Self {
            config,
            tokenizer,
            block_size,
            backend: None,
        }
    }

    /// Backend consulted for `dataset_name`
    pub fn with_backend(mut self, backend: &'a dyn Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    fn chunker(&self) -> Result<Arc<dyn Chunker>> {
        Ok(if self.config.data.preserve_sentinels {
            Arc::new(SentinelChunker::new(self.block_size)?)
        } else {
            Arc::new(BlockChunker::new(self.block_size)?)
        })
    }

    fn cache_dir(&self) -> Option<PathBuf> {
        self.config.model.cache_dir.as_ref().map(|dir| dir.join("blocks"))
    }

    /// Build the splits the run asks for (`do_train` → train, `do_eval` → eval)
    pub async fn build(&self) -> Result<PreparedDatasets> {
        let data = &self.config.data;
        let training = &self.config.training;
        if !training.do_train && !training.do_eval {
            return Ok(PreparedDatasets::default());
        }

        let sources = self.load_sources().await?;
        let preprocessor = Preprocessor::new(Arc::clone(&self.tokenizer), self.chunker()?)
            .with_workers(data.preprocessing_num_workers);
        let cache = if data.streaming {
            None
        } else {
            self.cache_dir().map(BlockCache::new)
        };
        let marker_dir = self.cache_dir().unwrap_or_else(std::env::temp_dir);
        let barrier = MainProcessFirst::new(self.config.distributed.clone(), marker_dir);

        let mut prepared = PreparedDatasets::default();
        if training.do_train {
            let source = sources
                .train
                .ok_or_else(|| Error::config("--do_train requires a train dataset"))?;
            let dataset = barrier
                .run("grouping train texts", || {
                    self.map_split("train", source, &sources.train_files, &preprocessor, cache.as_ref())
                })
                .await?;
            prepared.train = Some(limit(dataset, data.max_train_samples(), "train"));
        }
        if training.do_eval {
            let source = sources
                .validation
                .ok_or_else(|| Error::config("--do_eval requires a validation dataset"))?;
            let dataset = barrier
                .run("grouping validation texts", || {
                    self.map_split(
                        "validation",
                        source,
                        &sources.validation_files,
                        &preprocessor,
                        cache.as_ref(),
                    )
                })
                .await?;
            prepared.eval = Some(limit(dataset, data.max_eval_samples(), "validation"));
        }
        Ok(prepared)
    }

    async fn load_sources(&self) -> Result<SplitSources> {
        let data = &self.config.data;

        if let Some(name) = data.dataset_name.as_deref() {
            let backend = self.backend.ok_or_else(|| {
                Error::config(format!("dataset_name '{}' requires a numeric backend", name))
            })?;
            let mut raw = backend
                .load_hub_dataset(
                    name,
                    data.dataset_config_name.as_deref(),
                    self.config.model.cache_dir.as_deref(),
                    data.streaming,
                )
                .await?;
            raw.ensure_validation(data.validation_split_percentage);
            return Ok(from_raw(raw));
        }

        if !data.streaming {
            let raw = RawDatasets::from_dirs(
                data.train_file_dir.as_deref(),
                data.validation_file_dir.as_deref(),
                data.validation_split_percentage,
                data.keep_linebreaks,
            )?;
            return Ok(from_raw(raw));
        }

        let train_files = match data.train_file_dir.as_deref().filter(|d| d.exists()) {
            Some(dir) => discover_text_files(dir)?,
            None => Vec::new(),
        };
        let validation_files = match data.validation_file_dir.as_deref().filter(|d| d.exists()) {
            Some(dir) => discover_text_files(dir)?,
            None => Vec::new(),
        };

        let mut sources = SplitSources {
            train: None,
            validation: None,
            train_files: train_files.clone(),
            validation_files: validation_files.clone(),
        };
        if !validation_files.is_empty() {
            sources.validation = Some(SplitSource::Files {
                files: validation_files,
                skip: 0,
                take: None,
            });
            if !train_files.is_empty() {
                sources.train = Some(SplitSource::Files {
                    files: train_files,
                    skip: 0,
                    take: None,
                });
            }
        } else if !train_files.is_empty() {
            // One counting pass so the carved validation split matches the
            // non-streaming layout
            let rows = stream_rows(train_files.clone(), data.keep_linebreaks).count();
            let head = (rows as f64 * data.validation_split_percentage / 100.0).round() as usize;
            sources.validation = Some(SplitSource::Files {
                files: train_files.clone(),
                skip: 0,
                take: Some(head),
            });
            sources.train = Some(SplitSource::Files {
                files: train_files.clone(),
                skip: head,
                take: None,
            });
            sources.validation_files = train_files;
        }
        Ok(sources)
    }

    async fn map_split(
        &self,
        split: &'static str,
        source: SplitSource,
        files: &[PathBuf],
        preprocessor: &Preprocessor,
        cache: Option<&BlockCache>,
    ) -> Result<LmDataset> {
        let data = &self.config.data;

        if data.streaming {
            info!(split, "Streaming dataset, blocks are produced while training consumes them");
            let stream = match source {
                SplitSource::Rows(rows) => preprocessor.stream(rows.into_iter().map(Ok)),
                SplitSource::Files { files, skip, take } => preprocessor.stream(
                    stream_rows(files, data.keep_linebreaks)
                        .skip(skip)
                        .take(take.unwrap_or(usize::MAX)),
                ),
            };
            return Ok(LmDataset::Streaming(stream));
        }

        let job = MapJob {
            split,
            block_size: self.block_size,
            source,
            files: files.to_vec(),
            data: data.clone(),
            preprocessor: preprocessor.clone(),
            cache: cache.cloned(),
        };
        let dataset = tokio::task::spawn_blocking(move || job.run()).await??;
        Ok(LmDataset::InMemory(dataset))
    }
}

/// Tokenize and chunk one materialized split off the async runtime
struct MapJob {
    split: &'static str,
    block_size: usize,
    source: SplitSource,
    files: Vec<PathBuf>,
    data: DataArguments,
    preprocessor: Preprocessor,
    cache: Option<BlockCache>,
}

impl MapJob {
    fn run(self) -> Result<BlockDataset> {
        let data = &self.data;
        let desc = format!(
            "Running tokenizer and grouping {} texts in chunks of {}",
            self.split, self.block_size
        );

        let rows = match self.source {
            SplitSource::Rows(rows) => rows,
            SplitSource::Files { files, skip, take } => stream_rows(files, data.keep_linebreaks)
                .skip(skip)
                .take(take.unwrap_or(usize::MAX))
                .collect::<Result<Vec<_>>>()?,
        };

        let key = match &self.cache {
            Some(_) => {
                let (chunker, tokenizer) = self.preprocessor.describe();
                let options = format!(
                    "source={};keep_linebreaks={};validation_split_percentage={}",
                    data.dataset_name.as_deref().unwrap_or("local"),
                    data.keep_linebreaks,
                    data.validation_split_percentage
                );
                Some(CacheKey::new(self.split, &self.files, chunker, tokenizer, options)?)
            }
            None => None,
        };
        let cache = self.cache.as_ref().zip(key.as_ref());
        let dataset = self.preprocessor.map_cached(&rows, &desc, cache, data.overwrite_cache)?;
        info!(split = self.split, rows = rows.len(), blocks = dataset.len(), "Prepared split");
        Ok(dataset)
    }
}

fn from_raw(raw: RawDatasets) -> SplitSources {
    SplitSources {
        train: raw.train.map(|d| SplitSource::Rows(d.into_rows())),
        validation: raw.validation.map(|d| SplitSource::Rows(d.into_rows())),
        train_files: raw.train_files,
        validation_files: raw.validation_files,
    }
}

fn limit(dataset: LmDataset, max: Option<usize>, split: &str) -> LmDataset {
    match max {
        Some(n) => {
            info!(split, max_samples = n, "Truncating dataset");
            dataset.select(n)
        }
        None => dataset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::data::{INPUT_IDS, LABELS};
    use crate::data::pipeline::tests::CharTokenizer;
    use crate::tokenizer::{Encoded, SpecialTokens};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> RunConfig {
        let train = temp.path().join("train");
        fs::create_dir_all(train.join("nested")).unwrap();
        let text: String = (0..40).map(|i| format!("document number {}\n", i)).collect();
        fs::write(train.join("a.txt"), &text).unwrap();
        fs::write(train.join("nested/b.txt"), &text).unwrap();

        let mut config = RunConfig::default();
        config.model.model_type = Some("llama".into());
        config.model.model_name_or_path = Some(temp.path().join("model"));
        config.data.train_file_dir = Some(train);
        config.data.validation_split_percentage = 10.0;
        config.training.do_train = true;
        config.training.do_eval = true;
        config
    }

    fn in_memory(dataset: Option<LmDataset>) -> crate::data::BlockDataset {
        match dataset {
            Some(LmDataset::InMemory(d)) => d,
            other => panic!("expected in-memory dataset, got {:?}", other),
        }
    }

    #[test]
    fn test_block_size_resolution() {
        assert_eq!(resolve_block_size(None, usize::MAX), 1024);
        assert_eq!(resolve_block_size(None, 512), 512);
        assert_eq!(resolve_block_size(Some(4096), 2048), 2048);
        assert_eq!(resolve_block_size(Some(256), 2048), 256);
    }

    #[tokio::test]
    async fn test_build_train_and_carved_validation() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let prepared = DatasetBuilder::new(&config, Arc::new(CharTokenizer), 16)
            .build()
            .await
            .unwrap();

        let train = in_memory(prepared.train);
        let eval = in_memory(prepared.eval);
        assert!(train.len() > eval.len());
        assert!(!eval.is_empty());
        assert!(train.column(INPUT_IDS).unwrap().iter().all(|b| b.len() == 16));
        assert_eq!(train.column(LABELS), train.column(INPUT_IDS));
    }

    #[tokio::test]
    async fn test_streaming_matches_in_memory() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        let materialized = DatasetBuilder::new(&config, Arc::new(CharTokenizer), 16)
            .build()
            .await
            .unwrap();

        config.data.streaming = true;
        let streamed = DatasetBuilder::new(&config, Arc::new(CharTokenizer), 16)
            .build()
            .await
            .unwrap();
        let streamed_train: Vec<_> = streamed
            .train
            .unwrap()
            .into_records()
            .collect::<Result<_>>()
            .unwrap();
        let expected: Vec<_> = in_memory(materialized.train).records().collect();
        assert_eq!(streamed_train, expected);
    }

    #[tokio::test]
    async fn test_sample_limits_and_cache() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.model.cache_dir = Some(temp.path().join("cache"));
        config.data.max_train_samples = Some(3);
        config.data.max_eval_samples = Some(0);

        let prepared = DatasetBuilder::new(&config, Arc::new(CharTokenizer), 8)
            .build()
            .await
            .unwrap();
        assert_eq!(prepared.train.unwrap().len(), Some(3));
        assert!(prepared.eval.unwrap().len().unwrap() > 0);

        let cached: Vec<_> = fs::read_dir(temp.path().join("cache/blocks")).unwrap().collect();
        assert_eq!(cached.len(), 2);
    }

    /// Blocks its first encode until another task on the runtime opens the gate
    struct GatedTokenizer {
        gate: Mutex<mpsc::Receiver<()>>,
        opened: AtomicBool,
    }

    impl TextTokenizer for GatedTokenizer {
        fn encode(&self, text: &str) -> Result<Encoded> {
            if !self.opened.load(Ordering::SeqCst) {
                let gate = self.gate.lock().unwrap();
                if !self.opened.load(Ordering::SeqCst) {
                    gate.recv_timeout(Duration::from_secs(5)).map_err(|_| {
                        Error::Tokenizer("runtime stalled while tokenizing".to_string())
                    })?;
                    self.opened.store(true, Ordering::SeqCst);
                }
            }
            CharTokenizer.encode(text)
        }

        fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
            CharTokenizer.decode(ids, skip_special_tokens)
        }

        fn vocab_size(&self) -> usize {
            CharTokenizer.vocab_size()
        }

        fn model_max_length(&self) -> usize {
            CharTokenizer.model_max_length()
        }

        fn special_tokens(&self) -> SpecialTokens {
            CharTokenizer.special_tokens()
        }

        fn identity(&self) -> String {
            "gated".to_string()
        }

        fn save_pretrained(&self, _dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_tokenization_leaves_runtime_free() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let (open, gate) = mpsc::channel();
        let tokenizer = Arc::new(GatedTokenizer {
            gate: Mutex::new(gate),
            opened: AtomicBool::new(false),
        });
        tokio::spawn(async move {
            let _ = open.send(());
        });

        let prepared = DatasetBuilder::new(&config, tokenizer, 16).build().await.unwrap();
        assert!(!in_memory(prepared.train).is_empty());
    }

    #[tokio::test]
    async fn test_hub_dataset_needs_backend() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.data.dataset_name = Some("wikitext".into());
        let err = DatasetBuilder::new(&config, Arc::new(CharTokenizer), 8)
            .build()
            .await
            .unwrap_err();
        assert!(err.is_config());
    }
}

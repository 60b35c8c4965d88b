//! Tokenize + chunk mapping over raw text rows
//!
//! Rows are processed in map batches of `MAP_BATCH_SIZE`. Each batch is
//! tokenized, concatenated and cut into blocks independently, so the block
//! layout depends only on batch boundaries, never on the worker count.

use rayon::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use super::cache::{BlockCache, CacheKey};
use super::chunker::Chunker;
use super::collator::FeatureRecord;
use super::{BlockDataset, TokenColumns};
use crate::constants::data::{ATTENTION_MASK, INPUT_IDS, LABELS, MAP_BATCH_SIZE};
use crate::error::{Error, Result};
use crate::tokenizer::TextTokenizer;

/// Batched tokenize+chunk mapper
#[derive(Clone)]
pub struct Preprocessor {
    tokenizer: Arc<dyn TextTokenizer>,
    chunker: Arc<dyn Chunker>,
    num_workers: usize,
    batch_size: usize,
}

impl Preprocessor {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>, chunker: Arc<dyn Chunker>) -> Self {
        Self {
            tokenizer,
            chunker,
            num_workers: 1,
            batch_size: MAP_BATCH_SIZE,
        }
    }

    /// Fan out over `workers` threads, capped at the number of CPUs
    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        self.num_workers = workers.unwrap_or(1).clamp(1, num_cpus::get().max(1));
        self
    }

    /// Override the map batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Tokenize rows into `input_ids` and `attention_mask` columns
    pub fn tokenize(&self, rows: &[String]) -> Result<TokenColumns> {
        let mut input_ids = Vec::with_capacity(rows.len());
        let mut attention_mask = Vec::with_capacity(rows.len());
        for row in rows {
            let encoded = self.tokenizer.encode(row)?;
            input_ids.push(encoded.input_ids);
            attention_mask.push(encoded.attention_mask);
        }
        let mut columns = TokenColumns::new();
        columns.insert(INPUT_IDS.to_string(), input_ids);
        columns.insert(ATTENTION_MASK.to_string(), attention_mask);
        Ok(columns)
    }

    /// Tokenize and chunk one map batch
    pub fn map_batch(&self, rows: &[String]) -> Result<TokenColumns> {
        let tokenized = self.tokenize(rows)?;
        let mut blocks = self.chunker.chunk(&tokenized)?;
        if !blocks.contains_key(LABELS) {
            if let Some(input_ids) = blocks.get(INPUT_IDS).cloned() {
                blocks.insert(LABELS.to_string(), input_ids);
            }
        }
        Ok(blocks)
    }

    /// Map every row into blocks, keeping batch order
    pub fn map(&self, rows: &[String], desc: &str) -> Result<BlockDataset> {
        info!(
            rows = rows.len(),
            workers = self.num_workers,
            chunker = %self.chunker.describe(),
            "{}",
            desc
        );

        let outputs: Vec<TokenColumns> = if self.num_workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.num_workers)
                .build()
                .map_err(|e| Error::config(format!("Failed to build worker pool: {}", e)))?;
            pool.install(|| {
                rows.par_chunks(self.batch_size)
                    .map(|batch| self.map_batch(batch))
                    .collect::<Result<Vec<_>>>()
            })?
        } else {
            rows.chunks(self.batch_size)
                .map(|batch| self.map_batch(batch))
                .collect::<Result<Vec<_>>>()?
        };

        let mut dataset = BlockDataset::default();
        for output in outputs {
            dataset.extend(output)?;
        }
        debug!(blocks = dataset.len(), "Mapped rows into blocks");
        Ok(dataset)
    }

    /// Like `map`, consulting `cache` first unless `overwrite` is set
    pub fn map_cached(
        &self,
        rows: &[String],
        desc: &str,
        cache: Option<(&BlockCache, &CacheKey)>,
        overwrite: bool,
    ) -> Result<BlockDataset> {
        if let Some((cache, key)) = cache {
            if !overwrite {
                if let Some(dataset) = cache.load(key) {
                    return Ok(dataset);
                }
            }
            let dataset = self.map(rows, desc)?;
            cache.store(key, &dataset)?;
            return Ok(dataset);
        }
        self.map(rows, desc)
    }

    /// Identity of the tokenizer+chunker pair, for cache keys
    pub fn describe(&self) -> (String, String) {
        (self.chunker.describe(), self.tokenizer.identity())
    }

    /// Lazily map rows as they are consumed
    pub fn stream<I>(&self, rows: I) -> BlockStream
    where
        I: Iterator<Item = Result<String>> + Send + 'static,
    {
        BlockStream {
            rows: Box::new(rows),
            preprocessor: self.clone(),
            pending: VecDeque::new(),
            remaining: None,
            exhausted: false,
        }
    }
}

/// Single-pass stream of blocks
///
/// Rows are pulled one map batch at a time; blocks of a batch are buffered
/// until consumed. An error ends the stream after it is yielded.
pub struct BlockStream {
    rows: Box<dyn Iterator<Item = Result<String>> + Send>,
    preprocessor: Preprocessor,
    pending: VecDeque<FeatureRecord>,
    remaining: Option<usize>,
    exhausted: bool,
}

impl BlockStream {
    /// Stop after at most `n` blocks
    pub fn take_blocks(mut self, n: usize) -> Self {
        self.remaining = Some(self.remaining.map_or(n, |r| r.min(n)));
        self
    }

    fn fill(&mut self) -> Result<bool> {
        let mut batch = Vec::with_capacity(self.preprocessor.batch_size);
        while batch.len() < self.preprocessor.batch_size {
            match self.rows.next() {
                Some(row) => batch.push(row?),
                None => break,
            }
        }
        if batch.is_empty() {
            return Ok(false);
        }
        let blocks = BlockDataset::from_columns(self.preprocessor.map_batch(&batch)?)?;
        self.pending.extend(blocks.records());
        Ok(true)
    }
}

impl Iterator for BlockStream {
    type Item = Result<FeatureRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        loop {
            if let Some(record) = self.pending.pop_front() {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Some(Ok(record));
            }
            if self.exhausted {
                return None;
            }
            match self.fill() {
                Ok(true) => continue,
                Ok(false) => {
                    self.exhausted = true;
                    return None;
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

//! Data preparation: raw text → token ids → fixed-length blocks → batches
//!
//! This module provides:
//! - `corpus`: `*.txt` discovery and train/validation row splits
//! - `chunker`: concatenation of tokenized documents into fixed-length blocks
//! - `pipeline`: batched tokenize+chunk mapping (worker fan-out or streaming)
//! - `cache`: on-disk cache of prepared blocks
//! - `collator`: fault-tolerant assembly of feature records into batches

pub mod cache;
pub mod chunker;
pub mod collator;
pub mod corpus;
pub mod pipeline;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::data::INPUT_IDS;
use crate::error::{Error, Result};

pub use cache::BlockCache;
pub use chunker::{BlockChunker, Chunker, SentinelChunker};
pub use collator::{Batch, FaultTolerantCollator, FeatureRecord, FieldValue, Stacked};
pub use corpus::{discover_text_files, RawDatasets, TextDataset};
pub use pipeline::{BlockStream, Preprocessor};

/// Field name → one token-id sequence per row (document or block)
pub type TokenColumns = BTreeMap<String, Vec<Vec<u32>>>;

/// Number of rows in a column set, taken from `input_ids` when present
pub fn row_count(columns: &TokenColumns) -> usize {
    columns
        .get(INPUT_IDS)
        .or_else(|| columns.values().next())
        .map_or(0, Vec::len)
}

/// Prepared blocks held in memory, stored column-wise
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDataset {
    columns: TokenColumns,
}

impl BlockDataset {
    pub fn from_columns(columns: TokenColumns) -> Result<Self> {
        check_rectangular(&columns)?;
        Ok(Self { columns })
    }

    pub fn len(&self) -> usize {
        row_count(&self.columns)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn columns(&self) -> &TokenColumns {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&[Vec<u32>]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Append the rows of another chunk output, keeping row order
    pub fn extend(&mut self, other: TokenColumns) -> Result<()> {
        check_rectangular(&other)?;
        if self.columns.is_empty() {
            self.columns = other;
            return Ok(());
        }
        if row_count(&other) == 0 {
            return Ok(());
        }
        if !self.columns.keys().eq(other.keys()) {
            return Err(Error::invalid_data(format!(
                "cannot append rows with fields {:?} to dataset with fields {:?}",
                other.keys().collect::<Vec<_>>(),
                self.columns.keys().collect::<Vec<_>>()
            )));
        }
        for (name, rows) in other {
            if let Some(column) = self.columns.get_mut(&name) {
                column.extend(rows);
            }
        }
        Ok(())
    }

    /// Keep the first `n` blocks
    pub fn select(mut self, n: usize) -> Self {
        for rows in self.columns.values_mut() {
            rows.truncate(n);
        }
        self
    }

    pub fn record(&self, index: usize) -> Option<FeatureRecord> {
        if index >= self.len() {
            return None;
        }
        Some(
            self.columns
                .iter()
                .map(|(name, rows)| (name.clone(), FieldValue::ids(&rows[index])))
                .collect(),
        )
    }

    pub fn records(&self) -> impl Iterator<Item = FeatureRecord> + '_ {
        (0..self.len()).filter_map(move |i| self.record(i))
    }

    /// Collate consecutive blocks into batches of `batch_size`
    pub fn batches<'a>(
        &'a self,
        batch_size: usize,
        collator: &'a FaultTolerantCollator,
    ) -> impl Iterator<Item = Result<Batch>> + 'a {
        let batch_size = batch_size.max(1);
        (0..self.len()).step_by(batch_size).map(move |start| {
            let end = (start + batch_size).min(self.len());
            let records: Vec<FeatureRecord> = (start..end).filter_map(|i| self.record(i)).collect();
            collator.collate(&records)
        })
    }
}

fn check_rectangular(columns: &TokenColumns) -> Result<()> {
    let rows = row_count(columns);
    for (name, column) in columns {
        if column.len() != rows {
            return Err(Error::invalid_data(format!(
                "field '{}' has {} rows, expected {}",
                name,
                column.len(),
                rows
            )));
        }
    }
    Ok(())
}

/// A block dataset handed to the trainer
pub enum LmDataset {
    /// Fully materialized, length known up front
    InMemory(BlockDataset),
    /// Single-pass stream, produced lazily while training consumes it
    Streaming(BlockStream),
}

impl LmDataset {
    /// Number of blocks when known
    pub fn len(&self) -> Option<usize> {
        match self {
            LmDataset::InMemory(dataset) => Some(dataset.len()),
            LmDataset::Streaming(_) => None,
        }
    }

    /// Truncate to at most `n` blocks
    pub fn select(self, n: usize) -> Self {
        match self {
            LmDataset::InMemory(dataset) => LmDataset::InMemory(dataset.select(n)),
            LmDataset::Streaming(stream) => LmDataset::Streaming(stream.take_blocks(n)),
        }
    }

    /// Iterate feature records regardless of storage
    pub fn into_records(self) -> Box<dyn Iterator<Item = Result<FeatureRecord>> + Send> {
        match self {
            LmDataset::InMemory(dataset) => {
                let records: Vec<Result<FeatureRecord>> = dataset.records().map(Ok).collect();
                Box::new(records.into_iter())
            }
            LmDataset::Streaming(stream) => Box::new(stream),
        }
    }
}

impl std::fmt::Debug for LmDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LmDataset::InMemory(dataset) => write!(f, "LmDataset::InMemory({} blocks)", dataset.len()),
            LmDataset::Streaming(_) => f.write_str("LmDataset::Streaming"),
        }
    }
}

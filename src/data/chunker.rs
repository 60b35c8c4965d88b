//! Block chunking of tokenized documents
//!
//! Documents in a map batch are concatenated per field and cut into
//! contiguous blocks of exactly `block_size` tokens. The trailing
//! remainder of each batch is discarded.

use std::collections::BTreeMap;
use tracing::warn;

use super::{row_count, TokenColumns};
use crate::constants::data::{INPUT_IDS, LABELS};
use crate::error::{Error, Result};

/// Turns one batch of tokenized documents into blocks
pub trait Chunker: Send + Sync {
    fn chunk(&self, examples: &TokenColumns) -> Result<TokenColumns>;

    /// Short description including the block length, e.g. `block:1024`
    fn describe(&self) -> String;
}

/// Causal LM chunker: every emitted block carries `labels == input_ids`
#[derive(Debug, Clone, Copy)]
pub struct BlockChunker {
    block_size: usize,
}

impl BlockChunker {
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::config("block_size must be greater than 0"));
        }
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Chunker for BlockChunker {
    fn describe(&self) -> String {
        format!("block:{}", self.block_size)
    }

    fn chunk(&self, examples: &TokenColumns) -> Result<TokenColumns> {
        let concatenated = concatenate(examples)?;
        let total_length = concatenated
            .get(INPUT_IDS)
            .or_else(|| concatenated.values().next())
            .map_or(0, Vec::len);
        let usable = total_length / self.block_size * self.block_size;
        if usable < total_length {
            warn!(
                total_length,
                dropped = total_length - usable,
                block_size = self.block_size,
                "Dropping chunk remainder"
            );
        }

        let mut result: TokenColumns = concatenated
            .into_iter()
            .map(|(name, tokens)| {
                let blocks: Vec<Vec<u32>> = tokens[..usable]
                    .chunks_exact(self.block_size)
                    .map(<[u32]>::to_vec)
                    .collect();
                (name, blocks)
            })
            .collect();

        if let Some(input_ids) = result.get(INPUT_IDS).cloned() {
            result.insert(LABELS.to_string(), input_ids);
        }
        Ok(result)
    }
}

/// Chunker that keeps the first document's leading and trailing tokens
/// (typically BOS/EOS) around every block.
///
/// The interior of every document (`tokens[1..len - 1]`) is concatenated
/// and cut into pieces of `max_seq_length - 2`; each block is
/// `[first] + piece + [last]`. No labels are added.
#[derive(Debug, Clone, Copy)]
pub struct SentinelChunker {
    max_seq_length: usize,
}

impl SentinelChunker {
    pub fn new(max_seq_length: usize) -> Result<Self> {
        if max_seq_length <= 2 {
            return Err(Error::config(format!(
                "max_seq_length must leave room for two sentinel tokens, got {}",
                max_seq_length
            )));
        }
        Ok(Self { max_seq_length })
    }

    fn content_length(&self) -> usize {
        self.max_seq_length - 2
    }
}

impl Chunker for SentinelChunker {
    fn describe(&self) -> String {
        format!("sentinel:{}", self.max_seq_length)
    }

    fn chunk(&self, examples: &TokenColumns) -> Result<TokenColumns> {
        let content_length = self.content_length();
        let mut result = TokenColumns::new();

        for (name, docs) in examples {
            let first_doc = match docs.first() {
                Some(doc) => doc,
                None => {
                    result.insert(name.clone(), Vec::new());
                    continue;
                }
            };
            let (first, last) = match (first_doc.first(), first_doc.last()) {
                (Some(first), Some(last)) => (*first, *last),
                _ => {
                    return Err(Error::invalid_data(format!(
                        "field '{}': first document is empty, no sentinel tokens to preserve",
                        name
                    )))
                }
            };

            let contents: Vec<u32> = docs
                .iter()
                .flat_map(|doc| interior(doc).iter().copied())
                .collect();
            let usable = contents.len() / content_length * content_length;
            if usable < contents.len() && name == INPUT_IDS {
                warn!(
                    total_length = contents.len(),
                    dropped = contents.len() - usable,
                    content_length,
                    "Dropping chunk remainder"
                );
            }

            let blocks = contents[..usable]
                .chunks_exact(content_length)
                .map(|piece| {
                    let mut block = Vec::with_capacity(self.max_seq_length);
                    block.push(first);
                    block.extend_from_slice(piece);
                    block.push(last);
                    block
                })
                .collect();
            result.insert(name.clone(), blocks);
        }
        Ok(result)
    }
}

fn interior(doc: &[u32]) -> &[u32] {
    if doc.len() <= 2 {
        &[]
    } else {
        &doc[1..doc.len() - 1]
    }
}

fn concatenate(examples: &TokenColumns) -> Result<BTreeMap<String, Vec<u32>>> {
    let rows = row_count(examples);
    let mut concatenated = BTreeMap::new();
    let mut total: Option<usize> = None;

    for (name, docs) in examples {
        if docs.len() != rows {
            return Err(Error::invalid_data(format!(
                "field '{}' has {} documents, expected {}",
                name,
                docs.len(),
                rows
            )));
        }
        let tokens: Vec<u32> = docs.iter().flatten().copied().collect();
        match total {
            Some(expected) if expected != tokens.len() => {
                return Err(Error::invalid_data(format!(
                    "field '{}' concatenates to {} tokens, expected {}",
                    name,
                    tokens.len(),
                    expected
                )))
            }
            _ => total = Some(tokens.len()),
        }
        concatenated.insert(name.clone(), tokens);
    }
    Ok(concatenated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::data::ATTENTION_MASK;
    use crate::test_logs::warnings_during;

    fn batch(docs: Vec<Vec<u32>>) -> TokenColumns {
        let masks = docs.iter().map(|d| vec![1; d.len()]).collect();
        let mut columns = TokenColumns::new();
        columns.insert(INPUT_IDS.to_string(), docs);
        columns.insert(ATTENTION_MASK.to_string(), masks);
        columns
    }

    #[test]
    fn test_blocks_have_exact_length_and_remainder_is_dropped() {
        let chunker = BlockChunker::new(4).unwrap();
        let out = chunker
            .chunk(&batch(vec![vec![1, 2, 3], vec![4, 5, 6, 7, 8, 9, 10]]))
            .unwrap();

        let ids = &out[INPUT_IDS];
        assert_eq!(ids, &vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert_eq!(out[LABELS], out[INPUT_IDS]);
        assert_eq!(out[ATTENTION_MASK].len(), 2);
        assert!(out.values().flatten().all(|block| block.len() == 4));
    }

    #[test]
    fn test_dropped_remainder_is_a_warning() {
        let chunker = BlockChunker::new(4).unwrap();
        let (out, warnings) =
            warnings_during(|| chunker.chunk(&batch(vec![vec![1, 2, 3, 4, 5, 6]])).unwrap());
        assert_eq!(out[INPUT_IDS].len(), 1);
        assert_eq!(warnings, vec!["Dropping chunk remainder"]);

        let (_, warnings) =
            warnings_during(|| chunker.chunk(&batch(vec![vec![1, 2, 3, 4]])).unwrap());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_block_count_is_total_over_block_size() {
        let chunker = BlockChunker::new(3).unwrap();
        let docs: Vec<Vec<u32>> = (0..5).map(|i| (0..(i * 2 + 1)).collect()).collect();
        let total: usize = docs.iter().map(Vec::len).sum();
        let out = chunker.chunk(&batch(docs)).unwrap();
        assert_eq!(out[INPUT_IDS].len(), total / 3);
    }

    #[test]
    fn test_short_batch_emits_no_blocks() {
        let chunker = BlockChunker::new(10).unwrap();
        let out = chunker.chunk(&batch(vec![vec![1, 2, 3], vec![4, 5]])).unwrap();
        assert!(out[INPUT_IDS].is_empty());
        assert!(out[LABELS].is_empty());
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(BlockChunker::new(0).unwrap_err().is_config());
    }

    #[test]
    fn test_mismatched_field_lengths_rejected() {
        let mut columns = batch(vec![vec![1, 2, 3, 4]]);
        columns.insert(ATTENTION_MASK.to_string(), vec![vec![1, 1]]);
        let chunker = BlockChunker::new(2).unwrap();
        assert!(chunker.chunk(&columns).is_err());
    }

    #[test]
    fn test_sentinels_wrap_every_block() {
        let chunker = SentinelChunker::new(4).unwrap();
        let mut columns = TokenColumns::new();
        columns.insert(
            INPUT_IDS.to_string(),
            vec![vec![1, 10, 11, 12, 2], vec![1, 13, 14, 2], vec![1, 2]],
        );
        let out = chunker.chunk(&columns).unwrap();

        assert_eq!(
            out[INPUT_IDS],
            vec![vec![1, 10, 11, 2], vec![1, 12, 13, 2]]
        );
        assert!(!out.contains_key(LABELS));
    }

    #[test]
    fn test_sentinel_requires_room_for_content() {
        assert!(SentinelChunker::new(2).is_err());
        assert!(SentinelChunker::new(3).is_ok());
    }
}

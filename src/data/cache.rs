//! On-disk cache of prepared blocks
//!
//! Entries are bincode-encoded `BlockDataset`s named after a fingerprint of
//! the source files (path, size, mtime), the chunker and the tokenizer.
//! Any change to those inputs yields a different file name.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use super::BlockDataset;
use crate::error::Result;

/// Inputs that determine the content of a prepared split
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub split: String,
    /// `(path, size, mtime nanos)` for each source file
    pub files: Vec<(PathBuf, u64, u128)>,
    pub chunker: String,
    pub tokenizer: String,
    /// Any remaining option that changes row content
    pub options: String,
}

impl CacheKey {
    pub fn new(
        split: &str,
        files: &[PathBuf],
        chunker: String,
        tokenizer: String,
        options: String,
    ) -> Result<Self> {
        let files = files
            .iter()
            .map(|path| {
                let metadata = fs::metadata(path)?;
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos());
                Ok((path.clone(), metadata.len(), mtime))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            split: split.to_string(),
            files,
            chunker,
            tokenizer,
            options,
        })
    }

    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Directory of cached block datasets
#[derive(Debug, Clone)]
pub struct BlockCache {
    dir: PathBuf,
}

impl BlockCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir
            .join(format!("lorapt-{}-{:016x}.bin", key.split, key.fingerprint()))
    }

    /// Load a cached entry; unreadable entries count as misses
    pub fn load(&self, key: &CacheKey) -> Option<BlockDataset> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!(path = %path.display(), "Block cache miss");
                return None;
            }
        };
        match bincode::deserialize::<BlockDataset>(&bytes) {
            Ok(dataset) => {
                info!(path = %path.display(), blocks = dataset.len(), "Loaded blocks from cache");
                Some(dataset)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt block cache entry");
                None
            }
        }
    }

    /// Write an entry atomically (temp file + rename)
    pub fn store(&self, key: &CacheKey, dataset: &BlockDataset) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, bincode::serialize(dataset)?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), blocks = dataset.len(), "Stored blocks in cache");
        Ok(path)
    }
}

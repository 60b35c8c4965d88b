//! Raw text corpora
//!
//! Local corpora are directories searched recursively for `*.txt` files.
//! Every line of every file becomes one row of the `text` column.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Rows of the `text` column
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextDataset {
    rows: Vec<String>,
}

impl TextDataset {
    pub fn new(rows: Vec<String>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<String> {
        self.rows
    }

    /// Split off the first `percent`% of rows
    ///
    /// Returns `(head, tail)`; the head size is rounded to the nearest row.
    pub fn split_percent(self, percent: f64) -> (TextDataset, TextDataset) {
        let head = ((self.rows.len() as f64) * percent / 100.0).round() as usize;
        let mut rows = self.rows;
        let tail = rows.split_off(head.min(rows.len()));
        (TextDataset::new(rows), TextDataset::new(tail))
    }
}

/// Train and validation splits before tokenization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDatasets {
    pub train: Option<TextDataset>,
    pub validation: Option<TextDataset>,
    /// Files the splits were read from, for cache fingerprinting
    pub train_files: Vec<PathBuf>,
    pub validation_files: Vec<PathBuf>,
}

impl RawDatasets {
    /// Load local train/validation directories
    ///
    /// A missing directory leaves the corresponding split empty. When no
    /// validation split exists, `validation_split_percentage`% of the train
    /// rows are carved off the front as validation.
    pub fn from_dirs(
        train_dir: Option<&Path>,
        validation_dir: Option<&Path>,
        validation_split_percentage: f64,
        keep_linebreaks: bool,
    ) -> Result<Self> {
        let mut datasets = RawDatasets::default();

        if let Some(dir) = train_dir.filter(|d| d.exists()) {
            datasets.train_files = discover_text_files(dir)?;
            info!(dir = %dir.display(), files = datasets.train_files.len(), "Found train files");
            datasets.train = Some(read_rows(&datasets.train_files, keep_linebreaks)?);
        }
        if let Some(dir) = validation_dir.filter(|d| d.exists()) {
            datasets.validation_files = discover_text_files(dir)?;
            info!(
                dir = %dir.display(),
                files = datasets.validation_files.len(),
                "Found validation files"
            );
            datasets.validation = Some(read_rows(&datasets.validation_files, keep_linebreaks)?);
        }

        datasets.ensure_validation(validation_split_percentage);
        Ok(datasets)
    }

    /// Carve a validation split out of train when none was supplied
    pub fn ensure_validation(&mut self, validation_split_percentage: f64) {
        if self.validation.is_some() {
            return;
        }
        if let Some(train) = self.train.take() {
            let (validation, train) = train.split_percent(validation_split_percentage);
            debug!(
                validation_rows = validation.len(),
                train_rows = train.len(),
                "Carved validation split from train"
            );
            self.validation = Some(validation);
            self.train = Some(train);
            self.validation_files = self.train_files.clone();
        }
    }
}

/// Recursively find `*.txt` files under `dir`, sorted by path
pub fn discover_text_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::config(format!("Not a directory: {}", dir.display())));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some("txt")
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Read all lines of `files`, in order
pub fn read_rows(files: &[PathBuf], keep_linebreaks: bool) -> Result<TextDataset> {
    let mut rows = Vec::new();
    for path in files {
        rows.extend(TextLines::open(path, keep_linebreaks)?.collect::<Result<Vec<_>>>()?);
    }
    Ok(TextDataset::new(rows))
}

/// Lazily yields the lines of one file
pub struct TextLines {
    reader: BufReader<File>,
    keep_linebreaks: bool,
}

impl TextLines {
    pub fn open(path: &Path, keep_linebreaks: bool) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            keep_linebreaks,
        })
    }
}

impl Iterator for TextLines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => {
                if !self.keep_linebreaks {
                    let trimmed = line.trim_end_matches(['\n', '\r']).len();
                    line.truncate(trimmed);
                }
                Some(Ok(line))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

/// Lazily yields the lines of many files, one file at a time
pub fn stream_rows(
    files: Vec<PathBuf>,
    keep_linebreaks: bool,
) -> impl Iterator<Item = Result<String>> + Send {
    files.into_iter().flat_map(move |path| -> Box<dyn Iterator<Item = Result<String>> + Send> {
        match TextLines::open(&path, keep_linebreaks) {
            Ok(lines) => Box::new(lines),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_discovery_is_recursive_and_sorted() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "b.txt", "b\n");
        write(temp.path(), "nested/a.txt", "a\n");
        write(temp.path(), "notes.md", "skip\n");

        let files = discover_text_files(temp.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(temp.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(names, vec![PathBuf::from("b.txt"), PathBuf::from("nested/a.txt")]);
    }

    #[test]
    fn test_keep_linebreaks() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "one\r\ntwo\nthree");
        let files = discover_text_files(temp.path()).unwrap();

        let kept = read_rows(&files, true).unwrap();
        assert_eq!(kept.rows(), &["one\r\n", "two\n", "three"]);

        let stripped = read_rows(&files, false).unwrap();
        assert_eq!(stripped.rows(), &["one", "two", "three"]);
    }

    #[test]
    fn test_validation_carved_from_train() {
        let temp = TempDir::new().unwrap();
        let contents: String = (0..20).map(|i| format!("line {}\n", i)).collect();
        write(temp.path(), "train/a.txt", &contents);

        let datasets =
            RawDatasets::from_dirs(Some(&temp.path().join("train")), None, 10.0, false).unwrap();
        let validation = datasets.validation.unwrap();
        let train = datasets.train.unwrap();
        assert_eq!(validation.rows(), &["line 0", "line 1"]);
        assert_eq!(train.len(), 18);
        assert_eq!(train.rows()[0], "line 2");
    }

    #[test]
    fn test_missing_dirs_leave_splits_empty() {
        let temp = TempDir::new().unwrap();
        let datasets =
            RawDatasets::from_dirs(Some(&temp.path().join("absent")), None, 5.0, true).unwrap();
        assert!(datasets.train.is_none());
        assert!(datasets.validation.is_none());
    }

    #[test]
    fn test_stream_rows_matches_read_rows() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "x\ny\n");
        write(temp.path(), "b.txt", "z\n");
        let files = discover_text_files(temp.path()).unwrap();

        let streamed: Vec<String> = stream_rows(files.clone(), true).collect::<Result<_>>().unwrap();
        assert_eq!(streamed, read_rows(&files, true).unwrap().into_rows());
    }
}

//! Checkpoint discovery and resume decisions
//!
//! Checkpoints live in `<output_dir>/checkpoint-<global step>`. Before a
//! training run starts, [`ResumeManager`] inspects the output directory
//! and decides whether to start fresh, resume, or refuse to clobber an
//! unrelated non-empty directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::config::TrainingArguments;
use crate::constants::checkpoint::PREFIX_CHECKPOINT_DIR;
use crate::constants::files::TRAINER_STATE_NAME;
use crate::error::{Error, Result};

/// Subset of the trainer state persisted in each checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: Option<f64>,
    pub best_metric: Option<f64>,
    pub best_model_checkpoint: Option<String>,
    pub log_history: Vec<serde_json::Value>,
}

/// One checkpoint directory
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub step: usize,
    pub path: PathBuf,
    /// Parsed `trainer_state.json`, if present and readable
    pub state: Option<TrainerState>,
}

/// Name of the checkpoint directory for `step`
pub fn checkpoint_dir_name(step: usize) -> String {
    format!("{}-{}", PREFIX_CHECKPOINT_DIR, step)
}

/// Step of a `checkpoint-<digits>` name
fn parse_step(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(PREFIX_CHECKPOINT_DIR)?.strip_prefix('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// List checkpoint directories under `dir`, sorted by step
pub async fn list_checkpoints(dir: &Path) -> Result<Vec<CheckpointInfo>> {
    let mut checkpoints = Vec::new();

    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let step = match path.file_name().and_then(|n| n.to_str()).and_then(parse_step) {
            Some(step) => step,
            None => continue,
        };

        let state_path = path.join(TRAINER_STATE_NAME);
        let state = if state_path.exists() {
            let json = fs::read_to_string(&state_path).await?;
            match serde_json::from_str(&json) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(path = %state_path.display(), error = %e, "Unreadable trainer state");
                    None
                }
            }
        } else {
            None
        };

        checkpoints.push(CheckpointInfo { step, path, state });
    }

    checkpoints.sort_by_key(|c| c.step);
    Ok(checkpoints)
}

/// Checkpoint with the highest step, if any
pub async fn get_last_checkpoint(dir: &Path) -> Result<Option<CheckpointInfo>> {
    Ok(list_checkpoints(dir).await?.pop())
}

/// Remove the oldest checkpoints so at most `limit` remain
pub async fn rotate_checkpoints(dir: &Path, limit: usize) -> Result<Vec<PathBuf>> {
    let checkpoints = list_checkpoints(dir).await?;
    if checkpoints.len() <= limit {
        return Ok(Vec::new());
    }

    let to_remove = checkpoints.len() - limit;
    let mut removed = Vec::with_capacity(to_remove);
    for checkpoint in checkpoints.into_iter().take(to_remove) {
        match fs::remove_dir_all(&checkpoint.path).await {
            Ok(()) => {
                info!(path = %checkpoint.path.display(), "Deleted older checkpoint");
                removed.push(checkpoint.path);
            }
            Err(e) => warn!(path = %checkpoint.path.display(), error = %e, "Failed to remove old checkpoint"),
        }
    }
    Ok(removed)
}

/// Outcome of inspecting the output directory before training
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeState {
    /// Start from scratch
    NoPriorRun,
    /// Resume from the newest checkpoint found in the output directory
    ResumableCheckpointFound(CheckpointInfo),
    /// Output directory holds files but no checkpoint and overwrite is off
    NonEmptyConflictingDirectory { output_dir: PathBuf },
    /// The caller named a checkpoint; it wins over auto-detection
    ExplicitResumeRequested {
        path: PathBuf,
        auto_detected: Option<CheckpointInfo>,
    },
}

impl ResumeState {
    /// Checkpoint to hand to the trainer
    pub fn checkpoint_path(&self) -> Option<&Path> {
        match self {
            ResumeState::ResumableCheckpointFound(info) => Some(&info.path),
            ResumeState::ExplicitResumeRequested { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ResumeState::NonEmptyConflictingDirectory { .. })
    }
}

/// Message of the error raised for a conflicting output directory
pub fn conflict_message(output_dir: &Path) -> String {
    format!(
        "Output directory ({}) already exists and is not empty. Use --overwrite_output_dir to overcome.",
        output_dir.display()
    )
}

/// Decides how a training run relates to what is already on disk
pub struct ResumeManager<'a> {
    args: &'a TrainingArguments,
}

impl<'a> ResumeManager<'a> {
    pub fn new(args: &'a TrainingArguments) -> Self {
        Self { args }
    }

    /// Inspect without failing on conflicts
    pub async fn inspect(&self) -> Result<ResumeState> {
        let args = self.args;
        let explicit = args.resume_from_checkpoint.clone();

        if !args.do_train {
            return Ok(ResumeState::NoPriorRun);
        }

        let mut auto_detected = None;
        if args.output_dir.is_dir() && !args.overwrite_output_dir {
            auto_detected = get_last_checkpoint(&args.output_dir).await?;
            if auto_detected.is_none() && !is_empty_dir(&args.output_dir).await? {
                return Ok(ResumeState::NonEmptyConflictingDirectory {
                    output_dir: args.output_dir.clone(),
                });
            }
        }

        Ok(match (explicit, auto_detected) {
            (Some(path), auto_detected) => ResumeState::ExplicitResumeRequested { path, auto_detected },
            (None, Some(found)) => ResumeState::ResumableCheckpointFound(found),
            (None, None) => ResumeState::NoPriorRun,
        })
    }

    /// Inspect and turn a conflict or a missing explicit checkpoint into an error
    pub async fn resolve(&self) -> Result<ResumeState> {
        let state = self.inspect().await?;
        match &state {
            ResumeState::NonEmptyConflictingDirectory { output_dir } => {
                return Err(Error::config(conflict_message(output_dir)));
            }
            ResumeState::ResumableCheckpointFound(found) => {
                warn!(
                    checkpoint = %found.path.display(),
                    "Checkpoint detected, resuming training. To avoid this behavior, change \
                     the `--output_dir` or add `--overwrite_output_dir` to train from scratch."
                );
            }
            ResumeState::ExplicitResumeRequested { path, .. } => {
                if !path.is_dir() {
                    return Err(Error::Checkpoint(format!(
                        "Can't find a valid checkpoint at {}",
                        path.display()
                    )));
                }
                info!(checkpoint = %path.display(), "Resuming from requested checkpoint");
            }
            ResumeState::NoPriorRun => {}
        }
        Ok(state)
    }
}

async fn is_empty_dir(dir: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(output_dir: &Path) -> TrainingArguments {
        TrainingArguments {
            output_dir: output_dir.to_path_buf(),
            do_train: true,
            ..Default::default()
        }
    }

    async fn mkdir(path: PathBuf) -> PathBuf {
        fs::create_dir_all(&path).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_last_checkpoint_is_highest_step() {
        let temp = TempDir::new().unwrap();
        for step in [500, 1500, 1000] {
            mkdir(temp.path().join(checkpoint_dir_name(step))).await;
        }
        mkdir(temp.path().join("checkpoint-final")).await;
        mkdir(temp.path().join("checkpoint-+9000")).await;
        mkdir(temp.path().join("checkpoint- 8000")).await;
        fs::write(temp.path().join("checkpoint-2000"), b"a file").await.unwrap();

        let last = get_last_checkpoint(temp.path()).await.unwrap().unwrap();
        assert_eq!(last.step, 1500);
        assert!(last.path.ends_with("checkpoint-1500"));
    }

    #[test]
    fn test_step_must_be_plain_digits() {
        assert_eq!(parse_step("checkpoint-42"), Some(42));
        assert_eq!(parse_step("checkpoint-007"), Some(7));
        assert_eq!(parse_step("checkpoint-+5"), None);
        assert_eq!(parse_step("checkpoint-"), None);
        assert_eq!(parse_step("checkpoint-1e3"), None);
        assert_eq!(parse_step("checkpoint42"), None);
    }

    #[tokio::test]
    async fn test_trainer_state_is_read() {
        let temp = TempDir::new().unwrap();
        let dir = mkdir(temp.path().join("checkpoint-10")).await;
        fs::write(dir.join(TRAINER_STATE_NAME), r#"{"global_step": 10, "epoch": 0.5, "extra": 1}"#)
            .await
            .unwrap();

        let last = get_last_checkpoint(temp.path()).await.unwrap().unwrap();
        let state = last.state.unwrap();
        assert_eq!(state.global_step, 10);
        assert_eq!(state.epoch, Some(0.5));
    }

    #[tokio::test]
    async fn test_missing_or_empty_dir_is_fresh_run() {
        let temp = TempDir::new().unwrap();
        let missing = args(&temp.path().join("absent"));
        assert_eq!(ResumeManager::new(&missing).resolve().await.unwrap(), ResumeState::NoPriorRun);

        let empty = args(&mkdir(temp.path().join("empty")).await);
        assert_eq!(ResumeManager::new(&empty).resolve().await.unwrap(), ResumeState::NoPriorRun);
    }

    #[tokio::test]
    async fn test_conflicting_directory() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("notes.txt"), b"unrelated").await.unwrap();
        let args = args(temp.path());

        let state = ResumeManager::new(&args).inspect().await.unwrap();
        assert!(state.is_conflict());

        let err = ResumeManager::new(&args).resolve().await.unwrap_err();
        assert!(err.is_config());
        assert!(err
            .to_string()
            .contains("already exists and is not empty. Use --overwrite_output_dir to overcome."));
    }

    #[tokio::test]
    async fn test_overwrite_skips_detection() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("notes.txt"), b"unrelated").await.unwrap();
        mkdir(temp.path().join("checkpoint-5")).await;
        let mut args = args(temp.path());
        args.overwrite_output_dir = true;
        assert_eq!(ResumeManager::new(&args).resolve().await.unwrap(), ResumeState::NoPriorRun);
    }

    #[tokio::test]
    async fn test_checkpoint_found_resumes() {
        let temp = TempDir::new().unwrap();
        mkdir(temp.path().join("checkpoint-100")).await;
        mkdir(temp.path().join("checkpoint-200")).await;
        let args = args(temp.path());

        let state = ResumeManager::new(&args).resolve().await.unwrap();
        assert!(matches!(state, ResumeState::ResumableCheckpointFound(ref c) if c.step == 200));
        assert!(state.checkpoint_path().unwrap().ends_with("checkpoint-200"));
    }

    #[tokio::test]
    async fn test_explicit_resume_wins() {
        let temp = TempDir::new().unwrap();
        mkdir(temp.path().join("checkpoint-200")).await;
        let explicit = mkdir(temp.path().join("checkpoint-100")).await;
        let mut args = args(temp.path());
        args.resume_from_checkpoint = Some(explicit.clone());

        let state = ResumeManager::new(&args).resolve().await.unwrap();
        assert_eq!(state.checkpoint_path(), Some(explicit.as_path()));
        assert!(matches!(
            state,
            ResumeState::ExplicitResumeRequested { auto_detected: Some(ref c), .. } if c.step == 200
        ));
    }

    #[tokio::test]
    async fn test_explicit_resume_must_exist() {
        let temp = TempDir::new().unwrap();
        let mut args = args(&temp.path().join("out"));
        args.resume_from_checkpoint = Some(temp.path().join("nowhere"));
        assert!(matches!(
            ResumeManager::new(&args).resolve().await,
            Err(Error::Checkpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_no_training_means_no_resume() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("notes.txt"), b"unrelated").await.unwrap();
        let mut args = args(temp.path());
        args.do_train = false;
        assert_eq!(ResumeManager::new(&args).resolve().await.unwrap(), ResumeState::NoPriorRun);
    }

    #[tokio::test]
    async fn test_rotation_keeps_newest() {
        let temp = TempDir::new().unwrap();
        for step in [1, 2, 3, 4] {
            mkdir(temp.path().join(checkpoint_dir_name(step))).await;
        }
        let removed = rotate_checkpoints(temp.path(), 2).await.unwrap();
        assert_eq!(removed.len(), 2);
        let left: Vec<usize> = list_checkpoints(temp.path()).await.unwrap().iter().map(|c| c.step).collect();
        assert_eq!(left, vec![3, 4]);
    }
}

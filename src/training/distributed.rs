//! Coordination between processes of one distributed launch
//!
//! Dataset preparation runs on the local main process first; the other
//! processes wait for its ready marker and then prepare (typically from the
//! warm cache). Without a distributed launch the work runs immediately.

use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::config::DistributedEnv;
use crate::constants::data::READY_MARKER;
use crate::error::Result;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// File-based "main process first" barrier
#[derive(Debug, Clone)]
pub struct MainProcessFirst {
    env: DistributedEnv,
    marker_dir: PathBuf,
    poll_interval: Duration,
}

impl MainProcessFirst {
    pub fn new(env: DistributedEnv, marker_dir: impl Into<PathBuf>) -> Self {
        Self {
            env,
            marker_dir: marker_dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Marker written once the main process finished `desc`
    pub fn marker_path(&self, desc: &str) -> PathBuf {
        let slug: String = desc
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        self.marker_dir
            .join(format!("{}-{}-{}", READY_MARKER, self.env.launch_id(), slug))
    }

    /// Remove this launch's marker for `desc`
    pub async fn clear(&self, desc: &str) -> Result<()> {
        if self.env.is_local_main_process() {
            let marker = self.marker_path(desc);
            if fs::try_exists(&marker).await? {
                fs::remove_file(&marker).await?;
            }
        }
        Ok(())
    }

    /// Run `work` on the local main process, then on every other process
    pub async fn run<F, Fut, T>(&self, desc: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.env.is_distributed() {
            return work().await;
        }

        let marker = self.marker_path(desc);
        if self.env.is_local_main_process() {
            self.clear(desc).await?;
            let result = work().await?;
            write_marker(&marker).await?;
            info!(desc, marker = %marker.display(), "Main process finished, releasing others");
            Ok(result)
        } else {
            wait_for(&marker, self.poll_interval).await?;
            debug!(desc, rank = self.env.rank, "Main process ready, continuing");
            work().await
        }
    }
}

async fn write_marker(marker: &Path) -> Result<()> {
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(marker, Utc::now().to_rfc3339()).await?;
    Ok(())
}

async fn wait_for(marker: &Path, poll_interval: Duration) -> Result<()> {
    while !fs::try_exists(marker).await? {
        tokio::time::sleep(poll_interval).await;
    }
    Ok(())
}

//! On-disk output queue
//!
//! Publish batches are written as one JSON file per source and cycle into the
//! results directory, where the external publisher picks them up. Results
//! that were not selected live in a separate overflow pool file that is
//! replaced as a whole on every cycle.

use crate::proxy::models::ProbeResult;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Timestamp format used in batch file names
const BATCH_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// A pooled result and when it was put back into the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntry {
    #[serde(flatten)]
    pub result: ProbeResult,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutputQueue {
    dir: PathBuf,
    pool_file: PathBuf,
}

impl OutputQueue {
    pub fn new(dir: impl Into<PathBuf>, pool_file: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pool_file: pool_file.into(),
        }
    }

    pub fn pool_file(&self) -> &Path {
        &self.pool_file
    }

    /// Create the results directory and the pool file's parent
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::create_dir_all(pool_parent(&self.pool_file))?;
        Ok(())
    }

    /// Path for a new batch file of `source`, never reusing an existing file
    pub fn batch_path(&self, source: &str, at: DateTime<Utc>) -> PathBuf {
        let stem = format!("{}_{}", source, at.format(BATCH_TIMESTAMP_FORMAT));
        let mut path = self.dir.join(format!("{}.json", stem));
        let mut suffix = 1;
        while path.exists() {
            path = self.dir.join(format!("{}_{}.json", stem, suffix));
            suffix += 1;
        }
        path
    }

    /// Write one publish batch as a pretty JSON array
    pub fn write_batch(&self, source: &str, batch: &[ProbeResult]) -> Result<PathBuf> {
        self.ensure_dirs()?;
        let path = self.batch_path(source, Utc::now());
        fs::write(&path, serde_json::to_string_pretty(batch)?)?;
        debug!(path = %path.display(), count = batch.len(), "batch written");
        Ok(path)
    }

    /// Load pooled results measured within `ttl`.
    ///
    /// A missing or unreadable pool is treated as empty.
    pub fn load_pool(&self, ttl: Duration) -> Vec<ProbeResult> {
        let content = match fs::read_to_string(&self.pool_file) {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };
        let entries: Vec<PoolEntry> = match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.pool_file.display(), error = %e, "ignoring corrupt pool file");
                return Vec::new();
            }
        };

        let cutoff = Utc::now() - ttl;
        let total = entries.len();
        let fresh: Vec<ProbeResult> = entries
            .into_iter()
            .filter(|entry| entry.result.probed_at >= cutoff)
            .map(|entry| entry.result)
            .collect();
        if fresh.len() < total {
            debug!(expired = total - fresh.len(), "dropped expired pool entries");
        }
        fresh
    }

    /// Replace the pool with `results`, stamping each with the current time
    pub fn store_pool(&self, results: &[ProbeResult]) -> Result<()> {
        let queued_at = Utc::now();
        let entries: Vec<PoolEntry> = results
            .iter()
            .cloned()
            .map(|result| PoolEntry { result, queued_at })
            .collect();

        let parent = pool_parent(&self.pool_file);
        fs::create_dir_all(parent)?;
        let mut file = NamedTempFile::new_in(parent)?;
        file.write_all(serde_json::to_string_pretty(&entries)?.as_bytes())?;
        file.persist(&self.pool_file)?;
        Ok(())
    }
}

fn pool_parent(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

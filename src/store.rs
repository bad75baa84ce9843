// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent task records.
//!
//! The record set must survive process termination: the OS may kill the
//! hosting process and relaunch it later purely to deliver a transfer
//! callback, at which point the record is the only way to join that callback
//! back to a job. Writes are atomic (temp file + rename) and serialized
//! across processes with an advisory lock, so a crash mid-save never leaves
//! a torn document behind.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::task::TaskConfig;

/// Timeout for acquiring the state file lock
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval while waiting for the lock
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// On-disk document: all live task records plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    /// Schema version for future migrations
    #[serde(default = "default_version")]
    version: u32,
    /// When the document was last written
    #[serde(default)]
    last_saved: Option<DateTime<Utc>>,
    /// Live task records, keyed by job id
    #[serde(default)]
    tasks: HashMap<String, TaskConfig>,
}

fn default_version() -> u32 {
    1
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: default_version(),
            last_saved: None,
            tasks: HashMap::new(),
        }
    }
}

/// Durable mapping from job id to [`TaskConfig`].
#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    document: StoreDocument,
}

impl TaskStore {
    /// Default location under the user's data directory. Survives process
    /// termination but not uninstallation.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("bgfetch").join("tasks.json"))
            .unwrap_or_else(|| PathBuf::from(".bgfetch/tasks.json"))
    }

    /// Open the store at `path`, loading any existing records.
    ///
    /// A missing file is an empty store, not an error. A record written by an
    /// older schema still loads; its absent fields take defaults.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = Self::load_document(&path)?;
        Ok(Self { path, document })
    }

    fn lock_path(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    fn acquire_exclusive_lock(path: &Path, timeout: Duration) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        let start = Instant::now();
        loop {
            // UFCS keeps this on the fs2 trait method; std has since grown
            // inherent locking methods with a different error type.
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to lock state file at {:?}", path));
                }
            }
        }
    }

    fn acquire_shared_lock(file: &File, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            match FileExt::try_lock_shared(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!("Timed out waiting for shared lock after {:?}", timeout);
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| "Failed to acquire shared lock on state file");
                }
            }
        }
    }

    fn load_document(path: &Path) -> Result<StoreDocument> {
        if !path.exists() {
            return Ok(StoreDocument::default());
        }

        let lock_path = Self::lock_path(path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;
        Self::acquire_shared_lock(&lock_file, LOCK_TIMEOUT)?;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read task store at {:?}", path))?;
        let document: StoreDocument =
            serde_json::from_str(&content).with_context(|| "Failed to parse task store")?;

        Ok(document)
    }

    /// Write the record set to disk.
    ///
    /// The exclusive lock is held across the atomic rename so concurrent
    /// writers from another process cannot interleave.
    pub fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard = Self::acquire_exclusive_lock(&Self::lock_path(&self.path), LOCK_TIMEOUT)?;

        self.document.last_saved = Some(Utc::now());
        let content = serde_json::to_string_pretty(&self.document)
            .with_context(|| "Failed to serialize task store")?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write task store")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync task store to disk")?;
        }

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!("Failed to move {:?} into place at {:?}", temp_path, self.path)
        })?;

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&TaskConfig> {
        self.document.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TaskConfig> {
        self.document.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.document.tasks.contains_key(id)
    }

    pub fn insert(&mut self, task: TaskConfig) {
        self.document.tasks.insert(task.id.clone(), task);
    }

    pub fn remove(&mut self, id: &str) -> Option<TaskConfig> {
        self.document.tasks.remove(id)
    }

    pub fn len(&self) -> usize {
        self.document.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document.tasks.is_empty()
    }

    /// All live job ids.
    pub fn ids(&self) -> Vec<String> {
        self.document.tasks.keys().cloned().collect()
    }

    /// All live records.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskConfig> {
        self.document.tasks.values()
    }
}

//! Multi-instance coordination through the filesystem: advisory lock files and
//! completion flags for an external scheduler.
//!
//! The lock is a throttle, not mutual exclusion. Counting and creating are two
//! separate steps, so concurrent starters can briefly overshoot the ceiling.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::utils::{format_ts, now_eastern};

const LOCK_PREFIX: &str = "instance_";
const LOCK_SUFFIX: &str = ".lock";

// ── Instance lock ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Create `instance_<id>.lock` unless `max` locks are already present.
    pub fn try_acquire(dir: &Path, max: usize, id: u32) -> Result<Option<Self>> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Could not create lock dir {:?}", dir))?;

        if active_count(dir)? >= max {
            return Ok(None);
        }

        let path = dir.join(format!("{}{}{}", LOCK_PREFIX, id, LOCK_SUFFIX));
        std::fs::write(&path, format_ts(&now_eastern()))
            .with_context(|| format!("Failed to create lock {:?}", path))?;
        debug!("Created lock {:?}", path);
        Ok(Some(Self { path }))
    }

    /// Wait until fewer than `max` instances hold a lock, then take one for this process.
    pub async fn acquire(
        dir: &Path,
        max: usize,
        poll: Duration,
        stale_after: Option<Duration>,
    ) -> Result<Self> {
        let id = std::process::id();
        loop {
            if let Some(age) = stale_after {
                prune_stale(dir, age)?;
            }
            if let Some(lock) = Self::try_acquire(dir, max, id)? {
                info!("Instance lock acquired ({:?})", lock.path);
                return Ok(lock);
            }
            warn!("Too many instances running ({} max). Waiting...", max);
            sleep(poll).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove lock {:?}: {}", self.path, e),
        }
    }
}

fn lock_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(LOCK_PREFIX) && name.ends_with(LOCK_SUFFIX) {
            out.push(entry.path());
        }
    }
    Ok(out)
}

pub fn active_count(dir: &Path) -> Result<usize> {
    Ok(lock_files(dir)?.len())
}

/// Remove lock files whose mtime is older than `age`. Returns how many went.
pub fn prune_stale(dir: &Path, age: Duration) -> Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    for path in lock_files(dir)? {
        let modified = std::fs::metadata(&path).and_then(|m| m.modified());
        let stale = match modified {
            Ok(t) => now.duration_since(t).map(|d| d >= age).unwrap_or(false),
            Err(_) => false,
        };
        if stale && std::fs::remove_file(&path).is_ok() {
            warn!("Removed stale lock {:?}", path);
            removed += 1;
        }
    }
    Ok(removed)
}

// ── Flags ─────────────────────────────────────────────────────────────────────

/// `<prefix>_<pid>.flag`
pub fn pid_flag(prefix: &str) -> String {
    format!("{}_{}.flag", prefix, std::process::id())
}

/// Write a sentinel file containing `done`.
pub fn drop_flag(dir: &Path, name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("Could not create dir {:?}", dir))?;
    let path = dir.join(name);
    std::fs::write(&path, "done").with_context(|| format!("Failed to write flag {:?}", path))?;
    info!("Flag dropped: {:?}", path);
    Ok(path)
}

pub fn list_flags(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".flag"))
        .collect();
    names.sort();
    Ok(names)
}

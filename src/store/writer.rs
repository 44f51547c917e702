//! Crash-safe document writes
//!
//! Every commit goes backup, temp sibling, `sync_all`, `rename`. A reader sees
//! either the old bytes or the new bytes, never a mix. Backups are created with
//! `create_new` and never rewritten.
//!
//! The writer takes no locks. Callers hold the document lock for the duration.

use crate::error::{Result, StoreError};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const BACKUP_SUFFIX: &str = ".bak";
const BACKUP_TIMESTAMP: &str = "%Y%m%dT%H%M%S%3fZ";

// Fixed width, so lexical order is chronological
static BACKUP_STAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{8}T\d{9}Z$").expect("valid backup stamp regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    pub path: PathBuf,
    /// Backup of the content this commit replaced
    pub backup_path: Option<PathBuf>,
}

/// A commit whose bytes are durable in a temp file but not yet renamed
///
/// Dropping it without [`PendingCommit::finish`] removes the temp file and
/// leaves the target as it was.
#[derive(Debug)]
pub struct PendingCommit {
    target: PathBuf,
    temp: PathBuf,
    backup_path: Option<PathBuf>,
    finished: bool,
}

impl PendingCommit {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn backup_path(&self) -> Option<&Path> {
        self.backup_path.as_deref()
    }

    pub fn finish(mut self) -> Result<CommitOutcome> {
        if let Err(e) = fs::rename(&self.temp, &self.target) {
            // Drop removes the temp file
            return Err(StoreError::write(&self.target, e));
        }
        self.finished = true;
        sync_parent(&self.target);
        debug!(path = %self.target.display(), "Committed");
        Ok(CommitOutcome {
            path: self.target.clone(),
            backup_path: self.backup_path.take(),
        })
    }
}

impl Drop for PendingCommit {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = fs::remove_file(&self.temp) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.temp.display(), error = %e, "Failed to remove temp file");
            }
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn temp_path_for(path: &Path) -> PathBuf {
    path.with_file_name(format!(
        ".{}.{}.tmp",
        file_name(path),
        Uuid::new_v4().simple()
    ))
}

/// Fresh backup path for `path`: `<name>.<timestamp>.bak`
pub fn backup_path_for(path: &Path) -> PathBuf {
    let stamp = Utc::now().format(BACKUP_TIMESTAMP);
    path.with_file_name(format!("{}.{}{}", file_name(path), stamp, BACKUP_SUFFIX))
}

/// Ordering key for a backup name: (timestamp, collision counter)
fn backup_key(path: &Path, candidate: &str) -> Option<(String, u32)> {
    let prefix = format!("{}.", file_name(path));
    let middle = candidate.strip_prefix(&prefix)?.strip_suffix(BACKUP_SUFFIX)?;
    let (stamp, counter) = match middle.split_once('.') {
        Some((stamp, counter)) => (stamp, counter.parse::<u32>().ok()?),
        None => (middle, 0),
    };
    BACKUP_STAMP
        .is_match(stamp)
        .then(|| (stamp.to_string(), counter))
}

fn write_durable(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes)?;
    file.sync_all()
}

/// Best effort: make the rename itself durable
#[cfg(unix)]
fn sync_parent(path: &Path) {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

fn create_backup(path: &Path) -> Result<PathBuf> {
    let current = fs::read(path).map_err(|e| StoreError::write(path, e))?;
    let base = backup_path_for(path);
    let stem = base.to_string_lossy().trim_end_matches(BACKUP_SUFFIX).to_string();

    let mut candidate = base;
    let mut counter = 0u32;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut file) => {
                if let Err(e) = write_durable(&mut file, &current) {
                    drop(file);
                    let _ = fs::remove_file(&candidate);
                    return Err(StoreError::write(&candidate, e));
                }
                return Ok(candidate);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                counter += 1;
                candidate = PathBuf::from(format!("{}.{}{}", stem, counter, BACKUP_SUFFIX));
            }
            Err(e) => return Err(StoreError::write(&candidate, e)),
        }
    }
}

fn stage(path: &Path, bytes: &[u8], backup: bool) -> Result<PendingCommit> {
    let backup_path = if backup && path.is_file() {
        Some(create_backup(path)?)
    } else {
        None
    };

    let temp = temp_path_for(path);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)
        .map_err(|e| StoreError::write(path, e))?;

    let pending = PendingCommit {
        target: path.to_path_buf(),
        temp,
        backup_path,
        finished: false,
    };
    write_durable(&mut file, bytes).map_err(|e| StoreError::write(path, e))?;
    Ok(pending)
}

/// Back up the current content and stage `bytes` in a synced temp file
pub fn prepare(path: &Path, bytes: &[u8]) -> Result<PendingCommit> {
    stage(path, bytes, true)
}

/// Atomically replace `path` with `bytes`, keeping a backup of what was there
pub fn commit(path: &Path, bytes: &[u8]) -> Result<CommitOutcome> {
    prepare(path, bytes)?.finish()
}

/// Atomic replace without a backup, for derived artifacts
pub fn replace(path: &Path, bytes: &[u8]) -> Result<CommitOutcome> {
    stage(path, bytes, false)?.finish()
}

/// Restore `backup` over `path` through the same atomic path
pub fn rollback(path: &Path, backup: &Path) -> Result<CommitOutcome> {
    let bytes = fs::read(backup).map_err(|e| StoreError::io(backup, e))?;
    let outcome = commit(path, &bytes)?;
    info!(
        path = %path.display(),
        backup = %backup.display(),
        "Rolled back to backup"
    );
    Ok(outcome)
}

/// Backups of `path`, oldest first
pub fn list_backups(path: &Path) -> Result<Vec<PathBuf>> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let entries = match fs::read_dir(&parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(&parent, e)),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(&parent, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(key) = backup_key(path, &name) {
            backups.push((key, entry.path()));
        }
    }
    backups.sort();
    Ok(backups.into_iter().map(|(_, p)| p).collect())
}

/// Delete all but the newest `keep` backups; returns how many were removed
pub fn prune_backups(path: &Path, keep: usize) -> Result<usize> {
    let backups = list_backups(path)?;
    let excess = backups.len().saturating_sub(keep);
    for old in &backups[..excess] {
        fs::remove_file(old).map_err(|e| StoreError::io(old, e))?;
    }
    if excess > 0 {
        debug!(path = %path.display(), removed = excess, keep, "Pruned backups");
    }
    Ok(excess)
}

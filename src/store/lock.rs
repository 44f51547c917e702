//! Advisory per-document locks
//!
//! A lock is a `<document>.lock` side-file created with `create_new`, so two
//! acquirers can never both succeed. The file records the owner token and the
//! acquisition time. A lock older than the caller's `stale_after` is presumed
//! abandoned and reclaimed by the next acquirer.
//!
//! Removal of a lock (release or reclaim) first renames the side-file aside
//! and checks it is still the lock that was inspected. A lock that changed
//! hands in the meantime is linked back into place and left alone.

use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

/// Contents of a lock side-file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub owner: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }
}

/// A lock that was reclaimed because it outlived `stale_after`
#[derive(Debug, Clone)]
pub struct StaleLock {
    /// None when the side-file could not be parsed
    pub previous: Option<LockInfo>,
    pub age: Duration,
    pub warning: String,
}

/// Result of [`acquire`]
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub acquired: bool,
    /// Current holder when not acquired, our own lock when acquired
    pub holder: Option<LockInfo>,
    pub reclaimed: Option<StaleLock>,
}

impl Acquisition {
    fn granted(info: LockInfo, reclaimed: Option<StaleLock>) -> Self {
        Self {
            acquired: true,
            holder: Some(info),
            reclaimed,
        }
    }

    fn refused(holder: Option<LockInfo>) -> Self {
        Self {
            acquired: false,
            holder,
            reclaimed: None,
        }
    }

    pub fn warning(&self) -> Option<&str> {
        self.reclaimed.as_ref().map(|s| s.warning.as_str())
    }

    pub fn holder_name(&self) -> String {
        self.holder
            .as_ref()
            .map(|h| format!("{} (pid {})", h.owner, h.pid))
            .unwrap_or_else(|| "unknown owner".to_string())
    }
}

/// Owner token for the current process: `<pid>-<uuid>`
pub fn owner_token() -> String {
    format!("{}-{}", std::process::id(), Uuid::new_v4())
}

/// Side-file path for a document: `prd.json` -> `prd.json.lock`
pub fn lock_path(doc_path: &Path) -> PathBuf {
    let mut name = doc_path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    doc_path.with_file_name(name)
}

/// A lock side-file as read from disk
struct Observed {
    raw: Vec<u8>,
    info: Option<LockInfo>,
    age: Duration,
}

enum Created {
    Yes(LockInfo),
    AlreadyExists,
}

enum Taken {
    Removed,
    Vanished,
    ChangedHands,
}

fn try_create(path: &Path, owner: &str) -> Result<Created> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(Created::AlreadyExists),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let info = LockInfo::current(owner);
    let written = serde_json::to_vec(&info)
        .map_err(std::io::Error::from)
        .and_then(|bytes| file.write_all(&bytes))
        .and_then(|_| file.sync_all());
    if let Err(e) = written {
        let _ = fs::remove_file(path);
        return Err(StoreError::io(path, e));
    }
    Ok(Created::Yes(info))
}

fn read_lock(path: &Path) -> Result<Option<Observed>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let info = serde_json::from_slice::<LockInfo>(&raw).ok();
    let age = match &info {
        Some(info) => info.age(),
        // Created but not yet written, or corrupt: fall back to mtime
        None => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .unwrap_or_default(),
    };
    Ok(Some(Observed { raw, info, age }))
}

/// Remove the lock at `path` only if it still holds `expected` bytes
///
/// The bytes are checked again right before the rename, so a lock that
/// changed hands since the caller read it is normally never moved. A
/// replacement landing between that check and the rename is still moved
/// aside briefly; until `hard_link` puts it back, a third acquirer can
/// `create_new` the slot and the put-back then fails. Owners re-check with
/// [`LockGuard::ensure_held`] before writing, which catches that case.
fn take_if_unchanged(path: &Path, expected: &[u8]) -> Result<Taken> {
    match fs::read(path) {
        Ok(current) if current != expected => return Ok(Taken::ChangedHands),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Taken::Vanished),
        Err(e) => return Err(StoreError::io(path, e)),
    }

    let mut aside = path.file_name().unwrap_or_default().to_os_string();
    aside.push(format!(".taken-{}", Uuid::new_v4().simple()));
    let aside = path.with_file_name(aside);

    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Taken::Vanished),
        Err(e) => return Err(StoreError::io(path, e)),
    }

    let moved = fs::read(&aside).map_err(|e| StoreError::io(&aside, e))?;
    if moved == expected {
        fs::remove_file(&aside).map_err(|e| StoreError::io(&aside, e))?;
        return Ok(Taken::Removed);
    }

    // Someone replaced the lock between our read and the rename. hard_link
    // fails if the slot was taken again, which keeps the put-back exclusive.
    if let Err(e) = fs::hard_link(&aside, path) {
        warn!(
            path = %path.display(),
            error = %e,
            "Could not restore lock that changed hands during removal"
        );
    }
    let _ = fs::remove_file(&aside);
    Ok(Taken::ChangedHands)
}

/// Try to take the lock for `doc_path`; never blocks
///
/// Returns `acquired: false` when another owner holds a live lock. A lock
/// older than `stale_after` is reclaimed and reported through
/// [`Acquisition::reclaimed`]. Acquiring a lock already held by `owner`
/// succeeds without touching it.
pub fn acquire(doc_path: &Path, owner: &str, stale_after: Duration) -> Result<Acquisition> {
    let path = lock_path(doc_path);

    if let Created::Yes(info) = try_create(&path, owner)? {
        debug!(path = %path.display(), owner, "Lock acquired");
        return Ok(Acquisition::granted(info, None));
    }

    let Some(observed) = read_lock(&path)? else {
        // Released between our create attempt and the read
        return match try_create(&path, owner)? {
            Created::Yes(info) => Ok(Acquisition::granted(info, None)),
            Created::AlreadyExists => Ok(Acquisition::refused(
                read_lock(&path)?.and_then(|o| o.info),
            )),
        };
    };

    if let Some(info) = &observed.info {
        if info.owner == owner {
            return Ok(Acquisition::granted(info.clone(), None));
        }
    }

    if observed.age <= stale_after {
        return Ok(Acquisition::refused(observed.info));
    }

    match take_if_unchanged(&path, &observed.raw)? {
        Taken::Removed | Taken::Vanished => {}
        Taken::ChangedHands => return Ok(Acquisition::refused(read_lock(&path)?.and_then(|o| o.info))),
    }

    match try_create(&path, owner)? {
        Created::Yes(info) => {
            let previous_owner = observed
                .info
                .as_ref()
                .map(|i| i.owner.clone())
                .unwrap_or_else(|| "unknown owner".to_string());
            let warning = format!(
                "Reclaimed stale lock on {} held by {} for {}s (stale after {}s)",
                doc_path.display(),
                previous_owner,
                observed.age.as_secs(),
                stale_after.as_secs()
            );
            warn!(
                path = %path.display(),
                previous_owner = %previous_owner,
                age_secs = observed.age.as_secs(),
                owner,
                "Reclaimed stale lock"
            );
            Ok(Acquisition::granted(
                info,
                Some(StaleLock {
                    previous: observed.info,
                    age: observed.age,
                    warning,
                }),
            ))
        }
        // Another acquirer reclaimed it first
        Created::AlreadyExists => Ok(Acquisition::refused(read_lock(&path)?.and_then(|o| o.info))),
    }
}

/// Release the lock if `owner` holds it; returns false otherwise
pub fn release(doc_path: &Path, owner: &str) -> Result<bool> {
    let path = lock_path(doc_path);
    let Some(observed) = read_lock(&path)? else {
        return Ok(false);
    };

    let held_by_owner = observed.info.as_ref().is_some_and(|i| i.owner == owner);
    if !held_by_owner {
        debug!(path = %path.display(), owner, "Release ignored: lock held by another owner");
        return Ok(false);
    }

    match take_if_unchanged(&path, &observed.raw)? {
        Taken::Removed => {
            debug!(path = %path.display(), owner, "Lock released");
            Ok(true)
        }
        Taken::Vanished | Taken::ChangedHands => Ok(false),
    }
}

/// Whether a live (not stale) lock exists for `doc_path`
///
/// A side-file that cannot be read counts as locked.
pub fn is_locked(doc_path: &Path, stale_after: Duration) -> bool {
    match read_lock(&lock_path(doc_path)) {
        Ok(Some(observed)) => observed.age <= stale_after,
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "Could not read lock side-file; treating as locked");
            true
        }
    }
}

/// Current lock holder, for diagnostics
pub fn inspect(doc_path: &Path) -> Result<Option<LockInfo>> {
    Ok(read_lock(&lock_path(doc_path))?.and_then(|o| o.info))
}

/// Holds a document lock until released or dropped
#[derive(Debug)]
pub struct LockGuard {
    doc_path: PathBuf,
    owner: String,
    acquisition: Acquisition,
    /// The lock was already ours before this guard; leave it in place on drop
    reentrant: bool,
    released: bool,
}

impl LockGuard {
    /// Acquire or fail with [`StoreError::LockContention`]
    pub fn acquire(doc_path: &Path, owner: &str, stale_after: Duration) -> Result<Self> {
        let existing = inspect(doc_path)?.is_some_and(|i| i.owner == owner);
        let acquisition = acquire(doc_path, owner, stale_after)?;
        if !acquisition.acquired {
            return Err(StoreError::LockContention {
                path: doc_path.to_path_buf(),
                holder: acquisition.holder_name(),
            });
        }
        Ok(Self {
            doc_path: doc_path.to_path_buf(),
            owner: owner.to_string(),
            acquisition,
            reentrant: existing,
            released: false,
        })
    }

    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Fail with [`StoreError::LockContention`] unless the side-file still
    /// names this guard's owner
    ///
    /// A long-running holder can have its lock reclaimed as stale. Call this
    /// right before every write made under the lock.
    pub fn ensure_held(&self) -> Result<()> {
        match inspect(&self.doc_path)? {
            Some(info) if info.owner == self.owner => Ok(()),
            current => {
                let holder = current
                    .map(|i| format!("{} (pid {})", i.owner, i.pid))
                    .unwrap_or_else(|| "nobody".to_string());
                warn!(
                    path = %self.doc_path.display(),
                    owner = %self.owner,
                    %holder,
                    "Lock lost while held"
                );
                Err(StoreError::LockContention {
                    path: self.doc_path.clone(),
                    holder,
                })
            }
        }
    }

    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        if self.reentrant {
            return Ok(true);
        }
        release(&self.doc_path, &self.owner)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released || self.reentrant {
            return;
        }
        if let Err(e) = release(&self.doc_path, &self.owner) {
            warn!(path = %self.doc_path.display(), error = %e, "Failed to release lock on drop");
        }
    }
}

//! File-based run lock with staleness recovery.
//!
//! The lock record is a small JSON file created with `create_new`, so two
//! processes racing for a missing lock cannot both win. A record older than
//! the configured timeout is assumed to belong to a crashed run and is taken
//! over. A record that cannot be parsed is treated as absent.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vaultintel_shared::{Result, VaultIntelError};
use vaultintel_vault::{RetryPolicy, write_atomic};

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub started_at: DateTime<Utc>,
    pub owner: String,
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    timeout: Duration,
    owner: String,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            owner: format!("{}-{}", std::process::id(), uuid::Uuid::now_v7()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock. `Ok(false)` means a live run holds it.
    pub fn acquire(&self) -> Result<bool> {
        self.acquire_at(Utc::now())
    }

    /// [`acquire`](Self::acquire) with an explicit clock.
    pub fn acquire_at(&self, now: DateTime<Utc>) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VaultIntelError::io(parent, e))?;
        }

        let record = self.record(now);
        let json = serde_json::to_vec(&record)
            .map_err(|e| VaultIntelError::validation(format!("lock serialization failed: {e}")))?;

        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                if let Err(e) = file.write_all(&json) {
                    drop(file);
                    let _ = std::fs::remove_file(&self.path);
                    return Err(VaultIntelError::io(&self.path, e));
                }
                debug!(path = %self.path.display(), "lock acquired");
                return Ok(true);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(VaultIntelError::io(&self.path, e)),
        }

        match read_record(&self.path) {
            Some(existing) => {
                let age = now - existing.started_at;
                if age < self.timeout {
                    info!(
                        owner = %existing.owner,
                        age_minutes = age.num_minutes(),
                        "lock held by an active run"
                    );
                    return Ok(false);
                }
                warn!(
                    owner = %existing.owner,
                    age_hours = age.num_hours(),
                    "stale lock detected, taking over"
                );
            }
            None => warn!(path = %self.path.display(), "unreadable lock record, overriding"),
        }

        write_atomic(&self.path, &json, RetryPolicy::no_retry())?;
        Ok(true)
    }

    /// Remove the lock if this manager still owns it. Never fails.
    pub fn release(&self) {
        if let Some(existing) = read_record(&self.path) {
            if existing.owner != self.owner {
                debug!(owner = %existing.owner, "lock owned by another run, leaving it");
                return;
            }
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to release lock"),
        }
    }

    /// Acquire and wrap in a guard that releases on drop.
    pub fn try_lock(self) -> Result<Option<LockGuard>> {
        Ok(self.acquire()?.then_some(LockGuard { manager: self }))
    }

    fn record(&self, now: DateTime<Utc>) -> LockRecord {
        LockRecord {
            started_at: now,
            owner: self.owner.clone(),
            pid: std::process::id(),
        }
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Releases the lock when dropped, including during unwinding.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        self.manager.path()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vi-lock-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn acquire_when_absent() {
        let tmp = temp_dir();
        let lock = LockManager::new(tmp.join("vault-intel.lock"), Duration::hours(2));
        assert!(lock.acquire().unwrap());
        let record = read_record(lock.path()).unwrap();
        assert_eq!(record.pid, std::process::id());
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn second_run_is_refused_while_lock_is_fresh() {
        let tmp = temp_dir();
        let path = tmp.join("vault-intel.lock");
        let first = LockManager::new(&path, Duration::hours(2));
        let second = LockManager::new(&path, Duration::hours(2));

        assert!(first.acquire().unwrap());
        let before = std::fs::read(&path).unwrap();
        assert!(!second.acquire().unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), before);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let tmp = temp_dir();
        let path = tmp.join("vault-intel.lock");
        let crashed = LockManager::new(&path, Duration::hours(2));
        let now = Utc::now();
        assert!(crashed.acquire_at(now - Duration::hours(3)).unwrap());

        let next = LockManager::new(&path, Duration::hours(2));
        assert!(next.acquire_at(now).unwrap());
        let record = read_record(&path).unwrap();
        assert_eq!(record.started_at, now);
        assert_eq!(record.owner, next.owner);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn corrupted_lock_is_treated_as_absent() {
        let tmp = temp_dir();
        let path = tmp.join("vault-intel.lock");
        std::fs::write(&path, "{{{ not json").unwrap();
        let lock = LockManager::new(&path, Duration::hours(2));
        assert!(lock.acquire().unwrap());
        assert!(read_record(&path).is_some());
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn release_leaves_foreign_lock_alone() {
        let tmp = temp_dir();
        let path = tmp.join("vault-intel.lock");
        let holder = LockManager::new(&path, Duration::hours(2));
        let other = LockManager::new(&path, Duration::hours(2));
        assert!(holder.acquire().unwrap());

        other.release();
        assert!(path.exists());
        holder.release();
        assert!(!path.exists());
        // Releasing twice is harmless.
        holder.release();

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn guard_releases_on_drop() {
        let tmp = temp_dir();
        let path = tmp.join("vault-intel.lock");
        {
            let guard = LockManager::new(&path, Duration::hours(2))
                .try_lock()
                .unwrap()
                .expect("lock should be free");
            assert!(guard.path().exists());
            assert!(
                LockManager::new(&path, Duration::hours(2))
                    .try_lock()
                    .unwrap()
                    .is_none()
            );
        }
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn guard_releases_during_panic() {
        let tmp = temp_dir();
        let path = tmp.join("vault-intel.lock");
        let p = path.clone();
        let outcome = std::panic::catch_unwind(move || {
            let _guard = LockManager::new(&p, Duration::hours(2)).try_lock().unwrap();
            panic!("agent blew up");
        });
        assert!(outcome.is_err());
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&tmp);
    }
}

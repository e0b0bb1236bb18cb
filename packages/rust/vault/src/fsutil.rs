//! Atomic file writes with bounded retry.
//!
//! Notes are often open in an editor or being touched by a sync client while
//! the pipeline runs. Every mutation goes through [`write_atomic`]: the new
//! content is written to a hidden temp file next to the target and renamed
//! over it. Contention-type failures are retried with linear backoff; once
//! the attempts run out the error is returned to the caller, and the target
//! is never left half-written.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};
use vaultintel_shared::{Result, SafetyConfig, VaultIntelError};

/// Longest single sleep between write attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded retry with linear backoff (`base_delay * attempt`, capped).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Single attempt, no sleeping. Used by tests.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(attempt)
            .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
    }
}

impl From<&SafetyConfig> for RetryPolicy {
    fn from(safety: &SafetyConfig) -> Self {
        Self::new(
            safety.write_retries,
            Duration::from_millis(safety.write_retry_backoff_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SafetyConfig::default())
    }
}

/// Errors worth retrying: another process briefly holds the file.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::ResourceBusy
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    )
}

/// Hidden temp path in the target's directory so the rename stays on one filesystem.
fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    target.with_file_name(format!(".{name}.tmp"))
}

/// Atomically replace `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8], policy: RetryPolicy) -> Result<()> {
    write_atomic_with(path, policy, |file| file.write_all(bytes))
}

/// Atomically replace `path` with whatever `fill` writes into the temp file.
///
/// `fill` may be called once per attempt. On any failure the temp file is
/// removed and the original is untouched.
pub fn write_atomic_with<F>(path: &Path, policy: RetryPolicy, mut fill: F) -> Result<()>
where
    F: FnMut(&mut File) -> io::Result<()>,
{
    let temp = temp_path(path);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match try_write(path, &temp, &mut fill) {
            Ok(()) => {
                debug!(path = %path.display(), attempt, "atomic write complete");
                return Ok(());
            }
            Err(e) => {
                let _ = std::fs::remove_file(&temp);
                if attempt >= policy.attempts || !is_transient(&e) {
                    return Err(VaultIntelError::io(path, e));
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "write contended, retrying"
                );
                std::thread::sleep(delay);
            }
        }
    }
}

fn try_write<F>(path: &Path, temp: &Path, fill: &mut F) -> io::Result<()>
where
    F: FnMut(&mut File) -> io::Result<()>,
{
    let mut file = File::create(temp)?;
    fill(&mut file)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(temp, path)
}

/// Rename `from` to `to` unless `to` already exists.
pub fn rename_no_clobber(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        return Err(VaultIntelError::validation(format!(
            "refusing to overwrite {}",
            to.display()
        )));
    }
    std::fs::rename(from, to).map_err(|e| VaultIntelError::io(from, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vi-fsutil-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));

        let huge = RetryPolicy::new(u32::MAX, Duration::MAX);
        assert_eq!(huge.delay_for(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn write_replaces_content_and_leaves_no_temp() {
        let tmp = temp_dir();
        let target = tmp.join("note.md");
        std::fs::write(&target, "old").unwrap();

        write_atomic(&target, b"new content", RetryPolicy::no_retry()).unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "new content");
        assert!(!tmp.join(".note.md.tmp").exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn mid_write_failure_keeps_original_intact() {
        let tmp = temp_dir();
        let target = tmp.join("note.md");
        let original = "---\ncreated: 2025-01-01\n---\n\noriginal body\n";
        std::fs::write(&target, original).unwrap();

        let err = write_atomic_with(&target, RetryPolicy::no_retry(), |file| {
            file.write_all(b"partial garbage")?;
            Err(io::Error::other("disk vanished"))
        })
        .unwrap_err();

        assert!(err.to_string().contains("disk vanished"));
        assert_eq!(std::fs::read(&target).unwrap(), original.as_bytes());
        assert!(!tmp.join(".note.md.tmp").exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn transient_failure_is_retried() {
        let tmp = temp_dir();
        let target = tmp.join("briefing.md");
        let mut calls = 0;

        write_atomic_with(
            &target,
            RetryPolicy::new(3, Duration::from_millis(1)),
            |file| {
                calls += 1;
                if calls < 3 {
                    return Err(io::Error::from(io::ErrorKind::PermissionDenied));
                }
                file.write_all(b"done")
            },
        )
        .unwrap();

        assert_eq!(calls, 3);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "done");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn exhausted_retries_surface_error() {
        let tmp = temp_dir();
        let target = tmp.join("briefing.md");
        let mut calls = 0;

        let result = write_atomic_with(
            &target,
            RetryPolicy::new(2, Duration::from_millis(1)),
            |_| {
                calls += 1;
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            },
        );

        assert!(result.is_err());
        assert_eq!(calls, 2);
        assert!(!target.exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn non_transient_failure_is_not_retried() {
        let tmp = temp_dir();
        let mut calls = 0;
        let _ = write_atomic_with(
            &tmp.join("x.md"),
            RetryPolicy::new(5, Duration::from_millis(1)),
            |_| {
                calls += 1;
                Err(io::Error::from(io::ErrorKind::InvalidData))
            },
        );
        assert_eq!(calls, 1);
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rename_refuses_to_clobber() {
        let tmp = temp_dir();
        std::fs::write(tmp.join("a.md"), "a").unwrap();
        std::fs::write(tmp.join("b.md"), "b").unwrap();
        assert!(rename_no_clobber(&tmp.join("a.md"), &tmp.join("b.md")).is_err());
        assert_eq!(std::fs::read_to_string(tmp.join("b.md")).unwrap(), "b");
        let _ = std::fs::remove_dir_all(&tmp);
    }
}

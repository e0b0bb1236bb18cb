//! Error types for vault-intel.
//!
//! Library crates use [`VaultIntelError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Failures that an agent recovers from (one unreadable note, a missing
//! snapshot) are not errors in this sense: they are recorded as
//! [`RecoveredError`](crate::types::RecoveredError) values on the agent's
//! result and the scan carries on.

use std::path::PathBuf;

/// Top-level error type for all vault-intel operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultIntelError {
    /// Configuration loading or root-path validation error. Fatal at startup.
    #[error("config error: {message}")]
    Config { message: String },

    /// Another pipeline run holds a live lock.
    #[error("another run is in progress (lock held at {path:?})")]
    LockContention { path: PathBuf },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Frontmatter, YAML, CSV or JSON parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Data validation error (unexpected shape, bad value).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Push notification delivery error.
    #[error("notify error: {0}")]
    Notify(String),

    /// An agent could not run to completion.
    #[error("agent error: {0}")]
    Agent(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, VaultIntelError>;

impl VaultIntelError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must abort the invocation before any agent runs.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::LockContention { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = VaultIntelError::config("paths.vault: not absolute");
        assert_eq!(err.to_string(), "config error: paths.vault: not absolute");

        let err = VaultIntelError::parse("bad yaml at line 3");
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn fatal_classification() {
        assert!(VaultIntelError::config("x").is_fatal());
        assert!(
            VaultIntelError::LockContention {
                path: PathBuf::from("/tmp/vault-intel.lock")
            }
            .is_fatal()
        );
        assert!(!VaultIntelError::Notify("timeout".into()).is_fatal());
    }
}

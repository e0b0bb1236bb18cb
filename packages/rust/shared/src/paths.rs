//! Root-path validation.
//!
//! Every configured root is checked once at startup. A path is accepted only
//! if it is absolute, has no `..` component, exists, and canonicalizes under
//! one of the allowlisted roots (the operator's home directory by default).

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::config::AppConfig;
use crate::error::{Result, VaultIntelError};

/// Canonical, validated root directories for one run.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedPaths {
    pub vault: PathBuf,
    pub portfolio: PathBuf,
    pub holdings: PathBuf,
    pub data_dir: PathBuf,
    pub entity_dictionary: Option<PathBuf>,
}

impl ResolvedPaths {
    /// `<data_dir>/latest`
    pub fn latest_dir(&self) -> PathBuf {
        self.data_dir.join("latest")
    }

    /// `<data_dir>/runs`
    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    /// `<data_dir>/reference_index.json`
    pub fn index_export_path(&self) -> PathBuf {
        self.data_dir.join("reference_index.json")
    }

    /// `<data_dir>/vault-intel.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("vault-intel.lock")
    }
}

/// Validates configured paths against a fixed allowlist of roots.
#[derive(Debug, Clone)]
pub struct PathValidator {
    roots: Vec<PathBuf>,
    home: Option<PathBuf>,
}

impl PathValidator {
    /// Allow anything under the current user's home directory.
    pub fn for_home() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| VaultIntelError::config("could not determine home directory"))?;
        Self::new(vec![home.clone()]).map(|v| v.with_home(home))
    }

    /// Allow anything under `roots`. Roots that do not exist are dropped.
    pub fn new(roots: Vec<PathBuf>) -> Result<Self> {
        let roots: Vec<PathBuf> = roots
            .into_iter()
            .filter_map(|r| r.canonicalize().ok())
            .collect();
        if roots.is_empty() {
            return Err(VaultIntelError::config("no usable allowlist root"));
        }
        Ok(Self {
            roots,
            home: dirs::home_dir(),
        })
    }

    /// Directory substituted for a leading `~`.
    pub fn with_home(mut self, home: PathBuf) -> Self {
        self.home = Some(home);
        self
    }

    /// Validate one configured path. `field` names the config key in errors.
    pub fn validate(&self, raw: &str, field: &str) -> Result<PathBuf> {
        let path = self.check_lexical(raw, field)?;

        if !path.exists() {
            return Err(VaultIntelError::config(format!(
                "{field}: path does not exist: {}",
                path.display()
            )));
        }

        let canonical = path
            .canonicalize()
            .map_err(|e| VaultIntelError::config(format!("{field}: {}: {e}", path.display())))?;

        if !self.roots.iter().any(|root| canonical.starts_with(root)) {
            return Err(VaultIntelError::config(format!(
                "{field}: {} is outside the allowed roots",
                canonical.display()
            )));
        }

        debug!(field, path = %canonical.display(), "path validated");
        Ok(canonical)
    }

    /// Validate every `[paths]` entry. `data_dir` is created if missing, but
    /// only after every other root passed and its nearest existing ancestor
    /// lies under an allowed root.
    pub fn validate_all(&self, config: &AppConfig) -> Result<ResolvedPaths> {
        let paths = &config.paths;

        let vault = self.validate(&paths.vault, "paths.vault")?;
        let portfolio = self.validate(&paths.portfolio, "paths.portfolio")?;
        let holdings = self.validate(&paths.holdings, "paths.holdings")?;
        let entity_dictionary = paths
            .entity_dictionary
            .as_deref()
            .map(|p| self.validate(p, "paths.entity_dictionary"))
            .transpose()?;

        let data_dir = self.check_lexical(&paths.data_dir, "paths.data_dir")?;
        if !data_dir.exists() {
            self.check_creatable(&data_dir, "paths.data_dir")?;
            std::fs::create_dir_all(&data_dir).map_err(|e| VaultIntelError::io(&data_dir, e))?;
        }

        Ok(ResolvedPaths {
            vault,
            portfolio,
            holdings,
            data_dir: self.validate(&paths.data_dir, "paths.data_dir")?,
            entity_dictionary,
        })
    }

    /// A missing `path` may be created only if its nearest existing ancestor
    /// canonicalizes under an allowed root.
    fn check_creatable(&self, path: &Path, field: &str) -> Result<()> {
        let ancestor = path
            .ancestors()
            .skip(1)
            .find(|a| a.exists())
            .ok_or_else(|| {
                VaultIntelError::config(format!("{field}: no existing parent for {}", path.display()))
            })?;
        let canonical = ancestor.canonicalize().map_err(|e| {
            VaultIntelError::config(format!("{field}: {}: {e}", ancestor.display()))
        })?;
        if !self.roots.iter().any(|root| canonical.starts_with(root)) {
            return Err(VaultIntelError::config(format!(
                "{field}: {} is outside the allowed roots",
                path.display()
            )));
        }
        Ok(())
    }

    /// Tilde expansion plus the checks that need no filesystem access.
    fn check_lexical(&self, raw: &str, field: &str) -> Result<PathBuf> {
        let path = self.expand_tilde(raw, field)?;

        if !path.is_absolute() {
            return Err(VaultIntelError::config(format!(
                "{field}: path must be absolute: {raw}"
            )));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(VaultIntelError::config(format!(
                "{field}: path traversal (..) is not allowed: {raw}"
            )));
        }
        Ok(path)
    }

    fn expand_tilde(&self, raw: &str, field: &str) -> Result<PathBuf> {
        let rest = match raw.strip_prefix('~') {
            None => return Ok(PathBuf::from(raw)),
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
            Some(_) => return Ok(PathBuf::from(raw)),
        };
        let home = self.home.as_deref().ok_or_else(|| {
            VaultIntelError::config(format!("{field}: cannot expand ~ without a home directory"))
        })?;
        Ok(if rest.is_empty() {
            home.to_path_buf()
        } else {
            home.join(rest)
        })
    }
}

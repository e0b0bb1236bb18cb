//! Reference index: who links to whom.
//!
//! Built in one pass over every note in the vault. Keys are normalized note
//! identifiers (see [`note::normalize_target`]); values are the notes that
//! reference them. The coordinator builds it once per run and shares it; a
//! standalone agent loads the last export instead of walking the vault again.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use vaultintel_shared::{Result, VaultIntelError};

use crate::fsutil::{RetryPolicy, write_atomic};
use crate::note;
use crate::walk;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceIndex {
    pub built_at: DateTime<Utc>,
    pub notes_scanned: usize,
    /// Notes that could not be read during the build.
    #[serde(default)]
    pub unreadable: usize,
    pub references: BTreeMap<String, BTreeSet<PathBuf>>,
}

impl ReferenceIndex {
    /// Walk `vault` (skipping `ignore` directories) and index every wikilink.
    #[instrument(skip_all, fields(vault = %vault.display()))]
    pub fn build(vault: &Path, ignore: &[String]) -> Self {
        let mut index = Self {
            built_at: Utc::now(),
            ..Default::default()
        };

        for path in walk::markdown_files(vault, ignore) {
            let content = match std::fs::read(&path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read note for indexing");
                    index.unreadable += 1;
                    continue;
                }
            };
            index.notes_scanned += 1;
            index.add_note(&path, &content);
        }

        info!(
            notes = index.notes_scanned,
            targets = index.references.len(),
            unreadable = index.unreadable,
            "reference index built"
        );
        index
    }

    /// Record every outgoing reference in `content` as coming from `source`.
    pub fn add_note(&mut self, source: &Path, content: &str) {
        for target in note::wikilink_targets(content) {
            self.references
                .entry(note::normalize_target(target))
                .or_default()
                .insert(source.to_path_buf());
        }
    }

    /// Number of distinct referenced identifiers.
    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Whether any note references `identifier` (already normalized).
    pub fn is_referenced(&self, identifier: &str) -> bool {
        self.references.contains_key(identifier)
    }

    /// Notes referencing `identifier`.
    pub fn referrers(&self, identifier: &str) -> Option<&BTreeSet<PathBuf>> {
        self.references.get(identifier)
    }

    /// Write the index as JSON.
    pub fn export(&self, path: &Path, policy: RetryPolicy) -> Result<()> {
        let json = serde_json::to_vec(self).map_err(|e| {
            VaultIntelError::validation(format!("index serialization failed: {e}"))
        })?;
        write_atomic(path, &json, policy)?;
        debug!(path = %path.display(), targets = self.len(), "reference index exported");
        Ok(())
    }

    /// Read a previously exported index.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path).map_err(|e| VaultIntelError::io(path, e))?;
        serde_json::from_slice(&content).map_err(|e| {
            VaultIntelError::parse(format!("invalid index export {}: {e}", path.display()))
        })
    }

    /// Use the export at `path` if readable, otherwise rebuild from the vault.
    pub fn load_or_build(path: &Path, vault: &Path, ignore: &[String]) -> Self {
        match Self::load(path) {
            Ok(index) => {
                debug!(path = %path.display(), built_at = %index.built_at, "reusing exported index");
                index
            }
            Err(e) => {
                debug!(error = %e, "no usable index export, rebuilding");
                Self::build(vault, ignore)
            }
        }
    }
}

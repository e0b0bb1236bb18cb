//! Explicit per-run context handed to every agent.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, Utc};
use vaultintel_shared::{AppConfig, ResolvedPaths};
use vaultintel_vault::{ReferenceIndex, RetryPolicy};

/// Everything an agent may read: config, validated roots, the shared index,
/// the dry-run flag and the run clock. Cheap to clone across worker threads.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub config: Arc<AppConfig>,
    pub paths: Arc<ResolvedPaths>,
    /// Built once by the coordinator. `None` for standalone runs, in which
    /// case agents fall back to the exported index.
    pub index: Option<Arc<ReferenceIndex>>,
    pub dry_run: bool,
    /// Run start time; all date arithmetic uses this rather than the wall clock.
    pub now: DateTime<Local>,
    pub retry: RetryPolicy,
}

impl AgentContext {
    pub fn new(config: Arc<AppConfig>, paths: Arc<ResolvedPaths>) -> Self {
        let retry = RetryPolicy::from(&config.safety);
        Self {
            config,
            paths,
            index: None,
            dry_run: false,
            now: Local::now(),
            retry,
        }
    }

    pub fn with_index(mut self, index: Arc<ReferenceIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_now(mut self, now: DateTime<Local>) -> Self {
        self.now = now;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        self.now.with_timezone(&Utc)
    }

    /// The shared index, or the last export, or a fresh build.
    pub fn reference_index(&self) -> Arc<ReferenceIndex> {
        match &self.index {
            Some(index) => Arc::clone(index),
            None => Arc::new(ReferenceIndex::load_or_build(
                &self.paths.index_export_path(),
                &self.paths.vault,
                &self.config.hygiene.ignore_folders,
            )),
        }
    }

    /// `path` relative to the vault root, for display and result records.
    pub fn vault_relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.paths.vault).unwrap_or(path)
    }
}

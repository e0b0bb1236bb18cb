//! Three-stage pipeline: hygiene, then the read-only agents in parallel,
//! then the briefing.
//!
//! Each agent runs on its own OS thread so that a panic or a stuck scan is
//! contained. The async side waits on a oneshot channel, under a timeout for
//! every agent except hygiene; an agent that misses its deadline is abandoned
//! and recorded as failed. Hygiene is always waited for: it rewrites notes,
//! and nothing may read the tree while it is still running.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use vaultintel_agents::{AgentContext, run_agent};
use vaultintel_notify::TelegramNotifier;
use vaultintel_shared::{
    AgentKind, AgentReport, AgentResult, AppConfig, ErrorKind, PathValidator, RecoveredError,
    ResolvedPaths, Result, ResultSet, VaultIntelError,
};
use vaultintel_storage::{LockGuard, LockManager, RunStore};
use vaultintel_vault::{ReferenceIndex, RetryPolicy};

use crate::progress::ProgressReporter;

/// What a full pipeline run produced.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub dry_run: bool,
    pub results: ResultSet,
    /// One-line summary from the briefing, if it produced one.
    pub summary: Option<String>,
    /// Vault-relative path of the written report.
    pub briefing_path: Option<PathBuf>,
    pub index_size: usize,
    pub notified: bool,
    pub elapsed: Duration,
}

impl PipelineOutcome {
    pub fn failed_agents(&self) -> Vec<AgentKind> {
        self.results
            .values()
            .filter(|r| r.is_failed())
            .map(|r| r.agent)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    config: Arc<AppConfig>,
    paths: Arc<ResolvedPaths>,
}

impl Coordinator {
    /// Validate every configured root against the home tree. Any bad root is fatal.
    pub fn new(config: AppConfig) -> Result<Self> {
        let paths = PathValidator::for_home()?.validate_all(&config)?;
        Ok(Self::with_paths(config, paths))
    }

    /// Use already validated roots.
    pub fn with_paths(config: AppConfig, paths: ResolvedPaths) -> Self {
        Self {
            config: Arc::new(config),
            paths: Arc::new(paths),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.safety)
    }

    /// Deadline for `kind`, or `None` when the agent must run to completion.
    fn timeout_for(&self, kind: AgentKind) -> Option<Duration> {
        match kind {
            AgentKind::Hygiene => None,
            _ => Some(Duration::from_secs(self.config.safety.agent_timeout_secs)),
        }
    }

    fn store(&self) -> RunStore {
        RunStore::new(&self.paths.data_dir, self.retry())
    }

    fn context(&self, dry_run: bool) -> AgentContext {
        AgentContext::new(Arc::clone(&self.config), Arc::clone(&self.paths)).with_dry_run(dry_run)
    }

    fn acquire_lock(&self) -> Result<Option<LockGuard>> {
        if !self.config.safety.lock_enabled {
            debug!("run lock disabled");
            return Ok(None);
        }
        let hours = i64::try_from(self.config.safety.lock_timeout_hours).unwrap_or(i64::MAX);
        let timeout = chrono::Duration::try_hours(hours).unwrap_or(chrono::Duration::MAX);
        let path = self.paths.lock_path();
        match LockManager::new(&path, timeout).try_lock()? {
            Some(guard) => Ok(Some(guard)),
            None => Err(VaultIntelError::LockContention { path }),
        }
    }

    /// Build the reference index and export it. Export failure is returned
    /// alongside the index rather than aborting the run.
    async fn build_index(&self) -> Result<(ReferenceIndex, Option<RecoveredError>)> {
        let paths = Arc::clone(&self.paths);
        let ignore = self.config.hygiene.ignore_folders.clone();
        let retry = self.retry();
        tokio::task::spawn_blocking(move || {
            let index = ReferenceIndex::build(&paths.vault, &ignore);
            let export_path = paths.index_export_path();
            let export_error = index.export(&export_path, retry).err().map(|e| {
                warn!(error = %e, "reference index export failed");
                RecoveredError::new(ErrorKind::IndexExport, e.to_string()).at(&export_path)
            });
            (index, export_error)
        })
        .await
        .map_err(|e| VaultIntelError::Agent(format!("index build task failed: {e}")))
    }

    /// Rebuild and export the reference index without running any agent.
    pub async fn rebuild_index(&self) -> Result<ReferenceIndex> {
        let (index, export_error) = self.build_index().await?;
        match export_error {
            Some(e) => Err(VaultIntelError::Agent(e.to_string())),
            None => Ok(index),
        }
    }

    /// Run the full pipeline.
    ///
    /// Fails only on lock contention or when the index build task itself
    /// dies; everything else ends up on some agent's result.
    #[instrument(skip_all, fields(dry_run = dry_run))]
    pub async fn run(
        &self,
        dry_run: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineOutcome> {
        let start = Instant::now();
        let now = Local::now();
        let run_id = RunStore::run_id(now);
        info!(%run_id, dry_run, "starting pipeline");

        let _guard = self.acquire_lock()?;

        // --- Reference index ---
        progress.stage("Building reference index");
        let (index, export_error) = self.build_index().await?;
        let index_size = index.len();
        let ctx = self
            .context(dry_run)
            .with_now(now)
            .with_index(Arc::new(index));

        let mut results = ResultSet::new();

        // --- Stage 1: hygiene mutates notes, so it runs alone ---
        progress.stage("Stage 1: vault hygiene");
        progress.agent_started(AgentKind::Hygiene);
        let mut hygiene = self
            .run_stage_one(agent_job(
                AgentKind::Hygiene,
                ctx.clone(),
                Arc::new(ResultSet::new()),
            ))
            .await;
        if let Some(e) = export_error {
            hygiene.push_error(e);
            hygiene = hygiene.finalize();
        }
        progress.agent_finished(&hygiene);
        results.insert(AgentKind::Hygiene, hygiene);

        // --- Stage 2: read-only agents on a bounded pool ---
        progress.stage("Stage 2: analysis agents");
        let stage_two = self.run_stage_two(&ctx, &results, progress).await;
        results.extend(stage_two);

        // --- Stage 3: briefing over everything above ---
        progress.stage("Stage 3: briefing");
        progress.agent_started(AgentKind::Briefing);
        let briefing = run_isolated(
            AgentKind::Briefing,
            self.timeout_for(AgentKind::Briefing),
            agent_job(AgentKind::Briefing, ctx.clone(), Arc::new(results.clone())),
        )
        .await;
        progress.agent_finished(&briefing);
        let (summary, briefing_path) = match &briefing.report {
            Some(AgentReport::Briefing(b)) => (Some(b.summary.clone()), b.output_path.clone()),
            _ => (None, None),
        };
        results.insert(AgentKind::Briefing, briefing);

        // --- Persist ---
        progress.stage("Saving results");
        for (agent, e) in self.store().save_all(&run_id, &results) {
            error!(%agent, error = %e, "failed to persist result");
        }

        // --- Notify ---
        let notified = match (&summary, dry_run) {
            (Some(text), false) => self.notify(text).await,
            (_, true) => {
                debug!("dry run, notification skipped");
                false
            }
            (None, false) => {
                warn!("briefing produced no summary, notification skipped");
                false
            }
        };

        let outcome = PipelineOutcome {
            run_id,
            dry_run,
            results,
            summary,
            briefing_path,
            index_size,
            notified,
            elapsed: start.elapsed(),
        };
        info!(
            run_id = %outcome.run_id,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            failed = outcome.failed_agents().len(),
            "pipeline complete"
        );
        progress.done(&outcome);
        Ok(outcome)
    }

    /// Stage 1 has no deadline: the returned result means the hygiene
    /// thread is gone, finished or panicked, and the tree is stable.
    async fn run_stage_one<F>(&self, job: F) -> AgentResult
    where
        F: FnOnce() -> AgentResult + Send + 'static,
    {
        run_isolated(AgentKind::Hygiene, self.timeout_for(AgentKind::Hygiene), job).await
    }

    async fn run_stage_two(
        &self,
        ctx: &AgentContext,
        upstream: &ResultSet,
        progress: &dyn ProgressReporter,
    ) -> ResultSet {
        let workers = self.config.safety.max_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let upstream = Arc::new(upstream.clone());
        let mut set = JoinSet::new();

        for kind in AgentKind::STAGE_TWO {
            progress.agent_started(kind);
            let timeout = self.timeout_for(kind);
            let semaphore = Arc::clone(&semaphore);
            let job = agent_job(kind, ctx.clone(), Arc::clone(&upstream));
            set.spawn(async move {
                let started_at = Utc::now();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return AgentResult::failed(
                        kind,
                        started_at,
                        RecoveredError::new(ErrorKind::AgentFailure, "worker pool closed"),
                    );
                };
                run_isolated(kind, timeout, job).await
            });
        }

        let mut results = ResultSet::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    progress.agent_finished(&result);
                    results.insert(result.agent, result);
                }
                Err(e) => error!(error = %e, "stage 2 task aborted"),
            }
        }

        for kind in AgentKind::STAGE_TWO {
            results.entry(kind).or_insert_with(|| {
                let result = AgentResult::failed(
                    kind,
                    Utc::now(),
                    RecoveredError::new(ErrorKind::AgentFailure, "agent task aborted"),
                );
                progress.agent_finished(&result);
                result
            });
        }
        results
    }

    /// Run one agent on its own, without the lock or the staging.
    ///
    /// The briefing reads its inputs from the latest persisted results.
    /// The result is persisted like any pipeline result.
    #[instrument(skip_all, fields(agent = %agent, dry_run = dry_run))]
    pub async fn run_single(
        &self,
        agent: AgentKind,
        dry_run: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<AgentResult> {
        let now = Local::now();
        let run_id = RunStore::run_id(now);
        let store = self.store();
        let ctx = self.context(dry_run).with_now(now);

        let upstream = if agent == AgentKind::Briefing {
            let mut latest = store.load_latest_all();
            latest.remove(&AgentKind::Briefing);
            debug!(results = latest.len(), "briefing over latest results");
            latest
        } else {
            ResultSet::new()
        };

        progress.stage(&format!("Running {agent}"));
        progress.agent_started(agent);
        let result = run_isolated(
            agent,
            self.timeout_for(agent),
            agent_job(agent, ctx, Arc::new(upstream)),
        )
        .await;
        progress.agent_finished(&result);

        store.save(&run_id, &result)?;
        Ok(result)
    }

    /// Best-effort push of `summary`. Never fails the run.
    async fn notify(&self, summary: &str) -> bool {
        if !self.config.notify.enabled {
            debug!("notifications disabled");
            return false;
        }
        let notifier = match TelegramNotifier::from_config(&self.config.notify) {
            Ok(notifier) => notifier,
            Err(e) => {
                warn!(error = %e, "notifier unavailable");
                return false;
            }
        };
        match notifier.send(summary).await {
            Ok(()) => {
                info!("summary notification sent");
                true
            }
            Err(e) => {
                warn!(error = %e, "summary notification failed");
                false
            }
        }
    }
}

fn agent_job(
    kind: AgentKind,
    ctx: AgentContext,
    upstream: Arc<ResultSet>,
) -> impl FnOnce() -> AgentResult + Send + 'static {
    move || run_agent(kind, &ctx, &upstream)
}

/// Run `job` on a dedicated thread and wait for it, at most `timeout` when set.
///
/// A panic, a vanished thread or a missed deadline all become a failed
/// result for `kind`. A timed-out thread is left to finish on its own.
pub(crate) async fn run_isolated<F>(
    kind: AgentKind,
    timeout: Option<Duration>,
    job: F,
) -> AgentResult
where
    F: FnOnce() -> AgentResult + Send + 'static,
{
    let started_at = Utc::now();
    let (tx, rx) = oneshot::channel();

    let spawned = std::thread::Builder::new()
        .name(format!("agent-{kind}"))
        .spawn(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(job));
            let _ = tx.send(outcome);
        });
    if let Err(e) = spawned {
        return AgentResult::failed(
            kind,
            started_at,
            RecoveredError::new(ErrorKind::AgentFailure, format!("could not start agent thread: {e}")),
        );
    }

    let received = match timeout {
        Some(limit) => tokio::time::timeout(limit, rx).await,
        None => Ok(rx.await),
    };
    let failure = match received {
        Ok(Ok(Ok(result))) => {
            debug!(%kind, status = %result.status, "agent finished");
            return result;
        }
        Ok(Ok(Err(panic))) => {
            let message = panic_message(panic.as_ref());
            error!(%kind, %message, "agent panicked");
            RecoveredError::new(ErrorKind::AgentFailure, format!("agent panicked: {message}"))
        }
        Ok(Err(_)) => {
            error!(%kind, "agent thread exited without a result");
            RecoveredError::new(ErrorKind::AgentFailure, "agent thread exited without a result")
        }
        Err(_) => {
            let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
            warn!(%kind, timeout_secs = secs, "agent timed out");
            RecoveredError::new(ErrorKind::Timeout, format!("agent timed out after {secs}s"))
        }
    };
    AgentResult::failed(kind, started_at, failure)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

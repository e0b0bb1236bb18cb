//! Run records: one directory per pipeline run plus a `latest/` mirror.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{debug, instrument, warn};
use vaultintel_shared::{AgentKind, AgentResult, Result, ResultSet, VaultIntelError};
use vaultintel_vault::{RetryPolicy, write_atomic};

/// Persists agent results under `<data_dir>/runs/<run_id>/` and `<data_dir>/latest/`.
#[derive(Debug, Clone)]
pub struct RunStore {
    data_dir: PathBuf,
    policy: RetryPolicy,
}

impl RunStore {
    pub fn new(data_dir: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            data_dir: data_dir.into(),
            policy,
        }
    }

    /// Run identifier for a run started at `at`, e.g. `20251014-021500`.
    pub fn run_id(at: DateTime<Local>) -> String {
        at.format("%Y%m%d-%H%M%S").to_string()
    }

    pub fn latest_dir(&self) -> PathBuf {
        self.data_dir.join("latest")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(run_id)
    }

    /// Write `result` into the run directory and the latest mirror.
    #[instrument(skip_all, fields(agent = %result.agent, run_id = %run_id))]
    pub fn save(&self, run_id: &str, result: &AgentResult) -> Result<()> {
        let json = serde_json::to_vec_pretty(result).map_err(|e| {
            VaultIntelError::validation(format!("result serialization failed: {e}"))
        })?;
        let file_name = result.agent.result_file_name();

        for dir in [self.run_dir(run_id), self.latest_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| VaultIntelError::io(&dir, e))?;
            write_atomic(&dir.join(&file_name), &json, self.policy)?;
        }

        debug!(file = %file_name, "result persisted");
        Ok(())
    }

    /// Save every result in `results`; returns the failures instead of stopping at the first.
    pub fn save_all(&self, run_id: &str, results: &ResultSet) -> Vec<(AgentKind, VaultIntelError)> {
        results
            .values()
            .filter_map(|result| {
                self.save(run_id, result)
                    .err()
                    .map(|e| (result.agent, e))
            })
            .collect()
    }

    /// Latest result for one agent. `Ok(None)` if that agent has never run.
    pub fn load_latest(&self, agent: AgentKind) -> Result<Option<AgentResult>> {
        load_result(&self.latest_dir().join(agent.result_file_name()))
    }

    /// Every readable latest result. Unparsable files are skipped with a warning.
    pub fn load_latest_all(&self) -> ResultSet {
        let mut set = ResultSet::new();
        for agent in AgentKind::ALL {
            match self.load_latest(agent) {
                Ok(Some(result)) => {
                    set.insert(agent, result);
                }
                Ok(None) => debug!(%agent, "no latest result"),
                Err(e) => warn!(%agent, error = %e, "ignoring unreadable latest result"),
            }
        }
        set
    }
}

fn load_result(path: &Path) -> Result<Option<AgentResult>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(VaultIntelError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| VaultIntelError::parse(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use vaultintel_shared::{Issue, IssueKind, Severity, Status};

    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vi-runs-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn run_id_format() {
        let at = Local.with_ymd_and_hms(2025, 10, 14, 2, 15, 0).unwrap();
        assert_eq!(RunStore::run_id(at), "20251014-021500");
    }

    #[test]
    fn save_writes_run_dir_and_latest() {
        let tmp = temp_dir();
        let store = RunStore::new(&tmp, RetryPolicy::no_retry());
        let mut result = AgentResult::start(AgentKind::Hygiene);
        result.issues.push(Issue::new(IssueKind::EmptyNote, Severity::P3, "stub"));
        let result = result.finalize();

        store.save("20251014-021500", &result).unwrap();

        assert!(tmp.join("runs/20251014-021500/hygiene_result.json").exists());
        let loaded = store.load_latest(AgentKind::Hygiene).unwrap().unwrap();
        assert_eq!(loaded, result);
        assert!(store.run_dir("20251014-021500").is_dir());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn latest_is_overwritten_by_next_run() {
        let tmp = temp_dir();
        let store = RunStore::new(&tmp, RetryPolicy::no_retry());

        let mut first = AgentResult::start(AgentKind::PositionRisk);
        first.set_metric("alerts", 4);
        store.save("20251013-021500", &first.finalize()).unwrap();

        let mut second = AgentResult::start(AgentKind::PositionRisk);
        second.set_metric("alerts", 1);
        store.save("20251014-021500", &second.finalize()).unwrap();

        let latest = store.load_latest(AgentKind::PositionRisk).unwrap().unwrap();
        assert_eq!(latest.metric_u64("alerts"), Some(1));
        assert!(store.run_dir("20251013-021500").join("position_risk_result.json").exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn load_latest_all_skips_missing_and_corrupt() {
        let tmp = temp_dir();
        let store = RunStore::new(&tmp, RetryPolicy::no_retry());
        store
            .save("r1", &AgentResult::start(AgentKind::HoldingsDelta).finalize())
            .unwrap();
        std::fs::write(store.latest_dir().join("hygiene_result.json"), "{broken").unwrap();

        let set = store.load_latest_all();
        assert_eq!(set.len(), 1);
        assert_eq!(set[&AgentKind::HoldingsDelta].status, Status::Success);

        let _ = std::fs::remove_dir_all(&tmp);
    }
}

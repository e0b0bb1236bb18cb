//! Follow-up task queue for critical position findings.
//!
//! Tasks are appended to `<data_dir>/follow_up_tasks.json`. A task with the
//! same dedup key created within the last seven days suppresses a new one,
//! so a breach that persists across nights is queued once a week at most.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use vaultintel_shared::{Issue, Result, Severity, VaultIntelError};
use vaultintel_vault::{RetryPolicy, write_atomic};

pub const TASKS_FILE: &str = "follow_up_tasks.json";
const SOURCE: &str = "vault-intel";
const DEDUP_WINDOW_DAYS: i64 = 7;

pub fn queue_path(data_dir: &Path) -> PathBuf {
    data_dir.join(TASKS_FILE)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub id: u64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    /// 1 for P1 findings, 2 otherwise.
    pub priority: u8,
    pub source: String,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TaskQueue {
    #[serde(default)]
    pub tasks: Vec<FollowUpTask>,
}

impl TaskQueue {
    /// Load the queue. A missing file is an empty queue.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(VaultIntelError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| VaultIntelError::parse(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path, retry: RetryPolicy) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| VaultIntelError::parse(format!("task queue serialization: {e}")))?;
        write_atomic(path, &json, retry)
    }

    /// `vault-intel-<issue kind>-<ticker>`
    pub fn dedup_key(issue: &Issue) -> String {
        let kind = serde_json::to_value(issue.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", issue.kind));
        format!(
            "{SOURCE}-{kind}-{}",
            issue.ticker.as_deref().unwrap_or("unknown")
        )
    }

    fn is_duplicate(&self, key: &str, now: DateTime<Utc>) -> bool {
        let window = Duration::days(DEDUP_WINDOW_DAYS);
        self.tasks
            .iter()
            .any(|t| t.dedup_key == key && now - t.created_at < window)
    }

    /// Queue a task for `issue` unless a recent one covers it. Returns the new id.
    pub fn enqueue(&mut self, issue: &Issue, now: DateTime<Utc>) -> Option<u64> {
        let key = Self::dedup_key(issue);
        if self.is_duplicate(&key, now) {
            return None;
        }
        let id = self.tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        self.tasks.push(FollowUpTask {
            id,
            title: format!("[{SOURCE}] {}: {}", issue.kind.label(), issue.detail),
            ticker: issue.ticker.clone(),
            priority: if issue.severity == Severity::P1 { 1 } else { 2 },
            source: SOURCE.to_string(),
            dedup_key: key,
            created_at: now,
            done: false,
        });
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use vaultintel_shared::IssueKind;

    use super::*;

    fn breach(ticker: &str) -> Issue {
        Issue::new(IssueKind::InvalidationBreach, Severity::P1, format!("{ticker}: below 150"))
            .with_ticker(ticker)
    }

    #[test]
    fn dedup_key_uses_kind_and_ticker() {
        assert_eq!(
            TaskQueue::dedup_key(&breach("AAPL")),
            "vault-intel-invalidation_breach-AAPL"
        );
    }

    #[test]
    fn repeat_within_a_week_is_suppressed() {
        let now: DateTime<Utc> = "2025-10-14T02:00:00Z".parse().unwrap();
        let mut queue = TaskQueue::default();

        assert_eq!(queue.enqueue(&breach("AAPL"), now), Some(1));
        assert_eq!(queue.enqueue(&breach("AAPL"), now + Duration::days(3)), None);
        assert_eq!(queue.enqueue(&breach("MSFT"), now), Some(2));
        assert_eq!(queue.enqueue(&breach("AAPL"), now + Duration::days(8)), Some(3));

        let first = &queue.tasks[0];
        assert_eq!(first.title, "[vault-intel] Invalidation breach: AAPL: below 150");
        assert_eq!(first.priority, 1);
    }

    #[test]
    fn queue_round_trips_through_disk() {
        let tmp = std::env::temp_dir().join(format!("vi-tasks-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&tmp).unwrap();
        let path = queue_path(&tmp);

        assert!(TaskQueue::load(&path).unwrap().tasks.is_empty());
        let mut queue = TaskQueue::default();
        queue.enqueue(&breach("NVDA"), Utc::now());
        queue.save(&path, RetryPolicy::no_retry()).unwrap();

        let loaded = TaskQueue::load(&path).unwrap();
        assert_eq!(loaded.tasks, queue.tasks);

        std::fs::write(&path, "not json").unwrap();
        assert!(TaskQueue::load(&path).is_err());

        let _ = std::fs::remove_dir_all(&tmp);
    }
}

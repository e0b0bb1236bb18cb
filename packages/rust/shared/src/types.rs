//! Core domain types shared by every agent and the coordinator.
//!
//! [`AgentResult`] is the hand-off contract: each agent returns one, the
//! coordinator persists it as `<agent>_result.json`, and the briefing agent
//! reads the whole set back.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VaultIntelError;

// ---------------------------------------------------------------------------
// AgentKind
// ---------------------------------------------------------------------------

/// The closed set of agents the pipeline knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Hygiene,
    CrossReference,
    PositionRisk,
    HoldingsDelta,
    Briefing,
}

impl AgentKind {
    /// Every agent, in pipeline order.
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Hygiene,
        AgentKind::CrossReference,
        AgentKind::PositionRisk,
        AgentKind::HoldingsDelta,
        AgentKind::Briefing,
    ];

    /// Read-only agents that run concurrently in Stage 2.
    pub const STAGE_TWO: [AgentKind; 3] = [
        AgentKind::CrossReference,
        AgentKind::PositionRisk,
        AgentKind::HoldingsDelta,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hygiene => "hygiene",
            Self::CrossReference => "cross_reference",
            Self::PositionRisk => "position_risk",
            Self::HoldingsDelta => "holdings_delta",
            Self::Briefing => "briefing",
        }
    }

    /// File name used in run directories and the `latest/` mirror.
    pub fn result_file_name(&self) -> String {
        format!("{}_result.json", self.as_str())
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = VaultIntelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "hygiene" => Ok(Self::Hygiene),
            "cross_reference" | "crossref" | "linker" => Ok(Self::CrossReference),
            "position_risk" | "killcriteria" | "kill_criteria" => Ok(Self::PositionRisk),
            "holdings_delta" | "13f" | "13f_delta" => Ok(Self::HoldingsDelta),
            "briefing" => Ok(Self::Briefing),
            other => Err(VaultIntelError::validation(format!(
                "unknown agent '{other}': expected one of hygiene, cross-reference, \
                 position-risk, holdings-delta, briefing"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status, severity, issues
// ---------------------------------------------------------------------------

/// Outcome of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Partial,
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        })
    }
}

/// Issue priority. Ordered so that sorting puts `P1` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    P1,
    P2,
    P3,
}

impl Severity {
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::P1)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Every issue type any agent can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingFrontmatter,
    MissingDatePrefix,
    EmptyNote,
    OrphanNote,
    MisplacedNote,
    NarrativeShift,
    PortfolioOverlap,
    KillCriteriaViolation,
    InvalidationBreach,
    DrawdownAlert,
    StaleThesis,
    ConcentrationAlert,
    IncompleteThesis,
}

impl IssueKind {
    /// Human-readable label used in the briefing.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingFrontmatter => "Missing frontmatter",
            Self::MissingDatePrefix => "Missing date prefix",
            Self::EmptyNote => "Empty note",
            Self::OrphanNote => "Orphan note",
            Self::MisplacedNote => "Possibly misplaced",
            Self::NarrativeShift => "Narrative shift",
            Self::PortfolioOverlap => "Smart money overlap",
            Self::KillCriteriaViolation => "Kill criteria violation",
            Self::InvalidationBreach => "Invalidation breach",
            Self::DrawdownAlert => "Drawdown alert",
            Self::StaleThesis => "Stale thesis",
            Self::ConcentrationAlert => "Concentration alert",
            Self::IncompleteThesis => "Incomplete thesis",
        }
    }
}

/// One finding raised by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    /// Suggested destination folder for misplaced notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_dir: Option<String>,
}

impl Issue {
    pub fn new(kind: IssueKind, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            detail: detail.into(),
            path: None,
            ticker: None,
            suggested_dir: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.ticker = Some(ticker.into());
        self
    }

    pub fn with_suggested_dir(mut self, dir: impl Into<String>) -> Self {
        self.suggested_dir = Some(dir.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Actions and recovered errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    FrontmatterAdded,
    DatePrefixAdded,
    LinkAdded,
    BriefingWritten,
    TaskCreated,
    /// What would have happened without `--dry-run`.
    Preview,
}

/// A mutation performed (or previewed) by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Action {
    pub fn new(kind: ActionKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Category of a failure an agent recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FileRead,
    FileWrite,
    Parse,
    DataUnavailable,
    Timeout,
    AgentFailure,
    IndexExport,
}

/// A failure that did not stop the agent, kept on its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl RecoveredError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
        }
    }

    pub fn at(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl std::fmt::Display for RecoveredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}: {}", p.display(), self.message),
            None => f.write_str(&self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent-specific report payloads
// ---------------------------------------------------------------------------

/// Polarity of a thesis or an analysis note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Bullish,
    Bearish,
    Mixed,
}

/// A recent analysis note whose tone contradicts the recorded thesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeShift {
    pub ticker: String,
    pub note: PathBuf,
    pub thesis_stance: Stance,
    pub note_stance: Stance,
    pub bull_signals: usize,
    pub bear_signals: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increase,
    Decrease,
}

/// A position that appeared in or vanished from a manager's filing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub manager_cik: String,
    pub manager_name: String,
    pub issuer: String,
    pub cusip: String,
    pub ticker: String,
    pub shares: f64,
    /// Value in $K.
    pub value: f64,
    pub portfolio_overlap: bool,
}

/// A position held in both periods whose share count moved materially.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeChange {
    pub manager_cik: String,
    pub manager_name: String,
    pub issuer: String,
    pub cusip: String,
    pub ticker: String,
    pub prior_shares: f64,
    pub shares: f64,
    pub prior_value: f64,
    pub value: f64,
    /// Signed, rounded to one decimal.
    pub change_pct: f64,
    pub direction: Direction,
    pub portfolio_overlap: bool,
}

/// Diff between the two most recent holdings snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HoldingsDelta {
    pub latest_period: String,
    pub previous_period: String,
    pub new_positions: Vec<PositionEntry>,
    pub exits: Vec<PositionEntry>,
    pub size_changes: Vec<SizeChange>,
    pub overlap_tickers: Vec<String>,
}

/// Scored outcome of the briefing agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BriefingSummary {
    pub health_score: u8,
    pub grade: char,
    pub p1_count: usize,
    /// One-line summary for push delivery.
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

/// Typed payload attached to an [`AgentResult`] beyond metrics and issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentReport {
    CrossReference {
        narrative_shifts: Vec<NarrativeShift>,
    },
    PositionRisk {
        positions_without_thesis: Vec<String>,
    },
    HoldingsDelta(HoldingsDelta),
    Briefing(BriefingSummary),
}

// ---------------------------------------------------------------------------
// AgentResult
// ---------------------------------------------------------------------------

/// Uniform result record returned by every agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: AgentKind,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub actions_taken: Vec<Action>,
    #[serde(default)]
    pub errors: Vec<RecoveredError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<AgentReport>,
}

/// Results keyed by agent, as handed from one stage to the next.
pub type ResultSet = BTreeMap<AgentKind, AgentResult>;

impl AgentResult {
    /// Open a result for `agent`, started now.
    pub fn start(agent: AgentKind) -> Self {
        Self::start_at(agent, Utc::now())
    }

    pub fn start_at(agent: AgentKind, started_at: DateTime<Utc>) -> Self {
        Self {
            agent,
            status: Status::Success,
            started_at,
            completed_at: None,
            dry_run: false,
            metrics: BTreeMap::new(),
            issues: Vec::new(),
            actions_taken: Vec::new(),
            errors: Vec::new(),
            report: None,
        }
    }

    /// A result for an agent that never produced one (panic, timeout, setup failure).
    pub fn failed(agent: AgentKind, started_at: DateTime<Utc>, error: RecoveredError) -> Self {
        let mut result = Self::start_at(agent, started_at);
        result.mark_failed(error);
        result.finalize()
    }

    pub fn set_metric(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        self.metrics.insert(name.to_string(), value.into());
    }

    pub fn metric_u64(&self, name: &str) -> Option<u64> {
        self.metrics.get(name).and_then(serde_json::Value::as_u64)
    }

    pub fn push_error(&mut self, error: RecoveredError) {
        self.errors.push(error);
    }

    /// Mark the run as failed outright; `finalize` will keep it that way.
    fn mark_failed(&mut self, error: RecoveredError) {
        self.errors.push(error);
        self.status = Status::Failed;
    }

    /// Derive the final status and stamp `completed_at`.
    ///
    /// A failed result stays failed (and always carries at least one error);
    /// otherwise any recovered error downgrades the run to partial.
    pub fn finalize(mut self) -> Self {
        match self.status {
            Status::Failed if self.errors.is_empty() => {
                self.errors.push(RecoveredError::new(
                    ErrorKind::AgentFailure,
                    "agent failed without reporting a cause",
                ));
            }
            Status::Failed => {}
            _ if self.errors.is_empty() => self.status = Status::Success,
            _ => self.status = Status::Partial,
        }
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == Status::Failed
    }

    pub fn critical_issue_count(&self) -> usize {
        self.issues.iter().filter(|i| i.severity.is_critical()).count()
    }

    /// Wall-clock duration, if completed.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

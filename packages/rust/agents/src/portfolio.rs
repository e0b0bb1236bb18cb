//! Readers for the portfolio store: current positions, per-company thesis
//! records and the entity dictionary.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use vaultintel_shared::{ErrorKind, RecoveredError, Result, Stance, VaultIntelError};

/// `<portfolio>/portfolio_monitor/data/portfolio_data.json`
pub fn portfolio_file(portfolio_root: &Path) -> PathBuf {
    portfolio_root
        .join("portfolio_monitor")
        .join("data")
        .join("portfolio_data.json")
}

/// `<portfolio>/research/companies`
pub fn companies_dir(portfolio_root: &Path) -> PathBuf {
    portfolio_root.join("research").join("companies")
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Portfolio {
    #[serde(default)]
    pub positions: Vec<Position>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Position {
    pub symbol: String,
    #[serde(default)]
    pub total_pnl_pct: Option<f64>,
    #[serde(default)]
    pub pct_of_nav: Option<f64>,
    #[serde(default)]
    pub ibkr_pct_of_nav: Option<f64>,
    #[serde(default)]
    pub mark_price: Option<f64>,
}

impl Position {
    /// Weight of the position in the book, preferring the computed figure
    /// over the broker-reported one.
    pub fn nav_pct(&self) -> Option<f64> {
        self.pct_of_nav.or(self.ibkr_pct_of_nav)
    }

    pub fn ticker(&self) -> String {
        self.symbol.trim().to_uppercase()
    }
}

impl Portfolio {
    /// Load the position file. `Ok(None)` when the file does not exist.
    pub fn load(portfolio_root: &Path) -> Result<Option<Self>> {
        let path = portfolio_file(portfolio_root);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VaultIntelError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| VaultIntelError::parse(format!("{}: {e}", path.display())))
    }

    /// Uppercased held symbols.
    pub fn symbols(&self) -> BTreeSet<String> {
        self.positions
            .iter()
            .map(Position::ticker)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Held symbols, or an empty set when the store is missing or unreadable.
pub fn held_symbols(portfolio_root: &Path) -> BTreeSet<String> {
    match Portfolio::load(portfolio_root) {
        Ok(Some(portfolio)) => portfolio.symbols(),
        Ok(None) => BTreeSet::new(),
        Err(e) => {
            debug!(error = %e, "portfolio store unreadable, assuming no holdings");
            BTreeSet::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Thesis records
// ---------------------------------------------------------------------------

/// The fields of `thesis.yaml` the pipeline reads. Everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Thesis {
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub stance: Option<String>,
    #[serde(default)]
    pub kill_criteria_status: Option<String>,
    #[serde(default)]
    pub fail_detected_at: Option<serde_yaml::Value>,
    #[serde(default)]
    pub invalidation_price: Option<f64>,
    #[serde(default)]
    pub bull_case: Option<serde_yaml::Value>,
    #[serde(default)]
    pub bear_case_1: Option<serde_yaml::Value>,
    #[serde(default)]
    pub bear_case_2: Option<serde_yaml::Value>,
}

impl Thesis {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| VaultIntelError::parse(e.to_string()))
    }

    pub fn kill_criteria_failed(&self) -> bool {
        self.kill_criteria_status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("fail"))
    }

    /// When the kill criteria were first seen failing, if recorded and parsable.
    pub fn fail_detected_at(&self) -> Option<DateTime<Utc>> {
        match self.fail_detected_at.as_ref()? {
            serde_yaml::Value::String(s) => parse_timestamp(s),
            _ => None,
        }
    }

    /// Names of the case fields that are blank or still placeholders.
    pub fn incomplete_fields(&self) -> Vec<&'static str> {
        [
            ("bull_case", &self.bull_case),
            ("bear_case_1", &self.bear_case_1),
            ("bear_case_2", &self.bear_case_2),
        ]
        .into_iter()
        .filter(|(_, value)| is_placeholder(value.as_ref()))
        .map(|(name, _)| name)
        .collect()
    }

    /// Recorded stance: the explicit `stance` field, else a lexical scan of `raw`.
    ///
    /// The scan skips the `bull_case` / `bear_case*` key names, which every
    /// thesis template carries, and compares keyword counts in what remains.
    /// A tie is `Mixed`.
    pub fn stance(&self, raw: &str) -> Stance {
        if let Some(explicit) = self.stance.as_deref().and_then(parse_stance) {
            return explicit;
        }
        let lower = raw
            .to_lowercase()
            .replace("bull_case", "")
            .replace("bear_case", "");
        let bull = lower.matches("bull").count();
        let bear = lower.matches("bear").count() + lower.matches("short").count();
        match bull.cmp(&bear) {
            std::cmp::Ordering::Greater => Stance::Bullish,
            std::cmp::Ordering::Less => Stance::Bearish,
            std::cmp::Ordering::Equal => Stance::Mixed,
        }
    }
}

fn parse_stance(s: &str) -> Option<Stance> {
    match s.trim().to_lowercase().as_str() {
        "bull" | "bullish" | "long" => Some(Stance::Bullish),
        "bear" | "bearish" | "short" => Some(Stance::Bearish),
        "mixed" | "neutral" => Some(Stance::Mixed),
        _ => None,
    }
}

fn is_placeholder(value: Option<&serde_yaml::Value>) -> bool {
    match value {
        None | Some(serde_yaml::Value::Null) => true,
        Some(serde_yaml::Value::String(s)) => s.trim().is_empty() || s.contains("TODO"),
        Some(serde_yaml::Value::Sequence(items)) => {
            items.is_empty() || items.iter().all(|i| is_placeholder(Some(i)))
        }
        Some(_) => false,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// One `research/companies/<DIR>/thesis.yaml`.
#[derive(Debug, Clone)]
pub struct ThesisEntry {
    /// Uppercased company directory name.
    pub dir_ticker: String,
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
    pub thesis: Thesis,
}

impl ThesisEntry {
    /// Tickers this thesis answers to: its directory and its `ticker` field.
    pub fn tickers(&self) -> BTreeSet<String> {
        let mut tickers = BTreeSet::from([self.dir_ticker.clone()]);
        if let Some(t) = self.thesis.ticker.as_deref() {
            let t = t.trim().to_uppercase();
            if !t.is_empty() {
                tickers.insert(t);
            }
        }
        tickers
    }
}

/// Every readable thesis record, sorted by directory. Unparsable records
/// come back as `Parse` errors instead.
pub fn load_theses(portfolio_root: &Path) -> (Vec<ThesisEntry>, Vec<RecoveredError>) {
    let dir = companies_dir(portfolio_root);
    let mut entries = Vec::new();
    let mut errors = Vec::new();

    let Ok(read_dir) = std::fs::read_dir(&dir) else {
        debug!(dir = %dir.display(), "no company research directory");
        return (entries, errors);
    };
    let mut company_dirs: Vec<PathBuf> = read_dir
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    company_dirs.sort();

    for company in company_dirs {
        let path = company.join("thesis.yaml");
        if !path.is_file() {
            continue;
        }
        let dir_ticker = company
            .file_name()
            .map(|n| n.to_string_lossy().to_uppercase())
            .unwrap_or_default();
        match read_thesis(&path) {
            Ok((thesis, _)) => entries.push(ThesisEntry {
                dir_ticker,
                modified: vaultintel_vault::walk::modified(&path),
                path,
                thesis,
            }),
            Err(e) => errors.push(RecoveredError::new(ErrorKind::Parse, e.to_string()).at(&path)),
        }
    }
    (entries, errors)
}

/// Parse one thesis file, returning the record and its raw text.
pub fn read_thesis(path: &Path) -> Result<(Thesis, String)> {
    let raw = std::fs::read_to_string(path).map_err(|e| VaultIntelError::io(path, e))?;
    let thesis = Thesis::parse(&raw)
        .map_err(|e| VaultIntelError::parse(format!("{}: {e}", path.display())))?;
    Ok((thesis, raw))
}

// ---------------------------------------------------------------------------
// Entity dictionary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// `TICKER: {name, aliases}` map, keys uppercased.
#[derive(Debug, Clone, Default)]
pub struct EntityDictionary {
    pub entities: BTreeMap<String, EntityInfo>,
}

impl EntityDictionary {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let parsed: BTreeMap<String, Option<EntityInfo>> =
            serde_yaml::from_str(raw).map_err(|e| VaultIntelError::parse(e.to_string()))?;
        let entities = parsed
            .into_iter()
            .map(|(ticker, info)| (ticker.trim().to_uppercase(), info.unwrap_or_default()))
            .filter(|(ticker, _)| !ticker.is_empty())
            .collect();
        Ok(Self { entities })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| VaultIntelError::io(path, e))?;
        Self::parse(&raw).map_err(|e| VaultIntelError::parse(format!("{}: {e}", path.display())))
    }

    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

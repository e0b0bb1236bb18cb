//! Holdings-delta agent: diffs the two most recent institutional-holdings
//! snapshots and highlights activity in names the portfolio also holds.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use vaultintel_shared::{
    AgentKind, AgentReport, AgentResult, Direction, ErrorKind, HoldingsConfig, HoldingsDelta,
    Issue, IssueKind, PositionEntry, RecoveredError, Result, Severity, SizeChange, VaultIntelError,
};

use crate::context::AgentContext;
use crate::portfolio;

const CUSIP_MAP_FILE: &str = "_cusip_ticker_map.json";

/// One position in one manager's filing for one period.
#[derive(Debug, Clone, PartialEq)]
pub struct Holding {
    pub manager_name: String,
    pub issuer: String,
    pub shares: f64,
    /// Value in $K.
    pub value: f64,
    pub weight: f64,
    pub period: String,
}

/// (manager CIK, CUSIP)
pub type HoldingKey = (String, String);

/// A parsed snapshot plus the number of rows that could not be used.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub period: String,
    pub holdings: HashMap<HoldingKey, Holding>,
    pub malformed_rows: usize,
}

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(rename = "Manager CIK", default)]
    cik: String,
    #[serde(rename = "Manager Name", default)]
    manager_name: String,
    #[serde(rename = "Issuer Name", default)]
    issuer: String,
    #[serde(rename = "CUSIP", default)]
    cusip: String,
    #[serde(rename = "Value ($K)", default, deserialize_with = "csv::invalid_option")]
    value: Option<f64>,
    #[serde(rename = "Shares", default, deserialize_with = "csv::invalid_option")]
    shares: Option<f64>,
    #[serde(rename = "Portfolio %", default, deserialize_with = "csv::invalid_option")]
    weight: Option<f64>,
}

/// Snapshot files in `<holdings>/output/`, ordered by period label.
pub fn find_snapshots(holdings_root: &Path, prefix: &str) -> Vec<(String, PathBuf)> {
    let dir = holdings_root.join("output");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        debug!(dir = %dir.display(), "no holdings output directory");
        return Vec::new();
    };
    let mut found: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")))
        .filter_map(|p| {
            let stem = p.file_stem()?.to_string_lossy().to_string();
            let period = stem.strip_prefix(prefix)?.to_string();
            Some((period, p))
        })
        .collect();
    found.sort();
    found
}

/// Parse one snapshot, keeping only `tracked` managers when that list is non-empty.
pub fn load_snapshot(path: &Path, period: &str, tracked: &[String]) -> Result<Snapshot> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| VaultIntelError::parse(format!("{}: {e}", path.display())))?;

    let mut snapshot = Snapshot {
        period: period.to_string(),
        ..Default::default()
    };
    for record in reader.deserialize::<Row>() {
        let row = match record {
            Ok(row) => row,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping malformed row");
                snapshot.malformed_rows += 1;
                continue;
            }
        };
        if row.cik.is_empty() || row.cusip.is_empty() {
            continue;
        }
        if !tracked.is_empty() && !tracked.iter().any(|m| m == &row.cik) {
            continue;
        }
        snapshot.holdings.insert(
            (row.cik, row.cusip),
            Holding {
                manager_name: row.manager_name,
                issuer: row.issuer,
                shares: row.shares.unwrap_or(0.0),
                value: row.value.unwrap_or(0.0),
                weight: row.weight.unwrap_or(0.0),
                period: period.to_string(),
            },
        );
    }
    Ok(snapshot)
}

/// Optional CUSIP → ticker lookup next to the snapshots.
pub fn load_cusip_map(holdings_root: &Path) -> HashMap<String, String> {
    let path = holdings_root.join("output").join(CUSIP_MAP_FILE);
    let Ok(bytes) = std::fs::read(&path) else {
        return HashMap::new();
    };
    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "ignoring unreadable CUSIP map");
        HashMap::new()
    })
}

/// Counts before capping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeltaCounts {
    pub new_positions: usize,
    pub exits: usize,
    pub size_changes: usize,
}

/// Diff `previous` against `latest`. Lists come back sorted by value
/// descending and capped to `max_entries`.
pub fn compute_delta(
    previous: &Snapshot,
    latest: &Snapshot,
    held: &BTreeSet<String>,
    cusip_map: &HashMap<String, String>,
    cfg: &HoldingsConfig,
) -> (HoldingsDelta, DeltaCounts) {
    let ticker_for = |cusip: &str| {
        cusip_map
            .get(cusip)
            .map(|t| t.trim().to_uppercase())
            .unwrap_or_else(|| cusip.to_string())
    };
    let entry = |(cik, cusip): &HoldingKey, h: &Holding| {
        let ticker = ticker_for(cusip);
        PositionEntry {
            manager_cik: cik.clone(),
            manager_name: h.manager_name.clone(),
            issuer: h.issuer.clone(),
            cusip: cusip.clone(),
            portfolio_overlap: held.contains(&ticker),
            ticker,
            shares: h.shares,
            value: h.value,
        }
    };

    let mut new_positions: Vec<PositionEntry> = latest
        .holdings
        .iter()
        .filter(|(key, h)| !previous.holdings.contains_key(*key) && h.value >= cfg.min_value)
        .map(|(key, h)| entry(key, h))
        .collect();

    let mut exits: Vec<PositionEntry> = previous
        .holdings
        .iter()
        .filter(|(key, h)| !latest.holdings.contains_key(*key) && h.value >= cfg.min_value)
        .map(|(key, h)| entry(key, h))
        .collect();

    let mut size_changes: Vec<SizeChange> = latest
        .holdings
        .iter()
        .filter_map(|(key, now)| {
            let before = previous.holdings.get(key)?;
            if before.value < cfg.min_value && now.value < cfg.min_value {
                return None;
            }
            if before.shares <= 0.0 {
                return None;
            }
            let change = (now.shares - before.shares) / before.shares * 100.0;
            if change.abs() < cfg.min_position_change_pct {
                return None;
            }
            let (cik, cusip) = key;
            let ticker = ticker_for(cusip);
            Some(SizeChange {
                manager_cik: cik.clone(),
                manager_name: now.manager_name.clone(),
                issuer: now.issuer.clone(),
                cusip: cusip.clone(),
                portfolio_overlap: held.contains(&ticker),
                ticker,
                prior_shares: before.shares,
                shares: now.shares,
                prior_value: before.value,
                value: now.value,
                change_pct: (change * 10.0).round() / 10.0,
                direction: if now.shares > before.shares {
                    Direction::Increase
                } else {
                    Direction::Decrease
                },
            })
        })
        .collect();

    let counts = DeltaCounts {
        new_positions: new_positions.len(),
        exits: exits.len(),
        size_changes: size_changes.len(),
    };

    let overlap_tickers: BTreeSet<String> = new_positions
        .iter()
        .chain(exits.iter())
        .filter(|e| e.portfolio_overlap)
        .map(|e| e.ticker.clone())
        .chain(
            size_changes
                .iter()
                .filter(|c| c.portfolio_overlap)
                .map(|c| c.ticker.clone()),
        )
        .collect();

    let by_value = |a: f64, b: f64| b.total_cmp(&a);
    new_positions.sort_by(|a, b| by_value(a.value, b.value).then_with(|| a.cusip.cmp(&b.cusip)));
    exits.sort_by(|a, b| by_value(a.value, b.value).then_with(|| a.cusip.cmp(&b.cusip)));
    size_changes.sort_by(|a, b| by_value(a.value, b.value).then_with(|| a.cusip.cmp(&b.cusip)));
    new_positions.truncate(cfg.max_entries);
    exits.truncate(cfg.max_entries);
    size_changes.truncate(cfg.max_entries);

    let delta = HoldingsDelta {
        latest_period: latest.period.clone(),
        previous_period: previous.period.clone(),
        new_positions,
        exits,
        size_changes,
        overlap_tickers: overlap_tickers.into_iter().collect(),
    };
    (delta, counts)
}

#[instrument(skip_all, fields(holdings = %ctx.paths.holdings.display()))]
pub fn run(ctx: &AgentContext) -> AgentResult {
    let mut result = AgentResult::start_at(AgentKind::HoldingsDelta, ctx.now_utc());
    result.dry_run = ctx.dry_run;
    let cfg = &ctx.config.holdings;

    let snapshots = find_snapshots(&ctx.paths.holdings, &cfg.snapshot_prefix);
    let [.., (prev_period, prev_path), (latest_period, latest_path)] = snapshots.as_slice() else {
        warn!(found = snapshots.len(), "not enough holdings snapshots");
        result.push_error(RecoveredError::new(
            ErrorKind::DataUnavailable,
            "Need at least 2 holdings snapshots for delta analysis",
        ));
        return result.finalize();
    };

    let mut load = |period: &str, path: &Path| match load_snapshot(path, period, &cfg.tracked_managers) {
        Ok(snapshot) => {
            if snapshot.malformed_rows > 0 {
                result.push_error(
                    RecoveredError::new(
                        ErrorKind::Parse,
                        format!("{} malformed rows skipped", snapshot.malformed_rows),
                    )
                    .at(path),
                );
            }
            Some(snapshot)
        }
        Err(e) => {
            result.push_error(RecoveredError::new(ErrorKind::FileRead, e.to_string()).at(path));
            None
        }
    };
    let previous = load(prev_period.as_str(), prev_path.as_path());
    let latest = load(latest_period.as_str(), latest_path.as_path());
    let (Some(previous), Some(latest)) = (previous, latest) else {
        return result.finalize();
    };

    let held = portfolio::held_symbols(&ctx.paths.portfolio);
    let cusip_map = load_cusip_map(&ctx.paths.holdings);
    let (delta, counts) = compute_delta(&previous, &latest, &held, &cusip_map, cfg);

    for ticker in &delta.overlap_tickers {
        result.issues.push(
            Issue::new(
                IssueKind::PortfolioOverlap,
                Severity::P2,
                format!("13F activity detected for portfolio holding {ticker}"),
            )
            .with_ticker(ticker),
        );
    }

    result.set_metric("latest_period", delta.latest_period.as_str());
    result.set_metric("previous_period", delta.previous_period.as_str());
    result.set_metric("new_positions", counts.new_positions as u64);
    result.set_metric("exits", counts.exits as u64);
    result.set_metric("size_changes", counts.size_changes as u64);
    result.set_metric("portfolio_overlaps", delta.overlap_tickers.len() as u64);

    info!(
        latest = %delta.latest_period,
        previous = %delta.previous_period,
        new_positions = counts.new_positions,
        exits = counts.exits,
        size_changes = counts.size_changes,
        "holdings delta complete"
    );
    result.report = Some(AgentReport::HoldingsDelta(delta));
    result.finalize()
}

#[cfg(test)]
mod tests {
    use vaultintel_shared::{AppConfig, Status};

    use super::*;
    use crate::context::testing::{context, temp_root, write};

    const HEADER: &str = "Manager CIK,Manager Name,Issuer Name,CUSIP,Value ($K),Shares,Portfolio %\n";

    fn snapshot(period: &str, rows: &[(&str, &str, f64, f64)]) -> Snapshot {
        Snapshot {
            period: period.to_string(),
            holdings: rows
                .iter()
                .map(|(cik, cusip, shares, value)| {
                    (
                        (cik.to_string(), cusip.to_string()),
                        Holding {
                            manager_name: format!("Manager {cik}"),
                            issuer: format!("Issuer {cusip}"),
                            shares: *shares,
                            value: *value,
                            weight: 0.0,
                            period: period.to_string(),
                        },
                    )
                })
                .collect(),
            malformed_rows: 0,
        }
    }

    fn config() -> HoldingsConfig {
        HoldingsConfig {
            min_position_change_pct: 20.0,
            min_value: 10_000.0,
            ..HoldingsConfig::default()
        }
    }

    #[test]
    fn size_change_and_new_position() {
        let a = snapshot("2025Q1", &[("M1", "S1", 1000.0, 50_000.0)]);
        let b = snapshot(
            "2025Q2",
            &[("M1", "S1", 1300.0, 68_000.0), ("M1", "S2", 500.0, 12_000.0)],
        );

        let (delta, counts) = compute_delta(&a, &b, &BTreeSet::new(), &HashMap::new(), &config());

        assert_eq!(delta.size_changes.len(), 1);
        let change = &delta.size_changes[0];
        assert_eq!(change.cusip, "S1");
        assert_eq!((change.prior_shares, change.shares), (1000.0, 1300.0));
        assert_eq!(change.change_pct, 30.0);
        assert_eq!(change.direction, Direction::Increase);

        assert_eq!(delta.new_positions.len(), 1);
        assert_eq!(delta.new_positions[0].cusip, "S2");
        assert_eq!(delta.new_positions[0].value, 12_000.0);
        assert!(delta.exits.is_empty());
        assert_eq!(
            counts,
            DeltaCounts {
                new_positions: 1,
                exits: 0,
                size_changes: 1
            }
        );
    }

    #[test]
    fn small_positions_and_small_moves_are_ignored() {
        let a = snapshot(
            "p1",
            &[("M1", "TINY", 100.0, 900.0), ("M1", "FLAT", 1000.0, 50_000.0), ("M1", "GONE", 10.0, 20_000.0)],
        );
        let b = snapshot(
            "p2",
            &[("M1", "TINY", 500.0, 4_000.0), ("M1", "FLAT", 1100.0, 52_000.0), ("M2", "DUST", 1.0, 50.0)],
        );

        let (delta, _) = compute_delta(&a, &b, &BTreeSet::new(), &HashMap::new(), &config());
        assert!(delta.size_changes.is_empty());
        assert!(delta.new_positions.is_empty());
        assert_eq!(delta.exits.len(), 1);
        assert_eq!(delta.exits[0].cusip, "GONE");
    }

    #[test]
    fn overlap_uses_cusip_map_and_caps_after_counting() {
        let a = snapshot("p1", &[]);
        let b = snapshot(
            "p2",
            &[("M1", "C1", 10.0, 30_000.0), ("M1", "C2", 10.0, 20_000.0), ("M1", "C3", 10.0, 40_000.0)],
        );
        let held = BTreeSet::from(["NVDA".to_string()]);
        let map = HashMap::from([("C2".to_string(), "nvda".to_string())]);
        let cfg = HoldingsConfig {
            max_entries: 2,
            ..config()
        };

        let (delta, counts) = compute_delta(&a, &b, &held, &map, &cfg);
        assert_eq!(counts.new_positions, 3);
        let order: Vec<_> = delta.new_positions.iter().map(|e| e.cusip.as_str()).collect();
        assert_eq!(order, vec!["C3", "C1"]);
        assert_eq!(delta.overlap_tickers, vec!["NVDA"]);
    }

    #[test]
    fn single_snapshot_is_partial() {
        let tmp = temp_root("holdings");
        write(&tmp, "holdings/output/_ALL_HOLDINGS_2025Q2.csv", HEADER);
        let ctx = context(&tmp, AppConfig::default());

        let result = run(&ctx);
        assert_eq!(result.status, Status::Partial);
        assert_eq!(result.errors[0].kind, ErrorKind::DataUnavailable);
        assert!(result.report.is_none());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn run_reads_latest_two_snapshots() {
        let tmp = temp_root("holdings");
        write(
            &tmp,
            "holdings/output/_ALL_HOLDINGS_2024Q4.csv",
            &format!("{HEADER}0001,Old Fund,Ancient Corp,X0,99999,1,1\n"),
        );
        write(
            &tmp,
            "holdings/output/_ALL_HOLDINGS_2025Q1.csv",
            &format!("{HEADER}0001,Fund One,NVIDIA Corp,67066G104,50000,1000,4.5\n"),
        );
        write(
            &tmp,
            "holdings/output/_ALL_HOLDINGS_2025Q2.csv",
            &format!(
                "{HEADER}0001,Fund One,NVIDIA Corp,67066G104,68000,1300,5.1\n\
                 0001,Fund One,Apple Inc,037833100,12000,500,1.0\n\
                 broken\n"
            ),
        );
        write(&tmp, "holdings/output/_cusip_ticker_map.json", r#"{"67066G104":"NVDA"}"#);
        write(
            &tmp,
            "portfolio/portfolio_monitor/data/portfolio_data.json",
            r#"{"positions":[{"symbol":"NVDA"}]}"#,
        );
        let ctx = context(&tmp, AppConfig::default());

        let result = run(&ctx);
        assert_eq!(result.metrics["latest_period"], "2025Q2");
        assert_eq!(result.metrics["previous_period"], "2025Q1");
        assert_eq!(result.metric_u64("size_changes"), Some(1));
        assert_eq!(result.metric_u64("new_positions"), Some(1));
        assert_eq!(result.metric_u64("exits"), Some(0));
        assert_eq!(result.metric_u64("portfolio_overlaps"), Some(1));
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].kind, IssueKind::PortfolioOverlap);
        // The truncated row is reported once for the file.
        assert_eq!(result.status, Status::Partial);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::Parse);

        let _ = std::fs::remove_dir_all(&tmp);
    }
}

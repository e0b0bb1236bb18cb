//! Position-risk agent: checks held positions against their thesis records.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};
use vaultintel_shared::{
    Action, ActionKind, AgentKind, AgentReport, AgentResult, ErrorKind, Issue, IssueKind,
    PositionRiskConfig, RecoveredError, Severity,
};

use crate::context::AgentContext;
use crate::portfolio::{self, Portfolio, Position, ThesisEntry};
use crate::tasks::{self, TaskQueue};

#[instrument(skip_all)]
pub fn run(ctx: &AgentContext) -> AgentResult {
    let mut result = AgentResult::start_at(AgentKind::PositionRisk, ctx.now_utc());
    result.dry_run = ctx.dry_run;

    let portfolio = match Portfolio::load(&ctx.paths.portfolio) {
        Ok(Some(portfolio)) => portfolio,
        Ok(None) => {
            let path = portfolio::portfolio_file(&ctx.paths.portfolio);
            warn!(path = %path.display(), "portfolio store missing");
            result.push_error(
                RecoveredError::new(ErrorKind::DataUnavailable, "portfolio data file not found")
                    .at(path),
            );
            Portfolio::default()
        }
        Err(e) => {
            warn!(error = %e, "portfolio store unreadable");
            result.push_error(RecoveredError::new(ErrorKind::Parse, e.to_string()));
            Portfolio::default()
        }
    };

    let (theses, parse_errors) = portfolio::load_theses(&ctx.paths.portfolio);
    result.errors.extend(parse_errors);

    let by_ticker: BTreeMap<String, &ThesisEntry> = theses
        .iter()
        .flat_map(|entry| entry.tickers().into_iter().map(move |t| (t, entry)))
        .collect();
    let held = portfolio.symbols();

    let evaluation = evaluate(
        &ctx.config.position_risk,
        ctx.now_utc(),
        &portfolio.positions,
        &theses,
        &by_ticker,
    );

    let count = |kind: IssueKind| {
        evaluation
            .issues
            .iter()
            .filter(|i| i.kind == kind)
            .count() as u64
    };
    result.set_metric("total_theses", theses.len() as u64);
    result.set_metric("active_positions", held.len() as u64);
    result.set_metric(
        "positions_with_thesis",
        (held.len() - evaluation.without_thesis.len()) as u64,
    );
    result.set_metric("positions_without_thesis", evaluation.without_thesis.len() as u64);
    result.set_metric("p1_violations", count(IssueKind::KillCriteriaViolation));
    result.set_metric("invalidation_breaches", count(IssueKind::InvalidationBreach));
    result.set_metric("drawdown_alerts", count(IssueKind::DrawdownAlert));
    result.set_metric("concentration_alerts", count(IssueKind::ConcentrationAlert));
    result.set_metric("stale_theses", count(IssueKind::StaleThesis));
    result.set_metric("incomplete_theses", count(IssueKind::IncompleteThesis));
    result.set_metric("alerts", evaluation.issues.len() as u64);

    let tasks_created = queue_follow_ups(ctx, &evaluation.issues, &mut result);
    result.set_metric("tasks_created", tasks_created);

    result.issues = evaluation.issues;
    info!(
        positions = held.len(),
        theses = theses.len(),
        alerts = result.issues.len(),
        critical = result.critical_issue_count(),
        "position risk complete"
    );
    result.report = Some(AgentReport::PositionRisk {
        positions_without_thesis: evaluation.without_thesis,
    });
    result.finalize()
}

/// Queue one follow-up task per P1 finding not already queued this week.
/// Dry run previews the tasks and leaves the queue file alone.
fn queue_follow_ups(ctx: &AgentContext, issues: &[Issue], result: &mut AgentResult) -> u64 {
    let critical: Vec<&Issue> = issues.iter().filter(|i| i.severity == Severity::P1).collect();
    if critical.is_empty() {
        return 0;
    }

    let path = tasks::queue_path(&ctx.paths.data_dir);
    let mut queue = match TaskQueue::load(&path) {
        Ok(queue) => queue,
        Err(e) => {
            warn!(error = %e, "follow-up queue unreadable, no tasks created");
            result.push_error(RecoveredError::new(ErrorKind::FileRead, e.to_string()).at(&path));
            return 0;
        }
    };

    let now = ctx.now_utc();
    let mut created = 0;
    for issue in critical {
        let Some(id) = queue.enqueue(issue, now) else {
            continue;
        };
        let action = if ctx.dry_run {
            Action::new(ActionKind::Preview, format!("would create task: {}", issue.detail))
        } else {
            created += 1;
            Action::new(ActionKind::TaskCreated, format!("task #{id}: {}", issue.detail))
        };
        result.actions_taken.push(action.with_path(&path));
    }

    if created > 0 {
        if let Err(e) = queue.save(&path, ctx.retry) {
            warn!(error = %e, "failed to save follow-up queue");
            result.push_error(RecoveredError::new(ErrorKind::FileWrite, e.to_string()).at(&path));
            return 0;
        }
        info!(created, "follow-up tasks queued");
    }
    created
}

/// Findings for one snapshot of positions and theses.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub issues: Vec<Issue>,
    pub without_thesis: Vec<String>,
}

/// Apply every rule. Kill-criteria checks cover all theses; the remaining
/// rules only concern entities currently held.
pub fn evaluate(
    cfg: &PositionRiskConfig,
    now: DateTime<Utc>,
    positions: &[Position],
    theses: &[ThesisEntry],
    by_ticker: &BTreeMap<String, &ThesisEntry>,
) -> Evaluation {
    let mut eval = Evaluation::default();
    let violation_window = Duration::try_hours(cfg.violation_hours).unwrap_or(Duration::MAX);

    for entry in theses {
        if !entry.thesis.kill_criteria_failed() {
            continue;
        }
        let exceeded = match entry.thesis.fail_detected_at() {
            Some(at) => now - at > violation_window,
            None => true,
        };
        if exceeded {
            eval.issues.push(
                Issue::new(
                    IssueKind::KillCriteriaViolation,
                    Severity::P1,
                    format!(
                        "{}: kill criteria failing for more than {}h without action",
                        entry.dir_ticker, cfg.violation_hours
                    ),
                )
                .with_ticker(&entry.dir_ticker)
                .with_path(&entry.path),
            );
        }
    }

    let mut checked = BTreeSet::new();
    for position in positions {
        let ticker = position.ticker();
        if ticker.is_empty() || !checked.insert(ticker.clone()) {
            continue;
        }

        if let Some(pnl) = position.total_pnl_pct {
            if pnl < cfg.pnl_alert_pct {
                eval.issues.push(
                    Issue::new(
                        IssueKind::DrawdownAlert,
                        Severity::P1,
                        format!("{ticker}: P&L {pnl:.1}% below {:.1}%", cfg.pnl_alert_pct),
                    )
                    .with_ticker(&ticker),
                );
            }
        }
        if let Some(weight) = position.nav_pct() {
            if weight > cfg.position_alert_pct {
                eval.issues.push(
                    Issue::new(
                        IssueKind::ConcentrationAlert,
                        Severity::P2,
                        format!("{ticker}: {weight:.1}% of NAV above {:.1}%", cfg.position_alert_pct),
                    )
                    .with_ticker(&ticker),
                );
            }
        }

        let Some(entry) = by_ticker.get(&ticker) else {
            eval.without_thesis.push(ticker);
            continue;
        };

        if let (Some(mark), Some(floor)) = (position.mark_price, entry.thesis.invalidation_price) {
            if mark < floor {
                eval.issues.push(
                    Issue::new(
                        IssueKind::InvalidationBreach,
                        Severity::P1,
                        format!("{ticker}: mark {mark:.2} below invalidation {floor:.2}"),
                    )
                    .with_ticker(&ticker)
                    .with_path(&entry.path),
                );
            }
        }

        if let Some(days) = entry.modified.map(|m| age_days(now, m)) {
            if days > cfg.stale_check_days {
                eval.issues.push(
                    Issue::new(
                        IssueKind::StaleThesis,
                        Severity::P2,
                        format!("{ticker}: thesis not reviewed in {days} days"),
                    )
                    .with_ticker(&ticker)
                    .with_path(&entry.path),
                );
            }
        }

        let missing = entry.thesis.incomplete_fields();
        if !missing.is_empty() {
            eval.issues.push(
                Issue::new(
                    IssueKind::IncompleteThesis,
                    Severity::P2,
                    format!("{ticker}: {} still empty or TODO", missing.join(", ")),
                )
                .with_ticker(&ticker)
                .with_path(&entry.path),
            );
        }
    }

    eval
}

fn age_days(now: DateTime<Utc>, modified: SystemTime) -> i64 {
    (now - DateTime::<Utc>::from(modified)).num_days()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use vaultintel_shared::{AppConfig, Status};

    use super::*;
    use crate::context::testing::{context, temp_root, write};
    use crate::portfolio::Thesis;

    fn entry(ticker: &str, yaml: &str, modified: Option<SystemTime>) -> ThesisEntry {
        ThesisEntry {
            dir_ticker: ticker.to_string(),
            path: PathBuf::from(format!("/p/research/companies/{ticker}/thesis.yaml")),
            modified,
            thesis: Thesis::parse(yaml).unwrap(),
        }
    }

    fn position(json: &str) -> Position {
        serde_json::from_str(json).unwrap()
    }

    fn kinds(eval: &Evaluation) -> Vec<IssueKind> {
        eval.issues.iter().map(|i| i.kind).collect()
    }

    const COMPLETE: &str = "bull_case: moat\nbear_case_1: cyclic\nbear_case_2: regulation\n";

    #[test]
    fn kill_criteria_respects_violation_window() {
        let now: DateTime<Utc> = "2025-10-14T12:00:00Z".parse().unwrap();
        let cfg = PositionRiskConfig::default();
        let fresh = entry("AAA", "kill_criteria_status: FAIL\nfail_detected_at: '2025-10-13T12:00:00Z'\n", None);
        let old = entry("BBB", "kill_criteria_status: fail\nfail_detected_at: '2025-10-10T12:00:00Z'\n", None);
        let undated = entry("CCC", "kill_criteria_status: FAIL\n", None);
        let theses = vec![fresh, old, undated];

        let eval = evaluate(&cfg, now, &[], &theses, &BTreeMap::new());
        let tickers: Vec<_> = eval.issues.iter().filter_map(|i| i.ticker.clone()).collect();
        assert_eq!(tickers, vec!["BBB", "CCC"]);
        assert!(eval.issues.iter().all(|i| i.severity == Severity::P1));
    }

    #[test]
    fn oversized_violation_window_only_flags_undated_failures() {
        let now: DateTime<Utc> = "2025-10-14T12:00:00Z".parse().unwrap();
        let cfg = PositionRiskConfig {
            violation_hours: i64::MAX,
            ..PositionRiskConfig::default()
        };
        let theses = vec![
            entry("OLD", "kill_criteria_status: FAIL\nfail_detected_at: '2020-01-01T00:00:00Z'\n", None),
            entry("UND", "kill_criteria_status: FAIL\n", None),
        ];

        let eval = evaluate(&cfg, now, &[], &theses, &BTreeMap::new());
        let tickers: Vec<_> = eval.issues.iter().filter_map(|i| i.ticker.clone()).collect();
        assert_eq!(tickers, vec!["UND"]);
    }

    #[test]
    fn held_position_rules() {
        let now = Utc::now();
        let cfg = PositionRiskConfig::default();
        let stale = SystemTime::now() - std::time::Duration::from_secs(30 * 86_400);
        let theses = vec![
            entry("AAPL", &format!("{COMPLETE}invalidation_price: 150\n"), Some(SystemTime::now())),
            entry("MSFT", "bull_case: TODO\nbear_case_1: x\nbear_case_2: y\n", Some(stale)),
        ];
        let by_ticker: BTreeMap<String, &ThesisEntry> =
            theses.iter().map(|e| (e.dir_ticker.clone(), e)).collect();
        let positions = vec![
            position(r#"{"symbol":"AAPL","total_pnl_pct":-12.5,"pct_of_nav":7.0,"mark_price":140.0}"#),
            position(r#"{"symbol":"msft","total_pnl_pct":3.0,"pct_of_nav":2.0}"#),
            position(r#"{"symbol":"TSLA","total_pnl_pct":1.0}"#),
        ];

        let eval = evaluate(&cfg, now, &positions, &theses, &by_ticker);
        assert_eq!(
            kinds(&eval),
            vec![
                IssueKind::DrawdownAlert,
                IssueKind::ConcentrationAlert,
                IssueKind::InvalidationBreach,
                IssueKind::StaleThesis,
                IssueKind::IncompleteThesis,
            ]
        );
        assert_eq!(eval.without_thesis, vec!["TSLA"]);
    }

    #[test]
    fn missing_portfolio_is_partial() {
        let tmp = temp_root("risk");
        write(&tmp, "portfolio/research/companies/NVDA/thesis.yaml", COMPLETE);
        let ctx = context(&tmp, AppConfig::default());

        let result = run(&ctx);
        assert_eq!(result.status, Status::Partial);
        assert_eq!(result.errors[0].kind, ErrorKind::DataUnavailable);
        assert_eq!(result.metric_u64("total_theses"), Some(1));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn unparsable_thesis_is_recorded_and_skipped() {
        let tmp = temp_root("risk");
        write(
            &tmp,
            "portfolio/portfolio_monitor/data/portfolio_data.json",
            r#"{"positions":[{"symbol":"NVDA","total_pnl_pct":-20.0}]}"#,
        );
        write(&tmp, "portfolio/research/companies/NVDA/thesis.yaml", "bull_case: [unclosed\n");
        let ctx = context(&tmp, AppConfig::default());

        let result = run(&ctx);
        assert_eq!(result.status, Status::Partial);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::Parse);
        assert_eq!(result.critical_issue_count(), 1);
        match result.report {
            Some(AgentReport::PositionRisk { positions_without_thesis }) => {
                assert_eq!(positions_without_thesis, vec!["NVDA"]);
            }
            other => panic!("unexpected report {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&tmp);
    }

    fn breached_portfolio(tmp: &std::path::Path) {
        write(
            tmp,
            "portfolio/portfolio_monitor/data/portfolio_data.json",
            r#"{"positions":[{"symbol":"NVDA","total_pnl_pct":-20.0}]}"#,
        );
        write(tmp, "portfolio/research/companies/NVDA/thesis.yaml", COMPLETE);
    }

    #[test]
    fn critical_findings_queue_follow_up_tasks_once() {
        let tmp = temp_root("risk");
        breached_portfolio(&tmp);
        let ctx = context(&tmp, AppConfig::default());

        let first = run(&ctx);
        assert_eq!(first.metric_u64("tasks_created"), Some(1));
        assert_eq!(first.actions_taken[0].kind, ActionKind::TaskCreated);
        let queue = TaskQueue::load(&tasks::queue_path(&ctx.paths.data_dir)).unwrap();
        assert_eq!(queue.tasks.len(), 1);
        assert_eq!(queue.tasks[0].ticker.as_deref(), Some("NVDA"));

        let second = run(&ctx);
        assert_eq!(second.metric_u64("tasks_created"), Some(0));
        assert!(second.actions_taken.is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn dry_run_previews_tasks_without_queue_file() {
        let tmp = temp_root("risk");
        breached_portfolio(&tmp);
        let ctx = context(&tmp, AppConfig::default()).with_dry_run(true);

        let result = run(&ctx);
        assert_eq!(result.metric_u64("tasks_created"), Some(0));
        assert_eq!(result.actions_taken.len(), 1);
        assert_eq!(result.actions_taken[0].kind, ActionKind::Preview);
        assert!(!tasks::queue_path(&ctx.paths.data_dir).exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }
}

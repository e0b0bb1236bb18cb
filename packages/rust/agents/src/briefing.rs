//! Briefing agent: folds every result of the run into one scored report.
//!
//! The report always renders. A section whose upstream agent is missing or
//! failed says so explicitly instead of being dropped.

use std::fmt::Write as _;

use chrono::NaiveDate;
use tracing::{info, instrument, warn};
use vaultintel_shared::{
    Action, ActionKind, AgentKind, AgentReport, AgentResult, BriefingConfig, BriefingSummary,
    Direction, ErrorKind, Issue, IssueKind, RecoveredError, ResultSet, Severity,
};
use vaultintel_vault::write_atomic;

use crate::context::AgentContext;

// ---------------------------------------------------------------------------
// Health score
// ---------------------------------------------------------------------------

struct HealthCategory {
    kinds: &'static [IssueKind],
    max_penalty: f64,
    /// Issue count at which the full penalty applies.
    concerning: f64,
}

const CATEGORIES: [HealthCategory; 7] = [
    HealthCategory {
        kinds: &[IssueKind::MissingFrontmatter],
        max_penalty: 15.0,
        concerning: 50.0,
    },
    HealthCategory {
        kinds: &[IssueKind::MissingDatePrefix],
        max_penalty: 10.0,
        concerning: 100.0,
    },
    HealthCategory {
        kinds: &[IssueKind::OrphanNote],
        max_penalty: 10.0,
        concerning: 200.0,
    },
    HealthCategory {
        kinds: &[IssueKind::EmptyNote],
        max_penalty: 5.0,
        concerning: 50.0,
    },
    HealthCategory {
        kinds: &[
            IssueKind::KillCriteriaViolation,
            IssueKind::InvalidationBreach,
            IssueKind::DrawdownAlert,
        ],
        max_penalty: 30.0,
        concerning: 1.0,
    },
    HealthCategory {
        kinds: &[IssueKind::StaleThesis],
        max_penalty: 15.0,
        concerning: 3.0,
    },
    HealthCategory {
        kinds: &[IssueKind::IncompleteThesis],
        max_penalty: 15.0,
        concerning: 5.0,
    },
];

/// 0–100 health score over every issue in `results`.
pub fn health_score(results: &ResultSet) -> u8 {
    let issues: Vec<&Issue> = results.values().flat_map(|r| r.issues.iter()).collect();
    let penalty: f64 = CATEGORIES
        .iter()
        .map(|category| {
            let matching = issues.iter().filter(|i| category.kinds.contains(&i.kind));
            let (count, critical) = matching.fold((0usize, false), |(n, crit), i| {
                (n + 1, crit || i.severity.is_critical())
            });
            if critical {
                category.max_penalty
            } else {
                category.max_penalty * (count as f64 / category.concerning).min(1.0)
            }
        })
        .sum();
    (100.0 - penalty).clamp(0.0, 100.0) as u8
}

pub fn grade(score: u8) -> char {
    match score {
        90.. => 'A',
        75.. => 'B',
        60.. => 'C',
        _ => 'D',
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// The upstream result for `agent`, or why it cannot be used.
fn usable(upstream: &ResultSet, agent: AgentKind) -> Result<&AgentResult, String> {
    match upstream.get(&agent) {
        None => Err("no result from this run".to_string()),
        Some(result) if result.is_failed() => Err(result
            .errors
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "agent failed".to_string())),
        Some(result) => Ok(result),
    }
}

fn unavailable(out: &mut String, section: &str, reason: &str) {
    let _ = writeln!(out, "*{section} unavailable: {reason}*");
}

fn metric(result: &AgentResult, name: &str) -> u64 {
    result.metric_u64(name).unwrap_or(0)
}

/// Full markdown report.
pub fn render(
    date: NaiveDate,
    upstream: &ResultSet,
    score: u8,
    p1_count: usize,
    cfg: &BriefingConfig,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "---");
    let _ = writeln!(out, "date: {date}");
    let _ = writeln!(out, "type: vault-intel");
    let _ = writeln!(out, "tags: [daily-brief, vault-intel]");
    let _ = writeln!(out, "health_score: {score}");
    let _ = writeln!(out, "p1_count: {p1_count}");
    let _ = writeln!(out, "---");
    let _ = writeln!(out);
    let _ = writeln!(out, "# Vault Intelligence: {date}");
    let _ = writeln!(out);
    let statuses: Vec<String> = AgentKind::ALL
        .iter()
        .filter(|kind| **kind != AgentKind::Briefing)
        .map(|kind| match upstream.get(kind) {
            Some(r) => format!("{kind} {}", r.status),
            None => format!("{kind} not run"),
        })
        .collect();
    let _ = writeln!(out, "> Agents: {}", statuses.join(", "));
    let _ = writeln!(out);

    render_action_items(&mut out, upstream, cfg.max_action_items);
    render_portfolio_alerts(&mut out, upstream);
    render_smart_money(&mut out, upstream);
    render_research(&mut out, upstream);
    render_vault_health(&mut out, upstream, score);
    out
}

fn render_action_items(out: &mut String, upstream: &ResultSet, cap: usize) {
    let _ = writeln!(out, "## Action Items\n");
    let mut items: Vec<String> = upstream
        .values()
        .flat_map(|r| r.issues.iter().filter(|i| i.severity == Severity::P1))
        .map(|i| format!("- **P1** {}: {}", i.kind.label(), i.detail))
        .collect();

    if let Ok(hygiene) = usable(upstream, AgentKind::Hygiene) {
        let missing = metric(hygiene, "missing_frontmatter");
        if missing > 0 {
            items.push(format!(
                "- **P2** {missing} files missing frontmatter ({} auto-fixed)",
                metric(hygiene, "auto_fixed")
            ));
        }
    }
    items.extend(
        upstream
            .iter()
            .filter(|(kind, _)| **kind != AgentKind::Hygiene)
            .flat_map(|(_, r)| r.issues.iter().filter(|i| i.severity == Severity::P2))
            .map(|i| format!("- **P2** {}: {}", i.kind.label(), i.detail)),
    );

    if items.is_empty() {
        let _ = writeln!(out, "No action items today.\n");
        return;
    }
    let extra = items.len().saturating_sub(cap);
    for item in items.iter().take(cap) {
        let _ = writeln!(out, "{item}");
    }
    if extra > 0 {
        let _ = writeln!(out, "*...and {extra} more*");
    }
    let _ = writeln!(out);
}

fn render_portfolio_alerts(out: &mut String, upstream: &ResultSet) {
    const STALE_CAP: usize = 10;
    const NO_THESIS_CAP: usize = 15;
    let _ = writeln!(out, "## Portfolio Alerts\n");

    let risk = match usable(upstream, AgentKind::PositionRisk) {
        Ok(risk) => risk,
        Err(reason) => {
            unavailable(out, "Portfolio Alerts", &reason);
            let _ = writeln!(out);
            return;
        }
    };

    let groups = [
        (IssueKind::KillCriteriaViolation, "Kill Criteria Violations", usize::MAX),
        (IssueKind::InvalidationBreach, "Invalidation Breaches", usize::MAX),
        (IssueKind::DrawdownAlert, "Drawdown Alerts", usize::MAX),
        (IssueKind::StaleThesis, "Stale Theses", STALE_CAP),
        (IssueKind::ConcentrationAlert, "Concentration Alerts", usize::MAX),
        (IssueKind::IncompleteThesis, "Incomplete Theses (Active Positions)", usize::MAX),
    ];
    let mut any = false;
    for (kind, heading, cap) in groups {
        let matching: Vec<&Issue> = risk.issues.iter().filter(|i| i.kind == kind).collect();
        if matching.is_empty() {
            continue;
        }
        any = true;
        let _ = writeln!(out, "### {heading}\n");
        for issue in matching.iter().take(cap) {
            let _ = writeln!(out, "- {}", issue.detail);
        }
        if matching.len() > cap {
            let _ = writeln!(out, "- *...and {} more*", matching.len() - cap);
        }
        let _ = writeln!(out);
    }

    if let Some(AgentReport::PositionRisk {
        positions_without_thesis,
    }) = &risk.report
    {
        if !positions_without_thesis.is_empty() {
            any = true;
            let shown: Vec<&str> = positions_without_thesis
                .iter()
                .take(NO_THESIS_CAP)
                .map(String::as_str)
                .collect();
            let _ = writeln!(out, "### Positions Without Thesis\n");
            let _ = write!(out, "{}", shown.join(", "));
            if positions_without_thesis.len() > NO_THESIS_CAP {
                let _ = write!(out, " *(+{} more)*", positions_without_thesis.len() - NO_THESIS_CAP);
            }
            let _ = writeln!(out, "\n");
        }
    }

    if !any {
        let _ = writeln!(out, "All clear.\n");
    }
}

fn render_smart_money(out: &mut String, upstream: &ResultSet) {
    let _ = writeln!(out, "## Smart Money Signals\n");
    let holdings = match usable(upstream, AgentKind::HoldingsDelta) {
        Ok(holdings) => holdings,
        Err(reason) => {
            unavailable(out, "Smart Money Signals", &reason);
            let _ = writeln!(out);
            return;
        }
    };
    let Some(AgentReport::HoldingsDelta(delta)) = &holdings.report else {
        let reason = holdings
            .errors
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "no holdings delta produced".to_string());
        unavailable(out, "Smart Money Signals", &reason);
        let _ = writeln!(out);
        return;
    };

    let _ = writeln!(out, "**{} vs {}**\n", delta.latest_period, delta.previous_period);
    let mut overlaps = Vec::new();
    for entry in delta.new_positions.iter().filter(|e| e.portfolio_overlap) {
        overlaps.push(format!(
            "- NEW **{}** by {} (${:.0}K)",
            entry.ticker, entry.manager_name, entry.value
        ));
    }
    for entry in delta.exits.iter().filter(|e| e.portfolio_overlap) {
        overlaps.push(format!(
            "- EXIT **{}** by {} (${:.0}K)",
            entry.ticker, entry.manager_name, entry.value
        ));
    }
    for change in delta.size_changes.iter().filter(|c| c.portfolio_overlap) {
        let sign = match change.direction {
            Direction::Increase => "+",
            Direction::Decrease => "",
        };
        overlaps.push(format!(
            "- **{}** {sign}{:.1}% by {} ({:.0} → {:.0} sh)",
            change.ticker, change.change_pct, change.manager_name, change.prior_shares, change.shares
        ));
    }
    if overlaps.is_empty() {
        let _ = writeln!(out, "No activity in portfolio holdings.\n");
    } else {
        let _ = writeln!(out, "{}\n", overlaps.join("\n"));
    }

    let _ = writeln!(out, "| Metric | Count |");
    let _ = writeln!(out, "|---|---|");
    for (label, name) in [
        ("New positions", "new_positions"),
        ("Exits", "exits"),
        ("Size changes", "size_changes"),
        ("Portfolio overlaps", "portfolio_overlaps"),
    ] {
        let _ = writeln!(out, "| {label} | {} |", metric(holdings, name));
    }
    let _ = writeln!(out);
}

fn render_research(out: &mut String, upstream: &ResultSet) {
    let _ = writeln!(out, "## Research Updates\n");
    let crossref = match usable(upstream, AgentKind::CrossReference) {
        Ok(crossref) => crossref,
        Err(reason) => {
            unavailable(out, "Research Updates", &reason);
            let _ = writeln!(out);
            return;
        }
    };

    let _ = writeln!(out, "| Metric | Value |");
    let _ = writeln!(out, "|---|---|");
    for (label, name) in [
        ("Notes scanned", "notes_scanned"),
        ("Wikilinks added", "links_added"),
        ("Cross-references", "cross_references"),
        ("Narrative changes", "narrative_shifts"),
    ] {
        let _ = writeln!(out, "| {label} | {} |", metric(crossref, name));
    }
    let _ = writeln!(out);

    if let Some(AgentReport::CrossReference { narrative_shifts }) = &crossref.report {
        if !narrative_shifts.is_empty() {
            let _ = writeln!(out, "### Narrative Shifts\n");
            for shift in narrative_shifts {
                let _ = writeln!(
                    out,
                    "- **{}**: {:?} tone in `{}` against a {:?} thesis (bull {}, bear {})",
                    shift.ticker,
                    shift.note_stance,
                    shift.note.display(),
                    shift.thesis_stance,
                    shift.bull_signals,
                    shift.bear_signals
                );
            }
            let _ = writeln!(out);
        }
    }
}

fn render_vault_health(out: &mut String, upstream: &ResultSet, score: u8) {
    let _ = writeln!(out, "## Vault Health\n");
    let _ = writeln!(out, "**Health Score: {score}/100 ({})**\n", grade(score));
    let hygiene = match usable(upstream, AgentKind::Hygiene) {
        Ok(hygiene) => hygiene,
        Err(reason) => {
            unavailable(out, "Vault hygiene metrics", &reason);
            return;
        }
    };
    let _ = writeln!(out, "| Check | Count |");
    let _ = writeln!(out, "|---|---|");
    for (label, name) in [
        ("Files scanned", "files_scanned"),
        ("Issues found", "issues_found"),
        ("Missing frontmatter", "missing_frontmatter"),
        ("Missing date prefix", "missing_date_prefix"),
        ("Empty notes", "empty_notes"),
        ("Orphan notes", "orphan_notes"),
        ("Possibly misplaced", "misplaced_notes"),
        ("Auto-fixed", "auto_fixed"),
    ] {
        let _ = writeln!(out, "| {label} | {} |", metric(hygiene, name));
    }
}

/// One-line summary for push delivery.
pub fn summary_line(date: NaiveDate, score: u8, p1_count: usize, upstream: &ResultSet) -> String {
    let hygiene_issues = upstream
        .get(&AgentKind::Hygiene)
        .map(|h| metric(h, "issues_found"))
        .unwrap_or(0);
    format!("Vault Intel {date}: Score {score}/100, P1={p1_count}, Issues={hygiene_issues}")
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(upstream = upstream.len(), dry_run = ctx.dry_run))]
pub fn run(ctx: &AgentContext, upstream: &ResultSet) -> AgentResult {
    let mut result = AgentResult::start_at(AgentKind::Briefing, ctx.now_utc());
    result.dry_run = ctx.dry_run;
    let cfg = &ctx.config.briefing;
    let date = ctx.today();

    let score = health_score(upstream);
    let p1_count: usize = upstream.values().map(AgentResult::critical_issue_count).sum();
    let report = render(date, upstream, score, p1_count, cfg);

    let dir = ctx.paths.vault.join(&cfg.output_folder);
    let path = dir.join(format!("{date}-briefing.md"));
    let rel = ctx.vault_relative(&path).to_path_buf();
    let mut output_path = None;

    if ctx.dry_run {
        result.actions_taken.push(
            Action::new(ActionKind::Preview, format!("would write briefing ({} bytes)", report.len()))
                .with_path(&rel),
        );
    } else {
        let written = std::fs::create_dir_all(&dir)
            .map_err(|e| vaultintel_shared::VaultIntelError::io(&dir, e))
            .and_then(|()| write_atomic(&path, report.as_bytes(), ctx.retry));
        match written {
            Ok(()) => {
                result
                    .actions_taken
                    .push(Action::new(ActionKind::BriefingWritten, "briefing written").with_path(&rel));
                output_path = Some(rel.clone());
            }
            Err(e) => {
                warn!(path = %rel.display(), error = %e, "briefing write failed");
                result.push_error(RecoveredError::new(ErrorKind::FileWrite, e.to_string()).at(&rel));
            }
        }
    }

    let grade = grade(score);
    let summary = summary_line(date, score, p1_count, upstream);
    result.set_metric("health_score", score);
    result.set_metric("grade", grade.to_string());
    result.set_metric("p1_count", p1_count as u64);
    result.set_metric("sections_generated", 5u64);
    if let Some(path) = &output_path {
        result.set_metric("output_path", path.display().to_string());
    }
    result.report = Some(AgentReport::Briefing(BriefingSummary {
        health_score: score,
        grade,
        p1_count,
        summary,
        output_path,
    }));

    info!(health_score = score, %grade, p1_count, "briefing complete");
    result.finalize()
}

#[cfg(test)]
mod tests {
    use vaultintel_shared::{AppConfig, NarrativeShift, Stance, Status};

    use super::*;
    use crate::context::testing::{context, temp_root};

    fn with_issues(agent: AgentKind, issues: Vec<Issue>) -> AgentResult {
        let mut result = AgentResult::start(agent);
        result.issues = issues;
        result.finalize()
    }

    fn issue(kind: IssueKind, severity: Severity) -> Issue {
        Issue::new(kind, severity, format!("{kind:?} detail"))
    }

    #[test]
    fn clean_run_scores_full_marks() {
        assert_eq!(health_score(&ResultSet::new()), 100);
        assert_eq!(grade(100), 'A');
    }

    #[test]
    fn category_penalty_scales_with_count() {
        let mut set = ResultSet::new();
        let issues = (0..25)
            .map(|_| issue(IssueKind::MissingFrontmatter, Severity::P2))
            .collect();
        set.insert(AgentKind::Hygiene, with_issues(AgentKind::Hygiene, issues));
        // 15 * 25/50 = 7.5 points off.
        assert_eq!(health_score(&set), 92);
    }

    #[test]
    fn adding_a_critical_issue_never_raises_the_score() {
        let mut set = ResultSet::new();
        set.insert(
            AgentKind::Hygiene,
            with_issues(
                AgentKind::Hygiene,
                vec![
                    issue(IssueKind::OrphanNote, Severity::P3),
                    issue(IssueKind::EmptyNote, Severity::P3),
                ],
            ),
        );
        let mut previous = health_score(&set);
        for kind in [
            IssueKind::KillCriteriaViolation,
            IssueKind::InvalidationBreach,
            IssueKind::DrawdownAlert,
            IssueKind::StaleThesis,
        ] {
            set.entry(AgentKind::PositionRisk)
                .or_insert_with(|| AgentResult::start(AgentKind::PositionRisk))
                .issues
                .push(issue(kind, Severity::P1));
            let score = health_score(&set);
            assert!(score <= previous, "{kind:?} raised score {previous} -> {score}");
            previous = score;
        }
        // Critical alerts and stale theses each cost their full maximum.
        assert_eq!(previous, 100 - 30 - 15 - 1);
        assert_eq!(grade(previous), 'D');
    }

    #[test]
    fn failed_crossref_renders_unavailable_notice() {
        let mut set = ResultSet::new();
        set.insert(
            AgentKind::CrossReference,
            AgentResult::failed(
                AgentKind::CrossReference,
                chrono::Utc::now(),
                RecoveredError::new(ErrorKind::Timeout, "agent timed out after 300s"),
            ),
        );
        let date = NaiveDate::from_ymd_opt(2025, 10, 14).unwrap();
        let report = render(date, &set, 100, 0, &BriefingConfig::default());

        assert!(report.contains("## Research Updates\n\n*Research Updates unavailable: agent timed out after 300s*"));
        assert!(report.contains("*Smart Money Signals unavailable: no result from this run*"));
        assert!(report.contains("## Vault Health\n\n**Health Score: 100/100 (A)**"));
        assert!(report.contains("No action items today."));
    }

    #[test]
    fn action_items_are_capped() {
        let mut set = ResultSet::new();
        let issues = (0..4)
            .map(|_| issue(IssueKind::DrawdownAlert, Severity::P1))
            .collect();
        set.insert(AgentKind::PositionRisk, with_issues(AgentKind::PositionRisk, issues));
        let cfg = BriefingConfig {
            max_action_items: 3,
            ..BriefingConfig::default()
        };
        let report = render(NaiveDate::from_ymd_opt(2025, 10, 14).unwrap(), &set, 70, 4, &cfg);
        assert_eq!(report.matches("- **P1**").count(), 3);
        assert!(report.contains("- **P1** Drawdown alert: DrawdownAlert detail"));
        assert!(report.contains("*...and 1 more*"));
        assert!(report.contains("### Drawdown Alerts"));
    }

    #[test]
    fn run_writes_report_and_summary() {
        let tmp = temp_root("briefing");
        let ctx = context(&tmp, AppConfig::default());

        let mut hygiene = AgentResult::start(AgentKind::Hygiene);
        hygiene.set_metric("issues_found", 3u64);
        hygiene.set_metric("missing_frontmatter", 2u64);
        hygiene.set_metric("auto_fixed", 2u64);
        let mut crossref = AgentResult::start(AgentKind::CrossReference);
        crossref.report = Some(AgentReport::CrossReference {
            narrative_shifts: vec![NarrativeShift {
                ticker: "NVDA".into(),
                note: "Research/Earnings/NVDA Q3.md".into(),
                thesis_stance: Stance::Bullish,
                note_stance: Stance::Bearish,
                bull_signals: 0,
                bear_signals: 3,
            }],
        });
        let mut set = ResultSet::new();
        set.insert(AgentKind::Hygiene, hygiene.finalize());
        set.insert(AgentKind::CrossReference, crossref.finalize());

        let result = run(&ctx, &set);
        assert_eq!(result.status, Status::Success);
        let Some(AgentReport::Briefing(summary)) = &result.report else {
            panic!("missing briefing summary");
        };
        let date = ctx.today();
        assert_eq!(summary.summary, format!("Vault Intel {date}: Score 100/100, P1=0, Issues=3"));

        let written = std::fs::read_to_string(
            ctx.paths
                .vault
                .join("Navigation/Nightly-Intel")
                .join(format!("{date}-briefing.md")),
        )
        .unwrap();
        assert!(written.starts_with("---\ndate: "));
        assert!(written.contains("- **P2** 2 files missing frontmatter (2 auto-fixed)"));
        assert!(written.contains("- **NVDA**: Bearish tone"));

        let _ = std::fs::remove_dir_all(&tmp);
    }
}

//! Cross-reference agent: links recent research notes to the documents of
//! the companies they mention, and flags analysis notes whose tone runs
//! against the recorded thesis.
//!
//! The polarity check is a keyword count over a fixed vocabulary. It is a
//! coarse signal for a human to look at, with no accuracy target.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use regex::{Regex, RegexBuilder};
use tracing::{debug, info, instrument, warn};
use vaultintel_shared::{
    Action, ActionKind, AgentKind, AgentReport, AgentResult, ErrorKind, Issue, IssueKind,
    NarrativeShift, RecoveredError, Severity, Stance,
};
use vaultintel_vault::{note, walk, write_atomic};

use crate::context::AgentContext;
use crate::portfolio::{self, EntityDictionary};

const BULL_SIGNALS: [&str; 7] = [
    "beat",
    "exceeded",
    "accelerat",
    "upside",
    "strong growth",
    "raised guidance",
    "market share gain",
];

const BEAR_SIGNALS: [&str; 8] = [
    "miss",
    "below",
    "decelerat",
    "downside",
    "weak",
    "lowered guidance",
    "market share loss",
    "margin compression",
];

const RELATED_HEADING: &str = "## Related";

// ---------------------------------------------------------------------------
// Entity matching
// ---------------------------------------------------------------------------

/// Resolves the tickers a note talks about.
#[derive(Debug)]
pub struct EntityMatcher {
    tickers: Vec<String>,
    /// Case-insensitive whole-word alternation over tickers and aliases.
    body_re: Option<Regex>,
    /// Lowercased matched term → ticker.
    terms: HashMap<String, String>,
}

impl EntityMatcher {
    pub fn new(dictionary: &EntityDictionary, blocklist: &[String]) -> Self {
        let blocked: BTreeSet<String> = blocklist.iter().map(|t| t.trim().to_uppercase()).collect();
        let mut terms = HashMap::new();
        for (ticker, info) in &dictionary.entities {
            if blocked.contains(ticker) {
                continue;
            }
            terms.insert(ticker.to_lowercase(), ticker.clone());
            for alias in &info.aliases {
                let alias = alias.trim();
                if !alias.is_empty() {
                    terms.entry(alias.to_lowercase()).or_insert_with(|| ticker.clone());
                }
            }
        }

        let mut alternation: Vec<&String> = terms.keys().collect();
        // Longest first so "meta platforms" wins over "meta".
        alternation.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        let body_re = if alternation.is_empty() {
            None
        } else {
            let pattern = format!(
                r"\b(?:{})\b",
                alternation
                    .iter()
                    .map(|t| regex::escape(t))
                    .collect::<Vec<_>>()
                    .join("|")
            );
            match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(error = %e, "entity pattern rejected, body matching disabled");
                    None
                }
            }
        };

        let tickers = dictionary
            .tickers()
            .filter(|t| !blocked.contains(*t))
            .map(str::to_string)
            .collect();
        Self {
            tickers,
            body_re,
            terms,
        }
    }

    /// Tickers for one note: metadata field, then filename, then body.
    pub fn resolve(&self, path: &Path, content: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();

        if let Some(fm) = note::parse_frontmatter(content) {
            found.extend(
                note::string_list(&fm, "tickers")
                    .into_iter()
                    .map(|t| t.to_uppercase()),
            );
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_uppercase())
            .unwrap_or_default();
        found.extend(
            self.tickers
                .iter()
                .filter(|t| stem.contains(t.as_str()))
                .cloned(),
        );

        if let Some(re) = &self.body_re {
            for m in re.find_iter(content) {
                if let Some(ticker) = self.terms.get(&m.as_str().to_lowercase()) {
                    found.insert(ticker.clone());
                }
            }
        }
        found
    }
}

// ---------------------------------------------------------------------------
// Link insertion
// ---------------------------------------------------------------------------

/// Add `links` under the `## Related` section, creating it at the end if
/// absent. New entries follow the section's existing link list; nothing
/// else in the note moves, and the note keeps its line endings.
pub fn insert_related_links(content: &str, links: &[String]) -> String {
    if links.is_empty() {
        return content.to_string();
    }
    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let new_lines = links.iter().map(|l| format!("- [[{l}]]"));

    let heading = lines
        .iter()
        .position(|l| l.trim().eq_ignore_ascii_case(RELATED_HEADING));
    let trailing_newline = match heading {
        Some(idx) => {
            let mut at = idx + 1;
            while at < lines.len() && lines[at].trim().starts_with("- [[") {
                at += 1;
            }
            lines.splice(at..at, new_lines);
            content.ends_with('\n')
        }
        None => {
            if lines.last().is_some_and(|l| !l.trim().is_empty()) {
                lines.push(String::new());
            }
            lines.push(RELATED_HEADING.to_string());
            lines.extend(new_lines);
            true
        }
    };

    let mut out = lines.join(eol);
    if trailing_newline {
        out.push_str(eol);
    }
    out
}

// ---------------------------------------------------------------------------
// Narrative drift
// ---------------------------------------------------------------------------

/// Distinct bullish and bearish vocabulary hits in `text`.
pub fn count_signals(text: &str) -> (usize, usize) {
    let lower = text.to_lowercase();
    let bull = BULL_SIGNALS.iter().filter(|s| lower.contains(*s)).count();
    let bear = BEAR_SIGNALS.iter().filter(|s| lower.contains(*s)).count();
    (bull, bear)
}

/// The stance a note contradicts its thesis with, if any.
pub fn contradicting_stance(thesis: Stance, bull: usize, bear: usize, min_signals: usize) -> Option<Stance> {
    if thesis == Stance::Bullish && bear >= min_signals {
        Some(Stance::Bearish)
    } else if thesis == Stance::Bearish && bull >= min_signals {
        Some(Stance::Bullish)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    notes_scanned: u64,
    notes_with_entities: u64,
    links_added: u64,
    cross_references: u64,
}

struct RecentNote {
    path: PathBuf,
    upper_stem: String,
    stem: String,
}

#[instrument(skip_all, fields(dry_run = ctx.dry_run))]
pub fn run(ctx: &AgentContext) -> AgentResult {
    let mut result = AgentResult::start_at(AgentKind::CrossReference, ctx.now_utc());
    result.dry_run = ctx.dry_run;
    let cfg = &ctx.config.cross_reference;

    let dictionary = match &ctx.paths.entity_dictionary {
        Some(path) => EntityDictionary::load(path).unwrap_or_else(|e| {
            warn!(error = %e, "entity dictionary unusable, relying on note metadata");
            result.push_error(RecoveredError::new(ErrorKind::Parse, e.to_string()).at(path));
            EntityDictionary::default()
        }),
        None => EntityDictionary::default(),
    };
    let matcher = EntityMatcher::new(&dictionary, &cfg.ticker_blocklist);

    let cutoff = SystemTime::from(ctx.now)
        .checked_sub(Duration::from_secs(u64::from(cfg.lookback_days) * 86_400))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let recent: Vec<RecentNote> = walk::markdown_files_in(
        &ctx.paths.vault,
        &cfg.research_folders,
        &ctx.config.hygiene.ignore_folders,
    )
    .into_iter()
    .filter(|p| walk::modified(p).is_some_and(|m| m >= cutoff))
    .map(|path| {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        RecentNote {
            upper_stem: stem.to_uppercase(),
            stem,
            path,
        }
    })
    .collect();
    debug!(recent = recent.len(), "recent research notes");

    let mut counters = Counters::default();
    let mut shifts = Vec::new();
    let analysis_root = ctx.paths.vault.join(&cfg.analysis_folder);

    for current in &recent {
        let rel = ctx.vault_relative(&current.path).to_path_buf();
        let content = match std::fs::read(&current.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                result.push_error(RecoveredError::new(ErrorKind::FileRead, e.to_string()).at(&rel));
                continue;
            }
        };
        counters.notes_scanned += 1;

        let tickers = matcher.resolve(&current.path, &content);
        if tickers.is_empty() {
            continue;
        }
        counters.notes_with_entities += 1;

        let existing = note::existing_links(&content);
        let mut seen = BTreeSet::new();
        let mut links = Vec::new();
        let mut push_link = |link: String, links: &mut Vec<String>| -> bool {
            let key = note::normalize_target(&link);
            if existing.contains(&key) || !seen.insert(key) {
                return false;
            }
            links.push(link);
            true
        };

        for ticker in &tickers {
            let company = portfolio::companies_dir(&ctx.paths.portfolio).join(ticker);
            if company.join("thesis.md").is_file() {
                push_link(format!("{ticker} Thesis"), &mut links);
            }
            let moc = ctx
                .paths
                .vault
                .join(&cfg.moc_folder)
                .join(format!("{ticker} MOC.md"));
            if moc.is_file() {
                push_link(format!("{ticker} MOC"), &mut links);
            }
            for other in recent
                .iter()
                .filter(|o| o.path != current.path && o.upper_stem.contains(ticker.as_str()))
            {
                if push_link(other.stem.clone(), &mut links) {
                    counters.cross_references += 1;
                }
            }

            if current.path.starts_with(&analysis_root) {
                if let Some(shift) = detect_shift(ctx, &company, ticker, &rel, &content, &mut result) {
                    shifts.push(shift);
                }
            }
        }

        if links.is_empty() {
            continue;
        }
        if ctx.dry_run {
            result.actions_taken.push(
                Action::new(ActionKind::Preview, format!("would link {}", links.join(", ")))
                    .with_path(&rel),
            );
            continue;
        }
        let updated = insert_related_links(&content, &links);
        match write_atomic(&current.path, updated.as_bytes(), ctx.retry) {
            Ok(()) => {
                counters.links_added += links.len() as u64;
                result.actions_taken.push(
                    Action::new(ActionKind::LinkAdded, format!("linked {}", links.join(", ")))
                        .with_path(&rel),
                );
            }
            Err(e) => {
                warn!(path = %rel.display(), error = %e, "link insertion failed");
                result.push_error(RecoveredError::new(ErrorKind::FileWrite, e.to_string()).at(&rel));
            }
        }
    }

    result.set_metric("notes_scanned", counters.notes_scanned);
    result.set_metric("notes_with_entities", counters.notes_with_entities);
    result.set_metric("links_added", counters.links_added);
    result.set_metric("cross_references", counters.cross_references);
    result.set_metric("narrative_shifts", shifts.len() as u64);
    result.report = Some(AgentReport::CrossReference {
        narrative_shifts: shifts,
    });

    info!(
        notes_scanned = counters.notes_scanned,
        links_added = counters.links_added,
        "cross-reference complete"
    );
    result.finalize()
}

fn detect_shift(
    ctx: &AgentContext,
    company: &Path,
    ticker: &str,
    rel: &Path,
    content: &str,
    result: &mut AgentResult,
) -> Option<NarrativeShift> {
    let thesis_path = company.join("thesis.yaml");
    if !thesis_path.is_file() {
        return None;
    }
    let (thesis, raw) = match portfolio::read_thesis(&thesis_path) {
        Ok(parsed) => parsed,
        Err(e) => {
            result.push_error(RecoveredError::new(ErrorKind::Parse, e.to_string()).at(&thesis_path));
            return None;
        }
    };

    let thesis_stance = thesis.stance(&raw);
    let (bull, bear) = count_signals(note::body(content));
    let note_stance = contradicting_stance(
        thesis_stance,
        bull,
        bear,
        ctx.config.cross_reference.narrative_min_signals,
    )?;

    let direction = match note_stance {
        Stance::Bearish => "bearish",
        _ => "bullish",
    };
    result.issues.push(
        Issue::new(
            IssueKind::NarrativeShift,
            Severity::P2,
            format!("{ticker}: {direction} signals (bull {bull}, bear {bear}) against recorded thesis"),
        )
        .with_path(rel)
        .with_ticker(ticker),
    );
    Some(NarrativeShift {
        ticker: ticker.to_string(),
        note: rel.to_path_buf(),
        thesis_stance,
        note_stance,
        bull_signals: bull,
        bear_signals: bear,
    })
}

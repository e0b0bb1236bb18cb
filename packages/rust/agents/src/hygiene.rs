//! Hygiene agent: structural lint of the vault with safe auto-fixes.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDate};
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use vaultintel_shared::{
    Action, ActionKind, AgentKind, AgentResult, ErrorKind, Issue, IssueKind, RecoveredError,
    Severity,
};
use vaultintel_vault::{ReferenceIndex, note, rename_no_clobber, walk, write_atomic};

use crate::context::AgentContext;

static DATE_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("valid date prefix regex"));

/// Words that mark an inbox note as research material.
const RESEARCH_KEYWORDS: [&str; 8] = [
    "thesis",
    "earnings",
    "revenue",
    "margin",
    "valuation",
    "bull case",
    "bear case",
    "kill criteria",
];

const MISPLACED_SCAN_CHARS: usize = 500;

#[derive(Debug, Default)]
struct Counters {
    files_scanned: u64,
    missing_frontmatter: u64,
    missing_date_prefix: u64,
    empty_notes: u64,
    orphan_notes: u64,
    misplaced_notes: u64,
    auto_fixed: u64,
    renamed: usize,
}

#[instrument(skip_all, fields(vault = %ctx.paths.vault.display(), dry_run = ctx.dry_run))]
pub fn run(ctx: &AgentContext) -> AgentResult {
    let mut result = AgentResult::start_at(AgentKind::Hygiene, ctx.now_utc());
    result.dry_run = ctx.dry_run;

    let cfg = &ctx.config.hygiene;
    let index = ctx.reference_index();
    let files = walk::markdown_files_in(&ctx.paths.vault, &cfg.scan_folders, &cfg.ignore_folders);
    debug!(files = files.len(), "hygiene scan starting");

    let mut counters = Counters::default();
    for path in &files {
        check_note(ctx, &index, path, &mut counters, &mut result);
    }

    result.set_metric("files_scanned", counters.files_scanned);
    result.set_metric("issues_found", result.issues.len() as u64);
    result.set_metric("missing_frontmatter", counters.missing_frontmatter);
    result.set_metric("missing_date_prefix", counters.missing_date_prefix);
    result.set_metric("empty_notes", counters.empty_notes);
    result.set_metric("orphan_notes", counters.orphan_notes);
    result.set_metric("misplaced_notes", counters.misplaced_notes);
    result.set_metric("auto_fixed", counters.auto_fixed);
    result.set_metric("renamed", counters.renamed as u64);
    result.set_metric("index_size", index.len() as u64);

    info!(
        files_scanned = counters.files_scanned,
        issues = result.issues.len(),
        auto_fixed = counters.auto_fixed,
        errors = result.errors.len(),
        "hygiene complete"
    );
    result.finalize()
}

fn check_note(
    ctx: &AgentContext,
    index: &ReferenceIndex,
    path: &Path,
    counters: &mut Counters,
    result: &mut AgentResult,
) {
    let cfg = &ctx.config.hygiene;
    let rel = ctx.vault_relative(path).to_path_buf();

    let content = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(path = %rel.display(), error = %e, "cannot read note");
            result.push_error(RecoveredError::new(ErrorKind::FileRead, e.to_string()).at(&rel));
            return;
        }
    };
    counters.files_scanned += 1;
    let created = created_date(path, ctx.today());

    if !note::has_frontmatter(&content) {
        counters.missing_frontmatter += 1;
        result.issues.push(
            Issue::new(IssueKind::MissingFrontmatter, Severity::P2, "note has no frontmatter")
                .with_path(&rel),
        );
        if cfg.auto_fix_frontmatter {
            let tag = folder_tag(ctx, path);
            add_frontmatter(ctx, path, &rel, &content, created, &tag, counters, result);
        }
    }

    if note::body(&content).trim().len() < cfg.min_content_bytes {
        counters.empty_notes += 1;
        result.issues.push(
            Issue::new(
                IssueKind::EmptyNote,
                Severity::P3,
                format!("body shorter than {} bytes", cfg.min_content_bytes),
            )
            .with_path(&rel),
        );
    }

    if !index.is_referenced(&note::note_identifier(path)) {
        counters.orphan_notes += 1;
        result.issues.push(
            Issue::new(IssueKind::OrphanNote, Severity::P3, "no note links here").with_path(&rel),
        );
    }

    if is_inbox(ctx, path) && looks_like_research(&content) {
        counters.misplaced_notes += 1;
        result.issues.push(
            Issue::new(
                IssueKind::MisplacedNote,
                Severity::P3,
                format!("research content in {}", cfg.inbox_folder),
            )
            .with_path(&rel)
            .with_suggested_dir(&cfg.research_destination),
        );
    }

    // Renaming moves the file, so it goes last.
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if !DATE_PREFIX_RE.is_match(&stem) {
        counters.missing_date_prefix += 1;
        result.issues.push(
            Issue::new(
                IssueKind::MissingDatePrefix,
                Severity::P3,
                "filename does not start with YYYY-MM-DD",
            )
            .with_path(&rel),
        );
        if cfg.auto_fix_date_prefix && counters.renamed < ctx.config.safety.max_renames_per_run {
            add_date_prefix(ctx, path, &rel, &stem, created, counters, result);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn add_frontmatter(
    ctx: &AgentContext,
    path: &Path,
    rel: &Path,
    content: &str,
    created: NaiveDate,
    tag: &str,
    counters: &mut Counters,
    result: &mut AgentResult,
) {
    let header = frontmatter_block(created, tag);
    if ctx.dry_run {
        result.actions_taken.push(
            Action::new(ActionKind::Preview, format!("would add frontmatter (tag {tag})"))
                .with_path(rel),
        );
        return;
    }

    let fixed = format!("{header}{content}");
    match write_atomic(path, fixed.as_bytes(), ctx.retry) {
        Ok(()) => {
            counters.auto_fixed += 1;
            result.actions_taken.push(
                Action::new(ActionKind::FrontmatterAdded, format!("added frontmatter (tag {tag})"))
                    .with_path(rel),
            );
        }
        Err(e) => {
            warn!(path = %rel.display(), error = %e, "frontmatter fix failed");
            result.push_error(RecoveredError::new(ErrorKind::FileWrite, e.to_string()).at(rel));
        }
    }
}

fn add_date_prefix(
    ctx: &AgentContext,
    path: &Path,
    rel: &Path,
    stem: &str,
    created: NaiveDate,
    counters: &mut Counters,
    result: &mut AgentResult,
) {
    let new_name = format!("{}-{stem}.md", created.format("%Y-%m-%d"));
    let target: PathBuf = path.with_file_name(&new_name);
    counters.renamed += 1;

    if ctx.dry_run {
        result.actions_taken.push(
            Action::new(ActionKind::Preview, format!("would rename to {new_name}")).with_path(rel),
        );
        return;
    }

    match rename_no_clobber(path, &target) {
        Ok(()) => {
            result.actions_taken.push(
                Action::new(ActionKind::DatePrefixAdded, format!("renamed to {new_name}"))
                    .with_path(rel),
            );
        }
        Err(e) => {
            counters.renamed -= 1;
            warn!(path = %rel.display(), error = %e, "rename failed");
            result.push_error(RecoveredError::new(ErrorKind::FileWrite, e.to_string()).at(rel));
        }
    }
}

/// Minimal metadata block prepended to notes without one.
pub fn frontmatter_block(created: NaiveDate, tag: &str) -> String {
    format!("---\ncreated: {}\ntags: [{tag}]\n---\n\n", created.format("%Y-%m-%d"))
}

/// Creation date from file metadata: birth time, then mtime, then `fallback`.
fn created_date(path: &Path, fallback: NaiveDate) -> NaiveDate {
    std::fs::metadata(path)
        .ok()
        .and_then(|m| m.created().or_else(|_| m.modified()).ok())
        .map(|t| DateTime::<Local>::from(t).date_naive())
        .unwrap_or(fallback)
}

fn folder_tag(ctx: &AgentContext, path: &Path) -> String {
    walk::top_folder(&ctx.paths.vault, path)
        .and_then(|folder| ctx.config.hygiene.folder_tags.get(&folder).cloned())
        .unwrap_or_else(|| "note".to_string())
}

fn is_inbox(ctx: &AgentContext, path: &Path) -> bool {
    path.starts_with(ctx.paths.vault.join(&ctx.config.hygiene.inbox_folder))
}

/// At least two research keywords in the opening of the note.
pub fn looks_like_research(content: &str) -> bool {
    let head: String = content
        .chars()
        .take(MISPLACED_SCAN_CHARS)
        .collect::<String>()
        .to_lowercase();
    RESEARCH_KEYWORDS.iter().filter(|kw| head.contains(*kw)).count() >= 2
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use vaultintel_shared::{AppConfig, Status};

    use super::*;
    use crate::context::testing::{context, temp_root, write};

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.hygiene.scan_folders = vec!["Research".into(), "Inbox".into()];
        config.hygiene.folder_tags = BTreeMap::from([("Research".into(), "research".into())]);
        config.hygiene.min_content_bytes = 10;
        config
    }

    fn issues_of(result: &AgentResult, kind: IssueKind) -> Vec<&Issue> {
        result.issues.iter().filter(|i| i.kind == kind).collect()
    }

    #[test]
    fn adds_frontmatter_with_folder_tag() {
        let tmp = temp_root("hygiene");
        let vault = tmp.join("vault");
        let note = write(&vault, "Research/2025-10-01-idea.md", "# Idea\n\nSome long enough body text.\n");
        let ctx = context(&tmp, config());

        let result = run(&ctx);
        assert_eq!(result.status, Status::Success);
        assert_eq!(issues_of(&result, IssueKind::MissingFrontmatter).len(), 1);
        assert_eq!(result.metric_u64("auto_fixed"), Some(1));

        let fixed = std::fs::read_to_string(&note).unwrap();
        assert!(fixed.starts_with("---\ncreated: "));
        assert!(fixed.contains("tags: [research]\n---\n\n# Idea"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn second_run_takes_no_further_actions() {
        let tmp = temp_root("hygiene");
        let vault = tmp.join("vault");
        write(&vault, "Research/a.md", "plain note without metadata, linking [[b]]");
        write(&vault, "Research/b.md", "another plain note, linking [[a]]");
        let ctx = context(&tmp, config());

        let first = run(&ctx);
        assert_eq!(first.actions_taken.len(), 2);

        let second = run(&ctx);
        assert!(second.actions_taken.is_empty());
        assert!(issues_of(&second, IssueKind::MissingFrontmatter).is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn dry_run_previews_without_writing() {
        let tmp = temp_root("hygiene");
        let vault = tmp.join("vault");
        let note = write(&vault, "Research/raw.md", "no metadata here at all");
        let ctx = context(&tmp, config()).with_dry_run(true);

        let result = run(&ctx);
        assert!(result.dry_run);
        assert_eq!(result.actions_taken.len(), 1);
        assert_eq!(result.actions_taken[0].kind, ActionKind::Preview);
        assert_eq!(std::fs::read_to_string(&note).unwrap(), "no metadata here at all");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn unreferenced_note_is_orphan() {
        let tmp = temp_root("hygiene");
        let vault = tmp.join("vault");
        write(&vault, "Research/hub.md", "---\ntags: [x]\n---\nSee [[Linked Note]] for details.");
        write(&vault, "Research/Linked Note.md", "---\ntags: [x]\n---\nI am referenced by the hub.");
        write(&vault, "Research/lonely.md", "---\ntags: [x]\n---\nNobody links to this note.");
        let ctx = context(&tmp, config());

        let result = run(&ctx);
        let orphans: Vec<PathBuf> = issues_of(&result, IssueKind::OrphanNote)
            .iter()
            .filter_map(|i| i.path.clone())
            .collect();
        assert!(orphans.contains(&PathBuf::from("Research/lonely.md")));
        assert!(orphans.contains(&PathBuf::from("Research/hub.md")));
        assert!(!orphans.contains(&PathBuf::from("Research/Linked Note.md")));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn empty_and_misplaced_notes_are_flagged() {
        let tmp = temp_root("hygiene");
        let vault = tmp.join("vault");
        write(&vault, "Research/stub.md", "---\ntags: [x]\n---\nhi");
        write(
            &vault,
            "Inbox/call notes.md",
            "---\ntags: [x]\n---\nRevenue grew and margin expanded; the valuation looks stretched.",
        );
        let ctx = context(&tmp, config());

        let result = run(&ctx);
        let empty = issues_of(&result, IssueKind::EmptyNote);
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].path.as_deref(), Some(Path::new("Research/stub.md")));

        let misplaced = issues_of(&result, IssueKind::MisplacedNote);
        assert_eq!(misplaced.len(), 1);
        assert_eq!(misplaced[0].suggested_dir.as_deref(), Some("Research/Notes"));
        assert_eq!(result.metric_u64("files_scanned"), Some(2));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn date_prefix_rename_respects_cap_and_existing_files() {
        let tmp = temp_root("hygiene");
        let vault = tmp.join("vault");
        write(&vault, "Research/alpha.md", "---\ntags: [x]\n---\nalpha body text here");
        write(&vault, "Research/beta.md", "---\ntags: [x]\n---\nbeta body text here");
        let mut config = config();
        config.hygiene.auto_fix_date_prefix = true;
        config.safety.max_renames_per_run = 1;
        let ctx = context(&tmp, config);

        let result = run(&ctx);
        assert_eq!(issues_of(&result, IssueKind::MissingDatePrefix).len(), 2);
        assert_eq!(result.metric_u64("renamed"), Some(1));
        let renamed: Vec<_> = result
            .actions_taken
            .iter()
            .filter(|a| a.kind == ActionKind::DatePrefixAdded)
            .collect();
        assert_eq!(renamed.len(), 1);
        assert!(!vault.join("Research/alpha.md").exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn research_keyword_heuristic() {
        assert!(looks_like_research("Earnings beat; bull case intact"));
        assert!(!looks_like_research("Grocery list: eggs, valuation of nothing"));
    }
}

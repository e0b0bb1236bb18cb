//! Note parsing: frontmatter split and `[[wikilink]]` extraction.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// `[[target]]`, `[[target|alias]]`, `[[folder/target#heading]]`.
static WIKILINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[([^\]|#]*)(?:#[^\]|]*)?(?:\|[^\]]*)?\]\]").expect("valid wikilink regex")
});

/// Parsed frontmatter fields, converted to JSON values for uniform access.
pub type Frontmatter = BTreeMap<String, Value>;

/// Whether the note opens with a metadata block.
///
/// Only the leading `---` is checked so that a note repaired by the hygiene
/// agent is never flagged twice.
pub fn has_frontmatter(content: &str) -> bool {
    content.trim_start_matches('\u{feff}').starts_with("---")
}

/// Split content into `(yaml, body)`.
///
/// Without an opening `---` line or without a closing delimiter the whole
/// content is body.
pub fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let content = content.trim_start_matches('\u{feff}');
    let Some(rest) = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
    else {
        return (None, content);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            return (Some(&rest[..offset]), &rest[offset + line.len()..]);
        }
        offset += line.len();
    }
    (None, content)
}

/// Body text with the metadata block removed.
pub fn body(content: &str) -> &str {
    split_frontmatter(content).1
}

/// Parse the frontmatter block into a map. `None` if absent or not a mapping.
pub fn parse_frontmatter(content: &str) -> Option<Frontmatter> {
    let (yaml, _) = split_frontmatter(content);
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(yaml?).ok()?;
    match serde_json::to_value(yaml_value).ok()? {
        Value::Object(map) => Some(map.into_iter().collect()),
        _ => None,
    }
}

/// Read a field that may be a scalar string or a list of strings.
pub fn string_list(fm: &Frontmatter, key: &str) -> Vec<String> {
    match fm.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Raw targets of every wikilink in `content`, in order of appearance.
pub fn wikilink_targets(content: &str) -> impl Iterator<Item = &str> {
    WIKILINK_RE
        .captures_iter(content)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|t| !t.is_empty())
}

/// Normalize a link target to a note identifier: last path segment,
/// `.md` stripped, case-folded.
pub fn normalize_target(target: &str) -> String {
    let last = target.trim().rsplit(['/', '\\']).next().unwrap_or_default();
    let last = last.strip_suffix(".md").unwrap_or(last);
    last.trim().to_lowercase()
}

/// Identifier under which other notes would reference `path`.
pub fn note_identifier(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Lowercased normalized targets already linked from `content`.
pub fn existing_links(content: &str) -> std::collections::BTreeSet<String> {
    wikilink_targets(content).map(normalize_target).collect()
}

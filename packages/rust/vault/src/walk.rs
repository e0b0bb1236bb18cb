//! Markdown file discovery under a vault folder.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;
use walkdir::WalkDir;

/// Every `.md` file under `root`, skipping any directory whose name is in
/// `ignore`. Unreadable directory entries are skipped. Output is sorted.
pub fn markdown_files(root: &Path, ignore: &[String]) -> Vec<PathBuf> {
    if !root.is_dir() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !ignore.iter().any(|name| entry.file_name() == name.as_str())
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_markdown(entry.path()))
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    files
}

/// Markdown files under several vault-relative folders, deduplicated.
pub fn markdown_files_in(vault: &Path, folders: &[String], ignore: &[String]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = folders
        .iter()
        .flat_map(|folder| markdown_files(&vault.join(folder), ignore))
        .collect();
    files.sort();
    files.dedup();
    files
}

pub fn is_markdown(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

/// Last modification time, if the filesystem reports one.
pub fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Top-level folder of `path` relative to `vault`.
pub fn top_folder(vault: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(vault)
        .ok()?
        .components()
        .next()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
}

//! Filesystem scanning helpers for indexing passes.

use std::path::{Path, PathBuf};

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::UnderstandResult;

const LANGUAGE_BY_EXTENSION: &[(&str, &str)] = &[(".py", "python"), (".pyi", "python")];

/// Repository-local ignore file read in addition to `.gitignore`.
pub const IGNORE_FILE_NAME: &str = ".understandignore";

const IMPLICIT_IGNORED_DIRS: &[&str] = &["__pycache__", "node_modules", "site-packages", "venv"];

/// A source file selected for scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Posix-style path relative to the scan root.
    pub relative: String,
    pub language: &'static str,
}

pub fn detect_language(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))?;
    LANGUAGE_BY_EXTENSION
        .iter()
        .find(|(e, _)| *e == ext.as_str())
        .map(|(_, lang)| *lang)
}

pub fn compute_content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Module path of a relative source path: the path without its extension.
pub fn module_path(relative: &str) -> &str {
    match relative.rsplit_once('.') {
        Some((stem, ext)) if !ext.contains('/') => stem,
        _ => relative,
    }
}

pub(crate) fn to_posix(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// List recognized source files under `repo_root`, sorted by relative path.
///
/// `.gitignore` files apply even outside a git checkout. Include patterns act
/// as a whitelist when non-empty; exclude patterns always win.
pub fn iter_repo_files(
    repo_root: &Path,
    include_patterns: &[String],
    exclude_patterns: &[String],
) -> UnderstandResult<Vec<SourceFile>> {
    let mut overrides = OverrideBuilder::new(repo_root);
    for pattern in include_patterns.iter().map(|p| p.trim()) {
        if !pattern.is_empty() {
            overrides.add(pattern)?;
        }
    }
    for pattern in exclude_patterns.iter().map(|p| p.trim()) {
        if !pattern.is_empty() {
            let pattern = pattern.strip_prefix("./").unwrap_or(pattern);
            overrides.add(&format!("!{pattern}"))?;
        }
    }
    let overrides = overrides.build()?;

    let mut builder = WalkBuilder::new(repo_root);
    builder
        .hidden(true)
        .git_ignore(true)
        .git_exclude(true)
        .git_global(false)
        .require_git(false)
        .follow_links(false)
        .add_custom_ignore_filename(IGNORE_FILE_NAME)
        .overrides(overrides)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_some_and(|t| t.is_dir())
                && IMPLICIT_IGNORED_DIRS.contains(&name.as_ref()))
        });

    let mut files = Vec::new();
    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Some(language) = detect_language(entry.path()) else {
            continue;
        };
        let path = entry.path().to_path_buf();
        let relative = to_posix(path.strip_prefix(repo_root).unwrap_or(&path));
        files.push(SourceFile {
            path,
            relative,
            language,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

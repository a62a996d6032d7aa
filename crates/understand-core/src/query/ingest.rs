//! Seed candidates from free text: issue reports and CI or stack-trace logs.
//!
//! Candidates are tokens [`crate::query::lens::resolve_seed`] understands:
//! `path:name` frames, `.py` file references and bare names taken from
//! `identifier(` call syntax. They are kept in first-seen order, deduplicated
//! and capped. A file reference is dropped when a frame already names a
//! function in that file.

use std::collections::HashSet;
use std::sync::LazyLock;

use indexmap::IndexSet;
use regex::Regex;
use tracing::debug;

use crate::errors::{UnderstandError, UnderstandResult};
use crate::models::{Lens, RepositoryMap};
use crate::query::guards::MAX_TEXT_SEEDS;
use crate::query::lens::from_seeds;

// `File "/srv/app/pkg/service.py", line 12, in compute`
static TRACEBACK_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File "([^"]+\.pyi?)", line \d+, in ([A-Za-z_][A-Za-z0-9_]*)"#).unwrap()
});

// `pkg/service.py:12: in compute`
static PYTEST_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_./\\-]+\.pyi?):\d+: in ([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

static FILE_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z0-9_./\\-]+\.pyi?):\d+").unwrap());

static PATH_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([A-Za-z0-9_.\-]+(?:/[A-Za-z0-9_.\-]+)*):([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)",
    )
    .unwrap()
});

static FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_./\\-]+\.pyi?\b").unwrap());

static CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\(").unwrap());

/// Call-syntax words that never name repository functions.
const NOISE_CALLS: &[&str] = &[
    "if", "elif", "while", "for", "return", "and", "or", "not", "in", "assert", "print", "len",
    "str", "int", "float", "bool", "list", "dict", "set", "tuple", "super", "isinstance", "repr",
];

enum Hit {
    Frame { path: String, name: String },
    File(String),
    Name(String),
}

fn clean_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Order hits by position and reduce them to at most [`MAX_TEXT_SEEDS`]
/// distinct tokens.
fn collect(mut hits: Vec<(usize, Hit)>) -> Vec<String> {
    hits.sort_by_key(|(start, _)| *start);
    let framed: HashSet<String> = hits
        .iter()
        .filter_map(|(_, hit)| match hit {
            Hit::Frame { path, .. } => Some(path.clone()),
            _ => None,
        })
        .collect();

    let mut tokens: IndexSet<String> = IndexSet::new();
    for (_, hit) in hits {
        let token = match hit {
            Hit::Frame { path, name } => format!("{path}:{name}"),
            Hit::File(path) if framed.contains(&path) => continue,
            Hit::File(path) => path,
            Hit::Name(name) if NOISE_CALLS.contains(&name.as_str()) => continue,
            Hit::Name(name) => name,
        };
        tokens.insert(token);
        if tokens.len() == MAX_TEXT_SEEDS {
            break;
        }
    }
    tokens.into_iter().collect()
}

fn call_hits(text: &str, hits: &mut Vec<(usize, Hit)>) {
    for caps in CALL_RE.captures_iter(text) {
        let name = &caps[1];
        hits.push((caps.get(0).map_or(0, |m| m.start()), Hit::Name(name.to_string())));
    }
}

/// Candidates from an issue or ticket body.
pub fn extract_issue_candidates(text: &str) -> Vec<String> {
    let mut hits = Vec::new();
    for caps in PATH_NAME_RE.captures_iter(text) {
        let start = caps.get(0).map_or(0, |m| m.start());
        hits.push((
            start,
            Hit::Frame {
                path: clean_path(&caps[1]),
                name: caps[2].to_string(),
            },
        ));
    }
    for found in FILE_RE.find_iter(text) {
        hits.push((found.start(), Hit::File(clean_path(found.as_str()))));
    }
    call_hits(text, &mut hits);
    collect(hits)
}

/// Candidates from a CI log, pytest output or Python traceback.
pub fn extract_log_candidates(text: &str) -> Vec<String> {
    let mut hits = Vec::new();
    for re in [&*TRACEBACK_FRAME_RE, &*PYTEST_FRAME_RE] {
        for caps in re.captures_iter(text) {
            let start = caps.get(0).map_or(0, |m| m.start());
            hits.push((
                start,
                Hit::Frame {
                    path: clean_path(&caps[1]),
                    name: caps[2].to_string(),
                },
            ));
        }
    }
    for caps in FILE_LINE_RE.captures_iter(text) {
        let start = caps.get(0).map_or(0, |m| m.start());
        hits.push((start, Hit::File(clean_path(&caps[1]))));
    }
    call_hits(text, &mut hits);
    collect(hits)
}

fn lens_from_candidates(
    map: &RepositoryMap,
    candidates: Vec<String>,
    origin: &'static str,
    hops: u32,
) -> UnderstandResult<Lens> {
    if candidates.is_empty() {
        return Err(UnderstandError::NoSeedCandidates { origin });
    }
    debug!(origin, candidates = ?candidates, "seed candidates extracted");
    from_seeds(map, &candidates, hops)
}

/// Build a lens seeded from the functions an issue text mentions.
pub fn from_issue(map: &RepositoryMap, text: &str, hops: u32) -> UnderstandResult<Lens> {
    lens_from_candidates(map, extract_issue_candidates(text), "issue", hops)
}

/// Build a lens seeded from the frames of a failure log.
pub fn from_log(map: &RepositoryMap, text: &str, hops: u32) -> UnderstandResult<Lens> {
    lens_from_candidates(map, extract_log_candidates(text), "log", hops)
}
